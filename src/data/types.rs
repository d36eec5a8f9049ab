//! Candle types shared by the data sources and the feature pipeline

use crate::error::{ForecastError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Candle interval (timeframe)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Interval {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl FromStr for Interval {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "1m" => Ok(Interval::M1),
            "5m" => Ok(Interval::M5),
            "15m" => Ok(Interval::M15),
            "30m" => Ok(Interval::M30),
            "1h" | "60" => Ok(Interval::H1),
            "4h" | "240" => Ok(Interval::H4),
            "1d" | "d" | "day" => Ok(Interval::D1),
            "1w" | "w" | "week" => Ok(Interval::W1),
            _ => Err(ForecastError::config(format!("unknown interval '{}'", s))),
        }
    }
}

impl Interval {
    /// Interval string understood by the exchange API
    pub fn to_api_string(&self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H4 => "4h",
            Interval::D1 => "1d",
            Interval::W1 => "1w",
        }
    }

    /// Interval length in milliseconds
    pub fn duration_ms(&self) -> i64 {
        match self {
            Interval::M1 => 60_000,
            Interval::M5 => 300_000,
            Interval::M15 => 900_000,
            Interval::M30 => 1_800_000,
            Interval::H1 => 3_600_000,
            Interval::H4 => 14_400_000,
            Interval::D1 => 86_400_000,
            Interval::W1 => 604_800_000,
        }
    }

    /// Number of candles in a calendar year, used to annualize returns
    pub fn periods_per_year(&self) -> f64 {
        365.0 * 86_400_000.0 / self.duration_ms() as f64
    }
}

/// One OHLCV candlestick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, Unix milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    pub fn datetime(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_default()
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    /// Full candle range (high - low)
    pub fn full_range(&self) -> f64 {
        self.high - self.low
    }
}

/// One row of raw exchange data before cleaning.
///
/// `None` marks a missing value; the pipeline fills or rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub timestamp: i64,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

impl From<&Candle> for RawRow {
    fn from(c: &Candle) -> Self {
        Self {
            timestamp: c.timestamp,
            open: Some(c.open),
            high: Some(c.high),
            low: Some(c.low),
            close: Some(c.close),
            volume: Some(c.volume),
        }
    }
}

/// Raw OHLCV table as received from a source.
///
/// `columns` lists the columns the source actually provided; a column that
/// is not listed is treated as absent rather than missing.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFrame {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawFrame {
    pub fn new(columns: Vec<String>, rows: Vec<RawRow>) -> Self {
        Self { columns, rows }
    }

    pub fn from_candles(candles: &[Candle]) -> Self {
        Self {
            columns: ["timestamp", "open", "high", "low", "close", "volume"]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            rows: candles.iter().map(RawRow::from).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }
}

/// Parse a `YYYY-MM-DD` date into Unix milliseconds at midnight UTC
pub fn parse_start_date(date: &str) -> Result<i64> {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|e| ForecastError::config(format!("invalid start date '{}': {}", date, e)))?;
    let midnight = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ForecastError::config(format!("invalid start date '{}'", date)))?;
    Ok(midnight.and_utc().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_str() {
        assert_eq!("1h".parse::<Interval>().unwrap(), Interval::H1);
        assert_eq!("4H".parse::<Interval>().unwrap(), Interval::H4);
        assert_eq!("1d".parse::<Interval>().unwrap(), Interval::D1);
        assert!("7h".parse::<Interval>().is_err());
    }

    #[test]
    fn test_periods_per_year() {
        assert_eq!(Interval::H1.periods_per_year(), 8760.0);
        assert_eq!(Interval::D1.periods_per_year(), 365.0);
    }

    #[test]
    fn test_candle_bullish() {
        let candle = Candle::new(0, 100.0, 110.0, 95.0, 105.0, 1000.0);
        assert!(candle.is_bullish());
        assert_eq!(candle.full_range(), 15.0);
    }

    #[test]
    fn test_raw_frame_from_candles() {
        let frame = RawFrame::from_candles(&[Candle::new(1, 1.0, 2.0, 0.5, 1.5, 10.0)]);
        assert!(frame.has_column("close"));
        assert_eq!(frame.rows[0].close, Some(1.5));
    }

    #[test]
    fn test_parse_start_date() {
        assert_eq!(parse_start_date("1970-01-02").unwrap(), 86_400_000);
        assert!(parse_start_date("01/02/1970").is_err());
    }
}

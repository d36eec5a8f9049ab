//! CSV persistence for candles and predictions

use super::types::{Candle, RawFrame, RawRow};
use crate::error::{ForecastError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize)]
struct CsvRow {
    timestamp: i64,
    #[serde(default)]
    open: Option<f64>,
    #[serde(default)]
    high: Option<f64>,
    #[serde(default)]
    low: Option<f64>,
    #[serde(default)]
    close: Option<f64>,
    #[serde(default)]
    volume: Option<f64>,
}

/// Load a raw OHLCV table; empty cells become missing values
pub fn load_raw_csv<P: AsRef<Path>>(path: P) -> Result<RawFrame> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path).map_err(|e| {
        ForecastError::ExternalSource(format!("cannot open {}: {}", path.display(), e))
    })?;

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();

    if !columns.iter().any(|c| c == "timestamp") {
        return Err(ForecastError::data_integrity(format!(
            "{} has no timestamp column",
            path.display()
        )));
    }

    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: CsvRow = record?;
        rows.push(RawRow {
            timestamp: row.timestamp,
            open: row.open,
            high: row.high,
            low: row.low,
            close: row.close,
            volume: row.volume,
        });
    }

    Ok(RawFrame::new(columns, rows))
}

/// Save candles to CSV
pub fn save_candles_csv<P: AsRef<Path>>(candles: &[Candle], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for candle in candles {
        writer.serialize(candle)?;
    }
    writer.flush()?;
    Ok(())
}

/// Load candles from CSV, rejecting rows with missing values
pub fn load_candles_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Candle>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut candles = Vec::new();
    for record in reader.deserialize() {
        let candle: Candle = record?;
        candles.push(candle);
    }
    Ok(candles)
}

/// One row of the predictions export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub timestamp: i64,
    pub actual: f64,
    pub predicted: f64,
}

/// Save `timestamp, actual, predicted` rows to CSV
pub fn save_predictions_csv<P: AsRef<Path>>(rows: &[PredictionRow], path: P) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

//! Data source abstraction
//!
//! The pipeline only needs "give me OHLCV history for (symbol, interval,
//! start)". Network and file sources implement the same trait so tests can
//! inject synthetic data.

use super::io::load_candles_csv;
use super::types::{Candle, Interval};
use crate::error::{ForecastError, Result};
use std::path::PathBuf;

/// Anything that can produce OHLCV history
pub trait CandleSource {
    /// Fetch candles at `interval` from `start_ms` (Unix milliseconds) onwards
    fn fetch(&self, symbol: &str, interval: Interval, start_ms: i64) -> Result<Vec<Candle>>;
}

/// Candles stored in a local CSV file
#[derive(Debug, Clone)]
pub struct CsvSource {
    path: PathBuf,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl CandleSource for CsvSource {
    fn fetch(&self, _symbol: &str, _interval: Interval, start_ms: i64) -> Result<Vec<Candle>> {
        if !self.path.exists() {
            return Err(ForecastError::ExternalSource(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        let candles: Vec<Candle> = load_candles_csv(&self.path)?
            .into_iter()
            .filter(|c| c.timestamp >= start_ms)
            .collect();
        Ok(candles)
    }
}

/// In-memory source, handy for tests and replays
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    candles: Vec<Candle>,
}

impl MemorySource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }
}

impl CandleSource for MemorySource {
    fn fetch(&self, _symbol: &str, _interval: Interval, start_ms: i64) -> Result<Vec<Candle>> {
        Ok(self
            .candles
            .iter()
            .filter(|c| c.timestamp >= start_ms)
            .cloned()
            .collect())
    }
}

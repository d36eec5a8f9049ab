//! Error types shared by every pipeline stage

use thiserror::Error;

/// Errors raised by the forecasting pipeline.
///
/// Stages fail fast: none of these are recovered from inside the library.
#[derive(Error, Debug)]
pub enum ForecastError {
    /// Missing or invalid required columns or rows
    #[error("data integrity error: {0}")]
    DataIntegrity(String),

    /// Not enough rows for a window or indicator warm-up
    #[error("insufficient data: {0}")]
    InsufficientData(String),

    /// A transform was used before fit or load
    #[error("not fitted: {0}")]
    NotFitted(String),

    /// Invalid ratios, unknown identifiers, bad layer sizes
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The exchange or another data source failed
    #[error("external source error: {0}")]
    ExternalSource(String),

    /// Missing or corrupt persisted model, scaler or manifest
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
}

impl ForecastError {
    pub fn data_integrity(msg: impl Into<String>) -> Self {
        Self::DataIntegrity(msg.into())
    }

    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientData(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }
}

impl From<reqwest::Error> for ForecastError {
    fn from(err: reqwest::Error) -> Self {
        Self::ExternalSource(err.to_string())
    }
}

impl From<bincode::Error> for ForecastError {
    fn from(err: bincode::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ForecastError>;

//! # Utilities
//!
//! Evaluation metrics and logger setup.

pub mod logging;
pub mod metrics;

pub use metrics::{
    binary_accuracy, directional_accuracy, mae, mape, mse, naive_baseline, r2_score, rmse,
    DirectionMetrics, RegressionMetrics,
};

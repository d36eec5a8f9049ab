//! Sliding windows over a scaled feature matrix

use crate::config::DataConfig;
use crate::error::{ForecastError, Result};
use ndarray::{s, Array1, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

/// Close position in the base OHLCV ordering
pub const DEFAULT_TARGET_COLUMN: usize = 3;

/// Window length and the column the label is read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub time_steps: usize,
    pub target_column: usize,
}

impl WindowSpec {
    pub fn new(time_steps: usize) -> Self {
        Self {
            time_steps,
            target_column: DEFAULT_TARGET_COLUMN,
        }
    }

    pub fn with_target_column(mut self, target_column: usize) -> Self {
        self.target_column = target_column;
        self
    }

    pub fn from_config(config: &DataConfig) -> Self {
        Self::new(config.time_steps).with_target_column(config.target_column)
    }

    fn check(&self, data: &Array2<f64>) -> Result<()> {
        if self.time_steps == 0 {
            return Err(ForecastError::config("time_steps must be positive"));
        }
        if self.target_column >= data.ncols() {
            return Err(ForecastError::config(format!(
                "target column {} out of range for {} features",
                self.target_column,
                data.ncols()
            )));
        }
        if data.nrows() <= self.time_steps {
            return Err(ForecastError::insufficient(format!(
                "{} rows cannot form a window of {} steps plus a target",
                data.nrows(),
                self.time_steps
            )));
        }
        Ok(())
    }

    /// Number of samples `make_windows` yields for `n_rows`
    pub fn n_samples(&self, n_rows: usize) -> usize {
        n_rows.saturating_sub(self.time_steps)
    }
}

/// Overlapping windows `X[i] = data[i-T..i]` with `y[i] = data[i][target]`.
///
/// Returns `X` shaped `(L - T, T, F)` and `y` of length `L - T`.
pub fn make_windows(data: &Array2<f64>, spec: &WindowSpec) -> Result<(Array3<f64>, Array1<f64>)> {
    spec.check(data)?;

    let t = spec.time_steps;
    let n_samples = spec.n_samples(data.nrows());
    let mut x = Array3::zeros((n_samples, t, data.ncols()));
    let mut y = Array1::zeros(n_samples);

    for (k, i) in (t..data.nrows()).enumerate() {
        x.index_axis_mut(Axis(0), k)
            .assign(&data.slice(s![i - t..i, ..]));
        y[k] = data[[i, spec.target_column]];
    }

    Ok((x, y))
}

/// 1.0 where the target rises above the last close inside its window
pub fn direction_labels(data: &Array2<f64>, spec: &WindowSpec) -> Result<Array1<f64>> {
    spec.check(data)?;

    let c = spec.target_column;
    Ok((spec.time_steps..data.nrows())
        .map(|i| if data[[i, c]] > data[[i - 1, c]] { 1.0 } else { 0.0 })
        .collect())
}

/// The most recent `T` rows as a single-sample batch, for next-step forecasts
pub fn latest_window(data: &Array2<f64>, spec: &WindowSpec) -> Result<Array3<f64>> {
    if spec.time_steps == 0 {
        return Err(ForecastError::config("time_steps must be positive"));
    }
    if data.nrows() < spec.time_steps {
        return Err(ForecastError::insufficient(format!(
            "need {} rows for a window, have {}",
            spec.time_steps,
            data.nrows()
        )));
    }
    let start = data.nrows() - spec.time_steps;
    Ok(data.slice(s![start.., ..]).to_owned().insert_axis(Axis(0)))
}

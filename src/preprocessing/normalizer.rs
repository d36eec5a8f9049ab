//! Reversible per-column scaling
//!
//! A [`Normalizer`] is write-once: it is fitted (or loaded) exactly one time
//! and then only used to transform and invert.

use crate::config::ScalerConfig;
use crate::error::{ForecastError, Result};
use log::info;
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Scaling method, fixed before fit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ScalerKind {
    /// Min-max scaling into a target range
    MinMax,
    /// Zero mean, unit variance
    Standard,
}

impl FromStr for ScalerKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "minmax" | "min_max" | "minmaxscaler" => Ok(ScalerKind::MinMax),
            "standard" | "zscore" | "standardscaler" => Ok(ScalerKind::Standard),
            _ => Err(ForecastError::config(format!("unknown scaler '{}'", s))),
        }
    }
}

impl fmt::Display for ScalerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalerKind::MinMax => f.write_str("minmax"),
            ScalerKind::Standard => f.write_str("standard"),
        }
    }
}

impl TryFrom<String> for ScalerKind {
    type Error = ForecastError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ScalerKind> for String {
    fn from(value: ScalerKind) -> Self {
        value.to_string()
    }
}

/// Which rows the scaler parameters are computed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerFitScope {
    /// Whole feature matrix, validation and test rows included.
    /// Held-out statistics leak into the training scale.
    FullSeries,
    /// Only the rows that feed the training windows
    TrainOnly,
}

/// Fitted per-column parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalerState {
    MinMax {
        min: Array1<f64>,
        /// max - min, with constant columns stored as 1
        range: Array1<f64>,
        feature_range: (f64, f64),
    },
    Standard {
        mean: Array1<f64>,
        /// Population standard deviation, with constant columns stored as 1
        std: Array1<f64>,
    },
}

impl ScalerState {
    pub fn kind(&self) -> ScalerKind {
        match self {
            ScalerState::MinMax { .. } => ScalerKind::MinMax,
            ScalerState::Standard { .. } => ScalerKind::Standard,
        }
    }

    pub fn n_features(&self) -> usize {
        match self {
            ScalerState::MinMax { min, .. } => min.len(),
            ScalerState::Standard { mean, .. } => mean.len(),
        }
    }

    fn fit(kind: ScalerKind, feature_range: (f64, f64), data: &Array2<f64>) -> Self {
        match kind {
            ScalerKind::MinMax => {
                let min = data.fold_axis(Axis(0), f64::INFINITY, |&a, &b| a.min(b));
                let max = data.fold_axis(Axis(0), f64::NEG_INFINITY, |&a, &b| a.max(b));
                let range = (&max - &min).mapv(|v| if v.abs() < 1e-10 { 1.0 } else { v });
                ScalerState::MinMax {
                    min,
                    range,
                    feature_range,
                }
            }
            ScalerKind::Standard => {
                let n = data.nrows() as f64;
                let mean = data.sum_axis(Axis(0)) / n;
                let var = data
                    .rows()
                    .into_iter()
                    .fold(Array1::zeros(data.ncols()), |acc: Array1<f64>, row| {
                        let diff = &row - &mean;
                        acc + &diff * &diff
                    })
                    / n;
                let std = var.mapv(|v| {
                    let s = v.sqrt();
                    if s < 1e-10 {
                        1.0
                    } else {
                        s
                    }
                });
                ScalerState::Standard { mean, std }
            }
        }
    }

    fn transform(&self, data: &Array2<f64>) -> Array2<f64> {
        match self {
            ScalerState::MinMax {
                min,
                range,
                feature_range: (lo, hi),
            } => (data - min) / range * (hi - lo) + *lo,
            ScalerState::Standard { mean, std } => (data - mean) / std,
        }
    }

    fn inverse_transform(&self, data: &Array2<f64>) -> Array2<f64> {
        match self {
            ScalerState::MinMax {
                min,
                range,
                feature_range: (lo, hi),
            } => (data - *lo) / (hi - lo) * range + min,
            ScalerState::Standard { mean, std } => data * std + mean,
        }
    }
}

/// Fits, applies and inverts one scaling transform
#[derive(Debug, Clone, PartialEq)]
pub struct Normalizer {
    kind: ScalerKind,
    feature_range: (f64, f64),
    state: Option<ScalerState>,
}

impl Normalizer {
    pub fn new(kind: ScalerKind) -> Self {
        Self {
            kind,
            feature_range: (0.0, 1.0),
            state: None,
        }
    }

    /// Min-max target range, ignored by the standard scaler
    pub fn with_feature_range(mut self, low: f64, high: f64) -> Self {
        self.feature_range = (low, high);
        self
    }

    pub fn from_config(config: &ScalerConfig) -> Self {
        Self::new(config.kind).with_feature_range(config.feature_range.0, config.feature_range.1)
    }

    /// Wrap an already fitted state
    pub fn from_state(state: ScalerState) -> Self {
        let feature_range = match &state {
            ScalerState::MinMax { feature_range, .. } => *feature_range,
            ScalerState::Standard { .. } => (0.0, 1.0),
        };
        Self {
            kind: state.kind(),
            feature_range,
            state: Some(state),
        }
    }

    pub fn kind(&self) -> ScalerKind {
        self.kind
    }

    pub fn is_fitted(&self) -> bool {
        self.state.is_some()
    }

    pub fn state(&self) -> Option<&ScalerState> {
        self.state.as_ref()
    }

    /// Fit on `data` and return it scaled. Fails if already fitted.
    pub fn fit_transform(&mut self, data: &Array2<f64>) -> Result<Array2<f64>> {
        self.fit(data)?;
        self.transform(data)
    }

    /// Fit without transforming. Fails if already fitted.
    pub fn fit(&mut self, data: &Array2<f64>) -> Result<()> {
        if self.state.is_some() {
            return Err(ForecastError::config(
                "normalizer is already fitted; scaler state is never refit",
            ));
        }
        if data.nrows() == 0 || data.ncols() == 0 {
            return Err(ForecastError::insufficient("cannot fit a scaler on an empty matrix"));
        }
        let (lo, hi) = self.feature_range;
        if self.kind == ScalerKind::MinMax && !(lo < hi) {
            return Err(ForecastError::config(format!(
                "feature_range ({}, {}) must be increasing",
                lo, hi
            )));
        }

        self.state = Some(ScalerState::fit(self.kind, self.feature_range, data));
        info!(
            "Fitted {} scaler on {} rows x {} columns",
            self.kind,
            data.nrows(),
            data.ncols()
        );
        Ok(())
    }

    fn fitted_state(&self, n_cols: usize) -> Result<&ScalerState> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ForecastError::NotFitted("normalizer has no fitted state".to_string()))?;
        if state.n_features() != n_cols {
            return Err(ForecastError::data_integrity(format!(
                "scaler was fitted on {} columns, got {}",
                state.n_features(),
                n_cols
            )));
        }
        Ok(state)
    }

    pub fn transform(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(self.fitted_state(data.ncols())?.transform(data))
    }

    pub fn inverse_transform(&self, data: &Array2<f64>) -> Result<Array2<f64>> {
        Ok(self.fitted_state(data.ncols())?.inverse_transform(data))
    }

    /// Original-scale values for one column.
    ///
    /// The scaled values are placed in a zero matrix at `column` and the
    /// whole matrix is inverted; only that column is returned.
    pub fn inverse(&self, column: usize, scaled: &Array1<f64>) -> Result<Array1<f64>> {
        let n_cols = self
            .state
            .as_ref()
            .map(|s| s.n_features())
            .ok_or_else(|| ForecastError::NotFitted("normalizer has no fitted state".to_string()))?;
        if column >= n_cols {
            return Err(ForecastError::config(format!(
                "column {} out of range for {} scaled columns",
                column, n_cols
            )));
        }

        let mut embedded = Array2::zeros((scaled.len(), n_cols));
        embedded.column_mut(column).assign(scaled);
        let restored = self.inverse_transform(&embedded)?;
        Ok(restored.column(column).to_owned())
    }

    /// Persist the fitted state as a bincode blob
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| ForecastError::NotFitted("cannot save an unfitted normalizer".to_string()))?;
        let encoded = bincode::serialize(state)?;
        std::fs::write(path.as_ref(), encoded).map_err(|e| {
            ForecastError::persistence(format!("cannot write {}: {}", path.as_ref().display(), e))
        })?;
        Ok(())
    }

    /// Restore a normalizer saved with [`save`](Self::save)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ForecastError::persistence(format!("cannot read scaler {}: {}", path.display(), e))
        })?;
        let state: ScalerState = bincode::deserialize(&data)?;
        Ok(Self::from_state(state))
    }
}

//! Up/down dataset for the direction classifier

use super::indicators::{pct_change, rolling_std, rsi, sma};
use crate::data::Candle;
use crate::error::{ForecastError, Result};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// Feature columns of the direction classifier, in order
pub const DIRECTION_FEATURES: [&str; 10] = [
    "open",
    "high",
    "low",
    "close",
    "volume",
    "sma_7",
    "sma_25",
    "rsi_14",
    "roc_5",
    "volatility",
];

/// Row-major samples with a binary label: 1 if the next close is higher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectionDataset {
    pub features: Vec<Vec<f64>>,
    pub labels: Vec<f64>,
    pub feature_names: Vec<String>,
    pub timestamps: Vec<i64>,
}

/// Chronological train/test halves
#[derive(Debug, Clone)]
pub struct DirectionSplit {
    pub train: DirectionDataset,
    pub test: DirectionDataset,
}

impl DirectionDataset {
    pub fn new(feature_names: Vec<String>) -> Self {
        Self {
            features: Vec::new(),
            labels: Vec::new(),
            feature_names,
            timestamps: Vec::new(),
        }
    }

    /// Build labelled rows from cleaned candles.
    ///
    /// Rows inside an indicator warm-up are skipped, and so is the last
    /// candle, which has no next close to label it with.
    pub fn from_candles(candles: &[Candle]) -> Result<Self> {
        let close: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let sma_7 = sma(&close, 7);
        let sma_25 = sma(&close, 25);
        let rsi_14 = rsi(&close, 14);
        let roc_5 = pct_change(&close, 5);
        let volatility = rolling_std(&close, 7);

        let mut dataset = Self::new(DIRECTION_FEATURES.iter().map(|s| s.to_string()).collect());

        for (i, pair) in candles.windows(2).enumerate() {
            let (current, next) = (&pair[0], &pair[1]);
            let row = vec![
                current.open,
                current.high,
                current.low,
                current.close,
                current.volume,
                sma_7[i],
                sma_25[i],
                rsi_14[i],
                roc_5[i],
                volatility[i],
            ];
            if !row.iter().all(|v| v.is_finite()) {
                continue;
            }
            let label = if next.close > current.close { 1.0 } else { 0.0 };
            dataset.features.push(row);
            dataset.labels.push(label);
            dataset.timestamps.push(current.timestamp);
        }

        if dataset.is_empty() {
            return Err(ForecastError::insufficient(format!(
                "no labelled rows from {} candles",
                candles.len()
            )));
        }
        Ok(dataset)
    }

    pub fn n_samples(&self) -> usize {
        self.features.len()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Share of rows labelled up
    pub fn positive_rate(&self) -> f64 {
        if self.labels.is_empty() {
            return 0.0;
        }
        self.labels.iter().filter(|&&l| l > 0.5).count() as f64 / self.labels.len() as f64
    }

    /// Split by time: the first `train_ratio` of rows train, the rest test
    pub fn train_test_split(&self, train_ratio: f64) -> Result<DirectionSplit> {
        if !(0.0..=1.0).contains(&train_ratio) {
            return Err(ForecastError::config(format!(
                "train_ratio must be in [0, 1], got {}",
                train_ratio
            )));
        }
        let train_size = (self.n_samples() as f64 * train_ratio).floor() as usize;
        let all: Vec<usize> = (0..self.n_samples()).collect();
        let (train, test) = all.split_at(train_size);

        Ok(DirectionSplit {
            train: self.subset(train),
            test: self.subset(test),
        })
    }

    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            features: indices.iter().map(|&i| self.features[i].clone()).collect(),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
            feature_names: self.feature_names.clone(),
            timestamps: indices.iter().map(|&i| self.timestamps[i]).collect(),
        }
    }

    /// Sample with replacement, same size as the dataset
    pub fn bootstrap_sample(&self, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let n = self.n_samples();
        let indices: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
        self.subset(&indices)
    }
}

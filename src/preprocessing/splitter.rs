//! Ordered train/validation/test partitioning

use crate::error::{ForecastError, Result};
use ndarray::{s, Array1, Array3};

const RATIO_SLACK: f64 = 1e-9;

/// Three contiguous, time-ordered partitions of the windowed samples
#[derive(Debug, Clone)]
pub struct DatasetSplit {
    pub x_train: Array3<f64>,
    pub y_train: Array1<f64>,
    pub x_val: Array3<f64>,
    pub y_val: Array1<f64>,
    pub x_test: Array3<f64>,
    pub y_test: Array1<f64>,
}

impl DatasetSplit {
    /// (train, val, test) sample counts
    pub fn sizes(&self) -> (usize, usize, usize) {
        (self.y_train.len(), self.y_val.len(), self.y_test.len())
    }

    pub fn total(&self) -> usize {
        self.y_train.len() + self.y_val.len() + self.y_test.len()
    }
}

/// Reject negative, non-finite or over-allocating ratios
pub fn validate_ratios(train_ratio: f64, val_ratio: f64) -> Result<()> {
    for (name, ratio) in [("train_ratio", train_ratio), ("val_ratio", val_ratio)] {
        if !ratio.is_finite() || ratio < 0.0 {
            return Err(ForecastError::config(format!(
                "{} must be a non-negative number, got {}",
                name, ratio
            )));
        }
    }
    if train_ratio + val_ratio > 1.0 + RATIO_SLACK {
        return Err(ForecastError::config(format!(
            "train_ratio + val_ratio = {} exceeds 1",
            train_ratio + val_ratio
        )));
    }
    Ok(())
}

/// Floor-based partition sizes; the test split takes the remainder
pub fn split_sizes(total: usize, train_ratio: f64, val_ratio: f64) -> Result<(usize, usize, usize)> {
    validate_ratios(train_ratio, val_ratio)?;

    let train = ((total as f64 * train_ratio).floor() as usize).min(total);
    let val = ((total as f64 * val_ratio).floor() as usize).min(total - train);
    Ok((train, val, total - train - val))
}

/// Partition windows in order: train `[0, t)`, val `[t, t+v)`, test the rest
pub fn split(
    x: &Array3<f64>,
    y: &Array1<f64>,
    train_ratio: f64,
    val_ratio: f64,
) -> Result<DatasetSplit> {
    let total = y.len();
    if x.dim().0 != total {
        return Err(ForecastError::data_integrity(format!(
            "{} windows but {} targets",
            x.dim().0,
            total
        )));
    }

    let (train, val, _) = split_sizes(total, train_ratio, val_ratio)?;
    let val_end = train + val;

    Ok(DatasetSplit {
        x_train: x.slice(s![..train, .., ..]).to_owned(),
        y_train: y.slice(s![..train]).to_owned(),
        x_val: x.slice(s![train..val_end, .., ..]).to_owned(),
        y_val: y.slice(s![train..val_end]).to_owned(),
        x_test: x.slice(s![val_end.., .., ..]).to_owned(),
        y_test: y.slice(s![val_end..]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(n: usize) -> (Array3<f64>, Array1<f64>) {
        let x = Array3::from_shape_fn((n, 2, 1), |(i, _, _)| i as f64);
        let y = Array1::from_shape_fn(n, |i| i as f64);
        (x, y)
    }

    #[test]
    fn test_floor_sizes() {
        assert_eq!(split_sizes(940, 0.7, 0.15).unwrap(), (658, 141, 141));
        assert_eq!(split_sizes(10, 0.75, 0.15).unwrap(), (7, 1, 2));
        assert_eq!(split_sizes(0, 0.7, 0.15).unwrap(), (0, 0, 0));
    }

    #[test]
    fn test_order_preserved() {
        let (x, y) = samples(100);
        let split = split(&x, &y, 0.7, 0.15).unwrap();

        assert_eq!(split.sizes(), (70, 15, 15));
        assert_eq!(split.total(), 100);
        assert_eq!(split.y_train[69], 69.0);
        assert_eq!(split.y_val[0], 70.0);
        assert_eq!(split.y_test[0], 85.0);
        assert_eq!(split.x_test[[14, 0, 0]], 99.0);
    }

    #[test]
    fn test_invalid_ratios() {
        let (x, y) = samples(10);
        for (train, val) in [(-0.1, 0.2), (0.8, 0.3), (f64::NAN, 0.1)] {
            assert!(matches!(
                split(&x, &y, train, val),
                Err(ForecastError::Configuration(_))
            ));
        }
        assert!(split(&x, &y, 0.7, 0.3).is_ok());
    }

    #[test]
    fn test_length_mismatch() {
        let (x, _) = samples(10);
        let y = Array1::zeros(9);
        assert!(matches!(
            split(&x, &y, 0.7, 0.15),
            Err(ForecastError::DataIntegrity(_))
        ));
    }
}

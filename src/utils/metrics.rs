//! Regression and direction metrics
//!
//! Every function takes `(targets, predictions)` in that order. Lengths are
//! expected to match; extra elements of the longer slice are ignored.

use serde::{Deserialize, Serialize};
use std::fmt;

const MAPE_EPS: f64 = 1e-8;

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn mae(targets: &[f64], predictions: &[f64]) -> f64 {
    mean(targets.iter().zip(predictions).map(|(t, p)| (t - p).abs()))
}

pub fn mse(targets: &[f64], predictions: &[f64]) -> f64 {
    mean(targets.iter().zip(predictions).map(|(t, p)| (t - p).powi(2)))
}

pub fn rmse(targets: &[f64], predictions: &[f64]) -> f64 {
    mse(targets, predictions).sqrt()
}

/// Mean absolute percentage error, in percent
pub fn mape(targets: &[f64], predictions: &[f64]) -> f64 {
    mean(
        targets
            .iter()
            .zip(predictions)
            .map(|(t, p)| ((t - p) / (t.abs() + MAPE_EPS)).abs()),
    ) * 100.0
}

/// Coefficient of determination. 0 when the targets are constant.
pub fn r2_score(targets: &[f64], predictions: &[f64]) -> f64 {
    let target_mean = mean(targets.iter().copied());
    let ss_res: f64 = targets
        .iter()
        .zip(predictions)
        .map(|(t, p)| (t - p).powi(2))
        .sum();
    let ss_tot: f64 = targets.iter().map(|t| (t - target_mean).powi(2)).sum();

    if ss_tot == 0.0 {
        0.0
    } else {
        1.0 - ss_res / ss_tot
    }
}

/// Share of predictions on the right side of 0.5
pub fn binary_accuracy(targets: &[f64], predictions: &[f64]) -> f64 {
    mean(
        targets
            .iter()
            .zip(predictions)
            .map(|(t, p)| ((*t > 0.5) == (*p > 0.5)) as u8 as f64),
    )
}

/// Share of steps where both series move the same way
pub fn directional_accuracy(targets: &[f64], predictions: &[f64]) -> f64 {
    let n = targets.len().min(predictions.len());
    if n < 2 {
        return 0.0;
    }
    mean((1..n).map(|i| {
        let actual_up = targets[i] > targets[i - 1];
        let predicted_up = predictions[i] > predictions[i - 1];
        (actual_up == predicted_up) as u8 as f64
    }))
}

/// 1 where the price rose from the previous step, else 0. The first step is 0.
pub fn direction_labels(prices: &[f64]) -> Vec<u8> {
    let mut labels = Vec::with_capacity(prices.len());
    for (i, price) in prices.iter().enumerate() {
        let up = i > 0 && *price > prices[i - 1];
        labels.push(up as u8);
    }
    labels
}

/// Persistence forecast: each prediction is the previous actual
pub fn naive_baseline(actual: &[f64]) -> Vec<f64> {
    match actual.first() {
        None => Vec::new(),
        Some(&first) => std::iter::once(first)
            .chain(actual[..actual.len() - 1].iter().copied())
            .collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegressionMetrics {
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    pub mape: f64,
    pub r2: f64,
}

impl RegressionMetrics {
    pub fn compute(targets: &[f64], predictions: &[f64]) -> Self {
        Self {
            mae: mae(targets, predictions),
            mse: mse(targets, predictions),
            rmse: rmse(targets, predictions),
            mape: mape(targets, predictions),
            r2: r2_score(targets, predictions),
        }
    }
}

impl fmt::Display for RegressionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  MAE:  {:.6}", self.mae)?;
        writeln!(f, "  MSE:  {:.6}", self.mse)?;
        writeln!(f, "  RMSE: {:.6}", self.rmse)?;
        writeln!(f, "  MAPE: {:.4}%", self.mape)?;
        write!(f, "  R2:   {:.4}", self.r2)
    }
}

/// Up/down classification quality.
///
/// `confusion` is `[[tn, fp], [fn, tp]]` with "up" as the positive class.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DirectionMetrics {
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub confusion: [[usize; 2]; 2],
}

impl DirectionMetrics {
    /// Compare already-derived 0/1 labels
    pub fn from_labels(actual: &[u8], predicted: &[u8]) -> Self {
        let mut confusion = [[0usize; 2]; 2];
        for (&a, &p) in actual.iter().zip(predicted) {
            confusion[(a > 0) as usize][(p > 0) as usize] += 1;
        }
        let [[tn, fp], [fn_, tp]] = confusion;
        let total = tn + fp + fn_ + tp;

        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall == 0.0 {
            0.0
        } else {
            2.0 * precision * recall / (precision + recall)
        };

        Self {
            accuracy: ratio(tp + tn, total),
            precision,
            recall,
            f1,
            confusion,
        }
    }

    /// Derive direction labels from two price series and compare them
    pub fn from_prices(actual: &[f64], predicted: &[f64]) -> Self {
        Self::from_labels(&direction_labels(actual), &direction_labels(predicted))
    }
}

impl fmt::Display for DirectionMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  Accuracy:  {:.4}", self.accuracy)?;
        writeln!(f, "  Precision: {:.4}", self.precision)?;
        writeln!(f, "  Recall:    {:.4}", self.recall)?;
        writeln!(f, "  F1:        {:.4}", self.f1)?;
        write!(
            f,
            "  Confusion: [[{}, {}], [{}, {}]]",
            self.confusion[0][0], self.confusion[0][1], self.confusion[1][0], self.confusion[1][1]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_mse() {
        let error = mse(&[1.0, 2.0, 3.0], &[1.1, 2.0, 2.9]);
        assert_relative_eq!(error, 0.02 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_regression_metrics() {
        let targets = [100.0, 200.0, 300.0, 400.0];
        let predictions = [110.0, 190.0, 300.0, 420.0];
        let m = RegressionMetrics::compute(&targets, &predictions);

        assert_relative_eq!(m.mae, 10.0, epsilon = 1e-9);
        assert_relative_eq!(m.mse, 150.0, epsilon = 1e-9);
        assert_relative_eq!(m.rmse, 150f64.sqrt(), epsilon = 1e-9);
        assert_relative_eq!(m.mape, (0.1 + 0.05 + 0.0 + 0.05) / 4.0 * 100.0, epsilon = 1e-6);
        assert_relative_eq!(m.r2, 1.0 - 600.0 / 50_000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_mape_with_zero_target_stays_finite() {
        assert!(mape(&[0.0, 1.0], &[0.5, 1.0]).is_finite());
    }

    #[test]
    fn test_binary_accuracy() {
        let acc = binary_accuracy(&[1.0, 0.0, 1.0, 1.0], &[0.8, 0.2, 0.6, 0.4]);
        assert_relative_eq!(acc, 0.75);
    }

    #[test]
    fn test_directional_accuracy() {
        let actual = [1.0, 2.0, 1.5, 1.8];
        let predicted = [1.0, 1.2, 1.3, 1.9];
        // up/up, down/up, up/up
        assert_relative_eq!(directional_accuracy(&actual, &predicted), 2.0 / 3.0);
    }

    #[test]
    fn test_direction_metrics() {
        let actual = [1.0, 2.0, 1.0, 2.0, 3.0];
        let predicted = [1.0, 2.0, 3.0, 2.0, 3.0];
        // labels: actual 0 1 0 1 1, predicted 0 1 1 0 1
        let m = DirectionMetrics::from_prices(&actual, &predicted);

        assert_eq!(m.confusion, [[1, 1], [1, 2]]);
        assert_relative_eq!(m.accuracy, 0.6);
        assert_relative_eq!(m.precision, 2.0 / 3.0);
        assert_relative_eq!(m.recall, 2.0 / 3.0);
        assert_relative_eq!(m.f1, 2.0 / 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_naive_baseline() {
        assert_eq!(naive_baseline(&[1.0, 2.0, 3.0]), vec![1.0, 1.0, 2.0]);
        assert!(naive_baseline(&[]).is_empty());
    }
}

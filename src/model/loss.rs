//! Loss values, loss gradients and tracked metrics

use super::types::{LossKind, MetricKind};
use crate::utils::metrics;
use ndarray::Array1;

const BCE_EPSILON: f64 = 1e-7;
const HUBER_DELTA: f64 = 1.0;

impl LossKind {
    /// Mean loss over the batch
    pub fn compute(&self, predictions: &Array1<f64>, targets: &Array1<f64>) -> f64 {
        let n = predictions.len().max(1) as f64;
        let total: f64 = predictions
            .iter()
            .zip(targets.iter())
            .map(|(&p, &y)| match self {
                LossKind::Mse => (p - y).powi(2),
                LossKind::Mae => (p - y).abs(),
                LossKind::Huber => {
                    let e = (p - y).abs();
                    if e <= HUBER_DELTA {
                        0.5 * e * e
                    } else {
                        HUBER_DELTA * (e - 0.5 * HUBER_DELTA)
                    }
                }
                LossKind::BinaryCrossEntropy => {
                    let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
                    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
                }
            })
            .sum();
        total / n
    }

    /// Gradient of the mean loss with respect to each prediction
    pub fn gradient(&self, predictions: &Array1<f64>, targets: &Array1<f64>) -> Array1<f64> {
        let n = predictions.len().max(1) as f64;
        predictions
            .iter()
            .zip(targets.iter())
            .map(|(&p, &y)| {
                let e = p - y;
                let g = match self {
                    LossKind::Mse => 2.0 * e,
                    LossKind::Mae => super::param::sign(e),
                    LossKind::Huber => e.clamp(-HUBER_DELTA, HUBER_DELTA),
                    LossKind::BinaryCrossEntropy => {
                        let p = p.clamp(BCE_EPSILON, 1.0 - BCE_EPSILON);
                        (p - y) / (p * (1.0 - p))
                    }
                };
                g / n
            })
            .collect()
    }
}

impl MetricKind {
    pub fn compute(&self, predictions: &Array1<f64>, targets: &Array1<f64>) -> f64 {
        let predictions = predictions.to_vec();
        let targets = targets.to_vec();
        match self {
            MetricKind::Mae => metrics::mae(&targets, &predictions),
            MetricKind::Mse => metrics::mse(&targets, &predictions),
            MetricKind::Rmse => metrics::rmse(&targets, &predictions),
            MetricKind::Mape => metrics::mape(&targets, &predictions),
            MetricKind::Accuracy => metrics::binary_accuracy(&targets, &predictions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    fn numeric_gradient(loss: LossKind, p: &Array1<f64>, y: &Array1<f64>) -> Array1<f64> {
        let eps = 1e-6;
        (0..p.len())
            .map(|i| {
                let mut plus = p.clone();
                let mut minus = p.clone();
                plus[i] += eps;
                minus[i] -= eps;
                (loss.compute(&plus, y) - loss.compute(&minus, y)) / (2.0 * eps)
            })
            .collect()
    }

    #[test]
    fn test_loss_values() {
        let p = array![1.0, 3.0];
        let y = array![0.0, 0.0];

        assert_relative_eq!(LossKind::Mse.compute(&p, &y), 5.0);
        assert_relative_eq!(LossKind::Mae.compute(&p, &y), 2.0);
        assert_relative_eq!(LossKind::Huber.compute(&p, &y), (0.5 + 2.5) / 2.0);
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let p = array![0.3, -1.7, 2.2, 0.05];
        let y = array![0.1, 0.4, 0.9, -0.6];
        for loss in [LossKind::Mse, LossKind::Mae, LossKind::Huber] {
            let analytic = loss.gradient(&p, &y);
            let numeric = numeric_gradient(loss, &p, &y);
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                assert_relative_eq!(a, n, epsilon = 1e-5);
            }
        }

        let probs = array![0.2, 0.7, 0.9];
        let labels = array![0.0, 1.0, 0.0];
        let analytic = LossKind::BinaryCrossEntropy.gradient(&probs, &labels);
        let numeric = numeric_gradient(LossKind::BinaryCrossEntropy, &probs, &labels);
        for (a, n) in analytic.iter().zip(numeric.iter()) {
            assert_relative_eq!(a, n, epsilon = 1e-4);
        }
    }

    #[test]
    fn test_bce_is_finite_at_extremes() {
        let loss = LossKind::BinaryCrossEntropy.compute(&array![0.0, 1.0], &array![1.0, 0.0]);
        assert!(loss.is_finite());
    }

    #[test]
    fn test_metric_dispatch() {
        let p = array![1.0, 2.0];
        let y = array![1.0, 4.0];
        assert_relative_eq!(MetricKind::Mae.compute(&p, &y), 1.0);
        assert_relative_eq!(MetricKind::Rmse.compute(&p, &y), 2.0f64.sqrt());
    }
}

//! Trainable tensors

use ndarray::Array2;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A weight matrix with its accumulated gradient.
///
/// Biases are stored as `(1, n)` rows so they broadcast over a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    pub value: Array2<f64>,
    #[serde(skip)]
    pub grad: Array2<f64>,
    /// Whether the L1/L2 penalty applies (kernels yes, biases no)
    pub regularize: bool,
}

impl Param {
    pub fn new(value: Array2<f64>, regularize: bool) -> Self {
        let grad = Array2::zeros(value.dim());
        Self {
            value,
            grad,
            regularize,
        }
    }

    /// Uniform in `[-limit, limit]`
    pub fn uniform<R: Rng>(shape: (usize, usize), limit: f64, regularize: bool, rng: &mut R) -> Self {
        Self::new(
            Array2::random_using(shape, Uniform::new_inclusive(-limit, limit), rng),
            regularize,
        )
    }

    pub fn filled(shape: (usize, usize), value: f64) -> Self {
        Self::new(Array2::from_elem(shape, value), false)
    }

    pub fn zero_grad(&mut self) {
        self.grad = Array2::zeros(self.value.dim());
    }

    pub fn accumulate(&mut self, grad: &Array2<f64>) {
        if self.grad.dim() != self.value.dim() {
            self.grad = Array2::zeros(self.value.dim());
        }
        self.grad += grad;
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    /// L1/L2 penalty of this tensor, zero when not regularized
    pub fn penalty(&self, l1: f64, l2: f64) -> f64 {
        if !self.regularize {
            return 0.0;
        }
        self.value
            .iter()
            .map(|w| l1 * w.abs() + l2 * w * w)
            .sum()
    }

    /// Add the penalty gradient to `grad`
    pub fn add_penalty_grad(&mut self, l1: f64, l2: f64) {
        if !self.regularize || (l1 == 0.0 && l2 == 0.0) {
            return;
        }
        let penalty = self.value.mapv(|w| l1 * sign(w) + 2.0 * l2 * w);
        self.accumulate(&penalty);
    }
}

/// Sign with `sign(0) = 0`, unlike `f64::signum`
pub(crate) fn sign(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

//! Optimization Algorithms
//!
//! Gradient-descent variants that update a model's [`Param`]s in place:
//! - SGD with optional momentum
//! - Adam (Adaptive Moment Estimation)
//! - RMSprop
//!
//! Per-parameter state is kept by position, so the same parameter list must be
//! passed to every `step` of a run.

use super::param::Param;
use super::types::OptimizerKind;
use ndarray::Array2;
use std::fmt;

/// Optimizer trait for weight updates
pub trait Optimizer: Send + Sync + fmt::Debug {
    /// Apply one update from the accumulated gradients
    fn step(&mut self, params: &mut [&mut Param]);

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, learning_rate: f64);

    fn clone_box(&self) -> Box<dyn Optimizer>;
}

impl Clone for Box<dyn Optimizer> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

impl OptimizerKind {
    pub fn create(&self, learning_rate: f64) -> Box<dyn Optimizer> {
        match self {
            OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
            OptimizerKind::RmsProp => Box::new(RmsProp::new(learning_rate)),
            OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate)),
        }
    }
}

fn ensure_state(state: &mut Vec<Array2<f64>>, params: &[&mut Param]) {
    let matches = state.len() == params.len()
        && state.iter().zip(params.iter()).all(|(s, p)| s.dim() == p.value.dim());
    if !matches {
        *state = params.iter().map(|p| Array2::zeros(p.value.dim())).collect();
    }
}

/// Stochastic Gradient Descent with optional momentum
#[derive(Debug, Clone)]
pub struct Sgd {
    pub learning_rate: f64,
    pub momentum: f64,
    velocity: Vec<Array2<f64>>,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            momentum: 0.0,
            velocity: Vec::new(),
        }
    }

    pub fn with_momentum(mut self, momentum: f64) -> Self {
        self.momentum = momentum;
        self
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut Param]) {
        if self.momentum > 0.0 {
            ensure_state(&mut self.velocity, params);
            for (param, v) in params.iter_mut().zip(self.velocity.iter_mut()) {
                *v = &*v * self.momentum - &param.grad * self.learning_rate;
                param.value += &*v;
            }
        } else {
            for param in params.iter_mut() {
                let update = &param.grad * self.learning_rate;
                param.value -= &update;
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn clone_box(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

/// Adam optimizer (Adaptive Moment Estimation)
#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    t: i32,
    m: Vec<Array2<f64>>,
    v: Vec<Array2<f64>>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }

    pub fn with_betas(mut self, beta1: f64, beta2: f64) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Param]) {
        ensure_state(&mut self.m, params);
        ensure_state(&mut self.v, params);
        self.t += 1;

        let bias1 = 1.0 - self.beta1.powi(self.t);
        let bias2 = 1.0 - self.beta2.powi(self.t);

        for ((param, m), v) in params
            .iter_mut()
            .zip(self.m.iter_mut())
            .zip(self.v.iter_mut())
        {
            let g = &param.grad;
            *m = &*m * self.beta1 + g * (1.0 - self.beta1);
            *v = &*v * self.beta2 + &(g * g) * (1.0 - self.beta2);

            let m_hat = &*m / bias1;
            let v_hat = &*v / bias2;
            let update = &m_hat * self.learning_rate / &(v_hat.mapv(f64::sqrt) + self.epsilon);
            param.value -= &update;
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn clone_box(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

/// RMSprop: steps scaled by a running average of squared gradients
#[derive(Debug, Clone)]
pub struct RmsProp {
    pub learning_rate: f64,
    pub rho: f64,
    pub epsilon: f64,
    cache: Vec<Array2<f64>>,
}

impl RmsProp {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            rho: 0.9,
            epsilon: 1e-7,
            cache: Vec::new(),
        }
    }
}

impl Optimizer for RmsProp {
    fn step(&mut self, params: &mut [&mut Param]) {
        ensure_state(&mut self.cache, params);

        for (param, cache) in params.iter_mut().zip(self.cache.iter_mut()) {
            let g = &param.grad;
            *cache = &*cache * self.rho + &(g * g) * (1.0 - self.rho);
            let update = g * self.learning_rate / &(cache.mapv(f64::sqrt) + self.epsilon);
            param.value -= &update;
        }
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    fn clone_box(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn param_with_grad() -> Param {
        let mut p = Param::new(Array2::ones((3, 2)), true);
        p.accumulate(&Array2::ones((3, 2)));
        p
    }

    #[test]
    fn test_sgd_update() {
        let mut optimizer = Sgd::new(0.01);
        let mut p = param_with_grad();
        optimizer.step(&mut [&mut p]);

        assert!((p.value[[0, 0]] - 0.99).abs() < 1e-10);
    }

    #[test]
    fn test_adam_update() {
        let mut optimizer = Adam::new(0.001);
        let mut p = param_with_grad();

        for _ in 0..10 {
            optimizer.step(&mut [&mut p]);
        }

        // First Adam steps move by roughly the learning rate
        assert!(p.value[[0, 0]] < 1.0);
        assert!((p.value[[0, 0]] - (1.0 - 0.01)).abs() < 1e-6);
    }

    #[test]
    fn test_rmsprop_update() {
        let mut optimizer = RmsProp::new(0.01);
        let mut p = param_with_grad();
        optimizer.step(&mut [&mut p]);
        assert!(p.value[[0, 0]] < 1.0);
    }

    #[test]
    fn test_minimizes_quadratic() {
        for kind in [OptimizerKind::Adam, OptimizerKind::RmsProp, OptimizerKind::Sgd] {
            let mut optimizer = kind.create(0.05);
            let mut p = Param::new(array![[3.0]], false);
            for _ in 0..500 {
                p.zero_grad();
                let grad = &p.value * 2.0;
                p.accumulate(&grad);
                optimizer.step(&mut [&mut p]);
            }
            assert!(p.value[[0, 0]].abs() < 0.1, "{} did not converge", kind);
        }
    }

    #[test]
    fn test_set_learning_rate() {
        let mut optimizer = OptimizerKind::Adam.create(0.01);
        optimizer.set_learning_rate(0.005);
        assert_eq!(optimizer.learning_rate(), 0.005);
        assert_eq!(optimizer.clone().learning_rate(), 0.005);
    }
}

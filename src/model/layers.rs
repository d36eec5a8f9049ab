//! Dense, batch-normalization and dropout layers, plus the layer stack enum

use super::param::Param;
use super::recurrent::{dropout_mask, RecurrentLayer};
use super::types::Activation;
use crate::error::{ForecastError, Result};
use ndarray::{Array2, Array3, Axis};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Activations flowing between layers
#[derive(Debug, Clone, PartialEq)]
pub enum Tensor {
    /// `(batch, time, features)`
    Seq(Array3<f64>),
    /// `(batch, features)`
    Flat(Array2<f64>),
}

impl Tensor {
    pub fn into_flat(self) -> Result<Array2<f64>> {
        match self {
            Tensor::Flat(x) => Ok(x),
            Tensor::Seq(x) => Err(ForecastError::data_integrity(format!(
                "expected (batch, features), got a sequence of shape {:?}",
                x.dim()
            ))),
        }
    }

    pub fn into_seq(self) -> Result<Array3<f64>> {
        match self {
            Tensor::Seq(x) => Ok(x),
            Tensor::Flat(x) => Err(ForecastError::data_integrity(format!(
                "expected (batch, time, features), got shape {:?}",
                x.dim()
            ))),
        }
    }

    /// Rows of features; sequences are flattened to `(batch * time, features)`
    fn to_rows(&self) -> Result<Array2<f64>> {
        match self {
            Tensor::Flat(x) => Ok(x.clone()),
            Tensor::Seq(x) => {
                let (b, t, f) = x.dim();
                Ok(Array2::from_shape_vec((b * t, f), x.iter().copied().collect())?)
            }
        }
    }

    /// Rebuild a tensor of this tensor's kind from rows
    fn with_rows(&self, rows: Array2<f64>) -> Result<Tensor> {
        match self {
            Tensor::Flat(_) => Ok(Tensor::Flat(rows)),
            Tensor::Seq(x) => {
                let (b, t, f) = x.dim();
                Ok(Tensor::Seq(Array3::from_shape_vec(
                    (b, t, f),
                    rows.iter().copied().collect(),
                )?))
            }
        }
    }
}

/// Fully connected layer: `activation(x · W + b)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dense {
    /// `(input, output)`
    pub weights: Param,
    /// `(1, output)`
    pub biases: Param,
    pub activation: Activation,
    #[serde(skip)]
    last_input: Option<Array2<f64>>,
    #[serde(skip)]
    last_output: Option<Array2<f64>>,
}

impl Dense {
    /// Xavier/Glorot uniform initialization
    pub fn new<R: Rng>(
        input_size: usize,
        output_size: usize,
        activation: Activation,
        regularize: bool,
        rng: &mut R,
    ) -> Self {
        let limit = (6.0 / (input_size + output_size) as f64).sqrt();
        Self {
            weights: Param::new(
                Array2::random_using((input_size, output_size), Uniform::new(-limit, limit), rng),
                regularize,
            ),
            biases: Param::filled((1, output_size), 0.0),
            activation,
            last_input: None,
            last_output: None,
        }
    }

    pub fn input_size(&self) -> usize {
        self.weights.value.nrows()
    }

    pub fn output_size(&self) -> usize {
        self.weights.value.ncols()
    }

    pub fn forward(&mut self, x: &Array2<f64>) -> Result<Array2<f64>> {
        if x.ncols() != self.input_size() {
            return Err(ForecastError::data_integrity(format!(
                "dense layer expects {} features, got {}",
                self.input_size(),
                x.ncols()
            )));
        }
        let activation = self.activation;
        let out = (x.dot(&self.weights.value) + &self.biases.value).mapv(|z| activation.apply(z));
        self.last_input = Some(x.clone());
        self.last_output = Some(out.clone());
        Ok(out)
    }

    pub fn backward(&mut self, grad: &Array2<f64>) -> Result<Array2<f64>> {
        let (input, output) = match (&self.last_input, &self.last_output) {
            (Some(i), Some(o)) => (i, o),
            _ => {
                return Err(ForecastError::NotFitted(
                    "dense backward called before forward".to_string(),
                ))
            }
        };
        let activation = self.activation;
        let delta = grad * &output.mapv(|y| activation.derivative_from_output(y));

        let dw = input.t().dot(&delta);
        let db = delta.sum_axis(Axis(0)).insert_axis(Axis(0));
        let dx = delta.dot(&self.weights.value.t());

        self.weights.accumulate(&dw);
        self.biases.accumulate(&db);
        Ok(dx)
    }
}

/// Batch normalization over the feature axis.
///
/// Sequences are normalized per feature across batch and time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchNorm {
    pub gamma: Param,
    pub beta: Param,
    pub running_mean: Array2<f64>,
    pub running_var: Array2<f64>,
    pub momentum: f64,
    pub epsilon: f64,
    #[serde(skip)]
    cache: Option<(Array2<f64>, Array2<f64>)>,
}

impl BatchNorm {
    pub fn new(features: usize) -> Self {
        Self {
            gamma: Param::filled((1, features), 1.0),
            beta: Param::filled((1, features), 0.0),
            running_mean: Array2::zeros((1, features)),
            running_var: Array2::ones((1, features)),
            momentum: 0.99,
            epsilon: 1e-3,
            cache: None,
        }
    }

    pub fn features(&self) -> usize {
        self.gamma.value.ncols()
    }

    pub fn forward(&mut self, input: &Tensor, training: bool) -> Result<Tensor> {
        let x = input.to_rows()?;
        if x.ncols() != self.features() {
            return Err(ForecastError::data_integrity(format!(
                "batch norm expects {} features, got {}",
                self.features(),
                x.ncols()
            )));
        }

        let (mean, var) = if training && x.nrows() > 0 {
            let n = x.nrows() as f64;
            let mean = x.sum_axis(Axis(0)).insert_axis(Axis(0)) / n;
            let centered = &x - &mean;
            let var = (&centered * &centered).sum_axis(Axis(0)).insert_axis(Axis(0)) / n;

            self.running_mean = &self.running_mean * self.momentum + &mean * (1.0 - self.momentum);
            self.running_var = &self.running_var * self.momentum + &var * (1.0 - self.momentum);
            (mean, var)
        } else {
            (self.running_mean.clone(), self.running_var.clone())
        };

        let inv_std = var.mapv(|v| 1.0 / (v + self.epsilon).sqrt());
        let x_hat = (&x - &mean) * &inv_std;
        let out = &x_hat * &self.gamma.value + &self.beta.value;

        if training {
            self.cache = Some((x_hat, inv_std));
        }
        input.with_rows(out)
    }

    pub fn backward(&mut self, grad: &Tensor) -> Result<Tensor> {
        let (x_hat, inv_std) = self.cache.take().ok_or_else(|| {
            ForecastError::NotFitted("batch norm backward called before forward".to_string())
        })?;
        let dy = grad.to_rows()?;
        let n = dy.nrows() as f64;

        let dgamma = (&dy * &x_hat).sum_axis(Axis(0)).insert_axis(Axis(0));
        let dbeta = dy.sum_axis(Axis(0)).insert_axis(Axis(0));

        // dx = gamma * inv_std / n * (n * dy - sum(dy) - x_hat * sum(dy * x_hat))
        let scale = &self.gamma.value * &inv_std / n;
        let dx = (&dy * n - &dbeta - &x_hat * &dgamma) * &scale;

        self.gamma.accumulate(&dgamma);
        self.beta.accumulate(&dbeta);
        grad.with_rows(dx)
    }
}

/// Inverted dropout, active only in training
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dropout {
    pub rate: f64,
    #[serde(skip)]
    mask: Option<Array2<f64>>,
}

impl Dropout {
    pub fn new(rate: f64) -> Self {
        Self { rate, mask: None }
    }

    pub fn forward<R: Rng>(&mut self, input: Tensor, training: bool, rng: &mut R) -> Result<Tensor> {
        self.mask = None;
        if !training || self.rate <= 0.0 {
            return Ok(input);
        }
        let rows = input.to_rows()?;
        let mask = dropout_mask(rng, rows.dim(), self.rate);
        match mask {
            Some(mask) => {
                let out = &rows * &mask;
                self.mask = Some(mask);
                input.with_rows(out)
            }
            None => Ok(input),
        }
    }

    pub fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        match self.mask.take() {
            Some(mask) => {
                let rows = grad.to_rows()?;
                grad.with_rows(&rows * &mask)
            }
            None => Ok(grad),
        }
    }
}

/// One stage of a [`SequenceModel`](super::SequenceModel)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Layer {
    Recurrent(RecurrentLayer),
    BatchNorm(BatchNorm),
    Dropout(Dropout),
    Dense(Dense),
}

impl Layer {
    pub fn name(&self) -> String {
        match self {
            Layer::Recurrent(l) => {
                let prefix = if l.bidirectional { "Bi" } else { "" };
                format!(
                    "{}{:?}({}, return_sequences={})",
                    prefix, l.cell_kind, l.units, l.return_sequences
                )
            }
            Layer::BatchNorm(l) => format!("BatchNorm({})", l.features()),
            Layer::Dropout(l) => format!("Dropout({})", l.rate),
            Layer::Dense(l) => format!("Dense({}, {})", l.output_size(), l.activation),
        }
    }

    pub fn forward<R: Rng>(&mut self, input: Tensor, training: bool, rng: &mut R) -> Result<Tensor> {
        match self {
            Layer::Recurrent(l) => l.forward(&input.into_seq()?, training, rng),
            Layer::BatchNorm(l) => l.forward(&input, training),
            Layer::Dropout(l) => l.forward(input, training, rng),
            Layer::Dense(l) => Ok(Tensor::Flat(l.forward(&input.into_flat()?)?)),
        }
    }

    pub fn backward(&mut self, grad: Tensor) -> Result<Tensor> {
        match self {
            Layer::Recurrent(l) => Ok(Tensor::Seq(l.backward(grad)?)),
            Layer::BatchNorm(l) => l.backward(&grad),
            Layer::Dropout(l) => l.backward(grad),
            Layer::Dense(l) => Ok(Tensor::Flat(l.backward(&grad.into_flat()?)?)),
        }
    }

    pub fn params(&self) -> Vec<&Param> {
        match self {
            Layer::Recurrent(l) => l.params(),
            Layer::BatchNorm(l) => vec![&l.gamma, &l.beta],
            Layer::Dropout(_) => Vec::new(),
            Layer::Dense(l) => vec![&l.weights, &l.biases],
        }
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            Layer::Recurrent(l) => l.params_mut(),
            Layer::BatchNorm(l) => vec![&mut l.gamma, &mut l.beta],
            Layer::Dropout(_) => Vec::new(),
            Layer::Dense(l) => vec![&mut l.weights, &mut l.biases],
        }
    }

    /// Non-trainable state that still belongs to the weights
    pub fn buffers(&self) -> Vec<&Array2<f64>> {
        match self {
            Layer::BatchNorm(l) => vec![&l.running_mean, &l.running_var],
            _ => Vec::new(),
        }
    }

    pub fn buffers_mut(&mut self) -> Vec<&mut Array2<f64>> {
        match self {
            Layer::BatchNorm(l) => vec![&mut l.running_mean, &mut l.running_var],
            _ => Vec::new(),
        }
    }
}

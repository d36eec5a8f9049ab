//! Assembles a [`SequenceModel`] from a [`ModelConfig`]

use super::layers::{BatchNorm, Dense, Dropout, Layer};
use super::network::{CompileSettings, SequenceModel};
use super::recurrent::RecurrentLayer;
use super::types::{Activation, Head, LossKind};
use crate::config::ModelConfig;
use crate::error::{ForecastError, Result};
use log::{info, warn};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Builds stacked recurrent networks.
///
/// Layout for `recurrent_units = [u1, .., uN]` and `dense_units = [d1, .., dM]`:
///
/// ```text
/// Recurrent(u1, seq) [BatchNorm] [Dropout]
/// ...
/// Recurrent(uN, last) [BatchNorm]
/// Dense(d1) [BatchNorm] [Dropout]
/// ...
/// Dense(1, linear | sigmoid)
/// ```
pub struct ModelBuilder;

impl ModelBuilder {
    /// `input_shape` is `(time_steps, features)`
    pub fn build(input_shape: (usize, usize), config: &ModelConfig) -> Result<SequenceModel> {
        let (time_steps, features) = input_shape;
        if time_steps == 0 || features == 0 {
            return Err(ForecastError::config(format!(
                "input shape ({}, {}) must be non-empty",
                time_steps, features
            )));
        }
        Self::validate(config)?;
        let loss = Self::resolve_loss(config)?;

        let mut rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };

        let cell = config.model_type.cell();
        let bidirectional = config.model_type.is_bidirectional();
        let mut layers = Vec::new();
        let mut width = features;

        let n_recurrent = config.recurrent_units.len();
        for (i, &units) in config.recurrent_units.iter().enumerate() {
            let return_sequences = i + 1 < n_recurrent;
            let layer = RecurrentLayer::new(
                cell,
                width,
                units,
                bidirectional,
                return_sequences,
                config.dropout,
                config.recurrent_dropout,
                &mut rng,
            );
            width = layer.output_size();
            layers.push(Layer::Recurrent(layer));

            if config.batch_norm {
                layers.push(Layer::BatchNorm(BatchNorm::new(width)));
            }
            if config.dropout > 0.0 && return_sequences {
                layers.push(Layer::Dropout(Dropout::new(config.dropout)));
            }
        }

        for &units in &config.dense_units {
            layers.push(Layer::Dense(Dense::new(
                width,
                units,
                config.dense_activation,
                true,
                &mut rng,
            )));
            width = units;

            if config.batch_norm {
                layers.push(Layer::BatchNorm(BatchNorm::new(width)));
            }
            if config.dropout > 0.0 {
                layers.push(Layer::Dropout(Dropout::new(config.dropout)));
            }
        }

        let output_activation = match config.head {
            Head::Regression => Activation::Linear,
            Head::Classification => Activation::Sigmoid,
        };
        layers.push(Layer::Dense(Dense::new(width, 1, output_activation, false, &mut rng)));

        let settings = CompileSettings {
            loss,
            optimizer: config.optimizer,
            learning_rate: config.learning_rate,
            metrics: config.metrics.clone(),
            l1: config.l1,
            l2: config.l2,
        };
        let model = SequenceModel::new(input_shape, config.head, settings, layers, config.seed);

        info!(
            "Built {} model: recurrent {:?}, dense {:?}, {} parameters",
            config.model_type,
            config.recurrent_units,
            config.dense_units,
            model.num_parameters()
        );
        Ok(model)
    }

    fn validate(config: &ModelConfig) -> Result<()> {
        if config.recurrent_units.is_empty() {
            return Err(ForecastError::config("at least one recurrent layer is required"));
        }
        if config
            .recurrent_units
            .iter()
            .chain(config.dense_units.iter())
            .any(|&u| u == 0)
        {
            return Err(ForecastError::config("layer widths must be positive"));
        }
        for (name, rate) in [
            ("dropout", config.dropout),
            ("recurrent_dropout", config.recurrent_dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ForecastError::config(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        if config.l1 < 0.0 || config.l2 < 0.0 {
            return Err(ForecastError::config("regularization factors must be non-negative"));
        }
        if !(config.learning_rate > 0.0 && config.learning_rate.is_finite()) {
            return Err(ForecastError::config("learning_rate must be positive"));
        }
        Ok(())
    }

    /// The classification head always trains on binary cross-entropy
    fn resolve_loss(config: &ModelConfig) -> Result<LossKind> {
        match (config.head, config.loss) {
            (Head::Classification, LossKind::BinaryCrossEntropy) => Ok(LossKind::BinaryCrossEntropy),
            (Head::Classification, other) => {
                warn!(
                    "Classification head uses binary_crossentropy; ignoring configured loss {}",
                    other
                );
                Ok(LossKind::BinaryCrossEntropy)
            }
            (Head::Regression, LossKind::BinaryCrossEntropy) => Err(ForecastError::config(
                "binary_crossentropy needs the classification head",
            )),
            (Head::Regression, loss) => Ok(loss),
        }
    }
}

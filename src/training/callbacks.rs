//! Epoch-end policies: early stopping, learning-rate decay and checkpointing

use super::history::EpochRecord;
use crate::config::{CheckpointConfig, EarlyStoppingConfig, ReduceLrConfig};
use crate::error::{ForecastError, Result};
use crate::model::{MetricKind, SequenceModel, WeightSnapshot};
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// What a monitor reads from an epoch record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Loss,
    Metric(MetricKind),
}

/// A quantity on the train or validation split, e.g. `val_loss` or `mae`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Monitor {
    pub validation: bool,
    pub quantity: Quantity,
}

impl Monitor {
    pub fn val_loss() -> Self {
        Self {
            validation: true,
            quantity: Quantity::Loss,
        }
    }

    pub fn loss() -> Self {
        Self {
            validation: false,
            quantity: Quantity::Loss,
        }
    }

    pub fn val_metric(metric: MetricKind) -> Self {
        Self {
            validation: true,
            quantity: Quantity::Metric(metric),
        }
    }

    /// Direction of improvement implied by the quantity
    pub fn default_mode(&self) -> Mode {
        match self.quantity {
            Quantity::Metric(m) if m.higher_is_better() => Mode::Max,
            _ => Mode::Min,
        }
    }

    /// Value of the monitored quantity in `record`.
    ///
    /// Falls back to the training value when the record has no validation
    /// pass (empty validation split).
    pub fn read(&self, record: &EpochRecord) -> Option<f64> {
        let validation = self.validation && record.val_loss.is_some();
        match (self.quantity, validation) {
            (Quantity::Loss, true) => record.val_loss,
            (Quantity::Loss, false) => Some(record.loss),
            (Quantity::Metric(m), true) => record.val_metric(m),
            (Quantity::Metric(m), false) => record.metric(m),
        }
    }
}

impl FromStr for Monitor {
    type Err = ForecastError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let (validation, name) = match lower.strip_prefix("val_") {
            Some(rest) => (true, rest),
            None => (false, lower.as_str()),
        };
        let quantity = match name {
            "loss" => Quantity::Loss,
            other => Quantity::Metric(
                other
                    .parse()
                    .map_err(|_| ForecastError::config(format!("unknown monitor '{}'", s)))?,
            ),
        };
        Ok(Self {
            validation,
            quantity,
        })
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.validation {
            f.write_str("val_")?;
        }
        match self.quantity {
            Quantity::Loss => f.write_str("loss"),
            Quantity::Metric(m) => f.write_str(m.name()),
        }
    }
}

impl TryFrom<String> for Monitor {
    type Error = ForecastError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Monitor> for String {
    fn from(value: Monitor) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Min,
    Max,
}

impl Mode {
    /// `current` beats `best` by more than `min_delta`
    pub fn improved(&self, current: f64, best: Option<f64>, min_delta: f64) -> bool {
        match best {
            None => current.is_finite(),
            Some(best) => match self {
                Mode::Min => current < best - min_delta,
                Mode::Max => current > best + min_delta,
            },
        }
    }
}

/// Halts training after `patience` epochs without improvement
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    pub monitor: Monitor,
    mode: Mode,
    patience: usize,
    min_delta: f64,
    restore_best_weights: bool,
    best: Option<f64>,
    best_epoch: Option<usize>,
    best_weights: Option<WeightSnapshot>,
    wait: usize,
}

impl EarlyStopping {
    pub fn new(config: &EarlyStoppingConfig) -> Self {
        Self {
            monitor: config.monitor,
            mode: config.monitor.default_mode(),
            patience: config.patience,
            min_delta: config.min_delta,
            restore_best_weights: config.restore_best_weights,
            best: None,
            best_epoch: None,
            best_weights: None,
            wait: 0,
        }
    }

    pub fn best(&self) -> Option<(usize, f64)> {
        self.best_epoch.zip(self.best)
    }

    /// Returns true when training should stop
    pub fn on_epoch_end(&mut self, record: &EpochRecord, model: &SequenceModel) -> bool {
        let Some(value) = self.monitor.read(record) else {
            return false;
        };

        if self.mode.improved(value, self.best, self.min_delta) {
            self.best = Some(value);
            self.best_epoch = Some(record.epoch);
            self.wait = 0;
            if self.restore_best_weights {
                self.best_weights = Some(model.snapshot());
            }
            false
        } else {
            self.wait += 1;
            self.wait >= self.patience
        }
    }

    /// Put the best weights back, if they were kept
    pub fn restore(&self, model: &mut SequenceModel) -> Result<bool> {
        match (&self.best_weights, self.restore_best_weights) {
            (Some(weights), true) => {
                model.restore(weights)?;
                if let Some((epoch, value)) = self.best() {
                    info!(
                        "Restored weights from epoch {} ({} = {:.6})",
                        epoch, self.monitor, value
                    );
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Multiplies the learning rate by `factor` on a plateau, floored at `min_lr`
#[derive(Debug, Clone)]
pub struct ReduceLr {
    pub monitor: Monitor,
    mode: Mode,
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: Option<f64>,
    wait: usize,
}

impl ReduceLr {
    pub fn new(config: &ReduceLrConfig) -> Self {
        Self {
            monitor: config.monitor,
            mode: config.monitor.default_mode(),
            factor: config.factor,
            patience: config.patience,
            min_lr: config.min_lr,
            best: None,
            wait: 0,
        }
    }

    /// Returns the new learning rate when it was lowered
    pub fn on_epoch_end(&mut self, record: &EpochRecord, model: &mut SequenceModel) -> Option<f64> {
        let value = self.monitor.read(record)?;

        if self.mode.improved(value, self.best, 0.0) {
            self.best = Some(value);
            self.wait = 0;
            return None;
        }

        self.wait += 1;
        if self.wait < self.patience {
            return None;
        }
        self.wait = 0;

        let current = model.learning_rate();
        let reduced = (current * self.factor).max(self.min_lr);
        if reduced < current {
            model.set_learning_rate(reduced);
            info!("Epoch {}: learning rate reduced to {:.2e}", record.epoch, reduced);
            Some(reduced)
        } else {
            None
        }
    }
}

/// Writes the model to disk when the monitored value improves
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub monitor: Monitor,
    mode: Mode,
    save_best_only: bool,
    weights_only: bool,
    best: Option<f64>,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>, config: &CheckpointConfig) -> Self {
        Self {
            path: path.into(),
            monitor: config.monitor,
            mode: config.mode,
            save_best_only: config.save_best_only,
            weights_only: config.weights_only,
            best: None,
        }
    }

    /// Returns true when a file was written
    pub fn on_epoch_end(&mut self, record: &EpochRecord, model: &SequenceModel) -> Result<bool> {
        let value = self.monitor.read(record);
        let improved = value
            .map(|v| self.mode.improved(v, self.best, 0.0))
            .unwrap_or(false);
        if improved {
            self.best = value;
        }
        if self.save_best_only && !improved {
            return Ok(false);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        if self.weights_only {
            model.snapshot().save(&self.path)?;
        } else {
            model.save(&self.path)?;
        }
        info!(
            "Epoch {}: {} = {:.6}, checkpoint written to {}",
            record.epoch,
            self.monitor,
            value.unwrap_or(f64::NAN),
            self.path.display()
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::ModelBuilder;
    use approx::assert_relative_eq;

    fn record(epoch: usize, val_loss: f64) -> EpochRecord {
        EpochRecord {
            epoch,
            loss: val_loss + 0.1,
            metrics: vec![(MetricKind::Mae, 0.3)],
            val_loss: Some(val_loss),
            val_metrics: vec![(MetricKind::Mae, val_loss / 2.0)],
            learning_rate: 0.01,
        }
    }

    fn model() -> SequenceModel {
        let config = ModelConfig {
            recurrent_units: vec![2],
            dense_units: vec![],
            learning_rate: 0.01,
            seed: Some(3),
            ..ModelConfig::default()
        };
        ModelBuilder::build((3, 2), &config).unwrap()
    }

    #[test]
    fn test_monitor_parsing() {
        assert_eq!("val_loss".parse::<Monitor>().unwrap(), Monitor::val_loss());
        assert_eq!(
            "val_mae".parse::<Monitor>().unwrap(),
            Monitor::val_metric(MetricKind::Mae)
        );
        assert_eq!("loss".parse::<Monitor>().unwrap(), Monitor::loss());
        assert_eq!(Monitor::val_metric(MetricKind::Mse).to_string(), "val_mse");
        assert!(matches!(
            "val_sharpe".parse::<Monitor>(),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_monitor_reads_record() {
        let r = record(1, 0.4);
        assert_eq!(Monitor::val_loss().read(&r), Some(0.4));
        assert_eq!(Monitor::val_metric(MetricKind::Mae).read(&r), Some(0.2));
        assert_eq!("mae".parse::<Monitor>().unwrap().read(&r), Some(0.3));

        let no_val = EpochRecord {
            val_loss: None,
            val_metrics: vec![],
            ..r
        };
        assert_eq!(Monitor::val_loss().read(&no_val), Some(0.5));
    }

    #[test]
    fn test_accuracy_monitor_maximizes() {
        assert_eq!(Monitor::val_metric(MetricKind::Accuracy).default_mode(), Mode::Max);
        assert_eq!(Monitor::val_loss().default_mode(), Mode::Min);
    }

    #[test]
    fn test_early_stopping_on_plateau() {
        let m = model();
        let mut stopper = EarlyStopping::new(&EarlyStoppingConfig {
            patience: 3,
            min_delta: 0.01,
            ..EarlyStoppingConfig::default()
        });

        assert!(!stopper.on_epoch_end(&record(1, 1.0), &m));
        assert!(!stopper.on_epoch_end(&record(2, 0.5), &m));
        // within min_delta: not an improvement
        assert!(!stopper.on_epoch_end(&record(3, 0.495), &m));
        assert!(!stopper.on_epoch_end(&record(4, 0.6), &m));
        assert!(stopper.on_epoch_end(&record(5, 0.5), &m));
        assert_eq!(stopper.best(), Some((2, 0.5)));
    }

    #[test]
    fn test_restore_best_weights_after_training_moves_on() {
        let mut m = model();
        let mut stopper = EarlyStopping::new(&EarlyStoppingConfig {
            patience: 1,
            min_delta: 0.0,
            restore_best_weights: true,
            ..EarlyStoppingConfig::default()
        });

        assert!(!stopper.on_epoch_end(&record(1, 0.5), &m));
        let best = m.snapshot();

        let x = ndarray::Array3::from_shape_fn((4, 3, 2), |(b, t, f)| {
            0.1 * (b + t) as f64 + 0.05 * f as f64
        });
        let y = ndarray::Array1::from_vec(vec![0.9, 0.1, 0.7, 0.3]);
        m.train_batch(&x, &y).unwrap();
        assert_ne!(m.snapshot(), best);

        assert!(stopper.on_epoch_end(&record(2, 0.9), &m));
        assert!(stopper.restore(&mut m).unwrap());
        assert_eq!(m.snapshot(), best);
    }

    #[test]
    fn test_restore_is_noop_without_kept_weights() {
        let mut m = model();
        let stopper = EarlyStopping::new(&EarlyStoppingConfig {
            restore_best_weights: false,
            ..EarlyStoppingConfig::default()
        });
        assert!(!stopper.restore(&mut m).unwrap());
    }

    #[test]
    fn test_reduce_lr_respects_floor() {
        let mut m = model();
        let mut reducer = ReduceLr::new(&ReduceLrConfig {
            factor: 0.1,
            patience: 1,
            min_lr: 0.0005,
            ..ReduceLrConfig::default()
        });

        assert_eq!(reducer.on_epoch_end(&record(1, 1.0), &mut m), None);
        let first = reducer.on_epoch_end(&record(2, 1.0), &mut m).unwrap();
        assert_relative_eq!(first, 0.001, epsilon = 1e-12);
        assert_eq!(reducer.on_epoch_end(&record(3, 1.0), &mut m), Some(0.0005));
        assert_eq!(reducer.on_epoch_end(&record(4, 1.0), &mut m), None);
        assert_eq!(m.learning_rate(), 0.0005);
    }

    #[test]
    fn test_checkpoint_saves_only_improvements() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("best.bin");
        let m = model();
        let mut checkpoint = Checkpoint::new(&path, &CheckpointConfig::default());

        assert!(checkpoint.on_epoch_end(&record(1, 0.5), &m).unwrap());
        assert!(path.exists());
        assert!(!checkpoint.on_epoch_end(&record(2, 0.7), &m).unwrap());
        assert!(checkpoint.on_epoch_end(&record(3, 0.2), &m).unwrap());

        let loaded = SequenceModel::load(&path).unwrap();
        assert_eq!(loaded.snapshot(), m.snapshot());
    }

    #[test]
    fn test_weights_only_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.bin");
        let m = model();
        let mut checkpoint = Checkpoint::new(
            &path,
            &CheckpointConfig {
                weights_only: true,
                ..CheckpointConfig::default()
            },
        );

        checkpoint.on_epoch_end(&record(1, 0.5), &m).unwrap();
        assert_eq!(WeightSnapshot::load(&path).unwrap(), m.snapshot());
    }
}

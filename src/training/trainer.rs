//! Training loop
//!
//! Ordered mini-batches, one validation pass per epoch, and the epoch-end
//! policies from [`callbacks`](super::callbacks).

use super::callbacks::{Checkpoint, EarlyStopping, ReduceLr};
use super::history::{EpochRecord, History};
use crate::config::TrainingConfig;
use crate::error::{ForecastError, Result};
use crate::model::SequenceModel;
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use ndarray::{Array1, Array3, Axis};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Running,
    Completed,
    EarlyStopped,
    Interrupted,
    Failed,
}

impl TrainingState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TrainingState::Idle | TrainingState::Running)
    }
}

impl fmt::Display for TrainingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingState::Idle => "idle",
            TrainingState::Running => "running",
            TrainingState::Completed => "completed",
            TrainingState::EarlyStopped => "early stopped",
            TrainingState::Interrupted => "interrupted",
            TrainingState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Shared stop flag, checked between batches
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of [`Trainer::fit`]
#[derive(Debug, Clone)]
pub struct TrainingReport {
    pub state: TrainingState,
    /// Epoch with the best monitored value, 1-based
    pub best_epoch: Option<usize>,
    pub best_value: Option<f64>,
    pub history: History,
    /// Why training failed, for `TrainingState::Failed`
    pub failure: Option<String>,
}

impl TrainingReport {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }
}

/// Borrowed windows and targets of one split
#[derive(Debug, Clone, Copy)]
pub struct SplitRef<'a> {
    pub x: &'a Array3<f64>,
    pub y: &'a Array1<f64>,
}

impl<'a> SplitRef<'a> {
    pub fn new(x: &'a Array3<f64>, y: &'a Array1<f64>) -> Self {
        Self { x, y }
    }

    pub fn len(&self) -> usize {
        self.y.len()
    }

    pub fn is_empty(&self) -> bool {
        self.y.is_empty()
    }

    fn batch(&self, indices: &[usize]) -> (Array3<f64>, Array1<f64>) {
        (self.x.select(Axis(0), indices), self.y.select(Axis(0), indices))
    }
}

pub struct Trainer {
    config: TrainingConfig,
    checkpoint_path: Option<PathBuf>,
    interrupt: InterruptHandle,
    state: TrainingState,
    seed: u64,
}

impl Trainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            checkpoint_path: None,
            interrupt: InterruptHandle::new(),
            state: TrainingState::Idle,
            seed: 42,
        }
    }

    /// Where the checkpoint policy writes. Without a path checkpointing is off.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    /// Seed for batch shuffling, when enabled
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    /// Train `model` on `train`, validating on `val` after every epoch.
    ///
    /// A non-finite loss ends in `Failed` and an interrupt in `Interrupted`;
    /// neither is an `Err`. The history is returned either way. An error
    /// raised mid-training is returned and also leaves the trainer `Failed`.
    pub fn fit(
        &mut self,
        model: &mut SequenceModel,
        train: SplitRef<'_>,
        val: SplitRef<'_>,
    ) -> Result<TrainingReport> {
        if train.x.dim().0 != train.len() || val.x.dim().0 != val.len() {
            return Err(ForecastError::data_integrity(
                "window and target counts differ",
            ));
        }
        if train.is_empty() {
            return Err(ForecastError::insufficient("training split is empty"));
        }
        if self.config.batch_size == 0 {
            return Err(ForecastError::config("batch_size must be positive"));
        }
        if val.is_empty() {
            warn!("Validation split is empty; monitors fall back to training values");
        }

        self.state = TrainingState::Running;
        self.run(model, train, val).map_err(|e| {
            warn!("Training aborted: {}", e);
            self.state = TrainingState::Failed;
            e
        })
    }

    fn run(
        &mut self,
        model: &mut SequenceModel,
        train: SplitRef<'_>,
        val: SplitRef<'_>,
    ) -> Result<TrainingReport> {
        let mut history = History::new(model.settings.metrics.clone());
        let mut early_stopping = self
            .config
            .early_stopping
            .enabled
            .then(|| EarlyStopping::new(&self.config.early_stopping));
        let mut reduce_lr = self
            .config
            .reduce_lr
            .enabled
            .then(|| ReduceLr::new(&self.config.reduce_lr));
        let mut checkpoint = match (&self.checkpoint_path, self.config.checkpoint.enabled) {
            (Some(path), true) => Some(Checkpoint::new(path, &self.config.checkpoint)),
            _ => None,
        };

        let n_batches = (train.len() + self.config.batch_size - 1) / self.config.batch_size;
        info!(
            "Training for up to {} epochs: {} samples, {} batches of {}",
            self.config.epochs,
            train.len(),
            n_batches,
            self.config.batch_size
        );

        let pb = if self.config.show_progress {
            ProgressBar::new(self.config.epochs as u64)
        } else {
            ProgressBar::hidden()
        };
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let mut order: Vec<usize> = (0..train.len()).collect();
        let mut failure = None;

        'epochs: for epoch in 1..=self.config.epochs {
            if self.config.shuffle {
                order.shuffle(&mut rng);
            }
            let learning_rate = model.learning_rate();

            let mut loss_sum = 0.0;
            let mut predictions = Array1::zeros(train.len());
            for chunk in order.chunks(self.config.batch_size) {
                if self.interrupt.is_interrupted() {
                    self.state = TrainingState::Interrupted;
                    break 'epochs;
                }

                let (x, y) = train.batch(chunk);
                let (loss, batch_predictions) = model.train_batch(&x, &y)?;
                if !loss.is_finite() {
                    let reason = format!("non-finite training loss at epoch {}", epoch);
                    warn!("{}", reason);
                    failure = Some(reason);
                    self.state = TrainingState::Failed;
                    break 'epochs;
                }

                loss_sum += loss * chunk.len() as f64;
                for (&i, &p) in chunk.iter().zip(batch_predictions.iter()) {
                    predictions[i] = p;
                }
            }

            let metrics = model
                .settings
                .metrics
                .iter()
                .map(|m| (*m, m.compute(&predictions, train.y)))
                .collect();
            let (val_loss, val_metrics) = if val.is_empty() {
                (None, Vec::new())
            } else {
                let evaluation = model.evaluate(val.x, val.y)?;
                (Some(evaluation.loss), evaluation.metrics)
            };

            let record = EpochRecord {
                epoch,
                loss: loss_sum / train.len() as f64,
                metrics,
                val_loss,
                val_metrics,
                learning_rate,
            };

            if let Some(v) = record.val_loss.filter(|v| !v.is_finite()) {
                let reason = format!("validation loss {} at epoch {}", v, epoch);
                warn!("{}", reason);
                failure = Some(reason);
                history.push(record);
                self.state = TrainingState::Failed;
                break;
            }

            pb.set_message(format!(
                "loss {:.6} val_loss {}",
                record.loss,
                record
                    .val_loss
                    .map(|v| format!("{:.6}", v))
                    .unwrap_or_else(|| "-".to_string())
            ));
            pb.inc(1);

            if let Some(checkpoint) = checkpoint.as_mut() {
                checkpoint.on_epoch_end(&record, model)?;
            }
            let stop = early_stopping
                .as_mut()
                .map(|es| es.on_epoch_end(&record, model))
                .unwrap_or(false);
            if let Some(reducer) = reduce_lr.as_mut() {
                reducer.on_epoch_end(&record, model);
            }

            history.push(record);
            if stop {
                info!("Early stopping at epoch {}", epoch);
                self.state = TrainingState::EarlyStopped;
                break;
            }
        }

        if self.state == TrainingState::Running {
            self.state = TrainingState::Completed;
        }
        pb.finish_with_message(format!("training {}", self.state));

        if matches!(
            self.state,
            TrainingState::EarlyStopped | TrainingState::Interrupted
        ) {
            if let Some(es) = early_stopping.as_ref() {
                es.restore(model)?;
            }
        }

        let (best_epoch, best_value) = match early_stopping.as_ref().and_then(|es| es.best()) {
            Some((epoch, value)) => (Some(epoch), Some(value)),
            None => {
                let monitor = self.config.early_stopping.monitor;
                let mode = monitor.default_mode();
                let mut best: Option<(usize, f64)> = None;
                for record in &history.records {
                    if let Some(v) = monitor.read(record) {
                        if mode.improved(v, best.map(|b| b.1), 0.0) {
                            best = Some((record.epoch, v));
                        }
                    }
                }
                (best.map(|b| b.0), best.map(|b| b.1))
            }
        };

        info!(
            "Training {} after {} epochs (best epoch {:?}, value {:?})",
            self.state,
            history.len(),
            best_epoch,
            best_value
        );

        Ok(TrainingReport {
            state: self.state,
            best_epoch,
            best_value,
            history,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CheckpointConfig, EarlyStoppingConfig, ModelConfig, ReduceLrConfig};
    use crate::model::{ModelBuilder, WeightSnapshot};

    fn sine_windows(n: usize, steps: usize) -> (Array3<f64>, Array1<f64>) {
        let series: Vec<f64> = (0..n + steps)
            .map(|i| 0.5 + 0.4 * (i as f64 * 0.3).sin())
            .collect();
        let x = Array3::from_shape_fn((n, steps, 1), |(b, t, _)| series[b + t]);
        let y = Array1::from_shape_fn(n, |b| series[b + steps]);
        (x, y)
    }

    fn small_model() -> SequenceModel {
        let config = ModelConfig {
            recurrent_units: vec![4],
            dense_units: vec![],
            dropout: 0.0,
            recurrent_dropout: 0.0,
            batch_norm: false,
            l2: 0.0,
            learning_rate: 0.01,
            seed: Some(11),
            ..ModelConfig::default()
        };
        ModelBuilder::build((5, 1), &config).unwrap()
    }

    fn quiet(epochs: usize) -> TrainingConfig {
        TrainingConfig {
            epochs,
            batch_size: 8,
            show_progress: false,
            ..TrainingConfig::default()
        }
    }

    #[test]
    fn test_completes_and_records_history() {
        let (x, y) = sine_windows(40, 5);
        let (vx, vy) = sine_windows(10, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(quiet(4));
        assert_eq!(trainer.state(), TrainingState::Idle);

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();

        assert_eq!(report.state, TrainingState::Completed);
        assert_eq!(trainer.state(), TrainingState::Completed);
        assert_eq!(report.epochs_run(), 4);
        assert!(report.history.records.iter().all(|r| r.val_loss.is_some()));
        assert_eq!(report.history.records[0].metrics.len(), 2);
        assert!(report.best_epoch.is_some());
    }

    #[test]
    fn test_loss_decreases_on_sine() {
        let (x, y) = sine_windows(64, 5);
        let (vx, vy) = sine_windows(16, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(TrainingConfig {
            early_stopping: EarlyStoppingConfig {
                enabled: false,
                ..EarlyStoppingConfig::default()
            },
            ..quiet(30)
        });

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        let losses = report.history.losses();
        assert!(losses[losses.len() - 1] < losses[0]);
    }

    #[test]
    fn test_early_stops_on_plateau() {
        let (x, y) = sine_windows(32, 5);
        let (vx, vy) = sine_windows(8, 5);
        let mut model = small_model();
        // a frozen model cannot improve after the first epoch
        model.set_learning_rate(1e-300);
        let mut trainer = Trainer::new(TrainingConfig {
            early_stopping: EarlyStoppingConfig {
                patience: 2,
                min_delta: 1e-3,
                ..EarlyStoppingConfig::default()
            },
            ..quiet(50)
        });

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        assert_eq!(report.state, TrainingState::EarlyStopped);
        assert_eq!(report.epochs_run(), 3);
        assert_eq!(report.best_epoch, Some(1));
    }

    #[test]
    fn test_learning_rate_floor() {
        let (x, y) = sine_windows(16, 5);
        let (vx, vy) = sine_windows(8, 5);
        let mut model = small_model();
        let start = 1e-200;
        let floor = start * 0.25;
        model.set_learning_rate(start);
        let mut trainer = Trainer::new(TrainingConfig {
            early_stopping: EarlyStoppingConfig {
                enabled: false,
                ..EarlyStoppingConfig::default()
            },
            reduce_lr: ReduceLrConfig {
                factor: 0.5,
                patience: 1,
                min_lr: floor,
                ..ReduceLrConfig::default()
            },
            ..quiet(6)
        });

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        let rates: Vec<f64> = report.history.records.iter().map(|r| r.learning_rate).collect();
        assert_eq!(rates, vec![start, start, start * 0.5, floor, floor, floor]);
        assert_eq!(model.learning_rate(), floor);
    }

    #[test]
    fn test_pre_set_interrupt() {
        let (x, y) = sine_windows(16, 5);
        let (vx, vy) = sine_windows(4, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(quiet(10));
        trainer.interrupt_handle().interrupt();

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        assert_eq!(report.state, TrainingState::Interrupted);
        assert!(report.history.is_empty());
    }

    #[test]
    fn test_interrupt_keeps_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.bin");
        let (x, y) = sine_windows(32, 5);
        let (vx, vy) = sine_windows(8, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(TrainingConfig {
            early_stopping: EarlyStoppingConfig {
                enabled: false,
                ..EarlyStoppingConfig::default()
            },
            ..quiet(100_000)
        })
        .with_checkpoint_path(&path);

        let handle = trainer.interrupt_handle();
        let watched = path.clone();
        let watcher = std::thread::spawn(move || {
            while !watched.exists() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            handle.interrupt();
        });

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        watcher.join().unwrap();

        assert_eq!(report.state, TrainingState::Interrupted);
        assert!(report.epochs_run() >= 1);
        assert!(SequenceModel::load(&path).is_ok());
    }

    #[test]
    fn test_interrupt_restores_best_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best_weights.bin");
        let (x, y) = sine_windows(32, 5);
        let (vx, vy) = sine_windows(8, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(TrainingConfig {
            early_stopping: EarlyStoppingConfig {
                patience: usize::MAX,
                min_delta: 0.0,
                restore_best_weights: true,
                ..EarlyStoppingConfig::default()
            },
            checkpoint: CheckpointConfig {
                weights_only: true,
                ..CheckpointConfig::default()
            },
            ..quiet(100_000)
        })
        .with_checkpoint_path(&path);

        let handle = trainer.interrupt_handle();
        let watched = path.clone();
        let watcher = std::thread::spawn(move || {
            while !watched.exists() {
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            handle.interrupt();
        });

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        watcher.join().unwrap();

        assert_eq!(report.state, TrainingState::Interrupted);
        // the checkpoint holds the best epoch, which is what the model must end on
        assert_eq!(model.snapshot(), WeightSnapshot::load(&path).unwrap());
    }

    #[test]
    fn test_error_mid_training_leaves_failed_state() {
        let (x, y) = sine_windows(16, 5);
        // three features against a one-feature model
        let vx = Array3::zeros((4, 5, 3));
        let vy = Array1::zeros(4);
        let mut model = small_model();
        let mut trainer = Trainer::new(quiet(3));

        let result = trainer.fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy));
        assert!(result.is_err());
        assert_eq!(trainer.state(), TrainingState::Failed);
    }

    #[test]
    fn test_diverging_loss_fails() {
        let (x, mut y) = sine_windows(16, 5);
        y[3] = f64::NAN;
        let (vx, vy) = sine_windows(4, 5);
        let mut model = small_model();
        let mut trainer = Trainer::new(quiet(5));

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        assert_eq!(report.state, TrainingState::Failed);
        assert!(report.failure.is_some());
    }

    #[test]
    fn test_empty_validation_falls_back() {
        let (x, y) = sine_windows(16, 5);
        let vx = Array3::zeros((0, 5, 1));
        let vy = Array1::zeros(0);
        let mut model = small_model();
        let mut trainer = Trainer::new(quiet(2));

        let report = trainer
            .fit(&mut model, SplitRef::new(&x, &y), SplitRef::new(&vx, &vy))
            .unwrap();
        assert_eq!(report.state, TrainingState::Completed);
        assert!(report.history.records.iter().all(|r| r.val_loss.is_none()));
    }
}

//! Configuration management
//!
//! Configuration is a set of plain value objects loaded from TOML. Presets are
//! factory functions returning a fresh [`Config`]; nothing here is mutated
//! globally. Each pipeline stage receives only the section it needs.

use crate::error::{ForecastError, Result};
use crate::model::forest::ForestConfig;
use crate::model::{Activation, Head, LossKind, MetricKind, ModelKind, OptimizerKind};
use crate::preprocessing::{splitter, ScalerFitScope, ScalerKind};
use crate::training::{Mode, Monitor};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Base OHLCV columns, in the order the windower expects
pub const BASE_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

/// Data acquisition and windowing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    pub symbol: String,
    pub interval: String,
    /// First candle to fetch, `YYYY-MM-DD`
    pub start_date: String,
    /// Ordered feature columns; must start with the base OHLCV columns
    pub feature_columns: Vec<String>,
    pub time_steps: usize,
    /// Position of the close price inside `feature_columns`
    pub target_column: usize,
    pub train_ratio: f64,
    pub val_ratio: f64,
}

impl Default for DataConfig {
    fn default() -> Self {
        let mut feature_columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        feature_columns.extend(
            [
                "rsi",
                "macd",
                "macd_signal",
                "macd_hist",
                "bb_upper",
                "bb_middle",
                "bb_lower",
                "ema_12",
                "ema_26",
                "atr",
                "obv",
            ]
            .iter()
            .map(|c| c.to_string()),
        );

        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            start_date: "2024-01-01".to_string(),
            feature_columns,
            time_steps: 60,
            target_column: 3,
            train_ratio: 0.70,
            val_ratio: 0.15,
        }
    }
}

/// Normalization configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalerConfig {
    pub kind: ScalerKind,
    pub feature_range: (f64, f64),
    pub fit_scope: ScalerFitScope,
}

impl Default for ScalerConfig {
    fn default() -> Self {
        Self {
            kind: ScalerKind::MinMax,
            feature_range: (0.0, 1.0),
            fit_scope: ScalerFitScope::FullSeries,
        }
    }
}

/// Network architecture and compilation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_type: ModelKind,
    /// Units per recurrent layer, first to last
    pub recurrent_units: Vec<usize>,
    pub dense_units: Vec<usize>,
    pub dropout: f64,
    pub recurrent_dropout: f64,
    pub l1: f64,
    pub l2: f64,
    pub batch_norm: bool,
    pub dense_activation: Activation,
    pub head: Head,
    pub loss: LossKind,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub metrics: Vec<MetricKind>,
    /// Seed for weight initialization and dropout masks
    pub seed: Option<u64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_type: ModelKind::BiLstm,
            recurrent_units: vec![128, 64, 32],
            dense_units: vec![16],
            dropout: 0.2,
            recurrent_dropout: 0.1,
            l1: 0.0,
            l2: 0.001,
            batch_norm: true,
            dense_activation: Activation::Relu,
            head: Head::Regression,
            loss: LossKind::Mse,
            optimizer: OptimizerKind::Adam,
            learning_rate: 0.001,
            metrics: vec![MetricKind::Mae, MetricKind::Mse],
            seed: None,
        }
    }
}

/// Early stopping policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub enabled: bool,
    pub monitor: Monitor,
    pub patience: usize,
    pub min_delta: f64,
    pub restore_best_weights: bool,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor: Monitor::val_loss(),
            patience: 15,
            min_delta: 1e-4,
            restore_best_weights: true,
        }
    }
}

/// Learning-rate decay on plateau
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReduceLrConfig {
    pub enabled: bool,
    pub monitor: Monitor,
    pub factor: f64,
    pub patience: usize,
    pub min_lr: f64,
}

impl Default for ReduceLrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor: Monitor::val_loss(),
            factor: 0.5,
            patience: 7,
            min_lr: 1e-7,
        }
    }
}

/// Checkpointing policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub enabled: bool,
    pub monitor: Monitor,
    pub mode: Mode,
    pub save_best_only: bool,
    pub weights_only: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            monitor: Monitor::val_loss(),
            mode: Mode::Min,
            save_best_only: true,
            weights_only: false,
        }
    }
}

/// Training loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batch_size: usize,
    /// Shuffle batch order each epoch. Off for time series.
    pub shuffle: bool,
    pub early_stopping: EarlyStoppingConfig,
    pub reduce_lr: ReduceLrConfig,
    pub checkpoint: CheckpointConfig,
    pub show_progress: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batch_size: 32,
            shuffle: false,
            early_stopping: EarlyStoppingConfig::default(),
            reduce_lr: ReduceLrConfig::default(),
            checkpoint: CheckpointConfig::default(),
            show_progress: true,
        }
    }
}

/// Artifact locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub data_dir: PathBuf,
    pub models_dir: PathBuf,
    pub results_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            models_dir: PathBuf::from("models"),
            results_dir: PathBuf::from("results"),
        }
    }
}

impl PathConfig {
    pub fn raw_data_path(&self, symbol: &str, interval: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}_{}.csv", symbol.to_lowercase(), interval))
    }

    pub fn model_path(&self) -> PathBuf {
        self.models_dir.join("model.bin")
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.models_dir.join("checkpoint.bin")
    }

    pub fn scaler_path(&self) -> PathBuf {
        self.models_dir.join("scaler.bin")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.models_dir.join("manifest.json")
    }

    pub fn classifier_path(&self) -> PathBuf {
        self.models_dir.join("direction_forest.json")
    }

    pub fn history_path(&self) -> PathBuf {
        self.results_dir.join("training_history.csv")
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.results_dir.join("predictions.csv")
    }

    /// Create every artifact directory
    pub fn create_directories(&self) -> Result<()> {
        for dir in [&self.data_dir, &self.models_dir, &self.results_dir] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Backtest configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Periods per year used to annualize the Sharpe ratio
    pub periods_per_year: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            periods_per_year: 24.0 * 365.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub data: DataConfig,
    pub scaler: ScalerConfig,
    pub model: ModelConfig,
    pub training: TrainingConfig,
    pub classifier: ForestConfig,
    pub paths: PathConfig,
    pub backtest: BacktestConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ForecastError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ForecastError::config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Write the default configuration to `path`
    pub fn create_default<P: AsRef<Path>>(path: P) -> Result<()> {
        Config::default().save(path)
    }

    /// Config for the binaries: a TOML file when given, otherwise the named
    /// preset, otherwise defaults
    pub fn resolve(path: Option<&Path>, preset: Option<&str>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let config = match preset {
            Some(name) => Self::preset(name)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Override the market selection from the command line
    pub fn with_market(
        mut self,
        symbol: Option<String>,
        interval: Option<String>,
        start_date: Option<String>,
    ) -> Result<Self> {
        if let Some(symbol) = symbol {
            self.data.symbol = symbol.to_uppercase();
        }
        if let Some(interval) = interval {
            self.data.interval = interval;
        }
        if let Some(start_date) = start_date {
            self.data.start_date = start_date;
        }
        self.validate()?;
        Ok(self)
    }

    /// Build a preset by name
    pub fn preset(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "default" => Ok(Self::default()),
            "quick_test" => Ok(Self::quick_test()),
            "production" => Ok(Self::production()),
            "large_batch" | "gpu_optimized" => Ok(Self::large_batch()),
            "cpu_friendly" => Ok(Self::cpu_friendly()),
            _ => Err(ForecastError::config(format!("unknown preset '{}'", name))),
        }
    }

    /// Small windows and a short run for smoke tests
    pub fn quick_test() -> Self {
        let mut config = Self::default();
        config.data.time_steps = 30;
        config.model.recurrent_units = vec![64, 32];
        config.model.dense_units = vec![16];
        config.training.epochs = 20;
        config.training.batch_size = 64;
        config.training.early_stopping.patience = 5;
        config
    }

    /// Full training run on a deeper network
    pub fn production() -> Self {
        let mut config = Self::default();
        config.data.time_steps = 60;
        config.model.recurrent_units = vec![256, 128, 64];
        config.model.dense_units = vec![32, 16];
        config.training.epochs = 200;
        config.training.batch_size = 32;
        config.training.early_stopping.patience = 20;
        config
    }

    /// Wide layers with large batches
    pub fn large_batch() -> Self {
        let mut config = Self::default();
        config.model.recurrent_units = vec![512, 256, 128];
        config.training.batch_size = 128;
        config
    }

    /// Small batches and a compact network
    pub fn cpu_friendly() -> Self {
        let mut config = Self::default();
        config.model.recurrent_units = vec![64, 32];
        config.model.dense_units = vec![16];
        config.training.epochs = 50;
        config.training.batch_size = 16;
        config
    }

    /// Reject configurations no stage could run with
    pub fn validate(&self) -> Result<()> {
        splitter::validate_ratios(self.data.train_ratio, self.data.val_ratio)?;

        if self.data.time_steps == 0 {
            return Err(ForecastError::config("time_steps must be positive"));
        }
        if self.data.feature_columns.is_empty() {
            return Err(ForecastError::config("feature_columns must not be empty"));
        }
        let (low, high) = self.scaler.feature_range;
        if !(low < high) {
            return Err(ForecastError::config(format!(
                "feature_range ({}, {}) must be increasing",
                low, high
            )));
        }
        if self.model.recurrent_units.is_empty() {
            return Err(ForecastError::config("at least one recurrent layer is required"));
        }
        if self
            .model
            .recurrent_units
            .iter()
            .chain(self.model.dense_units.iter())
            .any(|&u| u == 0)
        {
            return Err(ForecastError::config("layer widths must be positive"));
        }
        for (name, rate) in [
            ("dropout", self.model.dropout),
            ("recurrent_dropout", self.model.recurrent_dropout),
        ] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ForecastError::config(format!(
                    "{} must be in [0, 1), got {}",
                    name, rate
                )));
            }
        }
        if self.model.l1 < 0.0 || self.model.l2 < 0.0 {
            return Err(ForecastError::config("regularization factors must be non-negative"));
        }
        if !(self.model.learning_rate > 0.0) {
            return Err(ForecastError::config("learning_rate must be positive"));
        }
        if self.training.batch_size == 0 {
            return Err(ForecastError::config("batch_size must be positive"));
        }
        let reduce = &self.training.reduce_lr;
        if reduce.enabled && !(reduce.factor > 0.0 && reduce.factor < 1.0) {
            return Err(ForecastError::config("reduce_lr.factor must be in (0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.data.target_column, 3);
        assert_eq!(&config.data.feature_columns[..5], &BASE_COLUMNS.map(String::from));
    }

    #[test]
    fn test_presets_are_independent_values() {
        let quick = Config::quick_test();
        let default = Config::default();

        assert_eq!(quick.data.time_steps, 30);
        assert_eq!(quick.training.early_stopping.patience, 5);
        assert_eq!(default.data.time_steps, 60);
        assert_eq!(Config::cpu_friendly().training.batch_size, 16);
        assert_eq!(Config::large_batch().training.batch_size, 128);
        assert_eq!(Config::production().model.recurrent_units, vec![256, 128, 64]);
    }

    #[test]
    fn test_unknown_preset() {
        assert!(matches!(
            Config::preset("turbo"),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::quick_test();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_identifier_in_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[model]\noptimizer = \"adagrad\"\n").unwrap();

        assert!(matches!(
            Config::load(&path),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_invalid_ratios_rejected() {
        let mut config = Config::default();
        config.data.train_ratio = 0.9;
        config.data.val_ratio = 0.2;
        assert!(matches!(
            config.validate(),
            Err(ForecastError::Configuration(_))
        ));
    }

    #[test]
    fn test_resolve_prefers_file_over_preset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut saved = Config::default();
        saved.data.symbol = "SOLUSDT".to_string();
        saved.save(&path).unwrap();

        let from_file = Config::resolve(Some(&path), Some("quick_test")).unwrap();
        assert_eq!(from_file, saved);

        let from_preset = Config::resolve(None, Some("quick_test")).unwrap();
        assert_eq!(from_preset, Config::quick_test());
        assert_eq!(Config::resolve(None, None).unwrap(), Config::default());
        assert!(Config::resolve(None, Some("turbo")).is_err());

        let default_path = dir.path().join("default.toml");
        Config::create_default(&default_path).unwrap();
        assert_eq!(Config::resolve(Some(&default_path), None).unwrap(), Config::default());
    }

    #[test]
    fn test_market_overrides() {
        let config = Config::default()
            .with_market(Some("ethusdt".into()), Some("4h".into()), None)
            .unwrap();
        assert_eq!(config.data.symbol, "ETHUSDT");
        assert_eq!(config.data.interval, "4h");
        assert_eq!(config.data.start_date, Config::default().data.start_date);
    }
}

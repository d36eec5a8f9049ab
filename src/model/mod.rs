//! # Models
//!
//! Stacked LSTM/GRU networks (optionally bidirectional) trained with
//! backpropagation through time, plus a random-forest direction classifier.
//!
//! ```rust,no_run
//! use crypto_forecast::config::ModelConfig;
//! use crypto_forecast::model::{ModelBuilder, ModelKind};
//!
//! let config = ModelConfig {
//!     model_type: ModelKind::BiLstm,
//!     recurrent_units: vec![64, 32],
//!     ..ModelConfig::default()
//! };
//! // 60 time steps, 12 features
//! let model = ModelBuilder::build((60, 12), &config)?;
//! println!("{}", model.summary());
//! # Ok::<(), crypto_forecast::error::ForecastError>(())
//! ```

mod builder;
pub mod forest;
mod gru;
mod layers;
mod loss;
mod lstm;
mod network;
mod optimizer;
mod param;
mod recurrent;
mod types;

pub use builder::ModelBuilder;
pub use forest::{ForestConfig, MaxFeatures, RandomForest};
pub use layers::{Layer, Tensor};
pub use network::{CompileSettings, Evaluation, SequenceModel, WeightSnapshot};
pub use optimizer::Optimizer;
pub use param::Param;
pub use types::{Activation, CellKind, Head, LossKind, MetricKind, ModelKind, OptimizerKind};

//! # Crypto Forecast
//!
//! Close-price forecasting for crypto pairs with technical indicators and
//! stacked LSTM/GRU networks, plus a random-forest direction classifier.
//!
//! ## Modules
//!
//! - `data` - candles from Binance or CSV
//! - `features` - cleaning, indicators, column selection
//! - `preprocessing` - scaling, windowing, chronological splits
//! - `model` - network builder, recurrent layers, random forest
//! - `training` - fit loop with early stopping, LR decay, checkpoints
//! - `pipeline` - end-to-end preparation and artifact persistence
//! - `backtest` - long/flat evaluation of forecasts
//! - `utils` - metrics and logging
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use crypto_forecast::config::Config;
//! use crypto_forecast::data::load_candles_csv;
//! use crypto_forecast::model::ModelBuilder;
//! use crypto_forecast::pipeline::ForecastPipeline;
//! use crypto_forecast::training::{SplitRef, Trainer};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::quick_test();
//!     let candles = load_candles_csv("data/btcusdt_1h.csv")?;
//!
//!     // 1. Features, scaling, windows, splits
//!     let mut pipeline = ForecastPipeline::from_config(&config);
//!     let prepared = pipeline.prepare_candles(&candles)?;
//!
//!     // 2. Model
//!     let mut model = ModelBuilder::build(prepared.input_shape(), &config.model)?;
//!
//!     // 3. Training
//!     let split = &prepared.split;
//!     let report = Trainer::new(config.training.clone()).fit(
//!         &mut model,
//!         SplitRef::new(&split.x_train, &split.y_train),
//!         SplitRef::new(&split.x_val, &split.y_val),
//!     )?;
//!     println!("{} after {} epochs", report.state, report.epochs_run());
//!     Ok(())
//! }
//! ```

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod features;
pub mod model;
pub mod pipeline;
pub mod preprocessing;
pub mod training;
pub mod utils;

pub use config::Config;
pub use data::{BinanceClient, BinanceClientSync, Candle, CandleSource};
pub use error::{ForecastError, Result};
pub use model::{ModelBuilder, RandomForest, SequenceModel};
pub use pipeline::{ForecastPipeline, PreparedData};
pub use preprocessing::Normalizer;
pub use training::{InterruptHandle, Trainer, TrainingState};

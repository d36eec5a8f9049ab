//! # Feature engineering
//!
//! - `indicators` - causal technical indicators over OHLCV series
//! - `pipeline` - clean / add_features / select_features
//! - `direction` - up/down dataset for the tree-ensemble classifier

pub mod direction;
pub mod indicators;
mod matrix;
mod pipeline;

pub use direction::DirectionDataset;
pub use matrix::FeatureMatrix;
pub use pipeline::FeaturePipeline;

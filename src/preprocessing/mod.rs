//! # Preprocessing
//!
//! Scaling, windowing and ordered splitting of the feature matrix.

mod normalizer;
pub mod splitter;
pub mod windower;

pub use normalizer::{Normalizer, ScalerFitScope, ScalerKind, ScalerState};
pub use splitter::{split, DatasetSplit};
pub use windower::{direction_labels, latest_window, make_windows, WindowSpec};

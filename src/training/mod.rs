//! # Training
//!
//! - `trainer` - mini-batch fit loop with a small state machine
//! - `callbacks` - early stopping, learning-rate decay, checkpointing
//! - `history` - per-epoch losses and metrics, exported as CSV

pub mod callbacks;
mod history;
mod trainer;

pub use callbacks::{Checkpoint, EarlyStopping, Mode, Monitor, Quantity, ReduceLr};
pub use history::{EpochRecord, History};
pub use trainer::{InterruptHandle, SplitRef, Trainer, TrainingReport, TrainingState};

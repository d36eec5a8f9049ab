//! # Market data
//!
//! Candle types, the [`CandleSource`] seam, the Binance client and CSV I/O.

mod binance;
mod io;
mod source;
mod types;

pub use binance::{BinanceClient, BinanceClientSync};
pub use io::{
    load_candles_csv, load_raw_csv, save_candles_csv, save_predictions_csv, PredictionRow,
};
pub use source::{CandleSource, CsvSource, MemorySource};
pub use types::{parse_start_date, Candle, Interval, RawFrame, RawRow};

//! Replay the trained forecaster over a price history
//!
//! Usage:
//!   cargo run --release --bin backtest -- --data data/btcusdt_1h.csv
//!
//! Scores the chronological test split only. Goes long for a step when the
//! forecast is above the previous close.

use anyhow::{Context, Result};
use clap::Parser;
use crypto_forecast::backtest;
use crypto_forecast::config::Config;
use crypto_forecast::data::{load_raw_csv, BinanceClientSync, Interval};
use crypto_forecast::model::SequenceModel;
use crypto_forecast::pipeline::{load_artifacts, load_market_data, ForecastPipeline};
use crypto_forecast::preprocessing::splitter::split_sizes;
use crypto_forecast::utils::logging;
use crypto_forecast::utils::metrics::{DirectionMetrics, RegressionMetrics};
use log::{info, warn};
use ndarray::s;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "backtest")]
#[command(about = "Replay the trained forecaster over the test split")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Named preset, used when no config file is given
    #[arg(short, long, env = "PRESET")]
    preset: Option<String>,

    /// Raw OHLCV CSV; fetched and cached from Binance when omitted
    #[arg(short, long, env = "DATA")]
    data: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref(), args.preset.as_deref())
        .context("failed to load configuration")?;
    logging::init(&config.logging.level);

    let (normalizer, manifest) =
        load_artifacts(&config.paths).context("no trained artifacts; run `train` first")?;
    let mut model = SequenceModel::load(config.paths.model_path())
        .context("failed to load the trained model")?;

    let raw = match &args.data {
        Some(path) => {
            load_raw_csv(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => load_market_data(&config, &BinanceClientSync::new())?,
    };

    let inference = ForecastPipeline::prepare_inference(&raw, &normalizer, &manifest)?;
    let (x, y) = inference.windows()?;
    let (train, val, test) = split_sizes(y.len(), config.data.train_ratio, config.data.val_ratio)?;
    let x_test = x.slice(s![train + val.., .., ..]).to_owned();
    let y_test = y.slice(s![train + val..]).to_owned();
    info!("Backtesting over {} test windows", test);

    let scaled = model.predict_batched(&x_test, config.training.batch_size)?;
    let predicted = normalizer.inverse(manifest.target_column, &scaled)?.to_vec();
    let actual = normalizer.inverse(manifest.target_column, &y_test)?.to_vec();

    let periods_per_year = match manifest.interval.parse::<Interval>() {
        Ok(interval) => interval.periods_per_year(),
        Err(e) => {
            warn!("{}; using the configured periods per year", e);
            config.backtest.periods_per_year
        }
    };

    let report = backtest::run(&actual, &predicted, periods_per_year)?;

    println!("\n=== Backtest {} {} ===", manifest.symbol, manifest.interval);
    println!("{}", report);
    println!("\nForecast accuracy (prices):");
    println!("{}", RegressionMetrics::compute(&actual, &predicted));
    println!("\nDirection:");
    println!("{}", DirectionMetrics::from_prices(&actual, &predicted));

    Ok(())
}

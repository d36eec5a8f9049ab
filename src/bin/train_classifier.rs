//! Train the random-forest direction classifier
//!
//! Usage:
//!   cargo run --release --bin train_classifier -- --data data/btcusdt_1h.csv
//!
//! Trains on the first 80% of labelled rows and reports test accuracy,
//! feature importances and a long/flat backtest of the test signals.

use anyhow::{Context, Result};
use clap::Parser;
use crypto_forecast::backtest;
use crypto_forecast::config::Config;
use crypto_forecast::data::{load_raw_csv, BinanceClientSync};
use crypto_forecast::features::{DirectionDataset, FeaturePipeline};
use crypto_forecast::model::RandomForest;
use crypto_forecast::pipeline::load_market_data;
use crypto_forecast::utils::logging;
use crypto_forecast::utils::metrics::DirectionMetrics;
use log::info;
use std::path::PathBuf;

const TRAIN_RATIO: f64 = 0.8;
const CLOSE: usize = 3;

#[derive(Parser)]
#[command(name = "train_classifier")]
#[command(about = "Train the random-forest direction classifier")]
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

    /// Trading pair
    #[arg(short, long, env = "SYMBOL")]
    symbol: Option<String>,

    /// Kline interval
    #[arg(short, long, env = "INTERVAL")]
    interval: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref(), args.preset.as_deref())
        .and_then(|c| c.with_market(args.symbol, args.interval, None))
        .context("failed to load configuration")?;
    logging::init(&config.logging.level);
    config.paths.create_directories()?;

    let raw = match &args.data {
        Some(path) => {
            load_raw_csv(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => load_market_data(&config, &BinanceClientSync::new())?,
    };
    let candles = FeaturePipeline::new().clean(&raw)?;

    let dataset = DirectionDataset::from_candles(&candles)?;
    let split = dataset.train_test_split(TRAIN_RATIO)?;
    println!(
        "Samples: train {}, test {} ({:.1}% up)",
        split.train.n_samples(),
        split.test.n_samples(),
        dataset.positive_rate() * 100.0
    );

    let mut forest = RandomForest::new(config.classifier.clone());
    forest.fit(&split.train)?;
    info!(
        "Fitted {} trees, deepest {}",
        forest.n_trees(),
        forest.max_tree_depth()
    );

    println!("\nTrain accuracy: {:.4}", forest.accuracy(&split.train)?);
    if split.test.is_empty() {
        forest.save(config.paths.classifier_path())?;
        return Ok(());
    }

    let signals = forest.predict(&split.test)?;
    let labels = |values: &[f64]| -> Vec<u8> { values.iter().map(|v| (*v > 0.5) as u8).collect() };
    println!("\nTest:");
    println!(
        "{}",
        DirectionMetrics::from_labels(&labels(&split.test.labels), &labels(&signals))
    );

    println!("\nFeature importance:");
    for (name, importance) in forest.feature_importance() {
        println!("  {:<12} {:.4}", name, importance);
    }

    let prices: Vec<f64> = split.test.features.iter().map(|row| row[CLOSE]).collect();
    if prices.len() >= 2 {
        let report =
            backtest::run_direction(&prices, &signals, config.backtest.periods_per_year)?;
        println!("\nBacktest on test signals:");
        println!("{}", report);
    }

    forest.save(config.paths.classifier_path())?;
    info!("Classifier saved to {}", config.paths.classifier_path().display());
    Ok(())
}

//! Forecast the next closes from the latest window
//!
//! Usage:
//!   cargo run --release --bin predict
//!   cargo run --release --bin predict -- --steps 6
//!   cargo run --release --bin predict -- --data data/btcusdt_1h.csv
//!
//! Needs the model, scaler and manifest written by `train`. Without `--data`
//! the most recent candles are fetched from Binance; the training cache is
//! never read, so the forecast starts from the current bar.

use anyhow::{Context, Result};
use chrono::DateTime;
use clap::Parser;
use crypto_forecast::config::Config;
use crypto_forecast::data::{load_raw_csv, BinanceClientSync, Interval};
use crypto_forecast::model::SequenceModel;
use crypto_forecast::pipeline::{fetch_recent, load_artifacts, ForecastPipeline};
use crypto_forecast::utils::logging;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "predict")]
#[command(about = "Forecast upcoming closes with the trained model")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Named preset, used when no config file is given
    #[arg(short, long, env = "PRESET")]
    preset: Option<String>,

    /// Raw OHLCV CSV to forecast from instead of live candles
    #[arg(short, long, env = "DATA")]
    data: Option<PathBuf>,

    /// Number of bars to forecast, each fed back as the next close
    #[arg(long, env = "STEPS", default_value_t = 1)]
    steps: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref(), args.preset.as_deref())
        .context("failed to load configuration")?;
    logging::init(&config.logging.level);
    if args.steps == 0 {
        anyhow::bail!("--steps must be at least 1");
    }

    let (normalizer, manifest) =
        load_artifacts(&config.paths).context("no trained artifacts; run `train` first")?;
    let mut model = SequenceModel::load(config.paths.model_path())
        .context("failed to load the trained model")?;
    info!(
        "Loaded model for {} {} ({} features, {} steps)",
        manifest.symbol,
        manifest.interval,
        manifest.feature_columns.len(),
        manifest.time_steps
    );

    let interval: Interval = manifest.interval.parse()?;
    let raw = match &args.data {
        Some(path) => {
            load_raw_csv(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => fetch_recent(
            &BinanceClientSync::new(),
            &manifest.symbol,
            interval,
            manifest.time_steps,
        )
        .context("failed to fetch recent candles")?,
    };

    let inference = ForecastPipeline::prepare_inference(&raw, &normalizer, &manifest)?;
    let forecast = inference.forecast(&mut model, &normalizer, args.steps)?;

    let close = inference
        .features
        .column("close")
        .and_then(|c| c.iter().last().copied())
        .context("prepared features have no close column")?;
    let next = forecast[0];
    let change = (next / close - 1.0) * 100.0;

    let format_time = |ms: i64| {
        DateTime::from_timestamp_millis(ms)
            .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };
    let last_ts = inference.last_timestamp();

    println!("\n=== {} {} forecast ===", manifest.symbol, manifest.interval);
    println!(
        "  As of:          {}",
        last_ts.map(format_time).unwrap_or_else(|| "unknown".to_string())
    );
    println!("  Last close:     {:.2}", close);
    println!("  Next close:     {:.2}", next);
    println!("  Change:         {:+.3}%", change);
    println!(
        "  Direction:      {}",
        if next > close { "UP" } else { "DOWN" }
    );

    if forecast.len() > 1 {
        println!("\n{:>4} {:^22} {:>12} {:>10}", "Step", "Open time", "Close", "Change");
        let mut previous = close;
        for (k, value) in forecast.iter().enumerate() {
            let when = last_ts
                .map(|ts| format_time(ts + (k as i64 + 1) * interval.duration_ms()))
                .unwrap_or_else(|| "unknown".to_string());
            println!(
                "{:>4} {:^22} {:>12.2} {:>+9.3}%",
                k + 1,
                when,
                value,
                (value / previous - 1.0) * 100.0
            );
            previous = *value;
        }
        let total = (forecast[forecast.len() - 1] / close - 1.0) * 100.0;
        println!("\n  Over {} bars:   {:+.3}%", forecast.len(), total);
    }

    Ok(())
}

//! Download historical klines from Binance into the raw data directory
//!
//! Usage:
//!   cargo run --bin fetch_data -- --symbol ETHUSDT --interval 4h --start 2023-06-01
//!
//! Unset options fall back to the `[data]` section of the config.

use anyhow::{Context, Result};
use clap::Parser;
use crypto_forecast::config::Config;
use crypto_forecast::data::{parse_start_date, save_candles_csv, BinanceClient, Interval};
use crypto_forecast::utils::logging;
use log::info;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fetch_data")]
#[command(about = "Download historical klines from Binance")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Named preset, used when no config file is given
    #[arg(short, long, env = "PRESET")]
    preset: Option<String>,

    /// Trading pair
    #[arg(short, long, env = "SYMBOL")]
    symbol: Option<String>,

    /// Kline interval (1m, 5m, 15m, 1h, 4h, 1d)
    #[arg(short, long, env = "INTERVAL")]
    interval: Option<String>,

    /// First day to fetch, YYYY-MM-DD
    #[arg(long, env = "START")]
    start: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::resolve(args.config.as_deref(), args.preset.as_deref())
        .and_then(|c| c.with_market(args.symbol, args.interval, args.start))
        .context("failed to load configuration")?;
    logging::init(&config.logging.level);

    let data = &config.data;
    let interval: Interval = data.interval.parse()?;
    let start_ms = parse_start_date(&data.start_date)?;

    info!("Fetching {} {} since {}", data.symbol, data.interval, data.start_date);
    let client = BinanceClient::new();
    let candles = client
        .fetch_history(&data.symbol, interval, start_ms)
        .await
        .with_context(|| format!("failed to download {} klines", data.symbol))?;

    config.paths.create_directories()?;
    let output = config.paths.raw_data_path(&data.symbol, &data.interval);
    save_candles_csv(&candles, &output)
        .with_context(|| format!("failed to write {}", output.display()))?;
    info!("Saved {} candles to {}", candles.len(), output.display());

    println!("\nLast 5 candles:");
    println!(
        "{:^20} {:>12} {:>12} {:>12} {:>12} {:>15}",
        "Open time", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{}", "-".repeat(88));
    for candle in candles.iter().rev().take(5).rev() {
        println!(
            "{:^20} {:>12.2} {:>12.2} {:>12.2} {:>12.2} {:>15.2}",
            candle.datetime().format("%Y-%m-%d %H:%M"),
            candle.open,
            candle.high,
            candle.low,
            candle.close,
            candle.volume
        );
    }

    Ok(())
}

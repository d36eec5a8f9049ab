//! Train a recurrent close-price forecaster
//!
//! Usage:
//!   cargo run --release --bin train -- --preset quick_test
//!   cargo run --release --bin train -- --config config.toml --data data/btc.csv
//!
//! Ctrl-C stops after the current batch; the best weights seen so far are
//! restored and all artifacts are still written. With the classification
//! head the network is trained on up/down labels instead of prices.

use anyhow::{Context, Result};
use clap::Parser;
use crypto_forecast::config::Config;
use crypto_forecast::data::{load_raw_csv, save_predictions_csv, BinanceClientSync, PredictionRow};
use crypto_forecast::model::{Head, ModelBuilder};
use crypto_forecast::pipeline::{load_market_data, save_artifacts, ForecastPipeline, PreparedData};
use crypto_forecast::preprocessing::DatasetSplit;
use crypto_forecast::training::{InterruptHandle, SplitRef, Trainer, TrainingState};
use crypto_forecast::utils::logging;
use crypto_forecast::utils::metrics::{naive_baseline, DirectionMetrics, RegressionMetrics};
use log::{info, warn};
use ndarray::Array1;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train")]
#[command(about = "Train an LSTM/GRU close-price forecaster")]
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

    println!("=== Training {} {} ===\n", config.data.symbol, config.data.interval);

    let raw = match &args.data {
        Some(path) => {
            load_raw_csv(path).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => load_market_data(&config, &BinanceClientSync::new())?,
    };
    info!("Loaded {} raw rows", raw.len());

    let mut pipeline = ForecastPipeline::from_config(&config);
    let prepared = pipeline.prepare(&raw)?;
    let split = match config.model.head {
        Head::Regression => prepared.split.clone(),
        Head::Classification => prepared.direction_split()?,
    };
    let (n_train, n_val, n_test) = split.sizes();
    println!("Windows: train {}, val {}, test {}", n_train, n_val, n_test);

    let mut model = ModelBuilder::build(prepared.input_shape(), &config.model)?;
    println!("{}", model.summary());

    let mut trainer = Trainer::new(config.training.clone())
        .with_checkpoint_path(config.paths.checkpoint_path());
    if let Some(seed) = config.model.seed {
        trainer = trainer.with_seed(seed);
    }
    watch_ctrl_c(trainer.interrupt_handle());

    let report = trainer.fit(
        &mut model,
        SplitRef::new(&split.x_train, &split.y_train),
        SplitRef::new(&split.x_val, &split.y_val),
    )?;

    println!(
        "\nTraining {} after {} epochs",
        report.state,
        report.epochs_run()
    );
    if let (Some(epoch), Some(value)) = (report.best_epoch, report.best_value) {
        println!("Best epoch {} ({:.6})", epoch, value);
    }
    report.history.save_csv(config.paths.history_path())?;

    if report.state == TrainingState::Failed {
        anyhow::bail!(
            "training failed: {}",
            report.failure.as_deref().unwrap_or("unknown reason")
        );
    }

    model.save(config.paths.model_path())?;
    save_artifacts(
        &config.paths,
        &prepared.normalizer,
        &prepared.manifest(&config.data, &config.scaler),
    )?;

    if n_test == 0 {
        warn!("Test split is empty; skipping evaluation");
        return Ok(());
    }

    let evaluation = model.evaluate(&split.x_test, &split.y_test)?;
    println!("\nTest loss: {:.6}", evaluation.loss);
    for (metric, value) in &evaluation.metrics {
        println!("  {}: {:.6}", metric, value);
    }

    let scaled = model.predict_batched(&split.x_test, config.training.batch_size)?;
    let (actual, predicted) = match config.model.head {
        Head::Regression => report_prices(&prepared, &split, &scaled)?,
        Head::Classification => report_directions(&split, &scaled),
    };

    let rows: Vec<PredictionRow> = prepared
        .test_timestamps()
        .iter()
        .zip(actual.iter().zip(&predicted))
        .map(|(&timestamp, (&actual, &predicted))| PredictionRow {
            timestamp,
            actual,
            predicted,
        })
        .collect();
    save_predictions_csv(&rows, config.paths.predictions_path())?;

    info!("Artifacts written to {}", config.paths.models_dir.display());
    Ok(())
}

/// Print price-space metrics; returns (actual, predicted) prices
fn report_prices(
    prepared: &PreparedData,
    split: &DatasetSplit,
    scaled: &Array1<f64>,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let predicted = prepared.inverse_target(scaled)?.to_vec();
    let actual = prepared.inverse_target(&split.y_test)?.to_vec();

    println!("\nModel (prices):");
    println!("{}", RegressionMetrics::compute(&actual, &predicted));
    println!("\nNaive baseline (previous close):");
    println!("{}", RegressionMetrics::compute(&actual, &naive_baseline(&actual)));
    println!("\nDirection:");
    println!("{}", DirectionMetrics::from_prices(&actual, &predicted));
    Ok((actual, predicted))
}

/// Print up/down metrics; returns (labels, probabilities)
fn report_directions(split: &DatasetSplit, probabilities: &Array1<f64>) -> (Vec<f64>, Vec<f64>) {
    let labels = |values: &[f64]| -> Vec<u8> { values.iter().map(|v| (*v > 0.5) as u8).collect() };
    let actual = split.y_test.to_vec();
    let probabilities = probabilities.to_vec();

    println!("\nDirection (classification head):");
    println!("{}", DirectionMetrics::from_labels(&labels(&actual), &labels(&probabilities)));
    (actual, probabilities)
}

/// Flip the interrupt flag on the first Ctrl-C
fn watch_ctrl_c(handle: InterruptHandle) {
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Ctrl-C handler unavailable: {}", e);
                return;
            }
        };
        runtime.block_on(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after the current batch");
                handle.interrupt();
            }
        });
    });
}

//! Integration tests for the forecasting pipeline

use crypto_forecast::backtest;
use crypto_forecast::config::{Config, DataConfig, ScalerConfig};
use crypto_forecast::data::{Candle, RawFrame};
use crypto_forecast::features::{DirectionDataset, FeaturePipeline};
use crypto_forecast::model::{ForestConfig, ModelBuilder, ModelKind, RandomForest, SequenceModel};
use crypto_forecast::pipeline::{load_artifacts, save_artifacts, ForecastPipeline};
use crypto_forecast::preprocessing::{make_windows, split, Normalizer, ScalerKind, WindowSpec};
use crypto_forecast::training::{SplitRef, Trainer, TrainingState};
use crypto_forecast::ForecastError;
use ndarray::{array, Array2};
use tempfile::tempdir;

const HOUR_MS: i64 = 3_600_000;

fn sine_candles(n: usize) -> Vec<Candle> {
    (0..n)
        .map(|i| {
            let close = 1000.0 + 50.0 * (i as f64 * 0.05).sin() + i as f64 * 0.2;
            Candle::new(
                i as i64 * HOUR_MS,
                close - 1.0,
                close + 3.0,
                close - 3.0,
                close,
                200.0 + (i % 11) as f64 * 5.0,
            )
        })
        .collect()
}

fn tiny_config() -> Config {
    let mut config = Config::quick_test();
    config.data.time_steps = 10;
    config.model.model_type = ModelKind::Gru;
    config.model.recurrent_units = vec![8];
    config.model.dense_units = vec![4];
    config.model.batch_norm = false;
    config.model.dropout = 0.0;
    config.model.recurrent_dropout = 0.0;
    config.model.learning_rate = 0.01;
    config.model.seed = Some(3);
    config.training.epochs = 3;
    config.training.batch_size = 16;
    config.training.show_progress = false;
    config
}

/// Test window counts and split sizes on a 1000-row hourly series
#[test]
fn test_windows_and_split_sizes() {
    let values = Array2::from_shape_fn((1000, 5), |(i, j)| (i as f64 * 0.1).sin() + j as f64);
    let spec = WindowSpec::new(60);

    let (x, y) = make_windows(&values, &spec).unwrap();
    assert_eq!(x.dim(), (940, 60, 5));
    assert_eq!(y.len(), 940);
    // target of the first window is the close of row 60
    assert_eq!(y[0], values[[60, 3]]);

    let split = split(&x, &y, 0.7, 0.15).unwrap();
    let (train, val, test) = split.sizes();
    assert_eq!(train, 658);
    assert_eq!(val, 141);
    assert_eq!(test, 141);
    assert_eq!(split.y_val[0], y[658]);
}

/// Test min-max scaling of a constant column pair
#[test]
fn test_min_max_midpoint() {
    let fit_data = array![[0.0, 0.0, 0.0, 0.0, 0.0], [1.0, 1.0, 1.0, 1.0, 1.0]];
    let mut normalizer = Normalizer::new(ScalerKind::MinMax);
    normalizer.fit(&fit_data).unwrap();

    let scaled = normalizer
        .transform(&array![[0.5, 0.5, 0.5, 0.5, 0.5]])
        .unwrap();
    assert!(scaled.iter().all(|v| (v - 0.5).abs() < 1e-12));
}

/// Test that absent configured columns are skipped, not fatal
#[test]
fn test_select_features_skips_absent_column() {
    let pipeline_input = RawFrame::from_candles(&sine_candles(120));
    let mut features = FeaturePipeline::new();
    let cleaned = features.clean(&pipeline_input).unwrap();
    let enriched = features.add_features(&cleaned).unwrap();

    let wanted: Vec<String> = ["open", "high", "low", "close", "volume", "sentiment", "rsi"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let selected = features.select_features(&enriched, &wanted).unwrap();

    assert_eq!(selected.n_features(), 6);
    assert_eq!(selected.columns.last().map(String::as_str), Some("rsi"));
    assert_eq!(features.feature_columns(), &selected.columns[..]);
}

/// Test prepare → build → fit → evaluate → persist → reload
#[test]
fn test_end_to_end_training_and_inference() {
    let dir = tempdir().unwrap();
    let mut config = tiny_config();
    config.paths.models_dir = dir.path().join("models");
    config.paths.results_dir = dir.path().join("results");
    config.paths.create_directories().unwrap();

    let candles = sine_candles(400);
    let mut pipeline = ForecastPipeline::from_config(&config);
    let prepared = pipeline.prepare_candles(&candles).unwrap();
    assert_eq!(prepared.input_shape(), (10, 16));

    let mut model = ModelBuilder::build(prepared.input_shape(), &config.model).unwrap();
    let split = &prepared.split;
    let report = Trainer::new(config.training.clone())
        .with_checkpoint_path(config.paths.checkpoint_path())
        .fit(
            &mut model,
            SplitRef::new(&split.x_train, &split.y_train),
            SplitRef::new(&split.x_val, &split.y_val),
        )
        .unwrap();

    assert!(matches!(
        report.state,
        TrainingState::Completed | TrainingState::EarlyStopped
    ));
    assert!(config.paths.checkpoint_path().exists());
    report.history.save_csv(config.paths.history_path()).unwrap();

    let predictions = model.predict(&split.x_test).unwrap();
    assert_eq!(predictions.len(), split.y_test.len());
    let prices = prepared.inverse_target(&predictions).unwrap();
    assert!(prices.iter().all(|p| p.is_finite()));

    model.save(config.paths.model_path()).unwrap();
    save_artifacts(
        &config.paths,
        &prepared.normalizer,
        &prepared.manifest(&config.data, &config.scaler),
    )
    .unwrap();

    let (normalizer, manifest) = load_artifacts(&config.paths).unwrap();
    let mut restored = SequenceModel::load(config.paths.model_path()).unwrap();
    let inference =
        ForecastPipeline::prepare_inference_candles(&candles, &normalizer, &manifest).unwrap();
    let next = restored.predict(&inference.latest_window().unwrap()).unwrap();
    assert_eq!(next.len(), 1);

    let original = model.predict(&inference.latest_window().unwrap()).unwrap();
    assert!((original[0] - next[0]).abs() < 1e-12);
}

/// Test that an interrupt raised before fitting stops with no epochs
#[test]
fn test_interrupt_before_first_batch() {
    let config = tiny_config();
    let mut pipeline = ForecastPipeline::from_config(&config);
    let prepared = pipeline.prepare_candles(&sine_candles(200)).unwrap();
    let mut model = ModelBuilder::build(prepared.input_shape(), &config.model).unwrap();

    let mut trainer = Trainer::new(config.training.clone());
    trainer.interrupt_handle().interrupt();

    let split = &prepared.split;
    let report = trainer
        .fit(
            &mut model,
            SplitRef::new(&split.x_train, &split.y_train),
            SplitRef::new(&split.x_val, &split.y_val),
        )
        .unwrap();

    assert_eq!(report.state, TrainingState::Interrupted);
    assert_eq!(trainer.state(), TrainingState::Interrupted);
    assert_eq!(report.epochs_run(), 0);
}

/// Test that a too-short series is reported as insufficient data
#[test]
fn test_short_series_is_insufficient() {
    let data = DataConfig {
        time_steps: 60,
        ..DataConfig::default()
    };
    let mut pipeline = ForecastPipeline::new(data, ScalerConfig::default());
    assert!(matches!(
        pipeline.prepare_candles(&sine_candles(50)),
        Err(ForecastError::InsufficientData(_))
    ));
}

/// Test the direction classifier and its backtest on a trending series
#[test]
fn test_direction_classifier_pipeline() {
    let dataset = DirectionDataset::from_candles(&sine_candles(400)).unwrap();
    let split = dataset.train_test_split(0.8).unwrap();

    let mut forest = RandomForest::new(ForestConfig {
        n_trees: 15,
        max_depth: 5,
        ..ForestConfig::default()
    });
    forest.fit(&split.train).unwrap();

    let accuracy = forest.accuracy(&split.test).unwrap();
    assert!((0.0..=1.0).contains(&accuracy));

    let signals = forest.predict(&split.test).unwrap();
    let prices: Vec<f64> = split.test.features.iter().map(|row| row[3]).collect();
    let report = backtest::run_direction(&prices, &signals, 8760.0).unwrap();
    assert_eq!(report.equity_curve.len(), prices.len());
}

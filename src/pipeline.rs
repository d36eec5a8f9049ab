//! End-to-end data preparation
//!
//! clean → add_features → select_features → normalize → window → split,
//! plus the artifact pair (scaler blob and JSON manifest) that lets
//! inference rebuild exactly the same inputs.

use crate::config::{Config, DataConfig, PathConfig, ScalerConfig};
use crate::data::{
    load_raw_csv, parse_start_date, save_candles_csv, Candle, CandleSource, Interval, RawFrame,
};
use crate::error::{ForecastError, Result};
use crate::features::{FeatureMatrix, FeaturePipeline};
use crate::model::SequenceModel;
use crate::preprocessing::{
    direction_labels, latest_window, make_windows, split, splitter, DatasetSplit, Normalizer,
    ScalerFitScope, ScalerKind, WindowSpec,
};
use chrono::Utc;
use log::{info, warn};
use ndarray::{s, Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Everything inference needs besides the model and the scaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub symbol: String,
    pub interval: String,
    pub feature_columns: Vec<String>,
    pub time_steps: usize,
    pub target_column: usize,
    pub scaler_kind: ScalerKind,
    pub fit_scope: ScalerFitScope,
    /// RFC 3339
    pub created_at: String,
}

impl ArtifactManifest {
    pub fn window_spec(&self) -> WindowSpec {
        WindowSpec::new(self.time_steps).with_target_column(self.target_column)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(|e| {
            ForecastError::persistence(format!("cannot write {}: {}", path.display(), e))
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ForecastError::persistence(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&json).map_err(|e| {
            ForecastError::persistence(format!("corrupt manifest {}: {}", path.display(), e))
        })
    }
}

/// Output of [`ForecastPipeline::prepare`]
#[derive(Debug, Clone)]
pub struct PreparedData {
    pub split: DatasetSplit,
    pub normalizer: Normalizer,
    /// Selected, unscaled features
    pub features: FeatureMatrix,
    pub spec: WindowSpec,
    /// Timestamp of each window's target row, in sample order
    pub target_timestamps: Vec<i64>,
}

impl PreparedData {
    /// `(time_steps, features)`
    pub fn input_shape(&self) -> (usize, usize) {
        (self.spec.time_steps, self.features.n_features())
    }

    /// Target timestamps of the test windows
    pub fn test_timestamps(&self) -> &[i64] {
        let (train, val, _) = self.split.sizes();
        &self.target_timestamps[train + val..]
    }

    /// Map scaled close values back to prices
    pub fn inverse_target(&self, scaled: &Array1<f64>) -> Result<Array1<f64>> {
        self.normalizer.inverse(self.spec.target_column, scaled)
    }

    /// The same windows labelled 1.0 when the target close rises above the
    /// window's last close. Targets for the classification head.
    pub fn direction_split(&self) -> Result<DatasetSplit> {
        let labels = direction_labels(&self.features.values, &self.spec)?;
        let (train, val, _) = self.split.sizes();
        Ok(DatasetSplit {
            x_train: self.split.x_train.clone(),
            y_train: labels.slice(s![..train]).to_owned(),
            x_val: self.split.x_val.clone(),
            y_val: labels.slice(s![train..train + val]).to_owned(),
            x_test: self.split.x_test.clone(),
            y_test: labels.slice(s![train + val..]).to_owned(),
        })
    }

    pub fn manifest(&self, data: &DataConfig, scaler: &ScalerConfig) -> ArtifactManifest {
        ArtifactManifest {
            symbol: data.symbol.clone(),
            interval: data.interval.clone(),
            feature_columns: self.features.columns.clone(),
            time_steps: self.spec.time_steps,
            target_column: self.spec.target_column,
            scaler_kind: self.normalizer.kind(),
            fit_scope: scaler.fit_scope,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Inputs rebuilt from saved artifacts
#[derive(Debug, Clone)]
pub struct InferenceData {
    pub features: FeatureMatrix,
    pub scaled: Array2<f64>,
    pub spec: WindowSpec,
}

impl InferenceData {
    /// The last `time_steps` rows as a `(1, T, F)` batch
    pub fn latest_window(&self) -> Result<Array3<f64>> {
        latest_window(&self.scaled, &self.spec)
    }

    /// Every full window with its scaled target
    pub fn windows(&self) -> Result<(Array3<f64>, Array1<f64>)> {
        make_windows(&self.scaled, &self.spec)
    }

    pub fn target_timestamps(&self) -> &[i64] {
        &self.features.timestamps[self.spec.time_steps.min(self.features.n_rows())..]
    }

    /// Timestamp of the newest row
    pub fn last_timestamp(&self) -> Option<i64> {
        self.features.timestamps.last().copied()
    }

    /// Next `steps` closes in price units, fed back one at a time from the
    /// latest window
    pub fn forecast(
        &self,
        model: &mut SequenceModel,
        normalizer: &Normalizer,
        steps: usize,
    ) -> Result<Array1<f64>> {
        let scaled = model.forecast_steps(&self.latest_window()?, steps, self.spec.target_column)?;
        normalizer.inverse(self.spec.target_column, &scaled)
    }
}

/// Chains the preparation stages for training and inference
#[derive(Debug, Clone)]
pub struct ForecastPipeline {
    data: DataConfig,
    scaler: ScalerConfig,
    features: FeaturePipeline,
}

impl ForecastPipeline {
    pub fn new(data: DataConfig, scaler: ScalerConfig) -> Self {
        Self {
            data,
            scaler,
            features: FeaturePipeline::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.data.clone(), config.scaler.clone())
    }

    /// Column order realized by the last `prepare`
    pub fn feature_columns(&self) -> &[String] {
        self.features.feature_columns()
    }

    pub fn prepare_candles(&mut self, candles: &[Candle]) -> Result<PreparedData> {
        self.prepare(&RawFrame::from_candles(candles))
    }

    /// Run every stage and fit a fresh normalizer
    pub fn prepare(&mut self, raw: &RawFrame) -> Result<PreparedData> {
        let cleaned = self.features.clean(raw)?;
        let enriched = self.features.add_features(&cleaned)?;
        let selected = self
            .features
            .select_features(&enriched, &self.data.feature_columns)?;

        let spec = WindowSpec::from_config(&self.data);
        check_target(&selected, &spec)?;

        let n_windows = spec.n_samples(selected.n_rows());
        if n_windows == 0 {
            return Err(ForecastError::insufficient(format!(
                "{} feature rows cannot form a window of {} steps",
                selected.n_rows(),
                spec.time_steps
            )));
        }

        let mut normalizer = Normalizer::from_config(&self.scaler);
        let scaled = match self.scaler.fit_scope {
            ScalerFitScope::FullSeries => {
                warn!(
                    "Fitting the {} scaler on the full series; validation and test rows leak into the scaling",
                    normalizer.kind()
                );
                normalizer.fit_transform(&selected.values)?
            }
            ScalerFitScope::TrainOnly => {
                let (train, _, _) =
                    splitter::split_sizes(n_windows, self.data.train_ratio, self.data.val_ratio)?;
                if train == 0 {
                    return Err(ForecastError::insufficient("training split has no windows"));
                }
                // rows feeding the training windows and their targets
                let fit_rows = train + spec.time_steps;
                normalizer.fit(&selected.values.slice(s![..fit_rows, ..]).to_owned())?;
                normalizer.transform(&selected.values)?
            }
        };

        let (x, y) = make_windows(&scaled, &spec)?;
        let split = split(&x, &y, self.data.train_ratio, self.data.val_ratio)?;
        let (train, val, test) = split.sizes();
        info!(
            "Prepared {} windows of {}x{}: train {}, val {}, test {}",
            split.total(),
            spec.time_steps,
            selected.n_features(),
            train,
            val,
            test
        );

        let target_timestamps = selected.timestamps[spec.time_steps..].to_vec();
        Ok(PreparedData {
            split,
            normalizer,
            features: selected,
            spec,
            target_timestamps,
        })
    }

    /// Rebuild model inputs with a fitted normalizer. Never refits.
    pub fn prepare_inference(
        raw: &RawFrame,
        normalizer: &Normalizer,
        manifest: &ArtifactManifest,
    ) -> Result<InferenceData> {
        if !normalizer.is_fitted() {
            return Err(ForecastError::NotFitted("normalizer".to_string()));
        }

        let pipeline = FeaturePipeline::with_columns(manifest.feature_columns.clone());
        let cleaned = pipeline.clean(raw)?;
        let enriched = pipeline.add_features(&cleaned)?;
        let features = pipeline.apply_recorded(&enriched)?;

        let spec = manifest.window_spec();
        check_target(&features, &spec)?;
        let scaled = normalizer.transform(&features.values)?;

        Ok(InferenceData {
            features,
            scaled,
            spec,
        })
    }

    pub fn prepare_inference_candles(
        candles: &[Candle],
        normalizer: &Normalizer,
        manifest: &ArtifactManifest,
    ) -> Result<InferenceData> {
        Self::prepare_inference(&RawFrame::from_candles(candles), normalizer, manifest)
    }
}

fn check_target(features: &FeatureMatrix, spec: &WindowSpec) -> Result<()> {
    if spec.target_column >= features.n_features() {
        return Err(ForecastError::config(format!(
            "target column {} out of range for {} features",
            spec.target_column,
            features.n_features()
        )));
    }
    if features.close_index() != Some(spec.target_column) {
        warn!(
            "Target column {} is '{}', not 'close'",
            spec.target_column, features.columns[spec.target_column]
        );
    }
    Ok(())
}

/// Load the cached raw CSV for the configured pair, or fetch it from
/// `source` and cache it under `paths.data_dir`
pub fn load_market_data(config: &Config, source: &dyn CandleSource) -> Result<RawFrame> {
    let data = &config.data;
    let cached = config.paths.raw_data_path(&data.symbol, &data.interval);
    if cached.exists() {
        info!("Loading cached candles from {}", cached.display());
        return load_raw_csv(&cached);
    }

    let interval: Interval = data.interval.parse()?;
    let start_ms = parse_start_date(&data.start_date)?;
    let candles = source.fetch(&data.symbol, interval, start_ms)?;
    if candles.is_empty() {
        return Err(ForecastError::insufficient(format!(
            "no candles for {} {} since {}",
            data.symbol, data.interval, data.start_date
        )));
    }

    std::fs::create_dir_all(&config.paths.data_dir)?;
    save_candles_csv(&candles, &cached)?;
    info!("Cached {} candles to {}", candles.len(), cached.display());
    Ok(RawFrame::from_candles(&candles))
}

/// Bars of history fetched for a live forecast, enough for the longest
/// indicator warm-up ahead of the window
pub fn recent_bars(time_steps: usize) -> usize {
    (time_steps + 200).max(300)
}

pub fn recent_start_ms(now_ms: i64, interval: Interval, time_steps: usize) -> i64 {
    now_ms - recent_bars(time_steps) as i64 * interval.duration_ms()
}

/// Fetch only the recent candles a forecast needs, bypassing the cache
pub fn fetch_recent(
    source: &dyn CandleSource,
    symbol: &str,
    interval: Interval,
    time_steps: usize,
) -> Result<RawFrame> {
    let start_ms = recent_start_ms(Utc::now().timestamp_millis(), interval, time_steps);
    let candles = source.fetch(symbol, interval, start_ms)?;
    if candles.len() <= time_steps {
        return Err(ForecastError::insufficient(format!(
            "{} recent candles for {} {}, need more than {}",
            candles.len(),
            symbol,
            interval.to_api_string(),
            time_steps
        )));
    }
    info!("Fetched {} recent candles for {}", candles.len(), symbol);
    Ok(RawFrame::from_candles(&candles))
}

/// Persist the scaler blob and the manifest under `paths.models_dir`
pub fn save_artifacts(
    paths: &PathConfig,
    normalizer: &Normalizer,
    manifest: &ArtifactManifest,
) -> Result<()> {
    std::fs::create_dir_all(&paths.models_dir)?;
    normalizer.save(paths.scaler_path())?;
    manifest.save(paths.manifest_path())?;
    info!("Artifacts saved to {}", paths.models_dir.display());
    Ok(())
}

/// Load the scaler and manifest, checking that they describe the same columns
pub fn load_artifacts(paths: &PathConfig) -> Result<(Normalizer, ArtifactManifest)> {
    let normalizer = Normalizer::load(paths.scaler_path())?;
    let manifest = ArtifactManifest::load(paths.manifest_path())?;

    let n_features = normalizer.state().map(|s| s.n_features()).unwrap_or(0);
    if n_features != manifest.feature_columns.len() {
        return Err(ForecastError::persistence(format!(
            "scaler has {} features but the manifest lists {}",
            n_features,
            manifest.feature_columns.len()
        )));
    }
    Ok((normalizer, manifest))
}

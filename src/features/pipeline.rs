//! Cleaning, indicator enrichment and column selection

use super::indicators::compute_all;
use super::matrix::FeatureMatrix;
use crate::config::BASE_COLUMNS;
use crate::data::{Candle, RawFrame, RawRow};
use crate::error::{ForecastError, Result};
use log::{debug, info, warn};
use ndarray::Array2;
use std::collections::HashSet;

const REQUIRED_COLUMNS: [&str; 6] = ["timestamp", "open", "high", "low", "close", "volume"];

/// Turns raw OHLCV into an ordered feature matrix.
///
/// The pipeline remembers the column order realized by
/// [`select_features`](Self::select_features) so inference can rebuild the
/// exact same layout.
#[derive(Debug, Clone, Default)]
pub struct FeaturePipeline {
    feature_columns: Vec<String>,
}

impl FeaturePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pipeline with a column order recorded by an earlier run
    pub fn with_columns(feature_columns: Vec<String>) -> Self {
        Self { feature_columns }
    }

    /// Realized column order, empty until columns have been selected
    pub fn feature_columns(&self) -> &[String] {
        &self.feature_columns
    }

    /// Remove exact duplicates, sort, fill gaps and drop invalid rows.
    ///
    /// Gaps are forward-filled, then backward-filled. Rows whose close is not
    /// positive or whose volume is negative are dropped afterwards. Rows that
    /// still share a timestamp keep the last occurrence.
    pub fn clean(&self, raw: &RawFrame) -> Result<Vec<Candle>> {
        let missing: Vec<&str> = REQUIRED_COLUMNS
            .iter()
            .filter(|c| !raw.has_column(c))
            .copied()
            .collect();
        if !missing.is_empty() {
            return Err(ForecastError::data_integrity(format!(
                "required columns missing: {}",
                missing.join(", ")
            )));
        }
        if raw.is_empty() {
            return Err(ForecastError::insufficient("raw frame has no rows"));
        }

        // Non-finite values are treated as missing
        let rows: Vec<RawRow> = raw.rows.iter().map(normalize_missing).collect();

        let mut seen = HashSet::new();
        let mut rows: Vec<RawRow> = rows
            .into_iter()
            .filter(|row| seen.insert(row_key(row)))
            .collect();
        let exact_duplicates = raw.len() - rows.len();

        rows.sort_by_key(|row| row.timestamp);

        let before = rows.len();
        rows = keep_last_per_timestamp(rows);
        if rows.len() < before {
            warn!(
                "{} rows shared a timestamp with different values; kept the last of each",
                before - rows.len()
            );
        }

        fill_column(&mut rows, "open", |r| &mut r.open)?;
        fill_column(&mut rows, "high", |r| &mut r.high)?;
        fill_column(&mut rows, "low", |r| &mut r.low)?;
        fill_column(&mut rows, "close", |r| &mut r.close)?;
        fill_column(&mut rows, "volume", |r| &mut r.volume)?;

        let filled = rows.len();
        let candles: Vec<Candle> = rows
            .into_iter()
            .filter_map(|r| match (r.open, r.high, r.low, r.close, r.volume) {
                (Some(open), Some(high), Some(low), Some(close), Some(volume)) => {
                    Some(Candle::new(r.timestamp, open, high, low, close, volume))
                }
                _ => None,
            })
            .filter(|c| c.close > 0.0 && c.volume >= 0.0)
            .collect();

        info!(
            "Cleaned {} raw rows: {} exact duplicates removed, {} invalid rows dropped, {} remain",
            raw.len(),
            exact_duplicates,
            filled - candles.len(),
            candles.len()
        );

        Ok(candles)
    }

    /// Append every indicator to the base OHLCV columns and drop rows with
    /// any missing value (indicator warm-up rows included).
    pub fn add_features(&self, cleaned: &[Candle]) -> Result<FeatureMatrix> {
        let indicators = compute_all(cleaned);

        let mut columns: Vec<String> = BASE_COLUMNS.iter().map(|c| c.to_string()).collect();
        columns.extend(indicators.iter().map(|(name, _)| name.clone()));

        let n_cols = columns.len();
        let mut timestamps = Vec::with_capacity(cleaned.len());
        let mut flat = Vec::with_capacity(cleaned.len() * n_cols);

        for (i, candle) in cleaned.iter().enumerate() {
            let mut row = vec![candle.open, candle.high, candle.low, candle.close, candle.volume];
            row.extend(indicators.iter().map(|(_, values)| values[i]));

            if row.iter().all(|v| v.is_finite()) {
                timestamps.push(candle.timestamp);
                flat.extend(row);
            }
        }

        if timestamps.is_empty() {
            return Err(ForecastError::insufficient(format!(
                "no complete rows after indicator warm-up ({} input rows)",
                cleaned.len()
            )));
        }

        debug!(
            "add_features: {} rows in, {} rows out, {} columns",
            cleaned.len(),
            timestamps.len(),
            n_cols
        );

        let values = Array2::from_shape_vec((timestamps.len(), n_cols), flat)?;
        FeatureMatrix::new(timestamps, columns, values)
    }

    /// Reindex to the configured columns, skipping the ones that are absent.
    ///
    /// The realized order is recorded on the pipeline.
    pub fn select_features(
        &mut self,
        enriched: &FeatureMatrix,
        columns: &[String],
    ) -> Result<FeatureMatrix> {
        let mut realized: Vec<String> = Vec::with_capacity(columns.len());
        for name in columns {
            if enriched.column_index(name).is_none() {
                warn!("Feature column '{}' not found in data, skipping", name);
            } else if realized.contains(name) {
                warn!("Feature column '{}' listed twice, keeping the first", name);
            } else {
                realized.push(name.clone());
            }
        }

        if realized.is_empty() {
            return Err(ForecastError::data_integrity(
                "none of the configured feature columns are present",
            ));
        }

        let base_prefix = realized.len() >= BASE_COLUMNS.len()
            && realized
                .iter()
                .zip(BASE_COLUMNS.iter())
                .all(|(a, b)| a == b);
        if !base_prefix {
            warn!(
                "Feature columns do not start with {:?}; the target column index must be set explicitly",
                BASE_COLUMNS
            );
        }

        let matrix = enriched.select(&realized)?;
        info!("Selected {} feature columns", realized.len());
        self.feature_columns = realized;
        Ok(matrix)
    }

    /// Rebuild the recorded layout on new data. Every recorded column must
    /// be present, otherwise inputs would no longer line up with the model.
    pub fn apply_recorded(&self, enriched: &FeatureMatrix) -> Result<FeatureMatrix> {
        if self.feature_columns.is_empty() {
            return Err(ForecastError::NotFitted(
                "no feature columns recorded".to_string(),
            ));
        }
        enriched.select(&self.feature_columns)
    }
}

fn normalize_missing(row: &RawRow) -> RawRow {
    let keep = |v: Option<f64>| v.filter(|x| x.is_finite());
    RawRow {
        timestamp: row.timestamp,
        open: keep(row.open),
        high: keep(row.high),
        low: keep(row.low),
        close: keep(row.close),
        volume: keep(row.volume),
    }
}

type RowKey = (i64, [Option<u64>; 5]);

fn row_key(row: &RawRow) -> RowKey {
    let bits = |v: Option<f64>| v.map(f64::to_bits);
    (
        row.timestamp,
        [
            bits(row.open),
            bits(row.high),
            bits(row.low),
            bits(row.close),
            bits(row.volume),
        ],
    )
}

/// Rows must already be sorted by timestamp
fn keep_last_per_timestamp(rows: Vec<RawRow>) -> Vec<RawRow> {
    let mut out: Vec<RawRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match out.last_mut() {
            Some(last) if last.timestamp == row.timestamp => *last = row,
            _ => out.push(row),
        }
    }
    out
}

fn fill_column<F>(rows: &mut [RawRow], name: &str, field: F) -> Result<()>
where
    F: Fn(&mut RawRow) -> &mut Option<f64>,
{
    let mut last: Option<f64> = None;
    for row in rows.iter_mut() {
        let value = field(row);
        match *value {
            Some(v) => last = Some(v),
            None => *value = last,
        }
    }

    let mut next: Option<f64> = None;
    for row in rows.iter_mut().rev() {
        let value = field(row);
        match *value {
            Some(v) => next = Some(v),
            None => *value = next,
        }
    }

    if rows.iter_mut().any(|r| field(r).is_none()) {
        return Err(ForecastError::data_integrity(format!(
            "column '{}' has no values to fill from",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_row(ts: i64, close: Option<f64>, volume: Option<f64>) -> RawRow {
        RawRow {
            timestamp: ts,
            open: Some(100.0),
            high: Some(101.0),
            low: Some(99.0),
            close,
            volume,
        }
    }

    fn frame(rows: Vec<RawRow>) -> RawFrame {
        RawFrame::new(REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(), rows)
    }

    fn synthetic_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let p = 100.0 + (i as f64 * 0.2).sin() * 5.0 + i as f64 * 0.05;
                Candle::new(i as i64 * 3_600_000, p - 0.3, p + 1.0, p - 1.0, p, 500.0 + (i % 7) as f64)
            })
            .collect()
    }

    #[test]
    fn test_clean_sorts_dedups_and_fills() {
        let raw = frame(vec![
            raw_row(3, Some(103.0), Some(10.0)),
            raw_row(1, Some(101.0), Some(10.0)),
            raw_row(2, None, Some(10.0)),
            raw_row(1, Some(101.0), Some(10.0)),
        ]);

        let cleaned = FeaturePipeline::new().clean(&raw).unwrap();

        let ts: Vec<i64> = cleaned.iter().map(|c| c.timestamp).collect();
        assert_eq!(ts, vec![1, 2, 3]);
        // forward fill from the previous row
        assert_eq!(cleaned[1].close, 101.0);
    }

    #[test]
    fn test_clean_backward_fills_leading_gap() {
        let raw = frame(vec![
            raw_row(1, None, Some(10.0)),
            raw_row(2, Some(102.0), Some(10.0)),
        ]);
        let cleaned = FeaturePipeline::new().clean(&raw).unwrap();
        assert_eq!(cleaned[0].close, 102.0);
    }

    #[test]
    fn test_clean_drops_invalid_rows() {
        let raw = frame(vec![
            raw_row(1, Some(0.0), Some(10.0)),
            raw_row(2, Some(-5.0), Some(10.0)),
            raw_row(3, Some(100.0), Some(-1.0)),
            raw_row(4, Some(100.0), Some(0.0)),
        ]);
        let cleaned = FeaturePipeline::new().clean(&raw).unwrap();

        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].timestamp, 4);
        assert!(cleaned.iter().all(|c| c.close > 0.0 && c.volume >= 0.0));
    }

    #[test]
    fn test_clean_keeps_last_of_conflicting_timestamps() {
        let raw = frame(vec![
            raw_row(1, Some(100.0), Some(10.0)),
            raw_row(1, Some(200.0), Some(10.0)),
        ]);
        let cleaned = FeaturePipeline::new().clean(&raw).unwrap();
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].close, 200.0);
    }

    #[test]
    fn test_clean_requires_columns() {
        let raw = RawFrame::new(
            vec!["timestamp".into(), "open".into(), "close".into()],
            vec![raw_row(1, Some(1.0), Some(1.0))],
        );
        assert!(matches!(
            FeaturePipeline::new().clean(&raw),
            Err(ForecastError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_clean_rejects_column_without_values() {
        let raw = frame(vec![raw_row(1, Some(1.0), None), raw_row(2, Some(1.0), None)]);
        assert!(matches!(
            FeaturePipeline::new().clean(&raw),
            Err(ForecastError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_add_features_drops_warm_up() {
        let candles = synthetic_candles(200);
        let enriched = FeaturePipeline::new().add_features(&candles).unwrap();

        assert!(enriched.n_rows() <= candles.len());
        // sma_50 is the longest window
        assert_eq!(enriched.timestamps[0], candles[49].timestamp);
        assert!(enriched.values.iter().all(|v| v.is_finite()));
        assert_eq!(&enriched.columns[..5], &BASE_COLUMNS.map(String::from));
    }

    #[test]
    fn test_add_features_insufficient() {
        let candles = synthetic_candles(30);
        assert!(matches!(
            FeaturePipeline::new().add_features(&candles),
            Err(ForecastError::InsufficientData(_))
        ));
    }

    #[test]
    fn test_select_features_skips_absent_columns() {
        let candles = synthetic_candles(120);
        let mut pipeline = FeaturePipeline::new();
        let enriched = pipeline.add_features(&candles).unwrap();

        let wanted: Vec<String> = ["open", "high", "low", "close", "volume", "made_up", "rsi"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let matrix = pipeline.select_features(&enriched, &wanted).unwrap();

        assert_eq!(matrix.n_features(), 6);
        assert!(!matrix.columns.contains(&"made_up".to_string()));
        assert_eq!(pipeline.feature_columns(), matrix.columns.as_slice());
        assert_eq!(matrix.close_index(), Some(3));
    }

    #[test]
    fn test_select_features_empty_result() {
        let candles = synthetic_candles(120);
        let mut pipeline = FeaturePipeline::new();
        let enriched = pipeline.add_features(&candles).unwrap();

        assert!(matches!(
            pipeline.select_features(&enriched, &["nothing".to_string()]),
            Err(ForecastError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_apply_recorded_requires_every_column() {
        let candles = synthetic_candles(120);
        let pipeline = FeaturePipeline::with_columns(vec!["close".into(), "gone".into()]);
        let enriched = pipeline.add_features(&candles).unwrap();

        assert!(pipeline.apply_recorded(&enriched).is_err());
    }

    #[test]
    fn test_clean_randomized_messy_feeds() {
        use rand::seq::SliceRandom;
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;
        use std::collections::HashSet;

        for seed in 0..20u64 {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut rows: Vec<RawRow> = synthetic_candles(200)
                .iter()
                // missing bars
                .filter(|_| rng.gen_bool(0.9))
                .map(RawRow::from)
                .collect();

            for row in rows.iter_mut() {
                match rng.gen_range(0..40) {
                    0 => row.close = None,
                    1 => row.volume = None,
                    2 => row.open = Some(f64::NAN),
                    3 => row.close = Some(-row.close.unwrap_or(1.0)),
                    4 => row.volume = Some(-1.0),
                    _ => {}
                }
            }

            let n_duplicates = rng.gen_range(1..20);
            for _ in 0..n_duplicates {
                let mut copy = rows[rng.gen_range(0..rows.len())].clone();
                if rng.gen_bool(0.5) {
                    copy.high = copy.high.map(|h| h + 1.0);
                }
                rows.push(copy);
            }
            rows.shuffle(&mut rng);

            let input_timestamps: HashSet<i64> = rows.iter().map(|r| r.timestamp).collect();
            let cleaned = FeaturePipeline::new().clean(&frame(rows)).unwrap();

            assert!(!cleaned.is_empty(), "seed {}", seed);
            assert!(
                cleaned.windows(2).all(|w| w[0].timestamp < w[1].timestamp),
                "seed {}: timestamps not strictly increasing",
                seed
            );
            for candle in &cleaned {
                assert!(input_timestamps.contains(&candle.timestamp));
                assert!(candle.close > 0.0, "seed {}: close {}", seed, candle.close);
                assert!(candle.volume >= 0.0, "seed {}: volume {}", seed, candle.volume);
                assert!(candle.open.is_finite() && candle.high.is_finite() && candle.low.is_finite());
            }
        }
    }
}

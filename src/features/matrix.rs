//! Named 2D feature table

use crate::error::{ForecastError, Result};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};

/// Rows of named numeric features, one per timestamp.
///
/// Columns keep the order they were selected in; that order is what the
/// windower and the normalizer index into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
    pub timestamps: Vec<i64>,
    pub columns: Vec<String>,
    pub values: Array2<f64>,
}

impl FeatureMatrix {
    pub fn new(timestamps: Vec<i64>, columns: Vec<String>, values: Array2<f64>) -> Result<Self> {
        if values.nrows() != timestamps.len() || values.ncols() != columns.len() {
            return Err(ForecastError::data_integrity(format!(
                "matrix shape {:?} does not match {} timestamps and {} columns",
                values.dim(),
                timestamps.len(),
                columns.len()
            )));
        }
        Ok(Self {
            timestamps,
            columns,
            values,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.values.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.values.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.values.nrows() == 0
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Position of the close price, if selected
    pub fn close_index(&self) -> Option<usize> {
        self.column_index("close")
    }

    pub fn column(&self, name: &str) -> Option<Array1<f64>> {
        self.column_index(name)
            .map(|i| self.values.column(i).to_owned())
    }

    /// Keep only the given columns, in the given order
    pub fn select(&self, columns: &[String]) -> Result<Self> {
        let indices = columns
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| {
                    ForecastError::data_integrity(format!("column '{}' not present", name))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let values = self.values.select(Axis(1), &indices);
        Self::new(self.timestamps.clone(), columns.to_vec(), values)
    }

    /// Rows `[start, end)`
    pub fn slice_rows(&self, start: usize, end: usize) -> Self {
        let end = end.min(self.n_rows());
        let start = start.min(end);
        Self {
            timestamps: self.timestamps[start..end].to_vec(),
            columns: self.columns.clone(),
            values: self.values.slice(ndarray::s![start..end, ..]).to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn sample() -> FeatureMatrix {
        FeatureMatrix::new(
            vec![1, 2],
            vec!["a".into(), "close".into(), "b".into()],
            array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]],
        )
        .unwrap()
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let result = FeatureMatrix::new(vec![1], vec!["a".into()], array![[1.0, 2.0]]);
        assert!(result.is_err());
    }

    #[test]
    fn test_select_reorders() {
        let m = sample().select(&["b".into(), "a".into()]).unwrap();
        assert_eq!(m.values, array![[3.0, 1.0], [6.0, 4.0]]);
        assert_eq!(m.close_index(), None);
    }

    #[test]
    fn test_close_index_and_slice() {
        let m = sample();
        assert_eq!(m.close_index(), Some(1));
        let tail = m.slice_rows(1, 5);
        assert_eq!(tail.timestamps, vec![2]);
        assert_eq!(tail.values, array![[4.0, 5.0, 6.0]]);
    }
}

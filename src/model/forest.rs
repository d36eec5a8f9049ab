//! Random-forest direction classifier
//!
//! An ensemble of gini CART trees, each fit on a bootstrap sample with a
//! random feature subset per split. Trees are grown in parallel.

use crate::error::{ForecastError, Result};
use crate::features::DirectionDataset;
use log::info;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// How many features each split may look at
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaxFeatures {
    Sqrt,
    All,
    Fraction(f64),
}

impl MaxFeatures {
    pub fn resolve(&self, n_features: usize) -> usize {
        let k = match self {
            MaxFeatures::Sqrt => (n_features as f64).sqrt().ceil() as usize,
            MaxFeatures::All => n_features,
            MaxFeatures::Fraction(f) => (n_features as f64 * f).round() as usize,
        };
        k.clamp(1, n_features.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    pub n_trees: usize,
    pub max_depth: usize,
    pub min_samples_split: usize,
    pub min_samples_leaf: usize,
    pub max_features: MaxFeatures,
    pub bootstrap: bool,
    pub seed: u64,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 10,
            min_samples_split: 5,
            min_samples_leaf: 2,
            max_features: MaxFeatures::Sqrt,
            bootstrap: true,
            seed: 42,
        }
    }
}

impl ForestConfig {
    fn validate(&self) -> Result<()> {
        if self.n_trees == 0 {
            return Err(ForecastError::config("n_trees must be positive"));
        }
        if self.max_depth == 0 {
            return Err(ForecastError::config("max_depth must be positive"));
        }
        if self.min_samples_leaf == 0 {
            return Err(ForecastError::config("min_samples_leaf must be positive"));
        }
        if let MaxFeatures::Fraction(f) = self.max_features {
            if !(f > 0.0 && f <= 1.0) {
                return Err(ForecastError::config(format!(
                    "max_features fraction must be in (0, 1], got {}",
                    f
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    /// Fraction of "up" labels that reached this leaf
    Leaf { p_up: f64 },
    Split {
        feature: usize,
        threshold: f64,
        left: Box<Node>,
        right: Box<Node>,
    },
}

impl Node {
    fn p_up(&self, row: &[f64]) -> f64 {
        let mut node = self;
        loop {
            match node {
                Node::Leaf { p_up, .. } => return *p_up,
                Node::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    node = if row[*feature] <= *threshold { left } else { right };
                }
            }
        }
    }

    fn depth(&self) -> usize {
        match self {
            Node::Leaf { .. } => 1,
            Node::Split { left, right, .. } => 1 + left.depth().max(right.depth()),
        }
    }
}

fn gini(n_up: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = n_up as f64 / n as f64;
    2.0 * p * (1.0 - p)
}

struct BestSplit {
    feature: usize,
    threshold: f64,
    gain: f64,
}

/// A single classification tree
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Tree {
    root: Node,
    importances: Vec<f64>,
}

struct TreeGrower<'a> {
    data: &'a DirectionDataset,
    config: &'a ForestConfig,
    max_features: usize,
    rng: ChaCha8Rng,
    importances: Vec<f64>,
}

impl<'a> TreeGrower<'a> {
    fn grow(mut self) -> Tree {
        let indices: Vec<usize> = (0..self.data.n_samples()).collect();
        let root = self.build(indices, 0);

        let total: f64 = self.importances.iter().sum();
        if total > 0.0 {
            self.importances.iter_mut().for_each(|v| *v /= total);
        }
        Tree {
            root,
            importances: self.importances,
        }
    }

    fn is_up(&self, i: usize) -> bool {
        self.data.labels[i] > 0.5
    }

    fn build(&mut self, indices: Vec<usize>, depth: usize) -> Node {
        let n = indices.len();
        let n_up = indices.iter().filter(|&&i| self.is_up(i)).count();
        let impurity = gini(n_up, n);
        let leaf = Node::Leaf {
            p_up: if n == 0 { 0.5 } else { n_up as f64 / n as f64 },
        };

        if depth >= self.config.max_depth || n < self.config.min_samples_split || impurity < 1e-10 {
            return leaf;
        }

        let Some(best) = self.best_split(&indices, impurity) else {
            return leaf;
        };

        let (left, right): (Vec<usize>, Vec<usize>) = indices
            .into_iter()
            .partition(|&i| self.data.features[i][best.feature] <= best.threshold);

        self.importances[best.feature] += best.gain * n as f64;
        Node::Split {
            feature: best.feature,
            threshold: best.threshold,
            left: Box::new(self.build(left, depth + 1)),
            right: Box::new(self.build(right, depth + 1)),
        }
    }

    /// Sort once per candidate feature and sweep the thresholds
    fn best_split(&mut self, indices: &[usize], parent_impurity: f64) -> Option<BestSplit> {
        let n = indices.len();
        let min_leaf = self.config.min_samples_leaf;
        let total_up = indices.iter().filter(|&&i| self.is_up(i)).count();

        let mut candidates: Vec<usize> = (0..self.data.n_features()).collect();
        candidates.shuffle(&mut self.rng);
        candidates.truncate(self.max_features);

        let mut best: Option<BestSplit> = None;
        for feature in candidates {
            let mut sorted: Vec<(f64, bool)> = indices
                .iter()
                .map(|&i| (self.data.features[i][feature], self.is_up(i)))
                .collect();
            sorted.sort_by(|a, b| a.0.total_cmp(&b.0));

            let mut left_up = 0;
            for k in 1..n {
                if sorted[k - 1].1 {
                    left_up += 1;
                }
                if sorted[k - 1].0 == sorted[k].0 || k < min_leaf || n - k < min_leaf {
                    continue;
                }

                let weighted = (k as f64 * gini(left_up, k)
                    + (n - k) as f64 * gini(total_up - left_up, n - k))
                    / n as f64;
                let gain = parent_impurity - weighted;
                if gain > best.as_ref().map_or(0.0, |b| b.gain) {
                    best = Some(BestSplit {
                        feature,
                        threshold: (sorted[k - 1].0 + sorted[k].0) / 2.0,
                        gain,
                    });
                }
            }
        }
        best
    }
}

/// Bagged ensemble of gini trees predicting next-candle direction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomForest {
    config: ForestConfig,
    trees: Vec<Tree>,
    feature_names: Vec<String>,
    feature_importances: Vec<f64>,
}

impl RandomForest {
    pub fn new(config: ForestConfig) -> Self {
        Self {
            config,
            trees: Vec::new(),
            feature_names: Vec::new(),
            feature_importances: Vec::new(),
        }
    }

    pub fn config(&self) -> &ForestConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        !self.trees.is_empty()
    }

    pub fn n_trees(&self) -> usize {
        self.trees.len()
    }

    /// Deepest tree in the ensemble
    pub fn max_tree_depth(&self) -> usize {
        self.trees.iter().map(|t| t.root.depth()).max().unwrap_or(0)
    }

    pub fn fit(&mut self, dataset: &DirectionDataset) -> Result<()> {
        self.config.validate()?;
        if dataset.is_empty() {
            return Err(ForecastError::insufficient("cannot fit a forest on zero samples"));
        }
        if dataset.n_features() == 0 {
            return Err(ForecastError::insufficient("dataset has no feature columns"));
        }

        let n_features = dataset.n_features();
        let max_features = self.config.max_features.resolve(n_features);
        let config = &self.config;

        let trees: Vec<Tree> = (0..config.n_trees)
            .into_par_iter()
            .map(|i| {
                let seed = config.seed.wrapping_add(i as u64);
                let sample;
                let data = if config.bootstrap {
                    sample = dataset.bootstrap_sample(seed);
                    &sample
                } else {
                    dataset
                };
                TreeGrower {
                    data,
                    config,
                    max_features,
                    rng: ChaCha8Rng::seed_from_u64(seed),
                    importances: vec![0.0; n_features],
                }
                .grow()
            })
            .collect();

        let mut importances = vec![0.0; n_features];
        for tree in &trees {
            for (total, v) in importances.iter_mut().zip(tree.importances.iter()) {
                *total += v;
            }
        }
        let sum: f64 = importances.iter().sum();
        if sum > 0.0 {
            importances.iter_mut().for_each(|v| *v /= sum);
        }

        self.trees = trees;
        self.feature_names = dataset.feature_names.clone();
        self.feature_importances = importances;

        info!(
            "Fitted random forest: {} trees, {} samples, {} features (max {} per split)",
            self.trees.len(),
            dataset.n_samples(),
            n_features,
            max_features
        );
        Ok(())
    }

    fn check_ready(&self, dataset: &DirectionDataset) -> Result<()> {
        if !self.is_fitted() {
            return Err(ForecastError::NotFitted("random forest".to_string()));
        }
        if !dataset.is_empty() && dataset.n_features() != self.feature_importances.len() {
            return Err(ForecastError::data_integrity(format!(
                "forest was fit on {} features, got {}",
                self.feature_importances.len(),
                dataset.n_features()
            )));
        }
        Ok(())
    }

    /// Mean of the per-tree up probabilities for each row
    pub fn predict_proba(&self, dataset: &DirectionDataset) -> Result<Vec<f64>> {
        self.check_ready(dataset)?;
        let n_trees = self.trees.len() as f64;
        Ok(dataset
            .features
            .par_iter()
            .map(|row| self.trees.iter().map(|t| t.root.p_up(row)).sum::<f64>() / n_trees)
            .collect())
    }

    /// 1.0 for up, 0.0 for down
    pub fn predict(&self, dataset: &DirectionDataset) -> Result<Vec<f64>> {
        Ok(self
            .predict_proba(dataset)?
            .into_iter()
            .map(|p| if p > 0.5 { 1.0 } else { 0.0 })
            .collect())
    }

    pub fn accuracy(&self, dataset: &DirectionDataset) -> Result<f64> {
        if dataset.is_empty() {
            return Err(ForecastError::insufficient("cannot score an empty dataset"));
        }
        let predictions = self.predict(dataset)?;
        Ok(crate::utils::metrics::binary_accuracy(&dataset.labels, &predictions))
    }

    /// Normalized mean decrease in impurity per feature
    pub fn feature_importances(&self) -> &[f64] {
        &self.feature_importances
    }

    /// `(name, importance)` sorted from most to least important
    pub fn feature_importance(&self) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self
            .feature_names
            .iter()
            .cloned()
            .zip(self.feature_importances.iter().copied())
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        ranked
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string(self)?;
        std::fs::write(path, json).map_err(|e| {
            ForecastError::persistence(format!("cannot write {}: {}", path.display(), e))
        })?;
        info!("Random forest saved to {}", path.display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            ForecastError::persistence(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&json)
            .map_err(|e| ForecastError::persistence(format!("corrupt forest {}: {}", path.display(), e)))
    }
}

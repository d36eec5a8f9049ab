//! Compiled sequence model: layer stack, loss, optimizer and metrics

use super::layers::{Layer, Tensor};
use super::optimizer::Optimizer;
use super::param::Param;
use super::types::{Head, LossKind, MetricKind, OptimizerKind};
use crate::error::{ForecastError, Result};
use log::info;
use ndarray::{s, Array1, Array2, Array3, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What `compile` binds to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileSettings {
    pub loss: LossKind,
    pub optimizer: OptimizerKind,
    pub learning_rate: f64,
    pub metrics: Vec<MetricKind>,
    pub l1: f64,
    pub l2: f64,
}

/// Loss and tracked metrics on one dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub metrics: Vec<(MetricKind, f64)>,
}

impl Evaluation {
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        self.metrics
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, v)| *v)
    }
}

/// All weights and normalization buffers, in layer order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub tensors: Vec<Array2<f64>>,
}

impl WeightSnapshot {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = bincode::serialize(self)?;
        std::fs::write(path.as_ref(), encoded).map_err(|e| {
            ForecastError::persistence(format!("cannot write {}: {}", path.as_ref().display(), e))
        })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ForecastError::persistence(format!("cannot read weights {}: {}", path.display(), e))
        })?;
        Ok(bincode::deserialize(&data)?)
    }
}

/// A stacked recurrent network with a one-unit head.
///
/// Built by [`ModelBuilder`](super::ModelBuilder). Input is
/// `(batch, time_steps, features)`, output one value per sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceModel {
    /// `(time_steps, features)`
    pub input_shape: (usize, usize),
    pub head: Head,
    pub settings: CompileSettings,
    layers: Vec<Layer>,
    seed: Option<u64>,
    #[serde(skip)]
    optimizer: Option<Box<dyn Optimizer>>,
    #[serde(skip)]
    rng: Option<ChaCha8Rng>,
}

impl SequenceModel {
    pub(crate) fn new(
        input_shape: (usize, usize),
        head: Head,
        settings: CompileSettings,
        layers: Vec<Layer>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            input_shape,
            head,
            settings,
            layers,
            seed,
            optimizer: None,
            rng: None,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn num_parameters(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| l.params())
            .map(|p| p.len())
            .sum()
    }

    /// Current optimizer learning rate
    pub fn learning_rate(&self) -> f64 {
        self.optimizer
            .as_ref()
            .map(|o| o.learning_rate())
            .unwrap_or(self.settings.learning_rate)
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.settings.learning_rate = learning_rate;
        if let Some(optimizer) = self.optimizer.as_mut() {
            optimizer.set_learning_rate(learning_rate);
        }
    }

    fn check_input(&self, x: &Array3<f64>) -> Result<()> {
        let (_, steps, features) = x.dim();
        if features != self.input_shape.1 {
            return Err(ForecastError::data_integrity(format!(
                "model expects {} features, got {}",
                self.input_shape.1, features
            )));
        }
        if steps == 0 {
            return Err(ForecastError::insufficient("input windows have no time steps"));
        }
        Ok(())
    }

    fn forward(&mut self, x: &Array3<f64>, training: bool) -> Result<Array1<f64>> {
        self.check_input(x)?;
        let seed = self.seed;
        let rng = self.rng.get_or_insert_with(|| match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        });

        let mut out = Tensor::Seq(x.clone());
        for layer in self.layers.iter_mut() {
            out = layer.forward(out, training, rng)?;
        }
        Ok(out.into_flat()?.column(0).to_owned())
    }

    fn penalty(&self) -> f64 {
        let (l1, l2) = (self.settings.l1, self.settings.l2);
        self.layers
            .iter()
            .flat_map(|l| l.params())
            .map(|p| p.penalty(l1, l2))
            .sum()
    }

    /// One value per window, in the scaled target space
    pub fn predict(&mut self, x: &Array3<f64>) -> Result<Array1<f64>> {
        if x.dim().0 == 0 {
            return Ok(Array1::zeros(0));
        }
        self.forward(x, false)
    }

    /// Predict in chunks of `batch_size` windows
    pub fn predict_batched(&mut self, x: &Array3<f64>, batch_size: usize) -> Result<Array1<f64>> {
        let n = x.dim().0;
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(n);
        for start in (0..n).step_by(batch_size) {
            let end = (start + batch_size).min(n);
            let batch = x.slice(s![start..end, .., ..]).to_owned();
            out.extend(self.predict(&batch)?);
        }
        Ok(Array1::from_vec(out))
    }

    /// Recursive forecast from a single `(1, T, F)` window.
    ///
    /// Each prediction is written into a copy of the last row at
    /// `target_column`, appended to the window and the oldest row dropped.
    /// Other features are carried forward unchanged. Values stay scaled.
    pub fn forecast_steps(
        &mut self,
        window: &Array3<f64>,
        steps: usize,
        target_column: usize,
    ) -> Result<Array1<f64>> {
        let (n, time_steps, features) = window.dim();
        if n != 1 {
            return Err(ForecastError::data_integrity(format!(
                "recursive forecasting takes one window, got {}",
                n
            )));
        }
        if target_column >= features {
            return Err(ForecastError::config(format!(
                "target column {} out of range for {} features",
                target_column, features
            )));
        }
        if time_steps == 0 {
            return Err(ForecastError::insufficient("input windows have no time steps"));
        }

        let mut current = window.clone();
        let mut out = Vec::with_capacity(steps);
        for _ in 0..steps {
            let next = self.predict(&current)?[0];
            out.push(next);

            let mut row = current.slice(s![0, time_steps - 1, ..]).to_owned();
            row[target_column] = next;
            let mut rolled = Array3::zeros(current.raw_dim());
            rolled
                .slice_mut(s![0, ..time_steps - 1, ..])
                .assign(&current.slice(s![0, 1.., ..]));
            rolled.slice_mut(s![0, time_steps - 1, ..]).assign(&row);
            current = rolled;
        }
        Ok(Array1::from_vec(out))
    }

    /// Loss (including the weight penalty) and every compiled metric
    pub fn evaluate(&mut self, x: &Array3<f64>, y: &Array1<f64>) -> Result<Evaluation> {
        if x.dim().0 != y.len() {
            return Err(ForecastError::data_integrity(format!(
                "{} windows but {} targets",
                x.dim().0,
                y.len()
            )));
        }
        if y.is_empty() {
            return Err(ForecastError::insufficient("cannot evaluate on an empty split"));
        }

        let predictions = self.predict(x)?;
        let loss = self.settings.loss.compute(&predictions, y) + self.penalty();
        let metrics = self
            .settings
            .metrics
            .iter()
            .map(|m| (*m, m.compute(&predictions, y)))
            .collect();
        Ok(Evaluation { loss, metrics })
    }

    /// One optimizer step on a mini-batch; returns the batch loss and predictions.
    ///
    /// A non-finite loss is returned without touching the weights.
    pub fn train_batch(&mut self, x: &Array3<f64>, y: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        let (loss, predictions) = self.compute_gradients(x, y)?;
        if !loss.is_finite() {
            return Ok((loss, predictions));
        }

        let (l1, l2) = (self.settings.l1, self.settings.l2);
        let settings = &self.settings;
        let optimizer = self
            .optimizer
            .get_or_insert_with(|| settings.optimizer.create(settings.learning_rate));
        let mut params: Vec<&mut Param> = self.layers.iter_mut().flat_map(|l| l.params_mut()).collect();
        for param in params.iter_mut() {
            param.add_penalty_grad(l1, l2);
        }
        optimizer.step(&mut params);

        Ok((loss, predictions))
    }

    /// Forward in training mode and backpropagate the data loss into every
    /// parameter's `grad`. The weight penalty is not included in the gradients.
    fn compute_gradients(&mut self, x: &Array3<f64>, y: &Array1<f64>) -> Result<(f64, Array1<f64>)> {
        if x.dim().0 != y.len() || y.is_empty() {
            return Err(ForecastError::data_integrity(format!(
                "batch has {} windows and {} targets",
                x.dim().0,
                y.len()
            )));
        }

        for param in self.params_mut() {
            param.zero_grad();
        }

        let predictions = self.forward(x, true)?;
        let loss = self.settings.loss.compute(&predictions, y) + self.penalty();
        if !loss.is_finite() {
            return Ok((loss, predictions));
        }

        let mut grad = Tensor::Flat(self.settings.loss.gradient(&predictions, y).insert_axis(Axis(1)));
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(grad)?;
        }
        Ok((loss, predictions))
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    /// Copy of every weight and buffer
    pub fn snapshot(&self) -> WeightSnapshot {
        let tensors = self
            .layers
            .iter()
            .flat_map(|l| {
                let mut t: Vec<Array2<f64>> = l.params().into_iter().map(|p| p.value.clone()).collect();
                t.extend(l.buffers().into_iter().cloned());
                t
            })
            .collect();
        WeightSnapshot { tensors }
    }

    /// Restore weights taken from a model of the same architecture
    pub fn restore(&mut self, snapshot: &WeightSnapshot) -> Result<()> {
        let mut targets: Vec<&mut Array2<f64>> = Vec::new();
        for layer in self.layers.iter_mut() {
            let (params, buffers) = split_layer_mut(layer);
            targets.extend(params);
            targets.extend(buffers);
        }

        if targets.len() != snapshot.tensors.len()
            || targets
                .iter()
                .zip(snapshot.tensors.iter())
                .any(|(t, s)| t.dim() != s.dim())
        {
            return Err(ForecastError::persistence(
                "weight snapshot does not match the model architecture",
            ));
        }

        for (target, source) in targets.into_iter().zip(snapshot.tensors.iter()) {
            target.assign(source);
        }
        Ok(())
    }

    /// Architecture plus weights
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = bincode::serialize(self)?;
        std::fs::write(path.as_ref(), encoded).map_err(|e| {
            ForecastError::persistence(format!("cannot write {}: {}", path.as_ref().display(), e))
        })?;
        info!("Model saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| {
            ForecastError::persistence(format!("cannot read model {}: {}", path.display(), e))
        })?;
        Ok(bincode::deserialize(&data)?)
    }

    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.snapshot().save(path)
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let snapshot = WeightSnapshot::load(path)?;
        self.restore(&snapshot)
    }

    /// Keras-style layer listing
    pub fn summary(&self) -> String {
        let mut lines = vec![format!(
            "SequenceModel input=({}, {}) head={}",
            self.input_shape.0, self.input_shape.1, self.head
        )];
        for (i, layer) in self.layers.iter().enumerate() {
            let n: usize = layer.params().iter().map(|p| p.len()).sum();
            lines.push(format!("  {:>2}  {:<40} params={}", i + 1, layer.name(), n));
        }
        lines.push(format!("Total params: {}", self.num_parameters()));
        lines.join("\n")
    }
}

fn split_layer_mut(layer: &mut Layer) -> (Vec<&mut Array2<f64>>, Vec<&mut Array2<f64>>) {
    match layer {
        Layer::BatchNorm(bn) => (
            vec![&mut bn.gamma.value, &mut bn.beta.value],
            vec![&mut bn.running_mean, &mut bn.running_var],
        ),
        other => (
            other.params_mut().into_iter().map(|p| &mut p.value).collect(),
            Vec::new(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::{ModelBuilder, ModelKind};
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn small_config(model_type: ModelKind) -> ModelConfig {
        ModelConfig {
            model_type,
            recurrent_units: vec![4, 3],
            dense_units: vec![3],
            dropout: 0.0,
            recurrent_dropout: 0.0,
            l1: 0.0,
            l2: 0.0,
            batch_norm: false,
            dense_activation: crate::model::Activation::Tanh,
            learning_rate: 0.01,
            seed: Some(7),
            ..ModelConfig::default()
        }
    }

    fn batch(n: usize, steps: usize, features: usize) -> (Array3<f64>, Array1<f64>) {
        let x = Array3::from_shape_fn((n, steps, features), |(b, t, f)| {
            ((b * 13 + t * 7 + f * 3) as f64 * 0.37).sin()
        });
        let y = Array1::from_shape_fn(n, |b| (b as f64 * 0.9).cos() * 0.5);
        (x, y)
    }

    fn loss_at(model: &mut SequenceModel, x: &Array3<f64>, y: &Array1<f64>) -> f64 {
        let predictions = model.forward(x, false).unwrap();
        model.settings.loss.compute(&predictions, y)
    }

    /// Compare backpropagated gradients with central differences on every
    /// tensor of the model.
    fn check_gradients(model_type: ModelKind) {
        let (x, y) = batch(3, 5, 2);
        let mut model = ModelBuilder::build((5, 2), &small_config(model_type)).unwrap();
        model.compute_gradients(&x, &y).unwrap();

        let analytic: Vec<Array2<f64>> = model
            .layers
            .iter()
            .flat_map(|l| l.params())
            .map(|p| p.grad.clone())
            .collect();

        let eps = 1e-5;
        let n_params = analytic.len();
        for k in 0..n_params {
            let (rows, cols) = analytic[k].dim();
            // a few entries per tensor keep the test fast
            for (r, c) in [(0, 0), (rows - 1, cols - 1), (rows / 2, cols / 2)] {
                let original = model.params_mut()[k].value[[r, c]];

                model.params_mut()[k].value[[r, c]] = original + eps;
                let plus = loss_at(&mut model, &x, &y);
                model.params_mut()[k].value[[r, c]] = original - eps;
                let minus = loss_at(&mut model, &x, &y);
                model.params_mut()[k].value[[r, c]] = original;

                let numeric = (plus - minus) / (2.0 * eps);
                assert_relative_eq!(analytic[k][[r, c]], numeric, epsilon = 1e-6, max_relative = 1e-4);
            }
        }
    }

    #[test]
    fn test_lstm_gradients_match_finite_differences() {
        check_gradients(ModelKind::Lstm);
    }

    #[test]
    fn test_bigru_gradients_match_finite_differences() {
        check_gradients(ModelKind::BiGru);
    }

    #[test]
    fn test_bilstm_gradients_match_finite_differences() {
        check_gradients(ModelKind::BiLstm);
    }

    #[test]
    fn test_training_reduces_loss() {
        let (x, y) = batch(16, 6, 2);
        let mut model = ModelBuilder::build((6, 2), &small_config(ModelKind::Gru)).unwrap();

        let before = model.evaluate(&x, &y).unwrap().loss;
        for _ in 0..150 {
            model.train_batch(&x, &y).unwrap();
        }
        let after = model.evaluate(&x, &y).unwrap().loss;
        assert!(after < before, "loss {} -> {}", before, after);
    }

    #[test]
    fn test_evaluate_reports_compiled_metrics() {
        let (x, y) = batch(4, 3, 2);
        let mut model = ModelBuilder::build((3, 2), &small_config(ModelKind::Lstm)).unwrap();
        let evaluation = model.evaluate(&x, &y).unwrap();

        assert_eq!(evaluation.metrics.len(), 2);
        let mse = evaluation.metric(MetricKind::Mse).unwrap();
        assert_relative_eq!(evaluation.loss, mse, epsilon = 1e-12);
    }

    #[test]
    fn test_snapshot_restore() {
        let (x, y) = batch(4, 3, 2);
        let mut model = ModelBuilder::build((3, 2), &ModelConfig {
            batch_norm: true,
            ..small_config(ModelKind::BiLstm)
        })
        .unwrap();

        let snapshot = model.snapshot();
        let before = model.predict(&x).unwrap();
        for _ in 0..5 {
            model.train_batch(&x, &y).unwrap();
        }
        assert_ne!(model.predict(&x).unwrap(), before);

        model.restore(&snapshot).unwrap();
        assert_eq!(model.predict(&x).unwrap(), before);
    }

    #[test]
    fn test_restore_rejects_other_architecture() {
        let a = ModelBuilder::build((3, 2), &small_config(ModelKind::Lstm)).unwrap();
        let mut b = ModelBuilder::build((3, 2), &small_config(ModelKind::Gru)).unwrap();
        assert!(matches!(
            b.restore(&a.snapshot()),
            Err(ForecastError::Persistence(_))
        ));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let (x, _) = batch(2, 4, 2);
        let mut model = ModelBuilder::build((4, 2), &small_config(ModelKind::BiGru)).unwrap();
        let expected = model.predict(&x).unwrap();

        model.save(dir.path().join("model.bin")).unwrap();
        let mut loaded = SequenceModel::load(dir.path().join("model.bin")).unwrap();
        assert_eq!(loaded.predict(&x).unwrap(), expected);

        model.save_weights(dir.path().join("weights.bin")).unwrap();
        let mut fresh = ModelBuilder::build((4, 2), &ModelConfig {
            seed: Some(99),
            ..small_config(ModelKind::BiGru)
        })
        .unwrap();
        fresh.load_weights(dir.path().join("weights.bin")).unwrap();
        assert_eq!(fresh.predict(&x).unwrap(), expected);
    }

    #[test]
    fn test_load_corrupt_model() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, b"garbage").unwrap();
        assert!(matches!(
            SequenceModel::load(&path),
            Err(ForecastError::Persistence(_))
        ));
    }

    #[test]
    fn test_wrong_feature_count() {
        let mut model = ModelBuilder::build((3, 2), &small_config(ModelKind::Lstm)).unwrap();
        let x = Array3::zeros((1, 3, 5));
        assert!(matches!(
            model.predict(&x),
            Err(ForecastError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_forecast_one_step_matches_predict() {
        let mut model = ModelBuilder::build((5, 2), &small_config(ModelKind::Gru)).unwrap();
        let (x, _) = batch(1, 5, 2);

        let single = model.predict(&x).unwrap();
        let recursive = model.forecast_steps(&x, 1, 1).unwrap();
        assert_eq!(recursive.len(), 1);
        assert_relative_eq!(recursive[0], single[0], epsilon = 1e-12);
    }

    #[test]
    fn test_forecast_feeds_predictions_back() {
        let mut model = ModelBuilder::build((5, 2), &small_config(ModelKind::Lstm)).unwrap();
        let (x, _) = batch(1, 5, 2);

        let path = model.forecast_steps(&x, 3, 1).unwrap();
        assert_eq!(path.len(), 3);

        let mut rolled = Array3::zeros((1, 5, 2));
        rolled
            .slice_mut(s![0, ..4, ..])
            .assign(&x.slice(s![0, 1.., ..]));
        rolled[[0, 4, 0]] = x[[0, 4, 0]];
        rolled[[0, 4, 1]] = path[0];
        let second = model.predict(&rolled).unwrap();
        assert_relative_eq!(path[1], second[0], epsilon = 1e-12);
    }

    #[test]
    fn test_forecast_rejects_batches() {
        let mut model = ModelBuilder::build((5, 2), &small_config(ModelKind::Gru)).unwrap();
        let (x, _) = batch(2, 5, 2);
        assert!(model.forecast_steps(&x, 2, 0).is_err());
        assert!(model.forecast_steps(&x.slice(s![..1, .., ..]).to_owned(), 2, 2).is_err());
    }
}

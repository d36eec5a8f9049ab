//! Uni- and bidirectional recurrent layers

use super::gru::{GruCell, GruStep};
use super::layers::Tensor;
use super::lstm::{LstmCell, LstmStep};
use super::param::Param;
use super::types::CellKind;
use crate::error::{ForecastError, Result};
use ndarray::{concatenate, s, Array2, Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One gate: `x · W_xᵀ + h · W_hᵀ + b`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gate {
    /// Input kernel `(hidden, input)`, regularized
    pub w_x: Param,
    /// Recurrent kernel `(hidden, hidden)`
    pub w_h: Param,
    pub b: Param,
}

impl Gate {
    pub fn new<R: Rng>(input_size: usize, hidden_size: usize, bias: f64, rng: &mut R) -> Self {
        let limit = (1.0 / hidden_size as f64).sqrt();
        Self {
            w_x: Param::uniform((hidden_size, input_size), limit, true, rng),
            w_h: Param::uniform((hidden_size, hidden_size), limit, false, rng),
            b: Param::filled((1, hidden_size), bias),
        }
    }

    pub fn preact(&self, x: &Array2<f64>, h: &Array2<f64>) -> Array2<f64> {
        x.dot(&self.w_x.value.t()) + h.dot(&self.w_h.value.t()) + &self.b.value
    }

    /// Accumulate gradients for a pre-activation gradient `dpre`.
    ///
    /// Returns the gradients w.r.t. `x` and `h`.
    pub fn backward(
        &mut self,
        dpre: &Array2<f64>,
        x: &Array2<f64>,
        h: &Array2<f64>,
    ) -> (Array2<f64>, Array2<f64>) {
        self.w_x.accumulate(&dpre.t().dot(x));
        self.w_h.accumulate(&dpre.t().dot(h));
        self.b.accumulate(&dpre.sum_axis(Axis(0)).insert_axis(Axis(0)));

        (dpre.dot(&self.w_x.value), dpre.dot(&self.w_h.value))
    }

    pub fn params(&self) -> Vec<&Param> {
        vec![&self.w_x, &self.w_h, &self.b]
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w_x, &mut self.w_h, &mut self.b]
    }
}

/// Dropout masks held fixed across all time steps of a sequence
#[derive(Debug, Clone, Default)]
pub struct StepMasks {
    input: Option<Array2<f64>>,
    recurrent: Option<Array2<f64>>,
}

impl StepMasks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn sample<R: Rng>(
        rng: &mut R,
        batch: usize,
        input_size: usize,
        hidden_size: usize,
        dropout: f64,
        recurrent_dropout: f64,
    ) -> Self {
        Self {
            input: dropout_mask(rng, (batch, input_size), dropout),
            recurrent: dropout_mask(rng, (batch, hidden_size), recurrent_dropout),
        }
    }

    pub fn apply_input(&self, x: Array2<f64>) -> Array2<f64> {
        match &self.input {
            Some(mask) => x * mask,
            None => x,
        }
    }

    pub fn apply_recurrent(&self, h: Array2<f64>) -> Array2<f64> {
        match &self.recurrent {
            Some(mask) => h * mask,
            None => h,
        }
    }
}

/// Inverted dropout mask scaled by `1 / (1 - rate)`, `None` when rate is 0
pub(crate) fn dropout_mask<R: Rng>(
    rng: &mut R,
    shape: (usize, usize),
    rate: f64,
) -> Option<Array2<f64>> {
    if rate <= 0.0 {
        return None;
    }
    let keep = 1.0 / (1.0 - rate);
    Some(Array2::from_shape_fn(shape, |_| {
        if rng.gen::<f64>() >= rate {
            keep
        } else {
            0.0
        }
    }))
}

fn reverse_time(x: &Array3<f64>) -> Array3<f64> {
    x.slice(s![.., ..;-1, ..]).to_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Cell {
    Lstm(LstmCell),
    Gru(GruCell),
}

#[derive(Debug, Clone)]
enum CellCache {
    Lstm(Vec<LstmStep>),
    Gru(Vec<GruStep>),
}

impl Cell {
    fn new<R: Rng>(kind: CellKind, input_size: usize, units: usize, rng: &mut R) -> Self {
        match kind {
            CellKind::Lstm => Cell::Lstm(LstmCell::new(input_size, units, rng)),
            CellKind::Gru => Cell::Gru(GruCell::new(input_size, units, rng)),
        }
    }

    fn forward(&self, x: &Array3<f64>, masks: &StepMasks) -> (Array3<f64>, CellCache) {
        match self {
            Cell::Lstm(cell) => {
                let (hs, steps) = cell.forward_sequence(x, masks);
                (hs, CellCache::Lstm(steps))
            }
            Cell::Gru(cell) => {
                let (hs, steps) = cell.forward_sequence(x, masks);
                (hs, CellCache::Gru(steps))
            }
        }
    }

    fn backward(
        &mut self,
        cache: &CellCache,
        dhs: &Array3<f64>,
        masks: &StepMasks,
    ) -> Result<Array3<f64>> {
        match (self, cache) {
            (Cell::Lstm(cell), CellCache::Lstm(steps)) => {
                Ok(cell.backward_sequence(steps, dhs, masks))
            }
            (Cell::Gru(cell), CellCache::Gru(steps)) => Ok(cell.backward_sequence(steps, dhs, masks)),
            _ => Err(ForecastError::NotFitted(
                "recurrent cache does not match the cell type".to_string(),
            )),
        }
    }

    fn params(&self) -> Vec<&Param> {
        match self {
            Cell::Lstm(cell) => cell.params(),
            Cell::Gru(cell) => cell.params(),
        }
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        match self {
            Cell::Lstm(cell) => cell.params_mut(),
            Cell::Gru(cell) => cell.params_mut(),
        }
    }
}

/// A recurrent layer over `(batch, time, features)` input.
///
/// A bidirectional layer runs a second cell over reversed time and
/// concatenates `[forward, backward]` features. Without `return_sequences`
/// the output is the final state of each direction: the forward cell at the
/// last step and the backward cell at the first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrentLayer {
    pub cell_kind: CellKind,
    pub units: usize,
    pub input_size: usize,
    pub bidirectional: bool,
    pub return_sequences: bool,
    pub dropout: f64,
    pub recurrent_dropout: f64,
    cells: Vec<Cell>,
    #[serde(skip)]
    cache: Vec<(CellCache, StepMasks)>,
    #[serde(skip)]
    seq_len: usize,
}

impl RecurrentLayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng>(
        cell_kind: CellKind,
        input_size: usize,
        units: usize,
        bidirectional: bool,
        return_sequences: bool,
        dropout: f64,
        recurrent_dropout: f64,
        rng: &mut R,
    ) -> Self {
        let directions = if bidirectional { 2 } else { 1 };
        let cells = (0..directions)
            .map(|_| Cell::new(cell_kind, input_size, units, rng))
            .collect();

        Self {
            cell_kind,
            units,
            input_size,
            bidirectional,
            return_sequences,
            dropout,
            recurrent_dropout,
            cells,
            cache: Vec::new(),
            seq_len: 0,
        }
    }

    /// Feature width of the output
    pub fn output_size(&self) -> usize {
        self.units * self.cells.len()
    }

    pub fn forward<R: Rng>(&mut self, x: &Array3<f64>, training: bool, rng: &mut R) -> Result<Tensor> {
        let (batch, steps, features) = x.dim();
        if features != self.input_size {
            return Err(ForecastError::data_integrity(format!(
                "recurrent layer expects {} features, got {}",
                self.input_size, features
            )));
        }
        if steps == 0 {
            return Err(ForecastError::insufficient("empty sequence"));
        }

        self.cache.clear();
        self.seq_len = steps;
        let mut outputs = Vec::with_capacity(self.cells.len());

        for (direction, cell) in self.cells.iter().enumerate() {
            let masks = if training {
                StepMasks::sample(
                    rng,
                    batch,
                    self.input_size,
                    self.units,
                    self.dropout,
                    self.recurrent_dropout,
                )
            } else {
                StepMasks::none()
            };

            let hs = if direction == 0 {
                let (hs, cache) = cell.forward(x, &masks);
                self.cache.push((cache, masks));
                hs
            } else {
                let (hs, cache) = cell.forward(&reverse_time(x), &masks);
                self.cache.push((cache, masks));
                reverse_time(&hs)
            };
            outputs.push(hs);
        }

        if self.return_sequences {
            let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
            return Ok(Tensor::Seq(concatenate(Axis(2), &views)?));
        }

        let finals: Vec<Array2<f64>> = outputs
            .iter()
            .enumerate()
            .map(|(direction, hs)| {
                let t = if direction == 0 { steps - 1 } else { 0 };
                hs.index_axis(Axis(1), t).to_owned()
            })
            .collect();
        let views: Vec<_> = finals.iter().map(|f| f.view()).collect();
        Ok(Tensor::Flat(concatenate(Axis(1), &views)?))
    }

    /// Backpropagate through time; returns the gradient w.r.t. the input
    pub fn backward(&mut self, grad: Tensor) -> Result<Array3<f64>> {
        let caches = std::mem::take(&mut self.cache);
        if caches.len() != self.cells.len() {
            return Err(ForecastError::NotFitted(
                "backward called before a training forward pass".to_string(),
            ));
        }

        let steps = self.seq_len;
        let units = self.units;
        let width = self.output_size();

        let dseq = match (grad, self.return_sequences) {
            (Tensor::Seq(g), true) => g,
            (Tensor::Flat(g), false) => {
                let batch = g.nrows();
                let mut d = Array3::zeros((batch, steps, width));
                d.slice_mut(s![.., steps - 1, ..units])
                    .assign(&g.slice(s![.., ..units]));
                if self.cells.len() == 2 {
                    d.slice_mut(s![.., 0, units..]).assign(&g.slice(s![.., units..]));
                }
                d
            }
            _ => {
                return Err(ForecastError::data_integrity(
                    "gradient shape does not match the recurrent output",
                ))
            }
        };

        let (batch, _, _) = dseq.dim();
        let mut dx = Array3::zeros((batch, steps, self.input_size));

        for (direction, (cell, (cache, masks))) in
            self.cells.iter_mut().zip(caches.iter()).enumerate()
        {
            let dh = dseq
                .slice(s![.., .., direction * units..(direction + 1) * units])
                .to_owned();
            if direction == 0 {
                dx += &cell.backward(cache, &dh, masks)?;
            } else {
                let dx_rev = cell.backward(cache, &reverse_time(&dh), masks)?;
                dx += &reverse_time(&dx_rev);
            }
        }

        Ok(dx)
    }

    pub fn params(&self) -> Vec<&Param> {
        self.cells.iter().flat_map(|c| c.params()).collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        self.cells.iter_mut().flat_map(|c| c.params_mut()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn layer(kind: CellKind, bidirectional: bool, return_sequences: bool) -> RecurrentLayer {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        RecurrentLayer::new(kind, 3, 4, bidirectional, return_sequences, 0.0, 0.0, &mut rng)
    }

    #[test]
    fn test_output_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = Array3::from_shape_fn((2, 5, 3), |(b, t, f)| (b + t + f) as f64 * 0.1);

        let mut seq = layer(CellKind::Lstm, true, true);
        match seq.forward(&x, false, &mut rng).unwrap() {
            Tensor::Seq(out) => assert_eq!(out.dim(), (2, 5, 8)),
            Tensor::Flat(_) => panic!("expected a sequence"),
        }

        let mut last = layer(CellKind::Gru, false, false);
        match last.forward(&x, false, &mut rng).unwrap() {
            Tensor::Flat(out) => assert_eq!(out.dim(), (2, 4)),
            Tensor::Seq(_) => panic!("expected final states"),
        }
    }

    #[test]
    fn test_backward_final_state_of_reverse_direction() {
        // The reverse cell's final state sees the whole sequence, so its
        // gradient reaches the last input step.
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x = Array3::from_elem((1, 4, 3), 0.5);
        let mut bi = layer(CellKind::Lstm, true, false);

        bi.forward(&x, true, &mut rng).unwrap();
        let mut g = Array2::zeros((1, 8));
        g.slice_mut(s![.., 4..]).fill(1.0);
        let dx = bi.backward(Tensor::Flat(g)).unwrap();

        assert!(dx.slice(s![0, 3, ..]).iter().any(|v| v.abs() > 0.0));
    }

    #[test]
    fn test_rejects_wrong_width() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut l = layer(CellKind::Lstm, false, false);
        let x = Array3::zeros((1, 4, 5));
        assert!(matches!(
            l.forward(&x, false, &mut rng),
            Err(ForecastError::DataIntegrity(_))
        ));
    }

    #[test]
    fn test_backward_without_forward() {
        let mut l = layer(CellKind::Gru, false, false);
        assert!(matches!(
            l.backward(Tensor::Flat(Array2::zeros((1, 4)))),
            Err(ForecastError::NotFitted(_))
        ));
    }

    #[test]
    fn test_dropout_mask_scale() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mask = dropout_mask(&mut rng, (50, 50), 0.2).unwrap();
        assert!(mask.iter().all(|&v| v == 0.0 || (v - 1.25).abs() < 1e-12));
        assert!(dropout_mask(&mut rng, (2, 2), 0.0).is_none());
    }
}

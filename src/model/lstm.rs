//! LSTM (Long Short-Term Memory) cell with backpropagation through time

use super::param::Param;
use super::recurrent::{Gate, StepMasks};
use super::types::sigmoid;
use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// LSTM cell: input, forget, candidate and output gates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LstmCell {
    pub input_size: usize,
    pub hidden_size: usize,
    input_gate: Gate,
    forget_gate: Gate,
    candidate: Gate,
    output_gate: Gate,
}

/// Activations of one time step, kept for the backward pass
#[derive(Debug, Clone)]
pub(crate) struct LstmStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    c_prev: Array2<f64>,
    i: Array2<f64>,
    f: Array2<f64>,
    g: Array2<f64>,
    o: Array2<f64>,
    c: Array2<f64>,
}

impl LstmCell {
    pub fn new<R: Rng>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self {
            input_size,
            hidden_size,
            input_gate: Gate::new(input_size, hidden_size, 0.0, rng),
            // Forget bias starts at 1 so early training keeps the cell state
            forget_gate: Gate::new(input_size, hidden_size, 1.0, rng),
            candidate: Gate::new(input_size, hidden_size, 0.0, rng),
            output_gate: Gate::new(input_size, hidden_size, 0.0, rng),
        }
    }

    /// Run the whole sequence `(batch, time, input)` from zero state.
    ///
    /// Returns every hidden state `(batch, time, hidden)` and the step cache.
    pub(crate) fn forward_sequence(
        &self,
        x: &Array3<f64>,
        masks: &StepMasks,
    ) -> (Array3<f64>, Vec<LstmStep>) {
        let (batch, steps, _) = x.dim();
        let mut h = Array2::zeros((batch, self.hidden_size));
        let mut c = Array2::zeros((batch, self.hidden_size));
        let mut hs = Array3::zeros((batch, steps, self.hidden_size));
        let mut cache = Vec::with_capacity(steps);

        for t in 0..steps {
            let x_t = masks.apply_input(x.index_axis(Axis(1), t).to_owned());
            let h_prev = masks.apply_recurrent(h);

            // c = f * c_prev + i * g ; h = o * tanh(c)
            let i = self.input_gate.preact(&x_t, &h_prev).mapv(sigmoid);
            let f = self.forget_gate.preact(&x_t, &h_prev).mapv(sigmoid);
            let g = self.candidate.preact(&x_t, &h_prev).mapv(f64::tanh);
            let o = self.output_gate.preact(&x_t, &h_prev).mapv(sigmoid);

            let c_next = &f * &c + &i * &g;
            let h_next = &o * &c_next.mapv(f64::tanh);

            hs.index_axis_mut(Axis(1), t).assign(&h_next);
            cache.push(LstmStep {
                x: x_t,
                h_prev,
                c_prev: c,
                i,
                f,
                g,
                o,
                c: c_next.clone(),
            });

            h = h_next;
            c = c_next;
        }

        (hs, cache)
    }

    /// Accumulate weight gradients and return the gradient w.r.t. the input.
    ///
    /// `dhs` is the loss gradient w.r.t. every hidden state of the sequence.
    pub(crate) fn backward_sequence(
        &mut self,
        cache: &[LstmStep],
        dhs: &Array3<f64>,
        masks: &StepMasks,
    ) -> Array3<f64> {
        let (batch, steps, _) = dhs.dim();
        let mut dx = Array3::zeros((batch, steps, self.input_size));
        let mut dh_next = Array2::zeros((batch, self.hidden_size));
        let mut dc_next = Array2::zeros((batch, self.hidden_size));

        for t in (0..steps).rev() {
            let s = &cache[t];
            let dh = &dhs.index_axis(Axis(1), t) + &dh_next;

            let tc = s.c.mapv(f64::tanh);
            let d_o = &dh * &tc;
            let dc = &dc_next + &(&dh * &s.o * &tc.mapv(|v| 1.0 - v * v));

            let d_f = &dc * &s.c_prev;
            let d_i = &dc * &s.g;
            let d_g = &dc * &s.i;
            dc_next = &dc * &s.f;

            let dp_i = d_i * &s.i.mapv(|v| v * (1.0 - v));
            let dp_f = d_f * &s.f.mapv(|v| v * (1.0 - v));
            let dp_g = d_g * &s.g.mapv(|v| 1.0 - v * v);
            let dp_o = d_o * &s.o.mapv(|v| v * (1.0 - v));

            let (dx_i, dh_i) = self.input_gate.backward(&dp_i, &s.x, &s.h_prev);
            let (dx_f, dh_f) = self.forget_gate.backward(&dp_f, &s.x, &s.h_prev);
            let (dx_g, dh_g) = self.candidate.backward(&dp_g, &s.x, &s.h_prev);
            let (dx_o, dh_o) = self.output_gate.backward(&dp_o, &s.x, &s.h_prev);

            let dx_t = masks.apply_input(dx_i + dx_f + dx_g + dx_o);
            dx.index_axis_mut(Axis(1), t).assign(&dx_t);
            dh_next = masks.apply_recurrent(dh_i + dh_f + dh_g + dh_o);
        }

        dx
    }

    pub fn params(&self) -> Vec<&Param> {
        [&self.input_gate, &self.forget_gate, &self.candidate, &self.output_gate]
            .into_iter()
            .flat_map(|g| g.params())
            .collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.input_gate.params_mut();
        params.extend(self.forget_gate.params_mut());
        params.extend(self.candidate.params_mut());
        params.extend(self.output_gate.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_lstm_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let cell = LstmCell::new(5, 10, &mut rng);
        let x = Array3::zeros((2, 7, 5));

        let (hs, cache) = cell.forward_sequence(&x, &StepMasks::none());
        assert_eq!(hs.dim(), (2, 7, 10));
        assert_eq!(cache.len(), 7);
        assert_eq!(cell.params().len(), 12);
    }

    #[test]
    fn test_hidden_state_is_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let cell = LstmCell::new(3, 4, &mut rng);
        let x = Array3::from_elem((1, 20, 3), 50.0);

        let (hs, _) = cell.forward_sequence(&x, &StepMasks::none());
        assert!(hs.iter().all(|v| v.abs() < 1.0));
    }
}

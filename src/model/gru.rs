//! GRU (Gated Recurrent Unit) cell with backpropagation through time
//!
//! Two gates instead of three: update `z` and reset `r`.
//! `h = z * h_prev + (1 - z) * n` with `n = tanh(W_n x + U_n (r * h_prev) + b_n)`.

use super::param::Param;
use super::recurrent::{Gate, StepMasks};
use super::types::sigmoid;
use ndarray::{Array2, Array3, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GruCell {
    pub input_size: usize,
    pub hidden_size: usize,
    update_gate: Gate,
    reset_gate: Gate,
    candidate: Gate,
}

#[derive(Debug, Clone)]
pub(crate) struct GruStep {
    x: Array2<f64>,
    h_prev: Array2<f64>,
    /// `h_prev` after recurrent dropout
    h_masked: Array2<f64>,
    z: Array2<f64>,
    r: Array2<f64>,
    n: Array2<f64>,
}

impl GruCell {
    pub fn new<R: Rng>(input_size: usize, hidden_size: usize, rng: &mut R) -> Self {
        Self {
            input_size,
            hidden_size,
            update_gate: Gate::new(input_size, hidden_size, 0.0, rng),
            reset_gate: Gate::new(input_size, hidden_size, 0.0, rng),
            candidate: Gate::new(input_size, hidden_size, 0.0, rng),
        }
    }

    pub(crate) fn forward_sequence(
        &self,
        x: &Array3<f64>,
        masks: &StepMasks,
    ) -> (Array3<f64>, Vec<GruStep>) {
        let (batch, steps, _) = x.dim();
        let mut h = Array2::zeros((batch, self.hidden_size));
        let mut hs = Array3::zeros((batch, steps, self.hidden_size));
        let mut cache = Vec::with_capacity(steps);

        for t in 0..steps {
            let x_t = masks.apply_input(x.index_axis(Axis(1), t).to_owned());
            let h_masked = masks.apply_recurrent(h.clone());

            let z = self.update_gate.preact(&x_t, &h_masked).mapv(sigmoid);
            let r = self.reset_gate.preact(&x_t, &h_masked).mapv(sigmoid);
            let n = self
                .candidate
                .preact(&x_t, &(&r * &h_masked))
                .mapv(f64::tanh);

            let h_next = &z * &h + &z.mapv(|v| 1.0 - v) * &n;
            hs.index_axis_mut(Axis(1), t).assign(&h_next);

            cache.push(GruStep {
                x: x_t,
                h_prev: h,
                h_masked,
                z,
                r,
                n,
            });
            h = h_next;
        }

        (hs, cache)
    }

    pub(crate) fn backward_sequence(
        &mut self,
        cache: &[GruStep],
        dhs: &Array3<f64>,
        masks: &StepMasks,
    ) -> Array3<f64> {
        let (batch, steps, _) = dhs.dim();
        let mut dx = Array3::zeros((batch, steps, self.input_size));
        let mut dh_next = Array2::zeros((batch, self.hidden_size));

        for t in (0..steps).rev() {
            let s = &cache[t];
            let dh = &dhs.index_axis(Axis(1), t) + &dh_next;

            let dz = &dh * &(&s.h_prev - &s.n);
            let dn = &dh * &s.z.mapv(|v| 1.0 - v);
            let dh_direct = &dh * &s.z;

            let dp_n = dn * &s.n.mapv(|v| 1.0 - v * v);
            let rh = &s.r * &s.h_masked;
            let (dx_n, d_rh) = self.candidate.backward(&dp_n, &s.x, &rh);

            let dr = &d_rh * &s.h_masked;
            let dp_z = dz * &s.z.mapv(|v| v * (1.0 - v));
            let dp_r = dr * &s.r.mapv(|v| v * (1.0 - v));

            let (dx_z, dhm_z) = self.update_gate.backward(&dp_z, &s.x, &s.h_masked);
            let (dx_r, dhm_r) = self.reset_gate.backward(&dp_r, &s.x, &s.h_masked);

            let dh_masked = dhm_z + dhm_r + &d_rh * &s.r;
            dh_next = dh_direct + masks.apply_recurrent(dh_masked);

            let dx_t = masks.apply_input(dx_n + dx_z + dx_r);
            dx.index_axis_mut(Axis(1), t).assign(&dx_t);
        }

        dx
    }

    pub fn params(&self) -> Vec<&Param> {
        [&self.update_gate, &self.reset_gate, &self.candidate]
            .into_iter()
            .flat_map(|g| g.params())
            .collect()
    }

    pub fn params_mut(&mut self) -> Vec<&mut Param> {
        let mut params = self.update_gate.params_mut();
        params.extend(self.reset_gate.params_mut());
        params.extend(self.candidate.params_mut());
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_gru_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let cell = GruCell::new(4, 6, &mut rng);
        let x = Array3::zeros((3, 5, 4));

        let (hs, cache) = cell.forward_sequence(&x, &StepMasks::none());
        assert_eq!(hs.dim(), (3, 5, 6));
        assert_eq!(cache.len(), 5);
        assert_eq!(cell.params().len(), 9);
    }
}

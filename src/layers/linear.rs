use crate::math::Matrix;
use crate::rng::rng_from_env;
use rand::Rng;

// Affine module with manual gradients.  The shared layers of this model
// (embedders, encoder, decoder) are each invoked several times within one
// training step, so the backward pass takes the forward input explicitly
// instead of caching it; gradients accumulate until `zero_grad`.  Optimizer
// state lives in the optimizer, keeping the five optimizer instances
// independent of each other.

pub struct LinearT {
    pub w: Matrix,
    pub b: Vec<f32>,
    pub grad_w: Matrix,
    pub grad_b: Vec<f32>,
}

impl LinearT {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        let mut rng = rng_from_env();
        let w = Matrix::from_vec(
            in_dim,
            out_dim,
            (0..in_dim * out_dim)
                .map(|_| (rng.gen::<f32>() - 0.5) * 0.02)
                .collect(),
        );
        Self {
            grad_w: Matrix::zeros(in_dim, out_dim),
            grad_b: vec![0.0; out_dim],
            b: vec![0.0; out_dim],
            w,
        }
    }

    pub fn in_dim(&self) -> usize {
        self.w.rows
    }

    pub fn out_dim(&self) -> usize {
        self.w.cols
    }

    pub fn forward(&self, x: &Matrix) -> Matrix {
        let mut out = Matrix::matmul(x, &self.w);
        for r in 0..out.rows {
            let row = out.row_mut(r);
            for (v, b) in row.iter_mut().zip(self.b.iter()) {
                *v += b;
            }
        }
        out
    }

    /// Accumulate weight/bias gradients for the pass that produced
    /// `grad_out` from input `x`, and return the gradient for `x`.
    pub fn backward(&mut self, x: &Matrix, grad_out: &Matrix) -> Matrix {
        let grad_w = Matrix::matmul(&x.transpose(), grad_out);
        self.grad_w.add_assign(&grad_w);
        for r in 0..grad_out.rows {
            for (gb, g) in self.grad_b.iter_mut().zip(grad_out.row(r).iter()) {
                *gb += g;
            }
        }
        Matrix::matmul(grad_out, &self.w.transpose())
    }

    /// Gradient for `x` only, leaving the parameter gradients untouched.
    /// Used where a pass must not train the layer (e.g. the critic's
    /// input-gradient for the gradient penalty).
    pub fn backward_input_only(&self, grad_out: &Matrix) -> Matrix {
        Matrix::matmul(grad_out, &self.w.transpose())
    }

    /// Row lookup used by the embedding layer.
    pub fn gather_rows(&self, ids: &[usize]) -> Matrix {
        let mut out = Matrix::zeros(ids.len(), self.w.cols);
        for (r, &id) in ids.iter().enumerate() {
            out.row_mut(r).copy_from_slice(self.w.row(id));
        }
        out
    }

    /// Scatter-add gradients for a row lookup.
    pub fn scatter_grad_rows(&mut self, ids: &[usize], grad_out: &Matrix) {
        assert_eq!(ids.len(), grad_out.rows);
        for (r, &id) in ids.iter().enumerate() {
            for (gw, g) in self
                .grad_w
                .row_mut(id)
                .iter_mut()
                .zip(grad_out.row(r).iter())
            {
                *gw += g;
            }
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad_w = Matrix::zeros(self.w.rows, self.w.cols);
        self.grad_b = vec![0.0; self.b.len()];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_diff_loss(layer: &LinearT, x: &Matrix) -> f32 {
        // simple scalar loss: sum of outputs
        layer.forward(x).data.iter().sum()
    }

    #[test]
    fn backward_matches_finite_differences() {
        let mut layer = LinearT::new(3, 2);
        let x = Matrix::from_vec(2, 3, vec![0.5, -1.0, 2.0, 1.5, 0.0, -0.5]);
        let out = layer.forward(&x);
        let ones = Matrix::from_vec(out.rows, out.cols, vec![1.0; out.rows * out.cols]);
        let grad_x = layer.backward(&x, &ones);

        let eps = 1e-3f32;
        for i in 0..layer.w.data.len() {
            let orig = layer.w.data[i];
            layer.w.data[i] = orig + eps;
            let hi = finite_diff_loss(&layer, &x);
            layer.w.data[i] = orig - eps;
            let lo = finite_diff_loss(&layer, &x);
            layer.w.data[i] = orig;
            let fd = (hi - lo) / (2.0 * eps);
            assert!(
                (layer.grad_w.data[i] - fd).abs() < 1e-2,
                "weight grad {i}: {} vs fd {}",
                layer.grad_w.data[i],
                fd
            );
        }
        for r in 0..x.rows {
            for c in 0..x.cols {
                let mut xp = x.clone();
                xp.set(r, c, x.get(r, c) + eps);
                let hi = finite_diff_loss(&layer, &xp);
                xp.set(r, c, x.get(r, c) - eps);
                let lo = finite_diff_loss(&layer, &xp);
                let fd = (hi - lo) / (2.0 * eps);
                assert!((grad_x.get(r, c) - fd).abs() < 1e-2);
            }
        }
    }

    #[test]
    fn gradients_accumulate_across_calls() {
        let mut layer = LinearT::new(2, 2);
        let x = Matrix::from_vec(1, 2, vec![1.0, 2.0]);
        let g = Matrix::from_vec(1, 2, vec![1.0, 1.0]);
        layer.backward(&x, &g);
        let first = layer.grad_w.clone();
        layer.backward(&x, &g);
        for (a, b) in layer.grad_w.data.iter().zip(first.data.iter()) {
            assert!((a - 2.0 * b).abs() < 1e-6);
        }
    }

    #[test]
    fn gather_scatter_round_trip() {
        let mut layer = LinearT::new(4, 3);
        let ids = vec![2usize, 2, 0];
        let rows = layer.gather_rows(&ids);
        assert_eq!(rows.row(0), layer.w.row(2));
        let grad = Matrix::from_vec(3, 3, vec![1.0; 9]);
        layer.scatter_grad_rows(&ids, &grad);
        assert!((layer.grad_w.get(2, 0) - 2.0).abs() < 1e-6);
        assert!((layer.grad_w.get(0, 0) - 1.0).abs() < 1e-6);
        assert!(layer.grad_w.get(1, 0).abs() < 1e-6);
    }
}

use super::linear::LinearT;
use super::{sigmoid, tanh};
use crate::math::Matrix;

fn elem_mul(a: &Matrix, b: &Matrix) -> Matrix {
    let mut v = vec![0.0; a.data.len()];
    for i in 0..v.len() {
        v[i] = a.data[i] * b.data[i];
    }
    Matrix::from_vec(a.rows, a.cols, v)
}

fn elem_sub(a: &Matrix, b: &Matrix) -> Matrix {
    let mut v = vec![0.0; a.data.len()];
    for i in 0..v.len() {
        v[i] = a.data[i] - b.data[i];
    }
    Matrix::from_vec(a.rows, a.cols, v)
}

fn elem_sub_from_one(a: &Matrix) -> Matrix {
    let mut v = vec![0.0; a.data.len()];
    for i in 0..v.len() {
        v[i] = 1.0 - a.data[i];
    }
    Matrix::from_vec(a.rows, a.cols, v)
}

/// One GRU step over a whole batch (rows are batch examples).
///
/// The encoder and decoder each invoke their cell several times within a
/// single training step, so every step returns an explicit trace that is
/// later handed back to [`GruCell::backward_step`].
pub struct GruCell {
    pub w_ir: LinearT,
    pub w_iz: LinearT,
    pub w_in: LinearT,
    pub w_hr: LinearT,
    pub w_hz: LinearT,
    pub w_hn: LinearT,
    input_dim: usize,
    hidden_dim: usize,
}

pub struct GruStepTrace {
    pub x: Matrix,
    pub h_prev: Matrix,
    r: Matrix,
    z: Matrix,
    n: Matrix,
}

impl GruCell {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Self {
        Self {
            w_ir: LinearT::new(input_dim, hidden_dim),
            w_iz: LinearT::new(input_dim, hidden_dim),
            w_in: LinearT::new(input_dim, hidden_dim),
            w_hr: LinearT::new(hidden_dim, hidden_dim),
            w_hz: LinearT::new(hidden_dim, hidden_dim),
            w_hn: LinearT::new(hidden_dim, hidden_dim),
            input_dim,
            hidden_dim,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn step(&self, x_t: &Matrix, h_prev: &Matrix) -> (Matrix, GruStepTrace) {
        let mut r = self.w_ir.forward(x_t).add(&self.w_hr.forward(h_prev));
        sigmoid::forward_matrix(&mut r);
        let mut z = self.w_iz.forward(x_t).add(&self.w_hz.forward(h_prev));
        sigmoid::forward_matrix(&mut z);
        let rh = elem_mul(&r, h_prev);
        let mut n = self.w_in.forward(x_t).add(&self.w_hn.forward(&rh));
        tanh::forward_matrix(&mut n);
        let one_minus_z = elem_sub_from_one(&z);
        let h = elem_mul(&z, h_prev).add(&elem_mul(&one_minus_z, &n));
        (
            h,
            GruStepTrace {
                x: x_t.clone(),
                h_prev: h_prev.clone(),
                r,
                z,
                n,
            },
        )
    }

    /// Accumulates weight gradients and returns `(dx, dh_prev)` for the
    /// step recorded in `trace`.
    pub fn backward_step(&mut self, trace: &GruStepTrace, dh: &Matrix) -> (Matrix, Matrix) {
        let mut dn = elem_mul(dh, &elem_sub_from_one(&trace.z));
        tanh::backward(&mut dn, &trace.n);
        let rh = elem_mul(&trace.r, &trace.h_prev);
        let drh = self.w_hn.backward(&rh, &dn);
        let grad_x_n = self.w_in.backward(&trace.x, &dn);
        let mut dh_prev = elem_mul(&drh, &trace.r);
        let mut dr = elem_mul(&drh, &trace.h_prev);
        sigmoid::backward(&mut dr, &trace.r);
        let grad_x_r = self.w_ir.backward(&trace.x, &dr);
        dh_prev = dh_prev.add(&self.w_hr.backward(&trace.h_prev, &dr));
        let mut dz = elem_mul(dh, &elem_sub(&trace.h_prev, &trace.n));
        sigmoid::backward(&mut dz, &trace.z);
        let grad_x_z = self.w_iz.backward(&trace.x, &dz);
        dh_prev = dh_prev.add(&self.w_hz.backward(&trace.h_prev, &dz));
        dh_prev = dh_prev.add(&elem_mul(dh, &trace.z));
        let dx = grad_x_n.add(&grad_x_r).add(&grad_x_z);
        (dx, dh_prev)
    }

    pub fn zero_grad(&mut self) {
        self.w_ir.zero_grad();
        self.w_iz.zero_grad();
        self.w_in.zero_grad();
        self.w_hr.zero_grad();
        self.w_hz.zero_grad();
        self.w_hn.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        let (w_ir, w_iz, w_in, w_hr, w_hz, w_hn) = (
            &mut self.w_ir,
            &mut self.w_iz,
            &mut self.w_in,
            &mut self.w_hr,
            &mut self.w_hz,
            &mut self.w_hn,
        );
        vec![w_ir, w_iz, w_in, w_hr, w_hz, w_hn]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar_loss(cell: &GruCell, x: &Matrix, h: &Matrix) -> f32 {
        let (out, _) = cell.step(x, h);
        out.data.iter().sum()
    }

    #[test]
    fn step_backward_matches_finite_differences() {
        let mut cell = GruCell::new(3, 4);
        let x = Matrix::from_vec(2, 3, vec![0.3, -0.2, 0.8, -0.5, 0.1, 0.4]);
        let h = Matrix::from_vec(2, 4, vec![0.1; 8]);
        let (out, trace) = cell.step(&x, &h);
        let ones = Matrix::from_vec(out.rows, out.cols, vec![1.0; out.data.len()]);
        let (dx, dh_prev) = cell.backward_step(&trace, &ones);

        let eps = 1e-3f32;
        for r in 0..x.rows {
            for c in 0..x.cols {
                let mut xp = x.clone();
                xp.set(r, c, x.get(r, c) + eps);
                let hi = scalar_loss(&cell, &xp, &h);
                xp.set(r, c, x.get(r, c) - eps);
                let lo = scalar_loss(&cell, &xp, &h);
                let fd = (hi - lo) / (2.0 * eps);
                assert!(
                    (dx.get(r, c) - fd).abs() < 1e-2,
                    "dx({r},{c}) {} vs fd {}",
                    dx.get(r, c),
                    fd
                );
            }
        }
        for r in 0..h.rows {
            for c in 0..h.cols {
                let mut hp = h.clone();
                hp.set(r, c, h.get(r, c) + eps);
                let hi = scalar_loss(&cell, &x, &hp);
                hp.set(r, c, h.get(r, c) - eps);
                let lo = scalar_loss(&cell, &x, &hp);
                let fd = (hi - lo) / (2.0 * eps);
                assert!((dh_prev.get(r, c) - fd).abs() < 1e-2);
            }
        }
    }
}

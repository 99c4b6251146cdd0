use std::sync::atomic::{AtomicUsize, Ordering};

static MATRIX_OPS: AtomicUsize = AtomicUsize::new(0);

pub fn reset_matrix_ops() {
    MATRIX_OPS.store(0, Ordering::SeqCst);
}

pub fn matrix_ops_count() -> usize {
    MATRIX_OPS.load(Ordering::SeqCst)
}

pub(crate) fn inc_ops() {
    MATRIX_OPS.fetch_add(1, Ordering::SeqCst);
}

#[derive(Clone, Debug, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn zeros(r: usize, c: usize) -> Self {
        Matrix {
            rows: r,
            cols: c,
            data: vec![0.0; r * c],
        }
    }

    pub fn from_vec(r: usize, c: usize, v: Vec<f32>) -> Self {
        assert_eq!(v.len(), r * c);
        Matrix {
            rows: r,
            cols: c,
            data: v,
        }
    }

    pub fn get(&self, r: usize, c: usize) -> f32 {
        self.data[r * self.cols + c]
    }

    pub fn set(&mut self, r: usize, c: usize, v: f32) {
        self.data[r * self.cols + c] = v;
    }

    pub fn row(&self, r: usize) -> &[f32] {
        &self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn row_mut(&mut self, r: usize) -> &mut [f32] {
        &mut self.data[r * self.cols..(r + 1) * self.cols]
    }

    pub fn matmul(a: &Matrix, b: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(a.cols, b.rows);
        let mut out = vec![0.0; a.rows * b.cols];
        for i in 0..a.rows {
            let a_row = &a.data[i * a.cols..(i + 1) * a.cols];
            for k in 0..a.cols {
                let a_val = a_row[k];
                if a_val == 0.0 {
                    continue;
                }
                let b_row = &b.data[k * b.cols..(k + 1) * b.cols];
                for j in 0..b.cols {
                    out[i * b.cols + j] += a_val * b_row[j];
                }
            }
        }
        Matrix::from_vec(a.rows, b.cols, out)
    }

    pub fn add(&self, other: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        let mut v = vec![0.0; self.data.len()];
        for i in 0..v.len() {
            v[i] = self.data[i] + other.data[i];
        }
        Matrix::from_vec(self.rows, self.cols, v)
    }

    pub fn sub(&self, other: &Matrix) -> Matrix {
        inc_ops();
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        let mut v = vec![0.0; self.data.len()];
        for i in 0..v.len() {
            v[i] = self.data[i] - other.data[i];
        }
        Matrix::from_vec(self.rows, self.cols, v)
    }

    pub fn scale(&self, s: f32) -> Matrix {
        let mut out = self.clone();
        for v in out.data.iter_mut() {
            *v *= s;
        }
        out
    }

    pub fn add_assign(&mut self, other: &Matrix) {
        assert_eq!(self.rows, other.rows);
        assert_eq!(self.cols, other.cols);
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            *a += b;
        }
    }

    pub fn transpose(&self) -> Matrix {
        inc_ops();
        let mut v = vec![0.0; self.rows * self.cols];
        for i in 0..self.rows {
            for j in 0..self.cols {
                v[j * self.rows + i] = self.get(i, j);
            }
        }
        Matrix::from_vec(self.cols, self.rows, v)
    }

    pub fn softmax(&self) -> Matrix {
        inc_ops();
        let mut v = vec![0.0; self.data.len()];
        for r in 0..self.rows {
            let row_start = r * self.cols;
            let row_slice = &self.data[row_start..row_start + self.cols];
            let max = row_slice.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let mut sum = 0.0;
            for c in 0..self.cols {
                let e = (self.get(r, c) - max).exp();
                v[row_start + c] = e;
                sum += e;
            }
            for c in 0..self.cols {
                v[row_start + c] /= sum;
            }
        }
        Matrix::from_vec(self.rows, self.cols, v)
    }

    /// Horizontal concatenation `[a | b]`.
    pub fn concat_cols(a: &Matrix, b: &Matrix) -> Matrix {
        assert_eq!(a.rows, b.rows);
        let mut out = Matrix::zeros(a.rows, a.cols + b.cols);
        for r in 0..a.rows {
            out.row_mut(r)[..a.cols].copy_from_slice(a.row(r));
            out.row_mut(r)[a.cols..].copy_from_slice(b.row(r));
        }
        out
    }

    /// Split along the column axis at `at`, returning `(left, right)`.
    pub fn split_cols(&self, at: usize) -> (Matrix, Matrix) {
        assert!(at <= self.cols);
        let mut left = Matrix::zeros(self.rows, at);
        let mut right = Matrix::zeros(self.rows, self.cols - at);
        for r in 0..self.rows {
            left.row_mut(r).copy_from_slice(&self.row(r)[..at]);
            right.row_mut(r).copy_from_slice(&self.row(r)[at..]);
        }
        (left, right)
    }
}

pub fn argmax(v: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_val = f32::NEG_INFINITY;
    for (i, &x) in v.iter().enumerate() {
        if x > best_val {
            best_val = x;
            best = i;
        }
    }
    best
}

/// Jacobian-vector product of a row-wise softmax evaluated at `probs`.
pub fn softmax_backward(probs: &Matrix, grad_out: &Matrix) -> Matrix {
    let mut grad = Matrix::zeros(grad_out.rows, grad_out.cols);
    for r in 0..grad_out.rows {
        let p = probs.row(r);
        let g = grad_out.row(r);
        let mut dot = 0.0;
        for c in 0..grad_out.cols {
            dot += g[c] * p[c];
        }
        let out = grad.row_mut(r);
        for c in 0..out.len() {
            out[c] = p[c] * (g[c] - dot);
        }
    }
    grad
}

/// Mean sigmoid cross-entropy over per-example logits.  The returned
/// gradient is with respect to each logit and already divided by the batch
/// size.
pub fn sigmoid_ce_with_logits(logits: &[f32], labels: &[f32]) -> (f32, Vec<f32>) {
    assert_eq!(logits.len(), labels.len());
    let n = logits.len() as f32;
    let mut loss = 0.0f32;
    let mut grad = vec![0.0f32; logits.len()];
    for i in 0..logits.len() {
        let x = logits[i];
        let y = labels[i];
        // max(x,0) - x*y + ln(1 + exp(-|x|)), the stable form
        loss += x.max(0.0) - x * y + (1.0 + (-x.abs()).exp()).ln();
        let sig = 1.0 / (1.0 + (-x).exp());
        grad[i] = (sig - y) / n;
    }
    (loss / n, grad)
}

/// Sequence softmax cross-entropy over time-major step logits, averaged
/// across timesteps (per example, not summed) and then across the batch.
///
/// Returns the loss, the gradient for each step's logits (zero past each
/// example's length) and the argmax predictions per step.
pub fn sequence_softmax_cross_entropy(
    logits: &[Matrix],
    targets: &[Vec<usize>],
    lengths: &[usize],
) -> (f32, Vec<Matrix>, Vec<Vec<usize>>) {
    let steps = logits.len();
    assert_eq!(steps, targets.len());
    let batch = if steps > 0 { logits[0].rows } else { 0 };
    let mut loss = 0.0f32;
    let mut grads = Vec::with_capacity(steps);
    let mut preds = Vec::with_capacity(steps);
    let inv_batch = if batch > 0 { 1.0 / batch as f32 } else { 0.0 };
    for t in 0..steps {
        let probs = logits[t].softmax();
        let mut grad = Matrix::zeros(probs.rows, probs.cols);
        let mut step_preds = vec![0usize; batch];
        for b in 0..batch {
            step_preds[b] = argmax(probs.row(b));
            if t >= lengths[b] || lengths[b] == 0 {
                continue;
            }
            let scale = inv_batch / lengths[b] as f32;
            let tok = targets[t][b];
            let p = probs.get(b, tok);
            loss += -(p + 1e-9).ln() * scale;
            let pr: Vec<f32> = probs.row(b).to_vec();
            let g = grad.row_mut(b);
            for c in 0..g.len() {
                g[c] = pr[c] * scale;
            }
            g[tok] -= scale;
        }
        grads.push(grad);
        preds.push(step_preds);
    }
    (loss, grads, preds)
}

/// Row-wise L2 normalization; returns the normalized matrix and the norms
/// needed for the backward pass.
pub fn l2_normalize_rows(x: &Matrix) -> (Matrix, Vec<f32>) {
    let mut out = x.clone();
    let mut norms = vec![0.0f32; x.rows];
    for r in 0..x.rows {
        let row = out.row_mut(r);
        let mut sq = 0.0f32;
        for v in row.iter() {
            sq += v * v;
        }
        let norm = sq.sqrt().max(1e-12);
        norms[r] = norm;
        for v in row.iter_mut() {
            *v /= norm;
        }
    }
    (out, norms)
}

/// Backward of row-wise L2 normalization given the normalized output and
/// the original norms.
pub fn l2_normalize_backward(normed: &Matrix, norms: &[f32], d_normed: &Matrix) -> Matrix {
    let mut grad = Matrix::zeros(normed.rows, normed.cols);
    for r in 0..normed.rows {
        let n = normed.row(r);
        let g = d_normed.row(r);
        let mut dot = 0.0f32;
        for c in 0..n.len() {
            dot += n[c] * g[c];
        }
        let out = grad.row_mut(r);
        for c in 0..out.len() {
            out[c] = (g[c] - n[c] * dot) / norms[r];
        }
    }
    grad
}

/// Mean over rows of `1 - <a_i, b_i>` for row-normalized `a`, `b`.
pub fn cosine_distance_rows(a: &Matrix, b: &Matrix) -> f32 {
    assert_eq!(a.rows, b.rows);
    assert_eq!(a.cols, b.cols);
    let mut total = 0.0f32;
    for r in 0..a.rows {
        let mut dot = 0.0f32;
        for (x, y) in a.row(r).iter().zip(b.row(r).iter()) {
            dot += x * y;
        }
        total += 1.0 - dot;
    }
    total / a.rows as f32
}

/// Gradients of [`cosine_distance_rows`] with respect to both normalized
/// inputs, scaled by an upstream seed.
pub fn cosine_distance_backward(a: &Matrix, b: &Matrix, seed: f32) -> (Matrix, Matrix) {
    let scale = -seed / a.rows as f32;
    (b.scale(scale), a.scale(scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_concat_are_inverses() {
        let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let (l, r) = m.split_cols(1);
        assert_eq!(l.cols, 1);
        assert_eq!(r.cols, 2);
        let back = Matrix::concat_cols(&l, &r);
        assert_eq!(back, m);
    }

    #[test]
    fn sigmoid_ce_matches_manual() {
        let (loss, grad) = sigmoid_ce_with_logits(&[0.0], &[1.0]);
        assert!((loss - (2.0f32).ln()).abs() < 1e-6);
        assert!((grad[0] - (0.5 - 1.0)).abs() < 1e-6);
    }

    #[test]
    fn normalized_rows_have_unit_norm() {
        let m = Matrix::from_vec(1, 3, vec![3.0, 0.0, 4.0]);
        let (n, norms) = l2_normalize_rows(&m);
        assert!((norms[0] - 5.0).abs() < 1e-6);
        let sq: f32 = n.row(0).iter().map(|v| v * v).sum();
        assert!((sq - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_distance_covers_full_range() {
        let a = Matrix::from_vec(1, 2, vec![1.0, 0.0]);
        let b = Matrix::from_vec(1, 2, vec![-1.0, 0.0]);
        let (na, _) = l2_normalize_rows(&a);
        let (nb, _) = l2_normalize_rows(&b);
        let d = cosine_distance_rows(&na, &nb);
        assert!((d - 2.0).abs() < 1e-6);
        let same = cosine_distance_rows(&na, &na);
        assert!(same.abs() < 1e-6);
    }
}

use super::linear::LinearT;
use crate::math::Matrix;
use std::fmt;

/// 1-D convolution over the time axis with ReLU and max-over-time pooling,
/// one weight matrix per kernel size (im2col onto a [`LinearT`], following
/// the same trick the repo uses for 2-D convolutions).
///
/// Inputs are time-major: a slice of `(batch x emb)` matrices.  Pooling is
/// restricted to the window positions that fall inside each example's
/// sequence length; sequences shorter than the largest kernel are
/// right-padded with literal zero steps.
pub struct Conv1dPool {
    pub convs: Vec<LinearT>,
    kernel_sizes: Vec<usize>,
    filters: usize,
    emb_dim: usize,
}

#[derive(Debug, PartialEq)]
pub enum ConvError {
    EmptyInput,
    DimMismatch { expected: usize, got: usize },
}

impl fmt::Display for ConvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvError::EmptyInput => write!(f, "convolution input has no time steps"),
            ConvError::DimMismatch { expected, got } => {
                write!(f, "input embedding width {got} does not match layer width {expected}")
            }
        }
    }
}

impl std::error::Error for ConvError {}

pub(crate) struct KernelTrace {
    /// im2col matrix, rows ordered batch-major then position.
    pub(crate) cols: Matrix,
    /// Winning window position per `(batch, filter)`.
    pub(crate) argmax: Vec<usize>,
    /// ReLU mask at the winning position per `(batch, filter)`.
    pub(crate) mask: Vec<f32>,
    pub(crate) positions: usize,
}

pub struct Conv1dTrace {
    pub(crate) kernels: Vec<KernelTrace>,
    pub(crate) batch: usize,
    pub(crate) time: usize,
}

impl Conv1dPool {
    pub fn new(emb_dim: usize, filters: usize, kernel_sizes: Vec<usize>) -> Self {
        assert!(!kernel_sizes.is_empty(), "at least one kernel size required");
        let convs = kernel_sizes
            .iter()
            .map(|&k| LinearT::new(k * emb_dim, filters))
            .collect();
        Self {
            convs,
            kernel_sizes,
            filters,
            emb_dim,
        }
    }

    pub fn feature_dim(&self) -> usize {
        self.filters * self.kernel_sizes.len()
    }

    fn im2col(&self, inputs: &[Matrix], batch: usize, k: usize) -> Matrix {
        let positions = inputs.len() - k + 1;
        let mut cols = Matrix::zeros(batch * positions, k * self.emb_dim);
        for b in 0..batch {
            for p in 0..positions {
                let row = cols.row_mut(b * positions + p);
                for i in 0..k {
                    row[i * self.emb_dim..(i + 1) * self.emb_dim]
                        .copy_from_slice(inputs[p + i].row(b));
                }
            }
        }
        cols
    }

    pub fn forward(
        &self,
        inputs: &[Matrix],
        lengths: &[usize],
    ) -> Result<(Matrix, Conv1dTrace), ConvError> {
        if inputs.is_empty() {
            return Err(ConvError::EmptyInput);
        }
        let batch = inputs[0].rows;
        if inputs[0].cols != self.emb_dim {
            return Err(ConvError::DimMismatch {
                expected: self.emb_dim,
                got: inputs[0].cols,
            });
        }
        let time = inputs.len();
        let max_k = self.kernel_sizes.iter().copied().max().unwrap_or(1);
        let mut padded: Vec<Matrix> = inputs.to_vec();
        while padded.len() < max_k {
            padded.push(Matrix::zeros(batch, self.emb_dim));
        }
        let padded_time = padded.len();

        let mut features = Matrix::zeros(batch, self.feature_dim());
        let mut kernels = Vec::with_capacity(self.kernel_sizes.len());
        for (ki, &k) in self.kernel_sizes.iter().enumerate() {
            let positions = padded_time - k + 1;
            let cols = self.im2col(&padded, batch, k);
            let mut conv = self.convs[ki].forward(&cols);
            // relu then max over the valid window positions
            for v in conv.data.iter_mut() {
                if *v < 0.0 {
                    *v = 0.0;
                }
            }
            let mut argmax = vec![0usize; batch * self.filters];
            let mut mask = vec![0.0f32; batch * self.filters];
            for b in 0..batch {
                let valid = lengths[b]
                    .saturating_sub(k - 1)
                    .clamp(1, positions);
                for f in 0..self.filters {
                    let mut best_p = 0usize;
                    let mut best = f32::NEG_INFINITY;
                    for p in 0..valid {
                        let v = conv.get(b * positions + p, f);
                        if v > best {
                            best = v;
                            best_p = p;
                        }
                    }
                    argmax[b * self.filters + f] = best_p;
                    mask[b * self.filters + f] = if best > 0.0 { 1.0 } else { 0.0 };
                    features.set(b, ki * self.filters + f, best);
                }
            }
            kernels.push(KernelTrace {
                cols,
                argmax,
                mask,
                positions,
            });
        }
        Ok((
            features,
            Conv1dTrace {
                kernels,
                batch,
                time,
            },
        ))
    }

    /// Accumulate weight gradients and return the gradient for the inputs.
    pub fn backward(&mut self, trace: &Conv1dTrace, d_features: &Matrix) -> Vec<Matrix> {
        let mut d_inputs: Vec<Matrix> = (0..trace.time)
            .map(|_| Matrix::zeros(trace.batch, self.emb_dim))
            .collect();
        for ki in 0..self.kernel_sizes.len() {
            let k = self.kernel_sizes[ki];
            let kt = &trace.kernels[ki];
            let mut d_conv = Matrix::zeros(trace.batch * kt.positions, self.filters);
            for b in 0..trace.batch {
                for f in 0..self.filters {
                    let idx = b * self.filters + f;
                    let g = d_features.get(b, ki * self.filters + f) * kt.mask[idx];
                    if g != 0.0 {
                        d_conv.set(b * kt.positions + kt.argmax[idx], f, g);
                    }
                }
            }
            let d_cols = self.convs[ki].backward(&kt.cols, &d_conv);
            Self::scatter_cols(&mut d_inputs, &d_cols, kt, k, self.emb_dim, trace);
        }
        d_inputs
    }

    /// Gradient for the inputs only, leaving all weights untouched.
    pub fn backward_input_only(&self, trace: &Conv1dTrace, d_features: &Matrix) -> Vec<Matrix> {
        let mut d_inputs: Vec<Matrix> = (0..trace.time)
            .map(|_| Matrix::zeros(trace.batch, self.emb_dim))
            .collect();
        for ki in 0..self.kernel_sizes.len() {
            let k = self.kernel_sizes[ki];
            let kt = &trace.kernels[ki];
            let mut d_conv = Matrix::zeros(trace.batch * kt.positions, self.filters);
            for b in 0..trace.batch {
                for f in 0..self.filters {
                    let idx = b * self.filters + f;
                    let g = d_features.get(b, ki * self.filters + f) * kt.mask[idx];
                    if g != 0.0 {
                        d_conv.set(b * kt.positions + kt.argmax[idx], f, g);
                    }
                }
            }
            let d_cols = self.convs[ki].backward_input_only(&d_conv);
            Self::scatter_cols(&mut d_inputs, &d_cols, kt, k, self.emb_dim, trace);
        }
        d_inputs
    }

    fn scatter_cols(
        d_inputs: &mut [Matrix],
        d_cols: &Matrix,
        kt: &KernelTrace,
        k: usize,
        emb_dim: usize,
        trace: &Conv1dTrace,
    ) {
        for b in 0..trace.batch {
            for p in 0..kt.positions {
                let row = d_cols.row(b * kt.positions + p);
                if row.iter().all(|&v| v == 0.0) {
                    continue;
                }
                for i in 0..k {
                    let t = p + i;
                    if t >= trace.time {
                        continue; // gradient into literal zero padding
                    }
                    for (dst, src) in d_inputs[t]
                        .row_mut(b)
                        .iter_mut()
                        .zip(row[i * emb_dim..(i + 1) * emb_dim].iter())
                    {
                        *dst += src;
                    }
                }
            }
        }
    }

    pub fn kernel_sizes(&self) -> &[usize] {
        &self.kernel_sizes
    }

    pub fn emb_dim(&self) -> usize {
        self.emb_dim
    }

    pub fn filters(&self) -> usize {
        self.filters
    }

    pub fn zero_grad(&mut self) {
        for c in self.convs.iter_mut() {
            c.zero_grad();
        }
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        self.convs.iter_mut().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_input() {
        let conv = Conv1dPool::new(4, 2, vec![2]);
        assert_eq!(
            conv.forward(&[], &[]).err(),
            Some(ConvError::EmptyInput)
        );
    }

    #[test]
    fn tokens_past_length_do_not_change_features() {
        let conv = Conv1dPool::new(2, 3, vec![2]);
        let base = vec![
            Matrix::from_vec(1, 2, vec![0.5, -0.3]),
            Matrix::from_vec(1, 2, vec![0.1, 0.9]),
            Matrix::from_vec(1, 2, vec![0.0, 0.0]),
        ];
        let mut noisy = base.clone();
        noisy[2] = Matrix::from_vec(1, 2, vec![9.0, 9.0]);
        let (a, _) = conv.forward(&base, &[2]).unwrap();
        let (b, _) = conv.forward(&noisy, &[2]).unwrap();
        for (x, y) in a.data.iter().zip(b.data.iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}

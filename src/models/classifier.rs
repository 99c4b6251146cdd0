use crate::layers::{Conv1dPool, Conv1dTrace, ConvError, LinearT};
use crate::math::Matrix;

/// Convolutional text classifier over embedded (or soft-embedded) token
/// sequences: parallel 1-D convolutions, max-over-time pooling, then a
/// dense projection.  Doubles as the adversarial critic, whose score
/// lives in a dedicated output column.
pub struct Conv1dClassifier {
    pub conv: Conv1dPool,
    pub out: LinearT,
}

pub struct ClassifierTrace {
    conv: Conv1dTrace,
    features: Matrix,
}

/// Right-pads the shorter of two time-major sequences with zero steps so
/// both span the same number of steps.  Real and generated sentences must
/// agree on shape before the critic compares them.
pub fn equalize_time(a: &mut Vec<Matrix>, b: &mut Vec<Matrix>) {
    if a.is_empty() || b.is_empty() {
        return;
    }
    let (batch, dim) = (a[0].rows, a[0].cols);
    while a.len() < b.len() {
        a.push(Matrix::zeros(batch, dim));
    }
    while b.len() < a.len() {
        b.push(Matrix::zeros(batch, dim));
    }
}

impl Conv1dClassifier {
    pub fn new(
        emb_dim: usize,
        filters: usize,
        kernel_sizes: Vec<usize>,
        out_dim: usize,
    ) -> Self {
        let conv = Conv1dPool::new(emb_dim, filters, kernel_sizes);
        let feature_dim = conv.feature_dim();
        Self {
            conv,
            out: LinearT::new(feature_dim, out_dim),
        }
    }

    pub fn forward(
        &self,
        inputs: &[Matrix],
        lengths: &[usize],
    ) -> Result<(Matrix, ClassifierTrace), ConvError> {
        let (features, conv_trace) = self.conv.forward(inputs, lengths)?;
        let logits = self.out.forward(&features);
        Ok((
            logits,
            ClassifierTrace {
                conv: conv_trace,
                features,
            },
        ))
    }

    /// Accumulates all weight gradients and returns the gradient for the
    /// embedded inputs.
    pub fn backward(&mut self, trace: &ClassifierTrace, d_logits: &Matrix) -> Vec<Matrix> {
        let d_features = self.out.backward(&trace.features, d_logits);
        self.conv.backward(&trace.conv, &d_features)
    }

    /// Input gradient only; weights stay untrained.
    pub fn backward_input_only(&self, trace: &ClassifierTrace, d_logits: &Matrix) -> Vec<Matrix> {
        let d_features = self.out.backward_input_only(d_logits);
        self.conv.backward_input_only(&trace.conv, &d_features)
    }

    /// Value of the WGAN-GP penalty without touching any gradients; used
    /// when the losses are only being reported.
    pub fn gradient_penalty(
        &self,
        inputs: &[Matrix],
        lengths: &[usize],
        critic_col: usize,
        lambda_gp: f32,
    ) -> Result<f32, ConvError> {
        let (logits, trace) = self.forward(inputs, lengths)?;
        let batch = logits.rows;
        let mut unit = Matrix::zeros(batch, logits.cols);
        for b in 0..batch {
            unit.set(b, critic_col, 1.0);
        }
        let grads = self.backward_input_only(&trace, &unit);
        let mut penalty = 0.0f32;
        for b in 0..batch {
            let mut sq = 0.0f32;
            for g_t in &grads {
                for &v in g_t.row(b) {
                    sq += v * v;
                }
            }
            let slope = sq.sqrt();
            penalty += lambda_gp * (slope - 1.0) * (slope - 1.0) / batch as f32;
        }
        Ok(penalty)
    }

    /// WGAN-GP penalty on interpolated inputs: `lambda * mean((|∇x D| - 1)^2)`
    /// for the critic column.  The max-pool argmax and ReLU masks of this
    /// forward pass are held fixed, which makes the parameter gradient of
    /// the penalty available in closed form: the critic branch is then
    /// bilinear in the convolution kernels and the critic output weights.
    /// Accumulates those gradients and returns the penalty value.
    pub fn accumulate_gradient_penalty(
        &mut self,
        inputs: &[Matrix],
        lengths: &[usize],
        critic_col: usize,
        lambda_gp: f32,
    ) -> Result<f32, ConvError> {
        let (logits, trace) = self.forward(inputs, lengths)?;
        let batch = logits.rows;
        let mut unit = Matrix::zeros(batch, logits.cols);
        for b in 0..batch {
            unit.set(b, critic_col, 1.0);
        }
        let grads = self.backward_input_only(&trace, &unit);

        let mut slopes = vec![0.0f32; batch];
        for g_t in &grads {
            for b in 0..batch {
                for &v in g_t.row(b) {
                    slopes[b] += v * v;
                }
            }
        }
        let mut penalty = 0.0f32;
        let mut coef = vec![0.0f32; batch];
        for b in 0..batch {
            let slope = slopes[b].sqrt().max(1e-8);
            penalty += lambda_gp * (slope - 1.0) * (slope - 1.0) / batch as f32;
            coef[b] = lambda_gp * 2.0 * (slope - 1.0) / (batch as f32 * slope);
        }

        // u = coef_b * g_b, the upstream seed for d(penalty)/d(g)
        let time = inputs.len();
        let emb_dim = self.conv.emb_dim();
        let filters = self.conv.filters();
        let kernel_sizes = self.conv.kernel_sizes().to_vec();
        for (ki, &k) in kernel_sizes.iter().enumerate() {
            let kt = &trace.conv.kernels[ki];
            let conv_w = &self.conv.convs[ki].w;
            let mut d_conv_w = Matrix::zeros(conv_w.rows, conv_w.cols);
            for b in 0..batch {
                if coef[b] == 0.0 {
                    continue;
                }
                for f in 0..filters {
                    let idx = b * filters + f;
                    if kt.mask[idx] == 0.0 {
                        continue;
                    }
                    let feat = ki * filters + f;
                    let w_out = self.out.w.get(feat, critic_col);
                    let p_star = kt.argmax[idx];
                    let mut window_dot = 0.0f32;
                    for i in 0..k {
                        let t = p_star + i;
                        if t >= time {
                            continue;
                        }
                        for e in 0..emb_dim {
                            let u = coef[b] * grads[t].get(b, e);
                            if u == 0.0 {
                                continue;
                            }
                            window_dot += u * conv_w.get(i * emb_dim + e, f);
                            d_conv_w.set(
                                i * emb_dim + e,
                                f,
                                d_conv_w.get(i * emb_dim + e, f) + w_out * u,
                            );
                        }
                    }
                    let cur = self.out.grad_w.get(feat, critic_col);
                    self.out.grad_w.set(feat, critic_col, cur + window_dot);
                }
            }
            self.conv.convs[ki].grad_w.add_assign(&d_conv_w);
        }
        Ok(penalty)
    }

    pub fn zero_grad(&mut self) {
        self.conv.zero_grad();
        self.out.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        let mut params = self.conv.parameters();
        params.push(&mut self.out);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equalize_pads_the_shorter_sequence_with_zeros() {
        let mut a: Vec<Matrix> = (0..5).map(|_| Matrix::from_vec(2, 3, vec![1.0; 6])).collect();
        let mut b: Vec<Matrix> = (0..8).map(|_| Matrix::from_vec(2, 3, vec![2.0; 6])).collect();
        equalize_time(&mut a, &mut b);
        assert_eq!(a.len(), 8);
        assert_eq!(b.len(), 8);
        for t in 5..8 {
            assert!(a[t].data.iter().all(|&v| v == 0.0));
        }
        assert!(b[7].data.iter().all(|&v| v == 2.0));
    }

    // fixed weights keep the ReLU/argmax masks away from their switch
    // points, where the finite-difference probe would be invalid
    fn fixed_weights(lin: &mut crate::layers::LinearT) {
        for (i, v) in lin.w.data.iter_mut().enumerate() {
            *v = ((i * 7 % 11) as f32 - 5.0) * 0.13;
        }
        for (i, v) in lin.b.iter_mut().enumerate() {
            *v = 0.05 * (i as f32 + 1.0);
        }
    }

    #[test]
    fn penalty_gradients_match_finite_differences() {
        let mut clf = Conv1dClassifier::new(3, 2, vec![2], 2);
        fixed_weights(&mut clf.conv.convs[0]);
        fixed_weights(&mut clf.out);
        let inputs: Vec<Matrix> = vec![
            Matrix::from_vec(2, 3, vec![0.4, -0.2, 0.7, 0.1, 0.9, -0.5]),
            Matrix::from_vec(2, 3, vec![-0.3, 0.6, 0.2, 0.8, -0.1, 0.3]),
            Matrix::from_vec(2, 3, vec![0.5, 0.5, -0.4, -0.6, 0.2, 0.1]),
        ];
        let lengths = [3usize, 3];
        clf.zero_grad();
        let penalty = clf
            .accumulate_gradient_penalty(&inputs, &lengths, 1, 10.0)
            .unwrap();
        assert!(penalty.is_finite() && penalty >= 0.0);

        let grad_conv = clf.conv.convs[0].grad_w.clone();
        let grad_out = clf.out.grad_w.clone();
        let eps = 1e-3f32;
        for i in 0..clf.conv.convs[0].w.data.len() {
            let orig = clf.conv.convs[0].w.data[i];
            clf.conv.convs[0].w.data[i] = orig + eps;
            clf.zero_grad();
            let hi = clf
                .accumulate_gradient_penalty(&inputs, &lengths, 1, 10.0)
                .unwrap();
            clf.conv.convs[0].w.data[i] = orig - eps;
            clf.zero_grad();
            let lo = clf
                .accumulate_gradient_penalty(&inputs, &lengths, 1, 10.0)
                .unwrap();
            clf.conv.convs[0].w.data[i] = orig;
            let fd = (hi - lo) / (2.0 * eps);
            assert!(
                (grad_conv.data[i] - fd).abs() < 5e-2,
                "conv weight {i}: {} vs fd {}",
                grad_conv.data[i],
                fd
            );
        }
        for i in 0..clf.out.w.data.len() {
            let orig = clf.out.w.data[i];
            clf.out.w.data[i] = orig + eps;
            clf.zero_grad();
            let hi = clf
                .accumulate_gradient_penalty(&inputs, &lengths, 1, 10.0)
                .unwrap();
            clf.out.w.data[i] = orig - eps;
            clf.zero_grad();
            let lo = clf
                .accumulate_gradient_penalty(&inputs, &lengths, 1, 10.0)
                .unwrap();
            clf.out.w.data[i] = orig;
            let fd = (hi - lo) / (2.0 * eps);
            assert!(
                (grad_out.data[i] - fd).abs() < 5e-2,
                "out weight {i}: {} vs fd {}",
                grad_out.data[i],
                fd
            );
        }
    }
}

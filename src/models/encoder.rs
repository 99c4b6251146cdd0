use crate::layers::{GruCell, GruStepTrace, LinearT};
use crate::math::Matrix;

/// Unidirectional GRU encoder with length masking.
///
/// Outputs at steps past an example's length are zeroed and the hidden
/// state is held, so padding tokens never leak into the final state or
/// into attention memory.
pub struct Encoder {
    pub cell: GruCell,
}

pub struct EncoderTrace {
    steps: Vec<GruStepTrace>,
    /// `done[t][b]` is true when step `t` is at or past example `b`'s length.
    done: Vec<Vec<bool>>,
}

impl Encoder {
    pub fn new(input_dim: usize, hidden_dim: usize) -> Self {
        Self {
            cell: GruCell::new(input_dim, hidden_dim),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.cell.hidden_dim()
    }

    /// Runs the cell over a time-major sequence.  Returns the masked
    /// per-step outputs, the final state and the trace for backward.
    pub fn forward(
        &self,
        inputs: &[Matrix],
        lengths: &[usize],
    ) -> (Vec<Matrix>, Matrix, EncoderTrace) {
        let batch = inputs[0].rows;
        let hidden = self.cell.hidden_dim();
        let mut h = Matrix::zeros(batch, hidden);
        let mut outputs = Vec::with_capacity(inputs.len());
        let mut steps = Vec::with_capacity(inputs.len());
        let mut done = Vec::with_capacity(inputs.len());
        for (t, x_t) in inputs.iter().enumerate() {
            let (h_new, trace) = self.cell.step(x_t, &h);
            let mut out_t = h_new.clone();
            let mut done_t = vec![false; batch];
            let mut h_next = h_new;
            for b in 0..batch {
                if t >= lengths[b] {
                    done_t[b] = true;
                    // hold the state, silence the output
                    h_next.row_mut(b).copy_from_slice(h.row(b));
                    for v in out_t.row_mut(b).iter_mut() {
                        *v = 0.0;
                    }
                }
            }
            h = h_next;
            outputs.push(out_t);
            steps.push(trace);
            done.push(done_t);
        }
        (outputs, h, EncoderTrace { steps, done })
    }

    /// Backpropagates through the whole sequence.  `d_outputs` may be
    /// shorter-lived zeros for steps no loss touched; `d_final` seeds the
    /// state gradient.  Accumulates cell weight gradients and returns the
    /// gradient for each input step.
    pub fn backward(
        &mut self,
        trace: &EncoderTrace,
        d_outputs: &[Matrix],
        d_final: &Matrix,
    ) -> Vec<Matrix> {
        let batch = d_final.rows;
        let hidden = self.cell.hidden_dim();
        let input_dim = self.cell.input_dim();
        let mut dh = d_final.clone();
        let mut d_inputs = vec![Matrix::zeros(batch, input_dim); trace.steps.len()];
        for t in (0..trace.steps.len()).rev() {
            let dh_total = dh.add(&d_outputs[t]);
            // rows already past their length skip this step entirely
            let mut dh_step = dh_total.clone();
            let mut dh_skip = Matrix::zeros(batch, hidden);
            for b in 0..batch {
                if trace.done[t][b] {
                    dh_skip.row_mut(b).copy_from_slice(dh_total.row(b));
                    for v in dh_step.row_mut(b).iter_mut() {
                        *v = 0.0;
                    }
                }
            }
            let (dx, dh_prev) = self.cell.backward_step(&trace.steps[t], &dh_step);
            d_inputs[t] = dx;
            dh = dh_prev.add(&dh_skip);
        }
        d_inputs
    }

    pub fn zero_grad(&mut self) {
        self.cell.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        self.cell.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_steps_leave_state_and_outputs_untouched() {
        let enc = Encoder::new(3, 5);
        let short = vec![
            Matrix::from_vec(1, 3, vec![0.2, -0.1, 0.4]),
            Matrix::from_vec(1, 3, vec![0.7, 0.0, -0.3]),
        ];
        let mut padded = short.clone();
        padded.push(Matrix::from_vec(1, 3, vec![5.0, 5.0, 5.0]));
        padded.push(Matrix::from_vec(1, 3, vec![-5.0, 5.0, -5.0]));

        let (_, final_short, _) = enc.forward(&short, &[2]);
        let (outputs, final_padded, _) = enc.forward(&padded, &[2]);
        assert_eq!(final_short.data, final_padded.data);
        for t in 2..4 {
            assert!(outputs[t].data.iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn backward_matches_finite_differences_through_masking() {
        let mut enc = Encoder::new(2, 3);
        let inputs = vec![
            Matrix::from_vec(2, 2, vec![0.3, -0.2, 0.5, 0.1]),
            Matrix::from_vec(2, 2, vec![-0.4, 0.6, 0.2, -0.1]),
            Matrix::from_vec(2, 2, vec![0.0, 0.0, -0.3, 0.7]),
        ];
        let lengths = [2usize, 3usize];
        fn total(enc: &Encoder, inp: &[Matrix], lengths: &[usize]) -> f32 {
            let (outs, fin, _) = enc.forward(inp, lengths);
            outs.iter().map(|m| m.data.iter().sum::<f32>()).sum::<f32>()
                + fin.data.iter().sum::<f32>()
        }
        let (outs, fin, trace) = enc.forward(&inputs, &lengths);
        let d_outs: Vec<Matrix> = outs
            .iter()
            .map(|m| Matrix::from_vec(m.rows, m.cols, vec![1.0; m.data.len()]))
            .collect();
        let d_fin = Matrix::from_vec(fin.rows, fin.cols, vec![1.0; fin.data.len()]);
        let d_inputs = enc.backward(&trace, &d_outs, &d_fin);

        let eps = 1e-3f32;
        for t in 0..inputs.len() {
            for r in 0..2 {
                for c in 0..2 {
                    let mut pert = inputs.clone();
                    pert[t].set(r, c, inputs[t].get(r, c) + eps);
                    let hi = total(&enc, &pert, &lengths);
                    pert[t].set(r, c, inputs[t].get(r, c) - eps);
                    let lo = total(&enc, &pert, &lengths);
                    let fd = (hi - lo) / (2.0 * eps);
                    assert!(
                        (d_inputs[t].get(r, c) - fd).abs() < 2e-2,
                        "t={t} ({r},{c}): {} vs {}",
                        d_inputs[t].get(r, c),
                        fd
                    );
                }
            }
        }
    }
}

use crate::layers::{EmbeddingT, GruCell, GruStepTrace, LinearT};
use crate::math::{argmax, softmax_backward, Matrix};
use rand::Rng;

/// GRU decoder with dot-product attention over the encoder outputs.
///
/// The attention context is concatenated to the decoder state before the
/// output projection.  Three decoding modes share the same weights:
/// teacher-forced (training the reconstruction), Gumbel-softmax (soft
/// samples that stay differentiable for the adversarial losses) and greedy
/// (inference-time argmax, no gradients).
pub struct AttentionDecoder {
    pub cell: GruCell,
    pub attn_query: LinearT,
    pub out: LinearT,
}

struct StepTrace {
    gru: GruStepTrace,
    query: Matrix,
    alpha: Matrix,
    concat: Matrix,
}

pub struct TeacherTrace {
    steps: Vec<StepTrace>,
}

pub struct SoftTrace {
    steps: Vec<StepTrace>,
    /// Gumbel-softmax distributions per step.
    outputs: Vec<Matrix>,
    bos: Vec<usize>,
    gamma: f32,
}

impl AttentionDecoder {
    pub fn new(emb_dim: usize, hidden_dim: usize, memory_dim: usize, vocab_size: usize) -> Self {
        Self {
            cell: GruCell::new(emb_dim, hidden_dim),
            attn_query: LinearT::new(hidden_dim, memory_dim),
            out: LinearT::new(hidden_dim + memory_dim, vocab_size),
        }
    }

    pub fn hidden_dim(&self) -> usize {
        self.cell.hidden_dim()
    }

    fn attend(
        &self,
        state: &Matrix,
        memory: &[Matrix],
        memory_lengths: &[usize],
    ) -> (Matrix, Matrix, Matrix) {
        let batch = state.rows;
        let mem_dim = memory[0].cols;
        let query = self.attn_query.forward(state);
        let mut scores = Matrix::zeros(batch, memory.len());
        for (j, m_j) in memory.iter().enumerate() {
            for b in 0..batch {
                if j >= memory_lengths[b] {
                    scores.set(b, j, -1e9);
                    continue;
                }
                let mut dot = 0.0f32;
                for (q, m) in query.row(b).iter().zip(m_j.row(b).iter()) {
                    dot += q * m;
                }
                scores.set(b, j, dot);
            }
        }
        let alpha = scores.softmax();
        let mut ctx = Matrix::zeros(batch, mem_dim);
        for (j, m_j) in memory.iter().enumerate() {
            for b in 0..batch {
                let a = alpha.get(b, j);
                if a == 0.0 {
                    continue;
                }
                for (c, m) in ctx.row_mut(b).iter_mut().zip(m_j.row(b).iter()) {
                    *c += a * m;
                }
            }
        }
        (ctx, query, alpha)
    }

    /// Backward through one attention read.  Accumulates query-projection
    /// gradients, adds the memory gradient in place and returns the
    /// gradient for the decoder state.
    fn attention_backward(
        &mut self,
        step: &StepTrace,
        d_ctx: &Matrix,
        memory: &[Matrix],
        d_memory: &mut [Matrix],
    ) -> Matrix {
        let batch = d_ctx.rows;
        let mut d_alpha = Matrix::zeros(batch, memory.len());
        for (j, m_j) in memory.iter().enumerate() {
            for b in 0..batch {
                let a = step.alpha.get(b, j);
                let mut dot = 0.0f32;
                for (g, m) in d_ctx.row(b).iter().zip(m_j.row(b).iter()) {
                    dot += g * m;
                }
                d_alpha.set(b, j, dot);
                if a != 0.0 {
                    for (dm, g) in d_memory[j].row_mut(b).iter_mut().zip(d_ctx.row(b).iter()) {
                        *dm += a * g;
                    }
                }
            }
        }
        // masked positions carry zero attention weight, so their score
        // gradient vanishes here without an explicit mask
        let d_scores = softmax_backward(&step.alpha, &d_alpha);
        let mut d_query = Matrix::zeros(batch, step.query.cols);
        for (j, m_j) in memory.iter().enumerate() {
            for b in 0..batch {
                let ds = d_scores.get(b, j);
                if ds == 0.0 {
                    continue;
                }
                for (dq, m) in d_query.row_mut(b).iter_mut().zip(m_j.row(b).iter()) {
                    *dq += ds * m;
                }
                for (dm, q) in d_memory[j]
                    .row_mut(b)
                    .iter_mut()
                    .zip(step.query.row(b).iter())
                {
                    *dm += ds * q;
                }
            }
        }
        let (state, _) = step.concat.split_cols(self.cell.hidden_dim());
        self.attn_query.backward(&state, &d_query)
    }

    fn step(
        &self,
        x_t: &Matrix,
        h_prev: &Matrix,
        memory: &[Matrix],
        memory_lengths: &[usize],
    ) -> (Matrix, Matrix, StepTrace) {
        let (h, gru) = self.cell.step(x_t, h_prev);
        let (ctx, query, alpha) = self.attend(&h, memory, memory_lengths);
        let concat = Matrix::concat_cols(&h, &ctx);
        let logits = self.out.forward(&concat);
        (
            logits,
            h,
            StepTrace {
                gru,
                query,
                alpha,
                concat,
            },
        )
    }

    /// Teacher-forced decoding over embedded gold inputs (BOS-prefixed,
    /// time-major).  Returns per-step vocabulary logits.
    pub fn forward_teacher(
        &self,
        inputs: &[Matrix],
        state0: &Matrix,
        memory: &[Matrix],
        memory_lengths: &[usize],
    ) -> (Vec<Matrix>, TeacherTrace) {
        let mut h = state0.clone();
        let mut logits = Vec::with_capacity(inputs.len());
        let mut steps = Vec::with_capacity(inputs.len());
        for x_t in inputs {
            let (l_t, h_new, trace) = self.step(x_t, &h, memory, memory_lengths);
            logits.push(l_t);
            steps.push(trace);
            h = h_new;
        }
        (logits, TeacherTrace { steps })
    }

    /// Full BPTT for the teacher-forced pass.  Returns the gradients for
    /// the embedded inputs, the initial state and the attention memory.
    pub fn backward_teacher(
        &mut self,
        trace: &TeacherTrace,
        d_logits: &[Matrix],
        memory: &[Matrix],
    ) -> (Vec<Matrix>, Matrix, Vec<Matrix>) {
        let batch = d_logits[0].rows;
        let mut d_memory: Vec<Matrix> = memory
            .iter()
            .map(|m| Matrix::zeros(m.rows, m.cols))
            .collect();
        let mut d_inputs = vec![Matrix::zeros(batch, self.cell.input_dim()); trace.steps.len()];
        let mut dh = Matrix::zeros(batch, self.cell.hidden_dim());
        for t in (0..trace.steps.len()).rev() {
            let step = &trace.steps[t];
            let d_concat = self.out.backward(&step.concat, &d_logits[t]);
            let (d_state_out, d_ctx) = d_concat.split_cols(self.cell.hidden_dim());
            let d_state_attn = self.attention_backward(step, &d_ctx, memory, &mut d_memory);
            let dh_total = dh.add(&d_state_out).add(&d_state_attn);
            let (dx, dh_prev) = self.cell.backward_step(&step.gru, &dh_total);
            d_inputs[t] = dx;
            dh = dh_prev;
        }
        (d_inputs, dh, d_memory)
    }

    /// Gumbel-softmax decoding.  Each step samples a relaxed one-hot over
    /// the vocabulary and feeds its expected embedding into the next step,
    /// keeping the whole rollout differentiable.  `soft_lengths` is the
    /// first step whose argmax hits EOS (inclusive), or `max_len`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_soft(
        &self,
        embedder: &EmbeddingT,
        bos: &[usize],
        state0: &Matrix,
        memory: &[Matrix],
        memory_lengths: &[usize],
        gamma: f32,
        max_len: usize,
        eos_id: usize,
        rng: &mut impl Rng,
    ) -> (Vec<Matrix>, Vec<usize>, SoftTrace) {
        let batch = state0.rows;
        let mut h = state0.clone();
        let mut x = embedder.forward_ids(bos);
        let mut outputs = Vec::with_capacity(max_len);
        let mut steps = Vec::with_capacity(max_len);
        let mut soft_lengths = vec![max_len; batch];
        for t in 0..max_len {
            let (logits, h_new, trace) = self.step(&x, &h, memory, memory_lengths);
            let mut noisy = logits;
            for v in noisy.data.iter_mut() {
                let u: f32 = rng.gen::<f32>().clamp(1e-6, 1.0 - 1e-6);
                let g = -(-u.ln()).ln();
                *v = (*v + g) / gamma;
            }
            let y = noisy.softmax();
            for b in 0..batch {
                if soft_lengths[b] == max_len && argmax(y.row(b)) == eos_id {
                    soft_lengths[b] = t + 1;
                }
            }
            x = embedder.forward_soft(&y);
            outputs.push(y);
            steps.push(trace);
            h = h_new;
        }
        (
            outputs.clone(),
            soft_lengths,
            SoftTrace {
                steps,
                outputs,
                bos: bos.to_vec(),
                gamma,
            },
        )
    }

    /// BPTT for the soft rollout, including the feedback path through the
    /// embedding table.  Returns the gradients for the initial state and
    /// the attention memory; embedding-table gradients accumulate on
    /// `embedder`.
    pub fn backward_soft(
        &mut self,
        embedder: &mut EmbeddingT,
        trace: &SoftTrace,
        d_outputs: &[Matrix],
        memory: &[Matrix],
    ) -> (Matrix, Vec<Matrix>) {
        let steps = trace.steps.len();
        let batch = trace.outputs[0].rows;
        let mut d_memory: Vec<Matrix> = memory
            .iter()
            .map(|m| Matrix::zeros(m.rows, m.cols))
            .collect();
        let mut dh = Matrix::zeros(batch, self.cell.hidden_dim());
        // gradient flowing into step t's input from step t+1's feedback
        let mut dx_next: Option<Matrix> = None;
        for t in (0..steps).rev() {
            let step = &trace.steps[t];
            let y = &trace.outputs[t];
            let mut d_y = d_outputs[t].clone();
            if let Some(dx) = dx_next.take() {
                d_y.add_assign(&embedder.backward_soft(y, &dx));
            }
            let d_logits = softmax_backward(y, &d_y).scale(1.0 / trace.gamma);
            let d_concat = self.out.backward(&step.concat, &d_logits);
            let (d_state_out, d_ctx) = d_concat.split_cols(self.cell.hidden_dim());
            let d_state_attn = self.attention_backward(step, &d_ctx, memory, &mut d_memory);
            let dh_total = dh.add(&d_state_out).add(&d_state_attn);
            let (dx, dh_prev) = self.cell.backward_step(&step.gru, &dh_total);
            dx_next = Some(dx);
            dh = dh_prev;
        }
        if let Some(dx0) = dx_next {
            embedder.backward_ids(&trace.bos, &dx0);
        }
        (dh, d_memory)
    }

    /// Greedy argmax decoding, stopping each example at EOS.  No trace.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_greedy(
        &self,
        embedder: &EmbeddingT,
        bos: &[usize],
        state0: &Matrix,
        memory: &[Matrix],
        memory_lengths: &[usize],
        max_len: usize,
        eos_id: usize,
    ) -> Vec<Vec<usize>> {
        let batch = state0.rows;
        let mut h = state0.clone();
        let mut ids = bos.to_vec();
        let mut done = vec![false; batch];
        let mut decoded: Vec<Vec<usize>> = vec![Vec::new(); batch];
        for _ in 0..max_len {
            let x = embedder.forward_ids(&ids);
            let (logits, h_new, _) = self.step(&x, &h, memory, memory_lengths);
            for b in 0..batch {
                if done[b] {
                    continue;
                }
                let tok = argmax(logits.row(b));
                if tok == eos_id {
                    done[b] = true;
                } else {
                    decoded[b].push(tok);
                }
                ids[b] = tok;
            }
            if done.iter().all(|&d| d) {
                break;
            }
            h = h_new;
        }
        decoded
    }

    pub fn zero_grad(&mut self) {
        self.cell.zero_grad();
        self.attn_query.zero_grad();
        self.out.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        let mut params = self.cell.parameters();
        params.push(&mut self.attn_query);
        params.push(&mut self.out);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::rng_from_env;

    fn tiny_memory() -> (Vec<Matrix>, Vec<usize>) {
        let memory = vec![
            Matrix::from_vec(2, 3, vec![0.2, -0.1, 0.4, 0.5, 0.3, -0.2]),
            Matrix::from_vec(2, 3, vec![-0.3, 0.6, 0.1, 0.0, 0.0, 0.0]),
        ];
        (memory, vec![2, 1])
    }

    fn logit_sum(
        dec: &AttentionDecoder,
        inputs: &[Matrix],
        s0: &Matrix,
        memory: &[Matrix],
        lens: &[usize],
    ) -> f32 {
        let (logits, _) = dec.forward_teacher(inputs, s0, memory, lens);
        logits.iter().map(|m| m.data.iter().sum::<f32>()).sum()
    }

    #[test]
    fn teacher_backward_matches_finite_differences() {
        let mut dec = AttentionDecoder::new(2, 3, 3, 4);
        let (memory, lens) = tiny_memory();
        let inputs = vec![
            Matrix::from_vec(2, 2, vec![0.1, -0.4, 0.3, 0.2]),
            Matrix::from_vec(2, 2, vec![-0.2, 0.5, 0.0, -0.1]),
        ];
        let s0 = Matrix::from_vec(2, 3, vec![0.05; 6]);
        let (logits, trace) = dec.forward_teacher(&inputs, &s0, &memory, &lens);
        let d_logits: Vec<Matrix> = logits
            .iter()
            .map(|m| Matrix::from_vec(m.rows, m.cols, vec![1.0; m.data.len()]))
            .collect();
        let (d_inputs, d_s0, d_memory) = dec.backward_teacher(&trace, &d_logits, &memory);

        let eps = 1e-3f32;
        for r in 0..s0.rows {
            for c in 0..s0.cols {
                let mut sp = s0.clone();
                sp.set(r, c, s0.get(r, c) + eps);
                let hi = logit_sum(&dec, &inputs, &sp, &memory, &lens);
                sp.set(r, c, s0.get(r, c) - eps);
                let lo = logit_sum(&dec, &inputs, &sp, &memory, &lens);
                let fd = (hi - lo) / (2.0 * eps);
                assert!(
                    (d_s0.get(r, c) - fd).abs() < 2e-2,
                    "s0 ({r},{c}): {} vs {}",
                    d_s0.get(r, c),
                    fd
                );
            }
        }
        for t in 0..memory.len() {
            for r in 0..2 {
                for c in 0..3 {
                    let mut mp = memory.clone();
                    mp[t].set(r, c, memory[t].get(r, c) + eps);
                    let hi = logit_sum(&dec, &inputs, &s0, &mp, &lens);
                    mp[t].set(r, c, memory[t].get(r, c) - eps);
                    let lo = logit_sum(&dec, &inputs, &s0, &mp, &lens);
                    let fd = (hi - lo) / (2.0 * eps);
                    assert!(
                        (d_memory[t].get(r, c) - fd).abs() < 2e-2,
                        "mem t={t} ({r},{c}): {} vs {}",
                        d_memory[t].get(r, c),
                        fd
                    );
                }
            }
        }
        for t in 0..inputs.len() {
            for r in 0..2 {
                for c in 0..2 {
                    let mut ip = inputs.clone();
                    ip[t].set(r, c, inputs[t].get(r, c) + eps);
                    let hi = logit_sum(&dec, &ip, &s0, &memory, &lens);
                    ip[t].set(r, c, inputs[t].get(r, c) - eps);
                    let lo = logit_sum(&dec, &ip, &s0, &memory, &lens);
                    let fd = (hi - lo) / (2.0 * eps);
                    assert!((d_inputs[t].get(r, c) - fd).abs() < 2e-2);
                }
            }
        }
    }

    #[test]
    fn soft_outputs_are_distributions() {
        let dec = AttentionDecoder::new(4, 3, 3, 6);
        let emb = EmbeddingT::new(6, 4);
        let (memory, lens) = tiny_memory();
        let s0 = Matrix::zeros(2, 3);
        let mut rng = rng_from_env();
        let (outputs, soft_lengths, _) =
            dec.forward_soft(&emb, &[1, 1], &s0, &memory, &lens, 0.5, 5, 2, &mut rng);
        assert_eq!(outputs.len(), 5);
        for y in &outputs {
            for b in 0..2 {
                let sum: f32 = y.row(b).iter().sum();
                assert!((sum - 1.0).abs() < 1e-4);
                assert!(y.row(b).iter().all(|&v| v >= 0.0));
            }
        }
        for &l in &soft_lengths {
            assert!(l >= 1 && l <= 5);
        }
    }

    #[test]
    fn greedy_stops_at_eos_and_respects_cap() {
        let dec = AttentionDecoder::new(4, 3, 3, 6);
        let emb = EmbeddingT::new(6, 4);
        let (memory, lens) = tiny_memory();
        let s0 = Matrix::zeros(2, 3);
        let decoded = dec.forward_greedy(&emb, &[1, 1], &s0, &memory, &lens, 7, 2);
        for seq in &decoded {
            assert!(seq.len() <= 7);
            assert!(seq.iter().all(|&t| t != 2));
        }
    }
}

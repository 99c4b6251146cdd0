use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::Rng;

use crate::config::HParams;
use crate::data::{Batch, Vocab};
use crate::layers::{
    Activation, ConvError, EmbeddingT, LinearT, MlpConnector, MlpTrace,
};
use crate::math::{
    argmax, cosine_distance_backward, cosine_distance_rows, l2_normalize_backward,
    l2_normalize_rows, sequence_softmax_cross_entropy, sigmoid_ce_with_logits, Matrix,
};
use crate::metrics::{accuracy, binary_preds, binary_preds_half};
use crate::models::classifier::{equalize_time, ClassifierTrace, Conv1dClassifier};
use crate::models::decoder::{AttentionDecoder, SoftTrace, TeacherTrace};
use crate::models::encoder::{Encoder, EncoderTrace};
use crate::optim::{from_config, Optimizer};
use crate::rng::rng_from_env;

/// Decoded text and latent values exported for inspection alongside the
/// numeric fetches.
pub struct Samples {
    pub original: Vec<String>,
    pub transferred: Vec<String>,
    pub z_vector: Vec<Vec<f32>>,
    pub labels_source: Vec<usize>,
    pub labels_target: Vec<usize>,
    pub labels_predicted: Vec<usize>,
}

pub struct EvalFetches {
    pub batch_size: usize,
    pub losses: BTreeMap<String, f32>,
    pub metrics: BTreeMap<String, f32>,
    pub samples: Samples,
}

/// Everything one shared forward pass produces: losses, metrics, samples
/// and the traces each objective's backward pass replays.
struct Forward {
    enc_ids: Vec<Vec<usize>>,
    dec_in_ids: Vec<Vec<usize>>,
    memory: Vec<Matrix>,
    enc_trace: EncoderTrace,
    zn: Matrix,
    z_norms: Vec<f32>,
    c_src_trace: MlpTrace,
    c_tgt_trace: MlpTrace,
    conn_ae_trace: MlpTrace,
    conn_tgt_trace: MlpTrace,
    tf_trace: TeacherTrace,
    tf_grads: Vec<Matrix>,
    soft_outputs: Vec<Matrix>,
    soft_trace: SoftTrace,
    soft_src_outputs: Vec<Matrix>,
    soft_src_trace: SoftTrace,
    clas_real_trace: ClassifierTrace,
    clas_fake_trace: ClassifierTrace,
    grad_clas_real: Vec<f32>,
    grad_clas_fake: Vec<f32>,
    disc_real_trace: ClassifierTrace,
    disc_fake_trace: ClassifierTrace,
    grad_d_style_real: Vec<f32>,
    grad_d_style_fake: Vec<f32>,
    d_dis_fake_seed: Vec<f32>,
    interp_inputs: Vec<Matrix>,
    interp_lens: Vec<usize>,
    real_steps: usize,
    fake_steps: usize,
    z_t1: MlpTrace,
    z_t2: MlpTrace,
    z_t3: MlpTrace,
    grad_z_logits: Vec<f32>,
    re_src_trace: EncoderTrace,
    re_tgt_trace: EncoderTrace,
    z_re_src_n: Matrix,
    z_re_src_norms: Vec<f32>,
    z_re_tgt_n: Matrix,
    z_re_tgt_norms: Vec<f32>,
    losses: BTreeMap<String, f32>,
    metrics: BTreeMap<String, f32>,
    samples: Samples,
}

/// Attribute-controlled sequence-to-sequence model.  One shared forward
/// pass feeds five training objectives: the generator, its autoencoding
/// warm-up, the discriminator/critic, the style classifier and the
/// latent-code classifier.  Each `train_*` method runs its own backward
/// pass and steps only its own parameter group.
pub struct StyleTransferModel {
    vocab: Vocab,
    dim_c: usize,
    gamma: f32,
    lambda_g: f32,
    lambda_z: f32,
    lambda_z1: f32,
    lambda_z2: f32,
    lambda_ae: f32,
    wgan: bool,
    wwgan: bool,
    lambda_gp: f32,
    acgan_scale_g: f32,
    acgan_scale_d: f32,
    max_decoding_length: usize,
    embedder: EmbeddingT,
    encoder: Encoder,
    label_connector: MlpConnector,
    connector: MlpConnector,
    decoder: AttentionDecoder,
    clas_embedder: EmbeddingT,
    classifier: Conv1dClassifier,
    discriminator: Conv1dClassifier,
    z_fc1: MlpConnector,
    z_fc2: MlpConnector,
    z_out: MlpConnector,
    opt_g: Box<dyn Optimizer>,
    opt_g_ae: Box<dyn Optimizer>,
    opt_d: Box<dyn Optimizer>,
    opt_c: Box<dyn Optimizer>,
    opt_z: Box<dyn Optimizer>,
    rng: StdRng,
}

impl StyleTransferModel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        vocab: Vocab,
        gamma: f32,
        lambda_g: f32,
        lambda_z: f32,
        lambda_z1: f32,
        lambda_z2: f32,
        lambda_ae: f32,
        hp: &HParams,
    ) -> Self {
        assert!(
            hp.num_classes == 2,
            "only binary attributes are supported (num_classes = {})",
            hp.num_classes
        );
        let emb_dim = hp.embedder.dim;
        let enc_dim = hp.encoder.dim;
        let dec_dim = hp.decoder.dim;
        let dim_z = hp.dim_z();
        let vocab_size = vocab.size();
        let z_act = Activation::parse(&hp.z_classifier.activation);
        Self {
            dim_c: hp.dim_c,
            gamma,
            lambda_g,
            lambda_z,
            lambda_z1,
            lambda_z2,
            lambda_ae,
            wgan: hp.wgan,
            wwgan: hp.wwgan,
            lambda_gp: hp.lambda_gp,
            acgan_scale_g: hp.acgan_scale_g,
            acgan_scale_d: hp.acgan_scale_d,
            max_decoding_length: hp.max_decoding_length,
            embedder: EmbeddingT::new(vocab_size, emb_dim),
            encoder: Encoder::new(emb_dim, enc_dim),
            label_connector: MlpConnector::new(1, hp.dim_c, Activation::Identity),
            connector: MlpConnector::new(hp.dim_c + dim_z, dec_dim, Activation::Identity),
            decoder: AttentionDecoder::new(emb_dim, dec_dim, enc_dim, vocab_size),
            clas_embedder: EmbeddingT::new(vocab_size, emb_dim),
            classifier: Conv1dClassifier::new(
                emb_dim,
                hp.classifier.filters,
                hp.classifier.kernel_sizes.clone(),
                1,
            ),
            // column 0 carries the style logit, column 1 the critic score
            discriminator: Conv1dClassifier::new(
                emb_dim,
                hp.discriminator.filters,
                hp.discriminator.kernel_sizes.clone(),
                2,
            ),
            z_fc1: MlpConnector::new(dim_z, hp.z_classifier.hidden1, z_act),
            z_fc2: MlpConnector::new(hp.z_classifier.hidden1, hp.z_classifier.hidden2, z_act),
            z_out: MlpConnector::new(hp.z_classifier.hidden2, 1, Activation::Identity),
            opt_g: from_config(&hp.opt),
            opt_g_ae: from_config(&hp.opt),
            opt_d: from_config(if hp.wgan { &hp.opt_d } else { &hp.opt }),
            opt_c: from_config(&hp.opt),
            opt_z: from_config(&hp.opt),
            rng: rng_from_env(),
            vocab,
        }
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn set_gamma(&mut self, gamma: f32) {
        self.gamma = gamma;
    }

    pub fn set_lambda_g(&mut self, lambda_g: f32) {
        self.lambda_g = lambda_g;
    }

    fn zero_all_grads(&mut self) {
        self.embedder.zero_grad();
        self.encoder.zero_grad();
        self.label_connector.zero_grad();
        self.connector.zero_grad();
        self.decoder.zero_grad();
        self.clas_embedder.zero_grad();
        self.classifier.zero_grad();
        self.discriminator.zero_grad();
        self.z_fc1.zero_grad();
        self.z_fc2.zero_grad();
        self.z_out.zero_grad();
    }

    fn step_g(&mut self, warm_up: bool) {
        let Self {
            embedder,
            encoder,
            label_connector,
            connector,
            decoder,
            opt_g,
            opt_g_ae,
            ..
        } = self;
        let mut params = embedder.parameters();
        params.extend(encoder.parameters());
        params.extend(label_connector.parameters());
        params.extend(connector.parameters());
        params.extend(decoder.parameters());
        if warm_up {
            opt_g_ae.step(&mut params);
        } else {
            opt_g.step(&mut params);
        }
    }

    fn step_d(&mut self) {
        let Self {
            clas_embedder,
            discriminator,
            opt_d,
            ..
        } = self;
        let mut params = clas_embedder.parameters();
        params.extend(discriminator.parameters());
        opt_d.step(&mut params);
    }

    fn step_c(&mut self) {
        let Self {
            clas_embedder,
            classifier,
            opt_c,
            ..
        } = self;
        let mut params = clas_embedder.parameters();
        params.extend(classifier.parameters());
        opt_c.step(&mut params);
    }

    fn step_z(&mut self) {
        let Self {
            z_fc1,
            z_fc2,
            z_out,
            opt_z,
            ..
        } = self;
        let mut params = z_fc1.parameters();
        params.extend(z_fc2.parameters());
        params.extend(z_out.parameters());
        opt_z.step(&mut params);
    }

    /// Every trainable affine module in a stable order, for checkpoints.
    pub fn all_parameters(&mut self) -> Vec<&mut LinearT> {
        let Self {
            embedder,
            encoder,
            label_connector,
            connector,
            decoder,
            clas_embedder,
            classifier,
            discriminator,
            z_fc1,
            z_fc2,
            z_out,
            ..
        } = self;
        let mut params = embedder.parameters();
        params.extend(encoder.parameters());
        params.extend(label_connector.parameters());
        params.extend(connector.parameters());
        params.extend(decoder.parameters());
        params.extend(clas_embedder.parameters());
        params.extend(classifier.parameters());
        params.extend(discriminator.parameters());
        params.extend(z_fc1.parameters());
        params.extend(z_fc2.parameters());
        params.extend(z_out.parameters());
        params
    }

    fn forward(&mut self, batch: &Batch) -> Result<Forward, ConvError> {
        let batch_size = batch.size();
        let time = batch.max_time();
        let ids_t: Vec<Vec<usize>> = (0..time)
            .map(|t| (0..batch_size).map(|b| batch.text_ids[b][t]).collect())
            .collect();
        let enc_ids: Vec<Vec<usize>> = ids_t[1..].to_vec();
        let dec_in_ids: Vec<Vec<usize>> = ids_t[..time - 1].to_vec();
        let targets: Vec<Vec<usize>> = ids_t[1..].to_vec();
        let enc_lens: Vec<usize> = batch.length.iter().map(|&l| l - 1).collect();

        // encode the sentence without its BOS marker
        let enc_inputs: Vec<Matrix> = enc_ids
            .iter()
            .map(|ids| self.embedder.forward_ids(ids))
            .collect();
        let (memory, final_state, enc_trace) = self.encoder.forward(&enc_inputs, &enc_lens);
        let (_c_slot, z) = final_state.split_cols(self.dim_c);

        let src_label_m = Matrix::from_vec(
            batch_size,
            1,
            batch.labels.iter().map(|&l| l as f32).collect(),
        );
        let tgt_label_m = Matrix::from_vec(
            batch_size,
            1,
            batch.labels.iter().map(|&l| 1.0 - l as f32).collect(),
        );
        let labels_target: Vec<usize> = batch.labels.iter().map(|&l| 1 - l).collect();
        let (c_src, c_src_trace) = self.label_connector.forward(&src_label_m);
        let (c_tgt, c_tgt_trace) = self.label_connector.forward(&tgt_label_m);
        let (state_ae, conn_ae_trace) =
            self.connector.forward(&Matrix::concat_cols(&c_src, &z));
        let (state_tgt, conn_tgt_trace) =
            self.connector.forward(&Matrix::concat_cols(&c_tgt, &z));

        // reconstruction under the source attribute
        let dec_inputs: Vec<Matrix> = dec_in_ids
            .iter()
            .map(|ids| self.embedder.forward_ids(ids))
            .collect();
        let (tf_logits, tf_trace) =
            self.decoder
                .forward_teacher(&dec_inputs, &state_ae, &memory, &enc_lens);
        let (loss_g_ae, tf_grads, _) =
            sequence_softmax_cross_entropy(&tf_logits, &targets, &enc_lens);
        let ppl = loss_g_ae.exp();

        // soft rollout under the flipped attribute
        let bos = vec![self.vocab.bos_token_id(); batch_size];
        let eos = self.vocab.eos_token_id();
        let (soft_outputs, soft_lengths, soft_trace) = self.decoder.forward_soft(
            &self.embedder,
            &bos,
            &state_tgt,
            &memory,
            &enc_lens,
            self.gamma,
            self.max_decoding_length,
            eos,
            &mut self.rng,
        );
        let fake_steps = soft_outputs.len();
        // a second rollout under the source attribute feeds the
        // consistency losses only
        let (soft_src_outputs, _, soft_src_trace) = self.decoder.forward_soft(
            &self.embedder,
            &bos,
            &state_ae,
            &memory,
            &enc_lens,
            self.gamma,
            self.max_decoding_length,
            eos,
            &mut self.rng,
        );
        let greedy = self.decoder.forward_greedy(
            &self.embedder,
            &bos,
            &state_tgt,
            &memory,
            &enc_lens,
            self.max_decoding_length,
            eos,
        );

        // style classifier on the real text and on the soft rollout
        let real_emb: Vec<Matrix> = enc_ids
            .iter()
            .map(|ids| self.clas_embedder.forward_ids(ids))
            .collect();
        let real_steps = real_emb.len();
        let (clas_real_logits, clas_real_trace) =
            self.classifier.forward(&real_emb, &enc_lens)?;
        let clas_real_col: Vec<f32> = (0..batch_size).map(|b| clas_real_logits.get(b, 0)).collect();
        let src_f: Vec<f32> = batch.labels.iter().map(|&l| l as f32).collect();
        let tgt_f: Vec<f32> = labels_target.iter().map(|&l| l as f32).collect();
        let (loss_clas, grad_clas_real) = sigmoid_ce_with_logits(&clas_real_col, &src_f);
        let labels_predicted = binary_preds(&clas_real_col);
        let accu_clas = accuracy(&batch.labels, &labels_predicted);

        let fake_emb: Vec<Matrix> = soft_outputs
            .iter()
            .map(|y| self.clas_embedder.forward_soft(y))
            .collect();
        let (clas_fake_logits, clas_fake_trace) =
            self.classifier.forward(&fake_emb, &soft_lengths)?;
        let clas_fake_col: Vec<f32> = (0..batch_size).map(|b| clas_fake_logits.get(b, 0)).collect();
        let (loss_g_clas, grad_clas_fake) = sigmoid_ce_with_logits(&clas_fake_col, &tgt_f);
        let accu_g = accuracy(&labels_target, &binary_preds(&clas_fake_col));

        // greedy transfer quality, no gradients
        let gdy_time = greedy.iter().map(|s| s.len() + 1).max().unwrap_or(1);
        let gdy_lens: Vec<usize> = greedy.iter().map(|s| s.len() + 1).collect();
        let gdy_emb: Vec<Matrix> = (0..gdy_time)
            .map(|t| {
                let ids: Vec<usize> = greedy
                    .iter()
                    .map(|s| {
                        if t < s.len() {
                            s[t]
                        } else if t == s.len() {
                            eos
                        } else {
                            self.vocab.pad_token_id()
                        }
                    })
                    .collect();
                self.clas_embedder.forward_ids(&ids)
            })
            .collect();
        let (gdy_logits, _) = self.classifier.forward(&gdy_emb, &gdy_lens)?;
        let gdy_col: Vec<f32> = (0..batch_size).map(|b| gdy_logits.get(b, 0)).collect();
        let accu_g_gdy = accuracy(&labels_target, &binary_preds(&gdy_col));

        // discriminator sees real and generated text at equal shape
        let mut d_real = real_emb;
        let mut d_fake = fake_emb;
        equalize_time(&mut d_real, &mut d_fake);
        let (disc_real_logits, disc_real_trace) =
            self.discriminator.forward(&d_real, &enc_lens)?;
        let (disc_fake_logits, disc_fake_trace) =
            self.discriminator.forward(&d_fake, &soft_lengths)?;
        let disc_real_style: Vec<f32> =
            (0..batch_size).map(|b| disc_real_logits.get(b, 0)).collect();
        let disc_fake_style: Vec<f32> =
            (0..batch_size).map(|b| disc_fake_logits.get(b, 0)).collect();
        let (mut loss_d_clas, grad_d_style_real) = sigmoid_ce_with_logits(&disc_real_style, &src_f);
        let accu_d_r = accuracy(&batch.labels, &binary_preds_half(&disc_real_style));
        let accu_d_f = accuracy(&labels_target, &binary_preds_half(&disc_fake_style));

        let mut loss_d_dis = 0.0f32;
        let mut loss_g_dis = 0.0f32;
        let mut loss_gp = 0.0f32;
        let mut grad_d_style_fake = vec![0.0f32; batch_size];
        let mut d_dis_fake_seed = vec![0.0f32; batch_size];
        let mut interp_inputs: Vec<Matrix> = Vec::new();
        let mut interp_lens: Vec<usize> = Vec::new();
        if self.wgan {
            // the style head also trains on the generated samples, at a
            // reduced weight
            let (loss_d_clas_fake, g) = sigmoid_ce_with_logits(&disc_fake_style, &tgt_f);
            loss_d_clas += self.lambda_g * loss_d_clas_fake;
            grad_d_style_fake = g;

            let real_crit: Vec<f32> =
                (0..batch_size).map(|b| disc_real_logits.get(b, 1)).collect();
            let fake_crit: Vec<f32> =
                (0..batch_size).map(|b| disc_fake_logits.get(b, 1)).collect();
            let max_i = argmax(&fake_crit);
            let shift = fake_crit[max_i];
            // the weighted variant reweights examples by a detached softmax
            // of their critic scores; otherwise every example counts 1/B
            let weights: Vec<f32> = if self.wwgan {
                let mut exps: Vec<f32> = fake_crit.iter().map(|&v| (v - shift).exp()).collect();
                let sum: f32 = exps.iter().sum();
                for e in exps.iter_mut() {
                    *e /= sum;
                }
                exps
            } else {
                vec![1.0 / batch_size as f32; batch_size]
            };
            let mean_real: f32 = real_crit.iter().sum::<f32>() / batch_size as f32;
            let shifted: f32 = weights
                .iter()
                .zip(fake_crit.iter())
                .map(|(w, f)| w * (f - shift))
                .sum();
            loss_d_dis = -mean_real + shifted;
            loss_g_dis = -fake_crit.iter().sum::<f32>() / batch_size as f32;
            for b in 0..batch_size {
                d_dis_fake_seed[b] = weights[b] - if b == max_i { 1.0 } else { 0.0 };
            }

            interp_lens = enc_lens
                .iter()
                .zip(soft_lengths.iter())
                .map(|(&a, &b)| a.max(b))
                .collect();
            interp_inputs = (0..d_real.len())
                .map(|t| Matrix::zeros(batch_size, d_real[t].cols))
                .collect();
            for b in 0..batch_size {
                let alpha: f32 = self.rng.gen();
                for t in 0..d_real.len() {
                    for (i, v) in interp_inputs[t].row_mut(b).iter_mut().enumerate() {
                        *v = alpha * d_real[t].row(b)[i] + (1.0 - alpha) * d_fake[t].row(b)[i];
                    }
                }
            }
            loss_gp = self
                .discriminator
                .gradient_penalty(&interp_inputs, &interp_lens, 1, self.lambda_gp)?;
        }

        // latent-code classifier on the attribute-free part of the state
        let (z_h1, z_t1) = self.z_fc1.forward(&z);
        let (z_h2, z_t2) = self.z_fc2.forward(&z_h1);
        let (z_logits, z_t3) = self.z_out.forward(&z_h2);
        let z_col: Vec<f32> = (0..batch_size).map(|b| z_logits.get(b, 0)).collect();
        let (loss_z_clas, grad_z_logits) = sigmoid_ce_with_logits(&z_col, &src_f);
        let accu_z_clas = accuracy(&batch.labels, &binary_preds(&z_col));

        // re-encode both rollouts: whichever attribute the decoder was
        // driven with, the latent code read back must match the source z
        let re_src_inputs: Vec<Matrix> = soft_src_outputs
            .iter()
            .map(|y| self.embedder.forward_soft(y))
            .collect();
        let re_src_lens: Vec<usize> = enc_lens
            .iter()
            .map(|&l| l.min(soft_src_outputs.len()))
            .collect();
        let (_, re_src_final, re_src_trace) = self.encoder.forward(&re_src_inputs, &re_src_lens);
        let (_, z_re_src) = re_src_final.split_cols(self.dim_c);

        let re_tgt_inputs: Vec<Matrix> = soft_outputs
            .iter()
            .map(|y| self.embedder.forward_soft(y))
            .collect();
        let re_tgt_lens: Vec<usize> = enc_lens.iter().map(|&l| l.min(fake_steps)).collect();
        let (_, re_tgt_final, re_tgt_trace) = self.encoder.forward(&re_tgt_inputs, &re_tgt_lens);
        let (_, z_re_tgt) = re_tgt_final.split_cols(self.dim_c);

        let (zn, z_norms) = l2_normalize_rows(&z);
        let (z_re_src_n, z_re_src_norms) = l2_normalize_rows(&z_re_src);
        let (z_re_tgt_n, z_re_tgt_norms) = l2_normalize_rows(&z_re_tgt);
        let loss_cos = cosine_distance_rows(&zn, &z_re_src_n);
        let loss_cos_ = cosine_distance_rows(&zn, &z_re_tgt_n);

        let loss_g = self.lambda_ae * loss_g_ae
            + self.lambda_g * (self.acgan_scale_g * loss_g_clas + loss_g_dis)
            + self.lambda_z1 * loss_cos
            + self.lambda_z2 * loss_cos_
            - self.lambda_z * loss_z_clas;
        let loss_d = self.acgan_scale_d * loss_d_clas + loss_d_dis + loss_gp;

        let mut losses = BTreeMap::new();
        losses.insert("loss_g".to_string(), loss_g);
        losses.insert("loss_g_ae".to_string(), loss_g_ae);
        losses.insert("loss_g_clas".to_string(), loss_g_clas);
        losses.insert("loss_g_dis".to_string(), loss_g_dis);
        losses.insert("loss_d".to_string(), loss_d);
        losses.insert("loss_d_clas".to_string(), loss_d_clas);
        losses.insert("loss_d_dis".to_string(), loss_d_dis);
        losses.insert("loss_clas".to_string(), loss_clas);
        losses.insert("loss_gp".to_string(), loss_gp);
        losses.insert("loss_z_clas".to_string(), loss_z_clas);
        losses.insert("loss_cos".to_string(), loss_cos);
        losses.insert("loss_cos_".to_string(), loss_cos_);

        let mut metrics = BTreeMap::new();
        metrics.insert("ppl".to_string(), ppl);
        metrics.insert("accu_d_r".to_string(), accu_d_r);
        metrics.insert("accu_d_f".to_string(), accu_d_f);
        metrics.insert("accu_clas".to_string(), accu_clas);
        metrics.insert("accu_g".to_string(), accu_g);
        metrics.insert("accu_g_gdy".to_string(), accu_g_gdy);
        metrics.insert("accu_z_clas".to_string(), accu_z_clas);

        let samples = Samples {
            original: batch
                .text_ids
                .iter()
                .map(|ids| self.vocab.decode(&ids[1..]))
                .collect(),
            transferred: greedy.iter().map(|ids| self.vocab.decode(ids)).collect(),
            z_vector: (0..batch_size).map(|b| z.row(b).to_vec()).collect(),
            labels_source: batch.labels.clone(),
            labels_target: labels_target.clone(),
            labels_predicted,
        };

        Ok(Forward {
            enc_ids,
            dec_in_ids,
            memory,
            enc_trace,
            zn,
            z_norms,
            c_src_trace,
            c_tgt_trace,
            conn_ae_trace,
            conn_tgt_trace,
            tf_trace,
            tf_grads,
            soft_outputs,
            soft_trace,
            soft_src_outputs,
            soft_src_trace,
            clas_real_trace,
            clas_fake_trace,
            grad_clas_real,
            grad_clas_fake,
            disc_real_trace,
            disc_fake_trace,
            grad_d_style_real,
            grad_d_style_fake,
            d_dis_fake_seed,
            interp_inputs,
            interp_lens,
            real_steps,
            fake_steps,
            z_t1,
            z_t2,
            z_t3,
            grad_z_logits,
            re_src_trace,
            re_tgt_trace,
            z_re_src_n,
            z_re_src_norms,
            z_re_tgt_n,
            z_re_tgt_norms,
            losses,
            metrics,
            samples,
        })
    }

    /// Backward through the teacher-forced reconstruction branch, scaled
    /// by `scale`.  Accumulates generator gradients up to (but excluding)
    /// the main encoder, whose seeds are returned as `(d_z, d_memory)`.
    fn backward_reconstruction(&mut self, fw: &Forward, scale: f32) -> (Matrix, Vec<Matrix>) {
        let d_logits: Vec<Matrix> = fw.tf_grads.iter().map(|g| g.scale(scale)).collect();
        let (d_inputs, d_state0, d_memory) =
            self.decoder
                .backward_teacher(&fw.tf_trace, &d_logits, &fw.memory);
        for (ids, d) in fw.dec_in_ids.iter().zip(d_inputs.iter()) {
            self.embedder.backward_ids(ids, d);
        }
        let d_concat = self.connector.backward(&fw.conn_ae_trace, &d_state0);
        let (d_c_src, d_z) = d_concat.split_cols(self.dim_c);
        self.label_connector.backward(&fw.c_src_trace, &d_c_src);
        (d_z, d_memory)
    }

    fn finish_encoder_backward(&mut self, fw: &Forward, d_z: &Matrix, d_memory: &[Matrix]) {
        let batch = d_z.rows;
        let d_final = Matrix::concat_cols(&Matrix::zeros(batch, self.dim_c), d_z);
        let d_enc_inputs = self.encoder.backward(&fw.enc_trace, d_memory, &d_final);
        for (ids, d) in fw.enc_ids.iter().zip(d_enc_inputs.iter()) {
            self.embedder.backward_ids(ids, d);
        }
    }

    /// Autoencoding warm-up step: reconstruction loss only, with its own
    /// optimizer state.
    pub fn train_g_ae(&mut self, batch: &Batch) -> Result<BTreeMap<String, f32>, ConvError> {
        let fw = self.forward(batch)?;
        self.zero_all_grads();
        let (d_z, d_memory) = self.backward_reconstruction(&fw, 1.0);
        self.finish_encoder_backward(&fw, &d_z, &d_memory);
        self.step_g(true);
        let mut fetches = BTreeMap::new();
        fetches.insert("loss_g_ae".to_string(), fw.losses["loss_g_ae"]);
        fetches.insert("ppl".to_string(), fw.metrics["ppl"]);
        Ok(fetches)
    }

    /// Full generator step: reconstruction, adversarial style and critic
    /// signals, the latent-code adversary and both re-encoding cosine
    /// terms.
    pub fn train_g(&mut self, batch: &Batch) -> Result<BTreeMap<String, f32>, ConvError> {
        let fw = self.forward(batch)?;
        self.zero_all_grads();
        let batch_size = fw.zn.rows;

        let (mut d_z_total, mut d_memory) = self.backward_reconstruction(&fw, self.lambda_ae);

        // cosine terms: both rollouts' re-encoded latents pull toward z
        let (mut d_zn, d_zre_src) =
            cosine_distance_backward(&fw.zn, &fw.z_re_src_n, self.lambda_z1);
        let (d_zn2, d_zre_tgt) = cosine_distance_backward(&fw.zn, &fw.z_re_tgt_n, self.lambda_z2);
        d_zn.add_assign(&d_zn2);
        let d_z_cos = l2_normalize_backward(&fw.zn, &fw.z_norms, &d_zn);
        let d_z_re_src = l2_normalize_backward(&fw.z_re_src_n, &fw.z_re_src_norms, &d_zre_src);
        let d_z_re_tgt = l2_normalize_backward(&fw.z_re_tgt_n, &fw.z_re_tgt_norms, &d_zre_tgt);
        d_z_total.add_assign(&d_z_cos);
        let zero_c = Matrix::zeros(batch_size, self.dim_c);

        // source-attribute rollout, gradient from its re-encoding only
        let mut d_y_src: Vec<Matrix> = fw
            .soft_src_outputs
            .iter()
            .map(|y| Matrix::zeros(y.rows, y.cols))
            .collect();
        let zero_mem_src: Vec<Matrix> = fw
            .soft_src_outputs
            .iter()
            .map(|_| Matrix::zeros(batch_size, self.encoder.hidden_dim()))
            .collect();
        let d_final_src = Matrix::concat_cols(&zero_c, &d_z_re_src);
        let d_re_src = self
            .encoder
            .backward(&fw.re_src_trace, &zero_mem_src, &d_final_src);
        for (t, d) in d_re_src.iter().enumerate() {
            d_y_src[t].add_assign(&self.embedder.backward_soft(&fw.soft_src_outputs[t], d));
        }
        let (d_state_ae, d_mem_src) = self.decoder.backward_soft(
            &mut self.embedder,
            &fw.soft_src_trace,
            &d_y_src,
            &fw.memory,
        );
        for (a, b) in d_memory.iter_mut().zip(d_mem_src.iter()) {
            a.add_assign(b);
        }
        let d_concat_ae = self.connector.backward(&fw.conn_ae_trace, &d_state_ae);
        let (d_c_src, d_z_src) = d_concat_ae.split_cols(self.dim_c);
        self.label_connector.backward(&fw.c_src_trace, &d_c_src);
        d_z_total.add_assign(&d_z_src);

        // flipped-attribute rollout, fed by the adversarial terms below
        // plus its own re-encoding
        let mut d_y: Vec<Matrix> = fw
            .soft_outputs
            .iter()
            .map(|y| Matrix::zeros(y.rows, y.cols))
            .collect();
        let zero_mem: Vec<Matrix> = fw
            .soft_outputs
            .iter()
            .map(|_| Matrix::zeros(batch_size, self.encoder.hidden_dim()))
            .collect();
        let d_final_tgt = Matrix::concat_cols(&zero_c, &d_z_re_tgt);
        let d_re_tgt = self
            .encoder
            .backward(&fw.re_tgt_trace, &zero_mem, &d_final_tgt);
        for (t, d) in d_re_tgt.iter().enumerate() {
            d_y[t].add_assign(&self.embedder.backward_soft(&fw.soft_outputs[t], d));
        }

        // style classifier pushing the rollout towards the target label
        let clas_scale = self.lambda_g * self.acgan_scale_g;
        let mut d_clas = Matrix::zeros(batch_size, 1);
        for b in 0..batch_size {
            d_clas.set(b, 0, clas_scale * fw.grad_clas_fake[b]);
        }
        let d_fake_in = self
            .classifier
            .backward_input_only(&fw.clas_fake_trace, &d_clas);
        for t in 0..fw.fake_steps {
            d_y[t].add_assign(
                &self
                    .clas_embedder
                    .backward_soft(&fw.soft_outputs[t], &d_fake_in[t]),
            );
        }

        // critic term, pushing fake scores up
        if self.wgan {
            let mut d_crit = Matrix::zeros(batch_size, 2);
            for b in 0..batch_size {
                d_crit.set(b, 1, -self.lambda_g / batch_size as f32);
            }
            let d_dfake = self
                .discriminator
                .backward_input_only(&fw.disc_fake_trace, &d_crit);
            for t in 0..fw.fake_steps {
                d_y[t].add_assign(
                    &self
                        .clas_embedder
                        .backward_soft(&fw.soft_outputs[t], &d_dfake[t]),
                );
            }
        }

        // adversarial latent term: the encoder is rewarded for hiding the
        // attribute from the z-classifier, hence the flipped sign
        let mut d_zlog = Matrix::zeros(batch_size, 1);
        for b in 0..batch_size {
            d_zlog.set(b, 0, -self.lambda_z * fw.grad_z_logits[b]);
        }
        let d_h2 = self.z_out.backward(&fw.z_t3, &d_zlog);
        let d_h1 = self.z_fc2.backward(&fw.z_t2, &d_h2);
        let d_z_adv = self.z_fc1.backward(&fw.z_t1, &d_h1);
        d_z_total.add_assign(&d_z_adv);

        let (d_state_tgt, d_mem_soft) =
            self.decoder
                .backward_soft(&mut self.embedder, &fw.soft_trace, &d_y, &fw.memory);
        for (a, b) in d_memory.iter_mut().zip(d_mem_soft.iter()) {
            a.add_assign(b);
        }
        let d_concat_tgt = self.connector.backward(&fw.conn_tgt_trace, &d_state_tgt);
        let (d_c_tgt, d_z_tgt) = d_concat_tgt.split_cols(self.dim_c);
        self.label_connector.backward(&fw.c_tgt_trace, &d_c_tgt);
        d_z_total.add_assign(&d_z_tgt);

        self.finish_encoder_backward(&fw, &d_z_total, &d_memory);
        self.step_g(false);

        let mut fetches = BTreeMap::new();
        for key in ["loss_g", "loss_g_ae", "loss_g_clas", "loss_g_dis"] {
            fetches.insert(key.to_string(), fw.losses[key]);
        }
        fetches.insert("loss_shifted_ae1".to_string(), fw.losses["loss_cos"]);
        fetches.insert("loss_shifted_ae2".to_string(), fw.losses["loss_cos_"]);
        for key in ["ppl", "accu_g", "accu_g_gdy", "accu_z_clas"] {
            fetches.insert(key.to_string(), fw.metrics[key]);
        }
        Ok(fetches)
    }

    /// Discriminator/critic step, followed by a style-classifier step on
    /// the same forward pass.
    pub fn train_d(&mut self, batch: &Batch) -> Result<BTreeMap<String, f32>, ConvError> {
        let fw = self.forward(batch)?;
        self.zero_all_grads();
        let batch_size = fw.grad_d_style_real.len();

        let mut d_real = Matrix::zeros(batch_size, 2);
        for b in 0..batch_size {
            d_real.set(b, 0, self.acgan_scale_d * fw.grad_d_style_real[b]);
            if self.wgan {
                d_real.set(b, 1, -1.0 / batch_size as f32);
            }
        }
        let d_real_in = self.discriminator.backward(&fw.disc_real_trace, &d_real);
        for t in 0..fw.real_steps {
            self.clas_embedder.backward_ids(&fw.enc_ids[t], &d_real_in[t]);
        }
        let mut loss_gp = 0.0f32;
        if self.wgan {
            let mut d_fake = Matrix::zeros(batch_size, 2);
            for b in 0..batch_size {
                d_fake.set(
                    b,
                    0,
                    self.acgan_scale_d * self.lambda_g * fw.grad_d_style_fake[b],
                );
                d_fake.set(b, 1, fw.d_dis_fake_seed[b]);
            }
            let d_fake_in = self.discriminator.backward(&fw.disc_fake_trace, &d_fake);
            for t in 0..fw.fake_steps {
                // the rollout is frozen here; only the embedding table learns
                let _ = self
                    .clas_embedder
                    .backward_soft(&fw.soft_outputs[t], &d_fake_in[t]);
            }
            loss_gp = self.discriminator.accumulate_gradient_penalty(
                &fw.interp_inputs,
                &fw.interp_lens,
                1,
                self.lambda_gp,
            )?;
        }
        self.step_d();

        // classifier step on the same batch
        self.zero_all_grads();
        let mut d_clas = Matrix::zeros(batch_size, 1);
        for b in 0..batch_size {
            d_clas.set(b, 0, fw.grad_clas_real[b]);
        }
        let d_clas_in = self.classifier.backward(&fw.clas_real_trace, &d_clas);
        for t in 0..fw.real_steps {
            self.clas_embedder.backward_ids(&fw.enc_ids[t], &d_clas_in[t]);
        }
        self.step_c();

        let mut fetches = BTreeMap::new();
        for key in ["loss_d", "loss_d_clas", "loss_d_dis"] {
            fetches.insert(key.to_string(), fw.losses[key]);
        }
        fetches.insert("loss_c".to_string(), fw.losses["loss_clas"]);
        fetches.insert("loss_gp".to_string(), loss_gp);
        for key in ["accu_d_r", "accu_d_f", "accu_clas"] {
            fetches.insert(key.to_string(), fw.metrics[key]);
        }
        Ok(fetches)
    }

    /// Standalone style-classifier step (used for pre-training).
    pub fn train_c(&mut self, batch: &Batch) -> Result<BTreeMap<String, f32>, ConvError> {
        let fw = self.forward(batch)?;
        self.zero_all_grads();
        let batch_size = fw.grad_clas_real.len();
        let mut d_clas = Matrix::zeros(batch_size, 1);
        for b in 0..batch_size {
            d_clas.set(b, 0, fw.grad_clas_real[b]);
        }
        let d_clas_in = self.classifier.backward(&fw.clas_real_trace, &d_clas);
        for t in 0..fw.real_steps {
            self.clas_embedder.backward_ids(&fw.enc_ids[t], &d_clas_in[t]);
        }
        self.step_c();
        let mut fetches = BTreeMap::new();
        fetches.insert("loss_c".to_string(), fw.losses["loss_clas"]);
        fetches.insert("accu_c".to_string(), fw.metrics["accu_clas"]);
        Ok(fetches)
    }

    /// Latent-code classifier step.  Touches only the z-classifier stack;
    /// the encoder input is treated as a constant.
    pub fn train_z(&mut self, batch: &Batch) -> Result<BTreeMap<String, f32>, ConvError> {
        let fw = self.forward(batch)?;
        self.zero_all_grads();
        let batch_size = fw.grad_z_logits.len();
        let mut d_zlog = Matrix::zeros(batch_size, 1);
        for b in 0..batch_size {
            d_zlog.set(b, 0, fw.grad_z_logits[b]);
        }
        let d_h2 = self.z_out.backward(&fw.z_t3, &d_zlog);
        let d_h1 = self.z_fc2.backward(&fw.z_t2, &d_h2);
        let _ = self.z_fc1.backward(&fw.z_t1, &d_h1);
        self.step_z();
        let mut fetches = BTreeMap::new();
        fetches.insert("loss_z".to_string(), fw.losses["loss_z_clas"]);
        fetches.insert("accu_z".to_string(), fw.metrics["accu_z_clas"]);
        Ok(fetches)
    }

    /// Forward-only pass exposing losses, metrics and decoded samples.
    pub fn eval(&mut self, batch: &Batch) -> Result<EvalFetches, ConvError> {
        let fw = self.forward(batch)?;
        Ok(EvalFetches {
            batch_size: batch.size(),
            losses: fw.losses,
            metrics: fw.metrics,
            samples: fw.samples,
        })
    }

    /// Greedy style transfer for raw sentences, used by the CLI.
    pub fn transfer(&mut self, batch: &Batch) -> Result<Vec<String>, ConvError> {
        let fw = self.forward(batch)?;
        Ok(fw.samples.transferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{make_batches, toy_corpus};

    fn tiny_hparams() -> HParams {
        let mut hp = HParams::default();
        hp.dim_c = 2;
        hp.embedder.dim = 8;
        hp.encoder.dim = 6;
        hp.decoder.dim = 6;
        hp.classifier.filters = 3;
        hp.classifier.kernel_sizes = vec![2, 3];
        hp.discriminator.filters = 3;
        hp.discriminator.kernel_sizes = vec![2, 3];
        hp.z_classifier.hidden1 = 5;
        hp.z_classifier.hidden2 = 4;
        hp.max_decoding_length = 8;
        hp
    }

    fn tiny_model(hp: &HParams) -> (StyleTransferModel, Vec<Batch>) {
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let batches = make_batches(&corpus, &vocab, 4);
        let model = StyleTransferModel::new(vocab, 0.5, 0.1, 0.1, 0.5, 0.5, 1.0, hp);
        (model, batches)
    }

    #[test]
    fn train_g_reports_all_fetches_finite() {
        let hp = tiny_hparams();
        let (mut model, batches) = tiny_model(&hp);
        let fetches = model.train_g(&batches[0]).unwrap();
        for key in [
            "loss_g",
            "loss_g_ae",
            "loss_g_clas",
            "loss_g_dis",
            "loss_shifted_ae1",
            "loss_shifted_ae2",
            "ppl",
            "accu_g",
            "accu_g_gdy",
            "accu_z_clas",
        ] {
            let v = fetches[key];
            assert!(v.is_finite(), "{key} = {v}");
        }
        assert!(fetches["ppl"] >= 1.0);
        assert!(fetches["loss_g_ae"] >= 0.0);
    }

    #[test]
    fn non_wgan_has_no_critic_losses() {
        let hp = tiny_hparams();
        let (mut model, batches) = tiny_model(&hp);
        let g = model.train_g(&batches[0]).unwrap();
        assert_eq!(g["loss_g_dis"], 0.0);
        let d = model.train_d(&batches[0]).unwrap();
        assert_eq!(d["loss_d_dis"], 0.0);
        assert_eq!(d["loss_gp"], 0.0);
    }

    #[test]
    fn wgan_produces_critic_losses_and_penalty() {
        let mut hp = tiny_hparams();
        hp.wgan = true;
        hp.wwgan = true;
        let (mut model, batches) = tiny_model(&hp);
        let d = model.train_d(&batches[0]).unwrap();
        assert!(d["loss_d_dis"].is_finite());
        assert!(d["loss_gp"].is_finite() && d["loss_gp"] >= 0.0);
        let g = model.train_g(&batches[0]).unwrap();
        assert!(g["loss_g_dis"].is_finite());
    }

    // with only one consistency coefficient active, loss_g reduces to
    // that term, and its rollout must still carry gradient to the decoder
    #[test]
    fn source_rollout_consistency_term_composes_loss_g() {
        let hp = tiny_hparams();
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let batches = make_batches(&corpus, &vocab, 4);
        let mut model = StyleTransferModel::new(vocab, 0.5, 0.0, 0.0, 1.0, 0.0, 0.0, &hp);
        let out_before = model.decoder.out.w.data.clone();
        let g = model.train_g(&batches[0]).unwrap();
        assert!((0.0..=2.0).contains(&g["loss_shifted_ae1"]));
        assert!((g["loss_g"] - g["loss_shifted_ae1"]).abs() < 1e-6);
        assert_ne!(model.decoder.out.w.data, out_before);
    }

    #[test]
    fn flipped_rollout_consistency_term_composes_loss_g() {
        let hp = tiny_hparams();
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let batches = make_batches(&corpus, &vocab, 4);
        let mut model = StyleTransferModel::new(vocab, 0.5, 0.0, 0.0, 0.0, 1.0, 0.0, &hp);
        let out_before = model.decoder.out.w.data.clone();
        let g = model.train_g(&batches[0]).unwrap();
        assert!((0.0..=2.0).contains(&g["loss_shifted_ae2"]));
        assert!((g["loss_g"] - g["loss_shifted_ae2"]).abs() < 1e-6);
        assert_ne!(model.decoder.out.w.data, out_before);
    }

    #[test]
    fn wgan_style_head_trains_on_fake_samples() {
        let mut hp = tiny_hparams();
        hp.wgan = true;
        let (mut model, batches) = tiny_model(&hp);
        model.set_lambda_g(0.0);
        let plain = model.train_d(&batches[0]).unwrap();
        model.set_lambda_g(1000.0);
        let weighted = model.train_d(&batches[0]).unwrap();
        assert!(weighted["loss_d_clas"].is_finite());
        assert!(
            weighted["loss_d_clas"] > plain["loss_d_clas"] + 1.0,
            "fake-sample style term missing: {} vs {}",
            weighted["loss_d_clas"],
            plain["loss_d_clas"]
        );
    }

    #[test]
    fn train_z_leaves_other_groups_untouched() {
        let hp = tiny_hparams();
        let (mut model, batches) = tiny_model(&hp);
        let enc_before = model.encoder.cell.w_ir.w.data.clone();
        let emb_before = model.embedder.table.w.data.clone();
        let clas_before = model.classifier.out.w.data.clone();
        let disc_before = model.discriminator.out.w.data.clone();
        let z_before = model.z_fc1.lin.w.data.clone();
        let fetches = model.train_z(&batches[0]).unwrap();
        assert!(fetches["loss_z"].is_finite());
        assert_eq!(model.encoder.cell.w_ir.w.data, enc_before);
        assert_eq!(model.embedder.table.w.data, emb_before);
        assert_eq!(model.classifier.out.w.data, clas_before);
        assert_eq!(model.discriminator.out.w.data, disc_before);
        assert_ne!(model.z_fc1.lin.w.data, z_before);
    }

    #[test]
    #[should_panic(expected = "binary attributes")]
    fn rejects_more_than_two_classes() {
        let mut hp = tiny_hparams();
        hp.num_classes = 3;
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let _ = StyleTransferModel::new(vocab, 0.5, 0.1, 0.1, 0.5, 0.5, 1.0, &hp);
    }

    #[test]
    fn eval_exposes_samples_for_every_example() {
        let hp = tiny_hparams();
        let (mut model, batches) = tiny_model(&hp);
        let fetches = model.eval(&batches[0]).unwrap();
        assert_eq!(fetches.batch_size, 4);
        assert_eq!(fetches.samples.original.len(), 4);
        assert_eq!(fetches.samples.transferred.len(), 4);
        assert_eq!(fetches.samples.z_vector.len(), 4);
        for (src, tgt) in fetches
            .samples
            .labels_source
            .iter()
            .zip(fetches.samples.labels_target.iter())
        {
            assert_eq!(src + tgt, 1);
        }
        assert!(fetches.losses["loss_g_ae"] >= 0.0);
    }
}

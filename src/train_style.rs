use indicatif::ProgressBar;

use crate::config::HParams;
use crate::data::{load_corpus, make_batches, toy_corpus, Vocab};
use crate::logging::{Logger, MetricRecord};
use crate::models::StyleTransferModel;
use crate::weights::save_model;
use crate::{error, info};

const BATCH_SIZE: usize = 4;
const PRETRAIN_EPOCHS: usize = 2;
const EPOCHS: usize = 5;
const N_CRITIC: usize = 5;
const GAMMA_INIT: f32 = 1.0;
const GAMMA_DECAY: f32 = 0.5;
const GAMMA_MIN: f32 = 0.001;
const LAMBDA_G: f32 = 0.1;
const LAMBDA_Z: f32 = 0.1;
const LAMBDA_Z1: f32 = 0.5;
const LAMBDA_Z2: f32 = 0.5;
const LAMBDA_AE: f32 = 1.0;

/// Full training schedule: autoencoding/classifier warm-up, then joint
/// adversarial training with per-epoch temperature decay.
pub fn run(hparams_path: Option<&str>, data_path: Option<&str>) {
    let hp = match hparams_path {
        Some(path) => match HParams::from_path(path) {
            Some(hp) => hp,
            None => {
                error!("could not read hyperparameters from {path}");
                return;
            }
        },
        None => HParams::default(),
    };
    let corpus = match data_path {
        Some(path) => match load_corpus(path) {
            Ok(corpus) => corpus,
            Err(e) => {
                error!("could not read corpus from {path}: {e}");
                return;
            }
        },
        None => toy_corpus(),
    };
    info!("{} sentences, wgan = {}", corpus.len(), hp.wgan);

    let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
    let batches = make_batches(&corpus, &vocab, BATCH_SIZE);
    let mut model = StyleTransferModel::new(
        vocab, GAMMA_INIT, LAMBDA_G, LAMBDA_Z, LAMBDA_Z1, LAMBDA_Z2, LAMBDA_AE, &hp,
    );
    let mut logger = match Logger::new(None, None) {
        Ok(l) => l,
        Err(e) => {
            error!("could not open log files: {e}");
            return;
        }
    };

    // warm-up: reconstruction and the style classifier only
    let pb = ProgressBar::new((PRETRAIN_EPOCHS * batches.len()) as u64);
    for epoch in 0..PRETRAIN_EPOCHS {
        for batch in &batches {
            let ae = match model.train_g_ae(batch) {
                Ok(f) => f,
                Err(e) => {
                    error!("warm-up step failed: {e}");
                    return;
                }
            };
            let c = match model.train_c(batch) {
                Ok(f) => f,
                Err(e) => {
                    error!("classifier step failed: {e}");
                    return;
                }
            };
            pb.set_message(format!(
                "warm-up {epoch} ae {:.3} clas {:.3}",
                ae["loss_g_ae"], c["loss_c"]
            ));
            pb.inc(1);
        }
    }
    pb.finish_with_message("warm-up done");

    let mut gamma = GAMMA_INIT;
    let pb = ProgressBar::new((EPOCHS * batches.len()) as u64);
    let mut step = 0usize;
    for epoch in 0..EPOCHS {
        model.set_gamma(gamma);
        for batch in &batches {
            let critic_rounds = if hp.wgan { N_CRITIC } else { 1 };
            let mut d = match model.train_d(batch) {
                Ok(f) => f,
                Err(e) => {
                    error!("discriminator step failed: {e}");
                    return;
                }
            };
            for _ in 1..critic_rounds {
                match model.train_d(batch) {
                    Ok(f) => d = f,
                    Err(e) => {
                        error!("discriminator step failed: {e}");
                        return;
                    }
                }
            }
            let z = match model.train_z(batch) {
                Ok(f) => f,
                Err(e) => {
                    error!("latent classifier step failed: {e}");
                    return;
                }
            };
            let g = match model.train_g(batch) {
                Ok(f) => f,
                Err(e) => {
                    error!("generator step failed: {e}");
                    return;
                }
            };
            logger.log(&MetricRecord {
                epoch,
                step,
                loss_g: g["loss_g"],
                loss_d: d["loss_d"],
                loss_z: z["loss_z"],
                ppl: g["ppl"],
                accu_g: g["accu_g"],
                accu_d_r: d["accu_d_r"],
                kind: "train",
            });
            pb.set_message(format!(
                "epoch {epoch} g {:.3} d {:.3} ppl {:.1}",
                g["loss_g"], d["loss_d"], g["ppl"]
            ));
            pb.inc(1);
            step += 1;
        }
        gamma = (gamma * GAMMA_DECAY).max(GAMMA_MIN);
    }
    pb.finish_with_message("training done");

    match model.eval(&batches[0]) {
        Ok(fetches) => {
            for (orig, transferred) in fetches
                .samples
                .original
                .iter()
                .zip(fetches.samples.transferred.iter())
                .take(4)
            {
                info!("{orig:?} -> {transferred:?}");
            }
            info!(
                "eval: accu_clas {:.3} accu_g_gdy {:.3} ppl {:.2}",
                fetches.metrics["accu_clas"],
                fetches.metrics["accu_g_gdy"],
                fetches.metrics["ppl"]
            );
        }
        Err(e) => error!("eval failed: {e}"),
    }
    if let Err(e) = save_model("model.json", &mut model) {
        error!("could not save weights: {e}");
    }
}

use std::env;

use styleflip::config::HParams;
use styleflip::data::{make_batches, toy_corpus, Vocab};
use styleflip::models::StyleTransferModel;
use styleflip::{error, info, train_style, weights};

fn main() {
    styleflip::util::simple_logger::init_from_env();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <mode> [args]", args[0]);
        eprintln!("Modes:");
        eprintln!("  train [hparams.toml] [corpus.tsv]");
        eprintln!("  eval <model.json> [hparams.toml]");
        eprintln!("  transfer <sentence> [label]");
        return;
    }

    let mode = args[1].as_str();
    match mode {
        "train" => {
            let hparams = args.get(2).map(|s| s.as_str());
            let data = args.get(3).map(|s| s.as_str());
            train_style::run(hparams, data);
        }
        "eval" => {
            let Some(ckpt) = args.get(2) else {
                eprintln!("eval needs a checkpoint path");
                return;
            };
            let hp = args
                .get(3)
                .and_then(|p| HParams::from_path(p))
                .unwrap_or_default();
            let corpus = toy_corpus();
            let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
            let batches = make_batches(&corpus, &vocab, 4);
            let mut model = StyleTransferModel::new(vocab, 0.01, 0.1, 0.1, 0.5, 0.5, 1.0, &hp);
            if let Err(e) = weights::load_model(ckpt, &mut model) {
                error!("could not load {ckpt}: {e}");
                return;
            }
            for batch in &batches {
                match model.eval(batch) {
                    Ok(fetches) => {
                        for (k, v) in &fetches.metrics {
                            info!("{k} = {v:.4}");
                        }
                        for (orig, out) in fetches
                            .samples
                            .original
                            .iter()
                            .zip(fetches.samples.transferred.iter())
                        {
                            info!("{orig:?} -> {out:?}");
                        }
                    }
                    Err(e) => error!("eval failed: {e}"),
                }
            }
        }
        "transfer" => {
            let Some(sentence) = args.get(2) else {
                eprintln!("transfer needs an input sentence");
                return;
            };
            let label: usize = args
                .get(3)
                .and_then(|s| s.parse().ok())
                .map(|l: usize| l.min(1))
                .unwrap_or(0);
            let hp = HParams::default();
            let corpus = toy_corpus();
            let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
            let mut model = StyleTransferModel::new(vocab, 0.01, 0.1, 0.1, 0.5, 0.5, 1.0, &hp);
            if let Err(e) = weights::load_model("model.json", &mut model) {
                error!("could not load model.json: {e}");
                return;
            }
            let batch = {
                let corpus = vec![(sentence.to_string(), label)];
                make_batches(&corpus, model.vocab(), 1).remove(0)
            };
            match model.transfer(&batch) {
                Ok(out) => println!("{}", out[0]),
                Err(e) => error!("transfer failed: {e}"),
            }
        }
        _ => eprintln!("Unknown mode {}", mode),
    }
}

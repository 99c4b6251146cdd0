use std::fs;

use styleflip::config::HParams;
use styleflip::data::{toy_corpus, Vocab};
use styleflip::models::StyleTransferModel;
use styleflip::weights::{load_model, save_model};

fn tiny_model() -> StyleTransferModel {
    let mut hp = HParams::default();
    hp.dim_c = 2;
    hp.embedder.dim = 6;
    hp.encoder.dim = 5;
    hp.decoder.dim = 5;
    hp.classifier.filters = 2;
    hp.classifier.kernel_sizes = vec![2];
    hp.discriminator.filters = 2;
    hp.discriminator.kernel_sizes = vec![2];
    hp.z_classifier.hidden1 = 4;
    hp.z_classifier.hidden2 = 3;
    hp.max_decoding_length = 6;
    let corpus = toy_corpus();
    let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
    StyleTransferModel::new(vocab, 0.5, 0.1, 0.1, 0.5, 0.5, 1.0, &hp)
}

#[test]
fn weights_round_trip_through_json() {
    let dir = std::env::temp_dir().join("styleflip-ckpt-test");
    fs::create_dir_all(&dir).unwrap();
    let first = dir.join("first.json");
    let second = dir.join("second.json");
    let first = first.to_str().unwrap();
    let second = second.to_str().unwrap();

    let mut a = tiny_model();
    save_model(first, &mut a).unwrap();

    // a fresh model starts from different random weights
    let mut b = tiny_model();
    load_model(first, &mut b).unwrap();
    save_model(second, &mut b).unwrap();

    let saved_a = fs::read_to_string(first).unwrap();
    let saved_b = fs::read_to_string(second).unwrap();
    assert_eq!(saved_a, saved_b);

    let _ = fs::remove_file(first);
    let _ = fs::remove_file(second);
}

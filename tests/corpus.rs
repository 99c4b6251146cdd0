use std::fs;

use styleflip::data::{load_corpus, make_batches, Vocab};

#[test]
fn malformed_lines_are_skipped() {
    let path = std::env::temp_dir().join("styleflip-corpus-test.tsv");
    fs::write(
        &path,
        "1\tgreat food and lovely staff\nnot-a-label\tbroken line\n0\tterrible experience\n2\tlabel out of range\n0\t\n",
    )
    .unwrap();
    let corpus = load_corpus(path.to_str().unwrap()).unwrap();
    assert_eq!(corpus.len(), 2);
    assert_eq!(corpus[0].1, 1);
    assert_eq!(corpus[1].1, 0);
    let _ = fs::remove_file(&path);
}

#[test]
fn unknown_tokens_map_to_unk() {
    let corpus = vec![("good food".to_string(), 1)];
    let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
    let ids = vocab.encode("good mystery");
    assert_eq!(ids[0], *vocab.stoi.get("good").unwrap());
    assert_eq!(ids[1], vocab.unk_token_id());
}

#[test]
fn batches_cover_the_whole_corpus() {
    let corpus = vec![
        ("one two three".to_string(), 0),
        ("four".to_string(), 1),
        ("five six".to_string(), 0),
    ];
    let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
    let batches = make_batches(&corpus, &vocab, 2);
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].size(), 2);
    assert_eq!(batches[1].size(), 1);
}

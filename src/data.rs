use std::collections::HashMap;
use std::fs;
use std::io;

pub const PAD: &str = "<pad>";
pub const BOS: &str = "<bos>";
pub const EOS: &str = "<eos>";
pub const UNK: &str = "<unk>";

/// Token vocabulary with the special markers the model relies on.
pub struct Vocab {
    pub itos: Vec<String>,
    pub stoi: HashMap<String, usize>,
}

impl Vocab {
    /// Build a vocabulary from an iterator of sentences.
    pub fn build<'a, I: IntoIterator<Item = &'a str>>(sentences: I) -> Self {
        let mut itos: Vec<String> = [PAD, BOS, EOS, UNK].iter().map(|s| s.to_string()).collect();
        let mut stoi: HashMap<String, usize> =
            itos.iter().cloned().zip(0..itos.len()).collect();
        for sent in sentences {
            for tok in sent.split_whitespace() {
                if !stoi.contains_key(tok) {
                    stoi.insert(tok.to_string(), itos.len());
                    itos.push(tok.to_string());
                }
            }
        }
        Self { itos, stoi }
    }

    pub fn size(&self) -> usize {
        self.itos.len()
    }

    pub fn pad_token_id(&self) -> usize {
        0
    }

    pub fn bos_token_id(&self) -> usize {
        1
    }

    pub fn eos_token_id(&self) -> usize {
        2
    }

    pub fn unk_token_id(&self) -> usize {
        3
    }

    pub fn encode(&self, sentence: &str) -> Vec<usize> {
        sentence
            .split_whitespace()
            .map(|t| *self.stoi.get(t).unwrap_or(&self.unk_token_id()))
            .collect()
    }

    pub fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .take_while(|&&id| id != self.eos_token_id())
            .map(|&id| self.itos.get(id).map(String::as_str).unwrap_or(UNK))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// One mini-batch of labelled sentences.
///
/// `text_ids` rows are BOS-prefixed, EOS-terminated and right-padded to a
/// common length; `length` counts the BOS token, so `length[i] <= time`
/// holds for every row.
#[derive(Clone, Debug)]
pub struct Batch {
    pub text_ids: Vec<Vec<usize>>,
    pub length: Vec<usize>,
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn size(&self) -> usize {
        self.text_ids.len()
    }

    pub fn max_time(&self) -> usize {
        self.text_ids.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// A tiny embedded sentiment corpus so examples and tests run without any
/// external files.
pub fn toy_corpus() -> Vec<(String, usize)> {
    vec![
        ("the food was great and the staff friendly".to_string(), 1),
        ("i loved the quick service here".to_string(), 1),
        ("wonderful little place with amazing coffee".to_string(), 1),
        ("best pasta i have had in years".to_string(), 1),
        ("the food was cold and the staff rude".to_string(), 0),
        ("i hated the slow service here".to_string(), 0),
        ("dreadful little place with awful coffee".to_string(), 0),
        ("worst pasta i have had in years".to_string(), 0),
    ]
}

/// Load a `label<TAB>text` corpus.  Lines that do not parse are skipped
/// with a warning.
pub fn load_corpus(path: &str) -> io::Result<Vec<(String, usize)>> {
    let content = fs::read_to_string(path)?;
    let mut out = Vec::new();
    for line in content.lines() {
        let mut parts = line.splitn(2, '\t');
        let label = parts.next().and_then(|s| s.trim().parse::<usize>().ok());
        let text = parts.next().map(str::trim);
        match (label, text) {
            (Some(label), Some(text)) if label <= 1 && !text.is_empty() => {
                out.push((text.to_string(), label));
            }
            _ => crate::warn!("skipping malformed corpus line: {line:?}"),
        }
    }
    Ok(out)
}

/// Group encoded sentences into padded mini-batches.  The final batch may
/// be smaller than `batch_size` if the sample count is not divisible by it.
pub fn make_batches(corpus: &[(String, usize)], vocab: &Vocab, batch_size: usize) -> Vec<Batch> {
    corpus
        .chunks(batch_size)
        .map(|chunk| {
            let encoded: Vec<(Vec<usize>, usize)> = chunk
                .iter()
                .map(|(text, label)| {
                    let mut ids = vec![vocab.bos_token_id()];
                    ids.extend(vocab.encode(text));
                    ids.push(vocab.eos_token_id());
                    (ids, *label)
                })
                .collect();
            let time = encoded.iter().map(|(ids, _)| ids.len()).max().unwrap_or(0);
            let mut text_ids = Vec::with_capacity(encoded.len());
            let mut length = Vec::with_capacity(encoded.len());
            let mut labels = Vec::with_capacity(encoded.len());
            for (mut ids, label) in encoded {
                length.push(ids.len());
                ids.resize(time, vocab.pad_token_id());
                text_ids.push(ids);
                labels.push(label);
            }
            Batch {
                text_ids,
                length,
                labels,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_padded_and_lengths_counted() {
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let batches = make_batches(&corpus, &vocab, 4);
        assert_eq!(batches.len(), 2);
        for batch in &batches {
            let time = batch.max_time();
            for (ids, &len) in batch.text_ids.iter().zip(batch.length.iter()) {
                assert_eq!(ids.len(), time);
                assert!(len <= time);
                assert_eq!(ids[0], vocab.bos_token_id());
                assert_eq!(ids[len - 1], vocab.eos_token_id());
            }
        }
    }

    #[test]
    fn decode_stops_at_eos() {
        let corpus = toy_corpus();
        let vocab = Vocab::build(corpus.iter().map(|(s, _)| s.as_str()));
        let mut ids = vocab.encode("the food was great");
        ids.push(vocab.eos_token_id());
        ids.push(vocab.unk_token_id());
        assert_eq!(vocab.decode(&ids), "the food was great");
    }
}

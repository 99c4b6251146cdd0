pub mod classifier;
pub mod decoder;
pub mod encoder;
pub mod transfer;

pub use classifier::{equalize_time, Conv1dClassifier};
pub use decoder::AttentionDecoder;
pub use encoder::Encoder;
pub use transfer::{EvalFetches, Samples, StyleTransferModel};

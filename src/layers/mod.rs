pub mod conv1d;
pub mod embedding;
pub mod gru;
pub mod linear;
pub mod mlp;
pub mod relu;
pub mod sigmoid;
pub mod tanh;

pub use conv1d::{Conv1dPool, Conv1dTrace, ConvError};
pub use embedding::EmbeddingT;
pub use gru::{GruCell, GruStepTrace};
pub use linear::LinearT;
pub use mlp::{Activation, MlpConnector, MlpTrace};

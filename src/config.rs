use serde::{Deserialize, Serialize};
use std::fs;

/// Hyperparameters for the style-transfer model, loadable from a TOML or
/// JSON file.  JSON field names keep the original spelling of the upstream
/// configuration (`WGAN`, `LAMBDA`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HParams {
    /// Width of the label-derived content code `c`.
    pub dim_c: usize,
    pub num_classes: usize,
    #[serde(rename = "WGAN")]
    pub wgan: bool,
    #[serde(rename = "WWGAN")]
    pub wwgan: bool,
    /// Gradient-penalty weight.
    #[serde(rename = "LAMBDA")]
    pub lambda_gp: f32,
    #[serde(rename = "ACGAN_SCALE_G")]
    pub acgan_scale_g: f32,
    #[serde(rename = "ACGAN_SCALE_D")]
    pub acgan_scale_d: f32,
    pub max_decoding_length: usize,
    pub embedder: EmbedderConfig,
    pub encoder: RnnConfig,
    pub decoder: RnnConfig,
    pub classifier: ConvConfig,
    pub discriminator: ConvConfig,
    pub z_classifier: ZClassifierConfig,
    pub opt: OptConfig,
    pub opt_d: OptConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    pub dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RnnConfig {
    pub dim: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvConfig {
    pub filters: usize,
    pub kernel_sizes: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ZClassifierConfig {
    pub hidden1: usize,
    pub hidden2: usize,
    /// Activation of the two hidden stages: "identity", "relu", "tanh" or
    /// "leaky_relu".
    pub activation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OptConfig {
    /// "adam" or "sgd".
    pub kind: String,
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Default for HParams {
    fn default() -> Self {
        Self {
            dim_c: 200,
            num_classes: 2,
            wgan: false,
            wwgan: false,
            lambda_gp: 10.0,
            acgan_scale_g: 1.0,
            acgan_scale_d: 1.0,
            max_decoding_length: 21,
            embedder: EmbedderConfig::default(),
            encoder: RnnConfig { dim: 700 },
            decoder: RnnConfig { dim: 700 },
            classifier: ConvConfig::default(),
            discriminator: ConvConfig::default(),
            z_classifier: ZClassifierConfig::default(),
            opt: OptConfig::default(),
            opt_d: OptConfig {
                kind: "adam".to_string(),
                lr: 1e-4,
                beta1: 0.5,
                beta2: 0.9,
                eps: 1e-8,
                weight_decay: 0.0,
            },
        }
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self { dim: 100 }
    }
}

impl Default for RnnConfig {
    fn default() -> Self {
        Self { dim: 700 }
    }
}

impl Default for ConvConfig {
    fn default() -> Self {
        Self {
            filters: 128,
            kernel_sizes: vec![3, 4, 5],
        }
    }
}

impl Default for ZClassifierConfig {
    fn default() -> Self {
        Self {
            hidden1: 256,
            hidden2: 64,
            activation: "relu".to_string(),
        }
    }
}

impl Default for OptConfig {
    fn default() -> Self {
        Self {
            kind: "adam".to_string(),
            lr: 5e-4,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl HParams {
    /// Load hyperparameters from the given path.  Supports TOML or JSON
    /// based on the file extension.  Returns `None` if parsing fails.
    pub fn from_path(path: &str) -> Option<Self> {
        let Ok(content) = fs::read_to_string(path) else {
            return None;
        };
        if path.ends_with(".json") {
            serde_json::from_str(&content).ok()
        } else {
            toml::from_str(&content).ok()
        }
    }

    /// Width of the attribute-free latent code `z`.
    pub fn dim_z(&self) -> usize {
        assert!(
            self.dim_c < self.encoder.dim,
            "dim_c ({}) must be smaller than the encoder state width ({})",
            self.dim_c,
            self.encoder.dim
        );
        self.encoder.dim - self.dim_c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_through_json() {
        let hp = HParams::default();
        let json = serde_json::to_string(&hp).unwrap();
        assert!(json.contains("\"WGAN\""));
        assert!(json.contains("\"LAMBDA\""));
        assert!(json.contains("\"ACGAN_SCALE_G\""));
        let back: HParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dim_c, hp.dim_c);
        assert_eq!(back.opt_d.lr, hp.opt_d.lr);
    }

    #[test]
    fn dim_z_is_state_minus_content() {
        let mut hp = HParams::default();
        hp.dim_c = 2;
        hp.encoder.dim = 16;
        assert_eq!(hp.dim_z(), 14);
    }
}

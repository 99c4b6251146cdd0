pub mod adam;
pub mod sgd;

use crate::config::OptConfig;
use crate::layers::LinearT;

pub use adam::Adam;
pub use sgd::Sgd;

/// Gradient-descent step over a parameter group.  Implementations keep
/// their own per-parameter state, keyed by position in the slice, so the
/// same group must always be passed in the same order.
pub trait Optimizer {
    fn step(&mut self, params: &mut [&mut LinearT]);
}

/// Builds the optimizer named by the config.  Unknown kinds fall back to
/// SGD with the configured learning rate.
pub fn from_config(cfg: &OptConfig) -> Box<dyn Optimizer> {
    match cfg.kind.as_str() {
        "adam" => Box::new(Adam::new(
            cfg.lr,
            cfg.beta1,
            cfg.beta2,
            cfg.eps,
            cfg.weight_decay,
        )),
        "sgd" => Box::new(Sgd::new(cfg.lr, cfg.weight_decay)),
        other => {
            crate::warn!("unknown optimizer kind {other:?}, falling back to sgd");
            Box::new(Sgd::new(cfg.lr, cfg.weight_decay))
        }
    }
}

pub mod config;
pub mod data;
pub mod layers;
pub mod logging;
pub mod math;
pub mod metrics;
pub mod models;
pub mod optim;
pub mod rng;
pub mod train_style;
pub mod util;
pub mod weights;

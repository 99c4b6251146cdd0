use super::Optimizer;
use crate::layers::LinearT;

/// Plain stochastic gradient descent with optional weight decay.
pub struct Sgd {
    lr: f32,
    weight_decay: f32,
}

impl Sgd {
    pub fn new(lr: f32, weight_decay: f32) -> Self {
        Self { lr, weight_decay }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, params: &mut [&mut LinearT]) {
        for p in params.iter_mut() {
            for i in 0..p.w.data.len() {
                let mut g = p.grad_w.data[i];
                if self.weight_decay != 0.0 {
                    g += self.weight_decay * p.w.data[i];
                }
                p.w.data[i] -= self.lr * g;
            }
            for i in 0..p.b.len() {
                p.b[i] -= self.lr * p.grad_b[i];
            }
        }
    }
}

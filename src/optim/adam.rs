use super::Optimizer;
use crate::layers::LinearT;
use crate::math::Matrix;

struct Slot {
    m_w: Matrix,
    v_w: Matrix,
    m_b: Vec<f32>,
    v_b: Vec<f32>,
}

/// Adam with bias correction and optional decoupled weight decay.  State
/// is allocated lazily on the first step so the optimizer can be built
/// before the parameter group is known.
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    t: i32,
    slots: Vec<Slot>,
}

impl Adam {
    pub fn new(lr: f32, beta1: f32, beta2: f32, eps: f32, weight_decay: f32) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            t: 0,
            slots: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut LinearT]) {
        self.t += 1;
        while self.slots.len() < params.len() {
            let p = &params[self.slots.len()];
            self.slots.push(Slot {
                m_w: Matrix::zeros(p.w.rows, p.w.cols),
                v_w: Matrix::zeros(p.w.rows, p.w.cols),
                m_b: vec![0.0; p.b.len()],
                v_b: vec![0.0; p.b.len()],
            });
        }
        let bc1 = 1.0 - self.beta1.powi(self.t);
        let bc2 = 1.0 - self.beta2.powi(self.t);
        for (p, slot) in params.iter_mut().zip(self.slots.iter_mut()) {
            for i in 0..p.w.data.len() {
                let mut g = p.grad_w.data[i];
                if self.weight_decay != 0.0 {
                    g += self.weight_decay * p.w.data[i];
                }
                slot.m_w.data[i] = self.beta1 * slot.m_w.data[i] + (1.0 - self.beta1) * g;
                slot.v_w.data[i] = self.beta2 * slot.v_w.data[i] + (1.0 - self.beta2) * g * g;
                let m_hat = slot.m_w.data[i] / bc1;
                let v_hat = slot.v_w.data[i] / bc2;
                p.w.data[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
            for i in 0..p.b.len() {
                let g = p.grad_b[i];
                slot.m_b[i] = self.beta1 * slot.m_b[i] + (1.0 - self.beta1) * g;
                slot.v_b[i] = self.beta2 * slot.v_b[i] + (1.0 - self.beta2) * g * g;
                let m_hat = slot.m_b[i] / bc1;
                let v_hat = slot.v_b[i] / bc2;
                p.b[i] -= self.lr * m_hat / (v_hat.sqrt() + self.eps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_against_the_gradient() {
        let mut layer = LinearT::new(2, 2);
        let before = layer.w.data.clone();
        for g in layer.grad_w.data.iter_mut() {
            *g = 1.0;
        }
        let mut opt = Adam::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        opt.step(&mut [&mut layer]);
        for (w, b) in layer.w.data.iter().zip(before.iter()) {
            assert!(w < b);
        }
    }

    #[test]
    fn zero_gradient_leaves_weights_alone() {
        let mut layer = LinearT::new(2, 2);
        let before = layer.w.data.clone();
        let mut opt = Adam::new(0.1, 0.9, 0.999, 1e-8, 0.0);
        opt.step(&mut [&mut layer]);
        assert_eq!(layer.w.data, before);
    }
}

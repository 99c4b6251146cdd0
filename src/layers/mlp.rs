use super::linear::LinearT;
use super::{relu, tanh};
use crate::math::Matrix;

/// Activation applied by an [`MlpConnector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    LeakyRelu,
}

impl Activation {
    pub fn parse(name: &str) -> Self {
        match name {
            "identity" => Activation::Identity,
            "relu" => Activation::Relu,
            "tanh" => Activation::Tanh,
            "leaky_relu" => Activation::LeakyRelu,
            other => panic!("unknown activation {other:?}"),
        }
    }
}

/// Single affine transform with an optional activation.  Used for the
/// label connector (scalar label -> content code), the decoder state
/// connector and the latent-classifier stages.  The layer is stateless
/// across calls: the same weights applied to the same input always yield
/// the same output.
pub struct MlpConnector {
    pub lin: LinearT,
    activation: Activation,
}

pub struct MlpTrace {
    pub x: Matrix,
    out: Matrix,
    mask: Option<Vec<f32>>,
}

impl MlpConnector {
    pub fn new(in_dim: usize, out_dim: usize, activation: Activation) -> Self {
        Self {
            lin: LinearT::new(in_dim, out_dim),
            activation,
        }
    }

    pub fn forward(&self, x: &Matrix) -> (Matrix, MlpTrace) {
        let mut out = self.lin.forward(x);
        let mask = match self.activation {
            Activation::Identity => None,
            Activation::Relu => Some(relu::forward_matrix(&mut out)),
            Activation::LeakyRelu => Some(relu::forward_matrix_leaky(&mut out)),
            Activation::Tanh => {
                tanh::forward_matrix(&mut out);
                None
            }
        };
        (
            out.clone(),
            MlpTrace {
                x: x.clone(),
                out,
                mask,
            },
        )
    }

    pub fn backward(&mut self, trace: &MlpTrace, grad_out: &Matrix) -> Matrix {
        let mut g = grad_out.clone();
        match self.activation {
            Activation::Identity => {}
            Activation::Relu | Activation::LeakyRelu => {
                if let Some(mask) = trace.mask.as_ref() {
                    relu::backward(&mut g, mask);
                }
            }
            Activation::Tanh => tanh::backward(&mut g, &trace.out),
        }
        self.lin.backward(&trace.x, &g)
    }

    pub fn zero_grad(&mut self) {
        self.lin.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        vec![&mut self.lin]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_input_yields_identical_output() {
        let conn = MlpConnector::new(1, 4, Activation::Identity);
        let label = Matrix::from_vec(2, 1, vec![1.0, 1.0]);
        let (a, _) = conn.forward(&label);
        let (b, _) = conn.forward(&label);
        assert_eq!(a, b);
        assert_eq!(a.row(0), a.row(1));
    }
}

use crate::math::Matrix;

/// Apply ReLU activation in place on a matrix and return a mask for
/// backward.
pub fn forward_matrix(m: &mut Matrix) -> Vec<f32> {
    let mut mask = vec![0.0; m.data.len()];
    for (i, v) in m.data.iter_mut().enumerate() {
        if *v < 0.0 {
            *v = 0.0;
        } else {
            mask[i] = 1.0;
        }
    }
    mask
}

/// Apply the stored ReLU mask to the gradient matrix.
pub fn backward(grad: &mut Matrix, mask: &[f32]) {
    for (g, &m) in grad.data.iter_mut().zip(mask.iter()) {
        *g *= m;
    }
}

/// Leaky variant with slope 0.01; returns the slope mask for backward.
pub fn forward_matrix_leaky(m: &mut Matrix) -> Vec<f32> {
    let mut mask = vec![1.0; m.data.len()];
    for (i, v) in m.data.iter_mut().enumerate() {
        if *v < 0.0 {
            *v *= 0.01;
            mask[i] = 0.01;
        }
    }
    mask
}

use super::linear::LinearT;
use crate::math::Matrix;

/// Embedding layer: maps token ids, or soft distributions over the
/// vocabulary, into dense vectors from one shared table.
pub struct EmbeddingT {
    pub table: LinearT, // weight matrix (vocab_size x dim)
}

impl EmbeddingT {
    pub fn new(vocab_size: usize, dim: usize) -> Self {
        Self {
            table: LinearT::new(vocab_size, dim),
        }
    }

    pub fn dim(&self) -> usize {
        self.table.out_dim()
    }

    /// Look up one step of token ids (one row per batch example).
    pub fn forward_ids(&self, ids: &[usize]) -> Matrix {
        self.table.gather_rows(ids)
    }

    pub fn backward_ids(&mut self, ids: &[usize], grad_out: &Matrix) {
        self.table.scatter_grad_rows(ids, grad_out);
    }

    /// Embed a soft distribution over the vocabulary (batch x vocab); the
    /// expectation of the table rows under the distribution.  This is what
    /// lets Gumbel-softmax samples stay differentiable end to end.
    pub fn forward_soft(&self, soft_ids: &Matrix) -> Matrix {
        Matrix::matmul(soft_ids, &self.table.w)
    }

    /// Accumulates table gradients and returns the gradient with respect
    /// to the soft distribution.
    pub fn backward_soft(&mut self, soft_ids: &Matrix, grad_out: &Matrix) -> Matrix {
        let grad_w = Matrix::matmul(&soft_ids.transpose(), grad_out);
        self.table.grad_w.add_assign(&grad_w);
        Matrix::matmul(grad_out, &self.table.w.transpose())
    }

    pub fn zero_grad(&mut self) {
        self.table.zero_grad();
    }

    pub fn parameters(&mut self) -> Vec<&mut LinearT> {
        vec![&mut self.table]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_lookup_of_one_hot_matches_id_lookup() {
        let emb = EmbeddingT::new(5, 3);
        let ids = vec![2usize];
        let hard = emb.forward_ids(&ids);
        let mut one_hot = Matrix::zeros(1, 5);
        one_hot.set(0, 2, 1.0);
        let soft = emb.forward_soft(&one_hot);
        for (a, b) in hard.data.iter().zip(soft.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}

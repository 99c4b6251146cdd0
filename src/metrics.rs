/// Fraction of predictions that match the reference labels.
pub fn accuracy(labels: &[usize], preds: &[usize]) -> f32 {
    if labels.is_empty() {
        return 0.0;
    }
    let hits = labels
        .iter()
        .zip(preds.iter())
        .filter(|(a, b)| a == b)
        .count();
    hits as f32 / labels.len() as f32
}

/// Binary predictions from raw logits, positive class for logits above 0
/// (a sigmoid probability above one half).
pub fn binary_preds(logits: &[f32]) -> Vec<usize> {
    logits.iter().map(|&l| usize::from(l > 0.0)).collect()
}

/// Binary predictions thresholding the raw logit at 0.5.  Used only for
/// the discriminator's real/fake accuracies, which keep this shifted
/// decision boundary.
pub fn binary_preds_half(logits: &[f32]) -> Vec<usize> {
    logits.iter().map(|&l| usize::from(l >= 0.5)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[1, 0, 1, 1], &[1, 1, 1, 0]), 0.5);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn preds_threshold_logits_at_zero() {
        assert_eq!(binary_preds(&[0.3, -0.1]), vec![1, 0]);
        assert_eq!(binary_preds(&[0.0, 2.0, -3.0]), vec![0, 1, 0]);
    }

    #[test]
    fn discriminator_preds_keep_the_half_threshold() {
        assert_eq!(binary_preds_half(&[0.4, 0.5, -2.0, 3.0]), vec![0, 1, 0, 1]);
    }
}

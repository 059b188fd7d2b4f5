// SPDX-License-Identifier: MIT OR Apache-2.0

//! Probability helpers shared by the ablation engine and prediction readout.
//!
//! Every function here uses the numerically stable softmax (max subtracted
//! before exponentiation) and the [`PROB_FLOOR`] before taking logarithms.

/// Probabilities at or below this value are treated as zero in logarithms.
pub const PROB_FLOOR: f32 = 1e-10;

/// Numerically stable softmax over a logit vector.
///
/// Returns an empty vector for empty input.
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_val = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_val.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exp_vals: Vec<f32> = logits.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();
    exp_vals.iter().map(|x| x / sum).collect()
}

/// Shannon entropy in bits: `-Σ p·log2(p)`, skipping `p ≤ PROB_FLOOR`.
#[must_use]
pub fn entropy_bits(probs: &[f32]) -> f32 {
    -probs
        .iter()
        .filter(|&&p| p > PROB_FLOOR)
        .map(|&p| p * p.log2())
        .sum::<f32>()
}

/// `KL(P || Q)` in nats over two probability vectors.
///
/// Terms where either probability is at or below [`PROB_FLOOR`] are
/// skipped. Always non-negative up to rounding; clamped at zero.
#[must_use]
pub fn kl_divergence(p: &[f32], q: &[f32]) -> f32 {
    let kl: f32 = p
        .iter()
        .zip(q.iter())
        .filter(|&(&pi, &qi)| pi > PROB_FLOOR && qi > PROB_FLOOR)
        .map(|(&pi, &qi)| pi * (pi / qi).ln())
        .sum();
    kl.max(0.0)
}

/// Indices sorted by descending value; ties keep ascending index order.
#[must_use]
pub fn argsort_desc(values: &[f32]) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    idx.sort_by(|&a, &b| {
        let va = values.get(a).copied().unwrap_or(f32::NEG_INFINITY);
        let vb = values.get(b).copied().unwrap_or(f32::NEG_INFINITY);
        vb.total_cmp(&va).then(a.cmp(&b))
    });
    idx
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, 1000.0]);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probs[3] > 0.99);
    }

    #[test]
    fn softmax_is_shift_invariant() {
        let a = softmax(&[0.5, 1.0, 1.5]);
        let b = softmax(&[100.5, 101.0, 101.5]);
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    #[test]
    fn entropy_of_uniform() {
        let probs = vec![0.25; 4];
        assert!((entropy_bits(&probs) - 2.0).abs() < 1e-6);
        assert_eq!(entropy_bits(&[1.0, 0.0]), 0.0);
    }

    #[test]
    fn kl_zero_for_identical() {
        let p = softmax(&[0.3, 1.2, -0.4]);
        assert_eq!(kl_divergence(&p, &p), 0.0);
    }

    #[test]
    fn kl_non_negative() {
        let p = softmax(&[2.0, 0.5, 0.1, -1.0]);
        let q = softmax(&[0.1, 0.1, 3.0, 0.0]);
        assert!(kl_divergence(&p, &q) > 0.0);
        assert!(kl_divergence(&q, &p) > 0.0);
    }

    #[test]
    fn argsort_orders_descending_with_stable_ties() {
        assert_eq!(argsort_desc(&[0.1, 0.5, 0.5, 0.2]), vec![1, 2, 3, 0]);
    }
}

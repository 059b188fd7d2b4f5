// SPDX-License-Identifier: MIT OR Apache-2.0

//! Next-token predictions and the logit lens.
//!
//! [`top_k_predictions`] turns a final-position logit vector into ranked
//! [`TokenPrediction`]s. The logit lens applies the same ranking to every
//! layer's final-position hidden state, projected through the runtime's
//! unembedding, to see what the model would predict at that depth.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::config::infer_vocab_size;
use crate::error::{MIError, Result};
use crate::util::stats::{argsort_desc, softmax};

/// Result of applying logit lens at a single layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitLensResult {
    /// Layer index (0-indexed).
    pub layer: usize,
    /// Top-k token predictions with probabilities.
    pub predictions: Vec<TokenPrediction>,
}

/// A single ranked token prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPrediction {
    /// Token ID in the vocabulary.
    pub token_id: u32,
    /// Decoded token string.
    pub token: String,
    /// Probability (0.0 to 1.0).
    pub probability: f32,
}

/// Full logit lens analysis across all layers.
///
/// Collects per-layer predictions and provides summary methods
/// for identifying convergence and first appearance of tokens.
///
/// # Example
///
/// ```
/// use circuit_lens::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
///
/// let mut analysis = LogitLensAnalysis::new("The cat sat on the".into(), 2);
/// analysis.push(LogitLensResult {
///     layer: 0,
///     predictions: vec![TokenPrediction { token_id: 42, token: " the".into(), probability: 0.3 }],
/// });
/// analysis.push(LogitLensResult {
///     layer: 1,
///     predictions: vec![TokenPrediction { token_id: 7, token: " mat".into(), probability: 0.6 }],
/// });
/// assert_eq!(analysis.top_predictions(), vec![(" the", 0.3), (" mat", 0.6)]);
/// assert_eq!(analysis.first_appearance("mat", 1), Some(1));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogitLensAnalysis {
    /// Input text that was analyzed.
    pub input_text: String,
    /// Results for each layer.
    pub layer_results: Vec<LogitLensResult>,
    /// Number of layers analyzed.
    pub n_layers: usize,
}

impl LogitLensAnalysis {
    /// Create a new analysis with capacity for `n_layers` layers.
    #[must_use]
    pub fn new(input_text: String, n_layers: usize) -> Self {
        Self {
            input_text,
            layer_results: Vec::with_capacity(n_layers),
            n_layers,
        }
    }

    /// Add a layer's result.
    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    /// Get the top prediction at each layer.
    ///
    /// Returns `(token_str, probability)` for the highest-probability
    /// token at each analyzed layer.
    #[must_use]
    pub fn top_predictions(&self) -> Vec<(&str, f32)> {
        self.layer_results
            .iter()
            .filter_map(|r| r.predictions.first())
            .map(|p| (p.token.as_str(), p.probability))
            .collect()
    }

    /// Find at which layer a specific token first appears in top-k.
    ///
    /// Searches predictions using `contains()` on the token string.
    /// Returns `None` if the token never appears in the top-k at any layer.
    #[must_use]
    pub fn first_appearance(&self, token: &str, k: usize) -> Option<usize> {
        self.layer_results
            .iter()
            .find(|r| r.predictions.iter().take(k).any(|p| p.token.contains(token)))
            .map(|r| r.layer)
    }
}

/// Rank `logits` by softmax probability and decode the best `k`.
///
/// Ties keep vocabulary order. Returns fewer than `k` predictions when the
/// vocabulary is smaller.
///
/// # Example
///
/// ```
/// use circuit_lens::interp::logit_lens::top_k_predictions;
///
/// let preds = top_k_predictions(&[0.0, 2.0, 1.0], 2, |id| format!("tok_{id}"));
/// assert_eq!(preds[0].token, "tok_1");
/// assert_eq!(preds[1].token_id, 2);
/// ```
pub fn top_k_predictions(
    logits: &[f32],
    k: usize,
    decode_fn: impl Fn(u32) -> String,
) -> Vec<TokenPrediction> {
    let probs = softmax(logits);
    let ranked: Vec<(u32, f32)> = argsort_desc(&probs)
        .into_iter()
        .take(k)
        .filter_map(|i| {
            let id = u32::try_from(i).ok()?;
            probs.get(i).map(|&p| (id, p))
        })
        .collect();
    decode_predictions_with(&ranked, decode_fn)
}

/// Extract the final position's logits from a runtime output tensor.
///
/// `[batch, seq, vocab]` uses batch 0. The remaining values are split with
/// [`infer_vocab_size`], where `vocab_hint` wins over the tensor's last
/// axis, and the trailing `vocab` values are returned.
///
/// # Shapes
/// - `logits`: `[batch, seq, vocab]`, `[seq, vocab]`, `[1, seq * vocab]` or `[n]`
/// - returns: `vocab` values
///
/// # Errors
///
/// Returns [`MIError::Hook`] if the tensor is a scalar or empty, and
/// [`MIError::Model`] on tensor conversion failure.
pub fn final_position_logits(
    logits: &Tensor,
    seq_len: usize,
    vocab_hint: Option<usize>,
) -> Result<Vec<f32>> {
    let logits = match logits.rank() {
        0 => return Err(MIError::Hook("logits tensor is a scalar".into())),
        3.. => logits.get(0)?,
        _ => logits.clone(),
    };
    let dims = logits.dims().to_vec();
    let flat: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if flat.is_empty() {
        return Err(MIError::Hook("logits tensor is empty".into()));
    }

    // An explicit size outranks the shape: exported runtimes may flatten
    // positions into the last axis.
    let vocab = infer_vocab_size(flat.len(), seq_len, vocab_hint, Some(&dims)).vocab_size;
    let start = flat.len().saturating_sub(vocab);
    flat.get(start..)
        .map(<[f32]>::to_vec)
        .ok_or_else(|| MIError::Hook(format!("cannot take {vocab} logits from {}", flat.len())))
}

/// Decode token IDs to [`TokenPrediction`] using a decode function.
///
/// Generic over any tokenizer: the caller provides a closure that
/// maps `token_id → String`.
///
/// # Example
///
/// ```
/// use circuit_lens::interp::logit_lens::decode_predictions_with;
///
/// let preds = decode_predictions_with(&[(42, 0.7), (99, 0.2)], |id| {
///     format!("token_{id}")
/// });
/// assert_eq!(preds.len(), 2);
/// assert_eq!(preds[0].token, "token_42");
/// ```
pub fn decode_predictions_with(
    predictions: &[(u32, f32)],
    decode_fn: impl Fn(u32) -> String,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, prob)| TokenPrediction {
            token_id,
            token: decode_fn(token_id),
            probability: prob,
        })
        .collect()
}

/// Format a token for display, escaping whitespace characters.
#[must_use]
pub fn format_token(token: &str) -> String {
    token
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('\r', "\\r")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn prediction(token_id: u32, token: &str) -> TokenPrediction {
        TokenPrediction {
            token_id,
            token: token.to_string(),
            probability: 0.5,
        }
    }

    #[test]
    fn first_appearance_found() {
        let mut analysis = LogitLensAnalysis::new("test".to_string(), 3);
        analysis.push(LogitLensResult {
            layer: 0,
            predictions: vec![prediction(1, "a")],
        });
        analysis.push(LogitLensResult {
            layer: 1,
            predictions: vec![prediction(3, "b"), prediction(2, " cat")],
        });

        assert_eq!(analysis.first_appearance("cat", 2), Some(1));
        assert_eq!(analysis.first_appearance("cat", 1), None);
        assert_eq!(analysis.first_appearance("notfound", 5), None);
    }

    #[test]
    fn top_predictions_empty() {
        let analysis = LogitLensAnalysis::new("test".to_string(), 0);
        assert!(analysis.top_predictions().is_empty());
    }

    #[test]
    fn top_k_is_sorted_and_normalized() {
        let preds = top_k_predictions(&[1.0, 3.0, 2.0, 3.0], 10, |id| format!("t{id}"));
        let ids: Vec<u32> = preds.iter().map(|p| p.token_id).collect();
        assert_eq!(ids, vec![1, 3, 2, 0]);
        let total: f32 = preds.iter().map(|p| p.probability).sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(top_k_predictions(&[], 3, |id| id.to_string()).is_empty());
    }

    #[test]
    fn final_logits_from_batched_output() {
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 4))
            .unwrap();
        assert_eq!(final_position_logits(&t, 3, None).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);

        let t2 = t.get(0).unwrap();
        assert_eq!(final_position_logits(&t2, 3, None).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn final_logits_from_flat_output() {
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu).unwrap();
        assert_eq!(final_position_logits(&t, 3, None).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);
        assert_eq!(final_position_logits(&t, 3, Some(6)).unwrap().len(), 6);
    }

    #[test]
    fn vocab_hint_outranks_flattened_shape() {
        let t = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 12))
            .unwrap();
        assert_eq!(final_position_logits(&t, 3, Some(4)).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);

        // A hint that does not divide the length falls back to the shape.
        let t2 = Tensor::arange(0f32, 12.0, &Device::Cpu)
            .unwrap()
            .reshape((3, 4))
            .unwrap();
        assert_eq!(final_position_logits(&t2, 3, Some(5)).unwrap(), vec![8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn final_logits_rejects_degenerate_tensors() {
        let scalar = Tensor::new(1f32, &Device::Cpu).unwrap();
        assert!(final_position_logits(&scalar, 1, None).is_err());
        let empty = Tensor::zeros((0,), DType::F32, &Device::Cpu).unwrap();
        assert!(final_position_logits(&empty, 1, None).is_err());
    }

    #[test]
    fn format_token_escapes() {
        assert_eq!(format_token("hello\nworld"), "hello\\nworld");
        assert_eq!(format_token("tab\there"), "tab\\there");
        assert_eq!(format_token("no_escapes"), "no_escapes");
    }
}

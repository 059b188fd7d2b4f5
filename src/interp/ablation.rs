// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention-head ablation and impact estimation.
//!
//! Estimates what disabling a set of heads would do to the next-token
//! distribution *without* re-running the model:
//!
//! 1. **Head importance** from the final query row of each masked head:
//!    focus (one minus normalized entropy) and recency (mass on the last few
//!    keys), weighted by depth.
//! 2. **Ablation strength** `√(masked / total) · (base + gain · mean importance)`.
//! 3. **Counterfactual logits**: the top original tokens lose
//!    `strength · p · e^(-decay·rank) · scale` from their logit.
//! 4. **Report**: top-1 before and after, entropy change, `KL(original ‖
//!    counterfactual)` and rank changes.
//!
//! The numbers are an estimate and every report says so through
//! [`AblationMethod::Heuristic`]. The estimator sits behind
//! [`AblationEstimator`] so an exact (re-run) implementation can produce the
//! same [`AblationReport`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{AttentionSource, AttentionTensor, ResolvedAttention};
use crate::error::{MIError, Result};
use crate::interp::circuits::{CircuitFinding, CircuitKind};
use crate::util::stats::{argsort_desc, entropy_bits, kl_divergence, softmax};

// ===========================================================================
// Part 1: Ablation mask
// ===========================================================================

/// Set of unique `(layer, head)` pairs to ablate.
///
/// # Example
///
/// ```
/// use circuit_lens::AblationMask;
///
/// let mask = AblationMask::new().head(5, 1).head(5, 1).head(2, 0);
/// assert_eq!(mask.len(), 2);
/// assert!(mask.contains(2, 0));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[must_use]
pub struct AblationMask {
    /// Heads to ablate, ordered by layer then head.
    heads: BTreeSet<(usize, usize)>,
}

impl AblationMask {
    /// An empty mask.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one head.
    pub fn head(mut self, layer: usize, head: usize) -> Self {
        self.heads.insert((layer, head));
        self
    }

    /// Add several heads.
    pub fn heads(mut self, heads: &[(usize, usize)]) -> Self {
        self.heads.extend(heads.iter().copied());
        self
    }

    /// Every head with a finding of the given kind.
    pub fn from_findings(findings: &[CircuitFinding], kind: CircuitKind) -> Self {
        Self {
            heads: findings
                .iter()
                .filter(|f| f.kind == kind)
                .map(|f| (f.layer, f.head))
                .collect(),
        }
    }

    /// Whether the mask contains a head.
    #[must_use]
    pub fn contains(&self, layer: usize, head: usize) -> bool {
        self.heads.contains(&(layer, head))
    }

    /// Number of heads in the mask.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heads.len()
    }

    /// Whether the mask is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Iterate over `(layer, head)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.heads.iter().copied()
    }

    /// Check every head against the tensor's dimensions.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] naming the first head outside the tensor.
    pub fn validate(&self, tensor: &AttentionTensor) -> Result<()> {
        for (layer, head) in self.iter() {
            if layer >= tensor.n_layers() {
                return Err(MIError::Intervention(format!(
                    "layer {layer} out of range (attention has {} layers)",
                    tensor.n_layers()
                )));
            }
            if head >= tensor.n_heads() {
                return Err(MIError::Intervention(format!(
                    "head {head} out of range (attention has {} heads)",
                    tensor.n_heads()
                )));
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Part 2: Parameters
// ===========================================================================

/// Tunable constants of the heuristic estimator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AblationParams {
    /// Only this many of the most likely tokens are penalized.
    pub top_k_penalized: usize,
    /// Exponential decay of the penalty with (0-based) rank.
    pub rank_decay: f32,
    /// Overall penalty multiplier.
    pub penalty_scale: f32,
    /// Weight of the focus score in head importance.
    pub focus_weight: f32,
    /// Weight of the recency score in head importance.
    pub recency_weight: f32,
    /// Number of trailing key positions counted as recent.
    pub recency_window: usize,
    /// Added to the squared depth fraction.
    pub depth_floor: f32,
    /// Strength floor before importance is considered.
    pub strength_base: f32,
    /// Strength gain per unit of mean importance.
    pub strength_gain: f32,
    /// Number of original top tokens reported in rank changes.
    pub reported_ranks: usize,
}

impl Default for AblationParams {
    fn default() -> Self {
        Self {
            top_k_penalized: 10,
            rank_decay: 0.3,
            penalty_scale: 8.0,
            focus_weight: 0.6,
            recency_weight: 0.4,
            recency_window: 5,
            depth_floor: 0.1,
            strength_base: 0.5,
            strength_gain: 1.5,
            reported_ranks: 5,
        }
    }
}

// ===========================================================================
// Part 3: Report types
// ===========================================================================

/// How an ablation impact was obtained.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AblationMethod {
    /// Estimated from attention statistics without re-running the model.
    Heuristic,
}

/// Rank and probability of one original top token before and after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankChange {
    /// Decoded token.
    pub token: String,
    /// Token ID.
    pub token_id: u32,
    /// 1-based rank under the original distribution.
    pub original_rank: usize,
    /// 1-based rank under the counterfactual distribution.
    pub ablated_rank: usize,
    /// Original probability.
    pub original_prob: f32,
    /// Counterfactual probability.
    pub ablated_prob: f32,
    /// `ablated_prob - original_prob`.
    pub prob_change: f32,
}

/// Distributional comparison between original and counterfactual output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationImpact {
    /// Most likely token originally.
    pub original_top_token: String,
    /// Its original probability.
    pub original_top_prob: f32,
    /// Most likely token after ablation.
    pub ablated_top_token: String,
    /// Its counterfactual probability.
    pub ablated_top_prob: f32,
    /// Change in the original top token's probability (negative means lost mass).
    pub probability_shift: f32,
    /// Counterfactual minus original entropy, in bits.
    pub entropy_change: f32,
    /// `KL(original ‖ counterfactual)` in nats; never negative.
    pub kl_divergence: f32,
    /// Rank changes for the original top tokens.
    pub rank_changes: Vec<RankChange>,
    /// Estimated ablation strength that produced the counterfactual.
    pub ablation_strength: f32,
    /// Fidelity of the attention the estimate was built on.
    pub attention_source: AttentionSource,
    /// How the estimate was obtained.
    pub method: AblationMethod,
}

/// Share of one masked head in the total importance of the mask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadContribution {
    /// Layer index.
    pub layer: usize,
    /// Head index.
    pub head: usize,
    /// Depth-weighted importance.
    pub importance: f32,
    /// Percentage of the summed importance across the mask.
    pub percent: f32,
}

/// Everything an ablation request returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AblationReport {
    /// Distributional impact.
    pub impact: AblationImpact,
    /// Masked heads, most important first.
    pub contributions: Vec<HeadContribution>,
    /// Attention with masked heads uniform-filled.
    pub ablated_attention: AttentionTensor,
}

// ===========================================================================
// Part 4: Building blocks
// ===========================================================================

/// Deep copy with every masked head replaced by uniform attention.
///
/// Masked heads get `1 / seq_len` at every key position and are flagged
/// uniform-filled; all other heads are untouched. An empty mask returns an
/// equal, independent copy.
///
/// # Errors
///
/// Returns [`MIError::Intervention`] if the mask references a head outside
/// the tensor.
pub fn apply_ablation(tensor: &AttentionTensor, mask: &AblationMask) -> Result<AttentionTensor> {
    mask.validate(tensor)?;
    let mut ablated = tensor.clone();
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let uniform = 1.0 / tensor.seq_len().max(1) as f32;
    for (layer, head) in mask.iter() {
        if let Some(matrix) = ablated.head_mut(layer, head) {
            matrix.fill(uniform);
        }
        ablated.mark_uniform_filled(layer, head);
    }
    Ok(ablated)
}

/// Depth-weighted importance of one head, from its final query row.
///
/// `(focus_weight · focus + recency_weight · recency) · (((layer+1)/n_layers)² + depth_floor)`
/// where `focus = 1 - entropy / log2(seq_len)` and `recency` is the mean
/// weight on the last `min(recency_window, seq_len)` keys. Returns `0.0` for
/// heads outside the tensor.
#[must_use]
pub fn head_importance(
    tensor: &AttentionTensor,
    layer: usize,
    head: usize,
    params: &AblationParams,
) -> f32 {
    let seq_len = tensor.seq_len();
    let Some(row) = seq_len
        .checked_sub(1)
        .and_then(|last| tensor.row(layer, head, last))
    else {
        return 0.0;
    };

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let max_entropy = (seq_len as f32).log2();
    let normalized = if max_entropy > 0.0 {
        (entropy_bits(row) / max_entropy).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let focus = 1.0 - normalized;

    let window = params.recency_window.min(seq_len).max(1);
    let recent = row.get(seq_len - window..).unwrap_or(&[]);
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let recency = recent.iter().sum::<f32>() / window as f32;

    let base = params.focus_weight * focus + params.recency_weight * recency;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let depth = ((layer + 1) as f32 / tensor.n_layers().max(1) as f32).powi(2) + params.depth_floor;
    base * depth
}

/// Overall strength of ablating `mask`: `√fraction · (base + gain · mean importance)`.
///
/// Zero for an empty mask or a tensor without heads.
#[must_use]
pub fn ablation_strength(
    tensor: &AttentionTensor,
    mask: &AblationMask,
    params: &AblationParams,
) -> f32 {
    let total = tensor.total_heads();
    if mask.is_empty() || total == 0 {
        return 0.0;
    }
    let importance_sum: f32 = mask
        .iter()
        .map(|(l, h)| head_importance(tensor, l, h, params))
        .sum();
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let (masked, total) = (mask.len() as f32, total as f32);
    let mean_importance = importance_sum / masked;
    (masked / total).min(1.0).sqrt() * (params.strength_base + params.strength_gain * mean_importance)
}

/// Penalize the most likely tokens' logits.
///
/// For the top `top_k_penalized` tokens by original probability, subtracts
/// `strength · p · e^(-rank_decay · rank) · penalty_scale` (rank 0 is the
/// most likely token). Every other logit is unchanged.
#[must_use]
pub fn counterfactual_logits(logits: &[f32], strength: f32, params: &AblationParams) -> Vec<f32> {
    let probs = softmax(logits);
    let mut out = logits.to_vec();
    for (rank, &idx) in argsort_desc(&probs)
        .iter()
        .take(params.top_k_penalized)
        .enumerate()
    {
        let p = probs.get(idx).copied().unwrap_or(0.0);
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let decay = (-params.rank_decay * rank as f32).exp();
        if let Some(logit) = out.get_mut(idx) {
            *logit -= strength * p * decay * params.penalty_scale;
        }
    }
    out
}

/// Importance of each masked head as a share of the mask total, highest first.
#[must_use]
pub fn head_contributions(
    tensor: &AttentionTensor,
    mask: &AblationMask,
    params: &AblationParams,
) -> Vec<HeadContribution> {
    let mut contributions: Vec<HeadContribution> = mask
        .iter()
        .map(|(layer, head)| HeadContribution {
            layer,
            head,
            importance: head_importance(tensor, layer, head, params),
            percent: 0.0,
        })
        .collect();
    let total: f32 = contributions.iter().map(|c| c.importance).sum();
    if total > 0.0 {
        for c in &mut contributions {
            c.percent = c.importance / total * 100.0;
        }
    }
    contributions.sort_by(|a, b| b.importance.total_cmp(&a.importance));
    contributions
}

/// Token ID for a vocabulary index.
fn token_id(idx: usize) -> u32 {
    u32::try_from(idx).unwrap_or(u32::MAX)
}

/// Compare the original and counterfactual distributions.
fn compare_distributions(
    logits: &[f32],
    counterfactual: &[f32],
    params: &AblationParams,
    decode: &dyn Fn(u32) -> String,
) -> (AblationImpactCore, Vec<RankChange>) {
    let p = softmax(logits);
    let q = softmax(counterfactual);
    let p_order = argsort_desc(&p);
    let q_order = argsort_desc(&q);

    let mut q_rank = vec![0_usize; q.len()];
    for (rank, &idx) in q_order.iter().enumerate() {
        if let Some(slot) = q_rank.get_mut(idx) {
            *slot = rank;
        }
    }

    let top_p = p_order.first().copied().unwrap_or(0);
    let top_q = q_order.first().copied().unwrap_or(0);
    let prob = |dist: &[f32], idx: usize| dist.get(idx).copied().unwrap_or(0.0);

    let rank_changes = p_order
        .iter()
        .take(params.reported_ranks)
        .enumerate()
        .map(|(rank, &idx)| RankChange {
            token: decode(token_id(idx)),
            token_id: token_id(idx),
            original_rank: rank + 1,
            ablated_rank: q_rank.get(idx).copied().unwrap_or(rank) + 1,
            original_prob: prob(&p, idx),
            ablated_prob: prob(&q, idx),
            prob_change: prob(&q, idx) - prob(&p, idx),
        })
        .collect();

    let core = AblationImpactCore {
        original_top: (decode(token_id(top_p)), prob(&p, top_p)),
        ablated_top: (decode(token_id(top_q)), prob(&q, top_q)),
        probability_shift: prob(&q, top_p) - prob(&p, top_p),
        entropy_change: entropy_bits(&q) - entropy_bits(&p),
        kl_divergence: kl_divergence(&p, &q),
    };
    (core, rank_changes)
}

/// Scalar part of an [`AblationImpact`].
struct AblationImpactCore {
    /// Original top token and probability.
    original_top: (String, f32),
    /// Counterfactual top token and probability.
    ablated_top: (String, f32),
    /// Shift of the original top token.
    probability_shift: f32,
    /// Entropy difference in bits.
    entropy_change: f32,
    /// KL in nats.
    kl_divergence: f32,
}

// ===========================================================================
// Part 5: Estimator
// ===========================================================================

/// Estimates the effect of ablating a set of heads.
///
/// Implementations return `Ok(None)` when there is nothing to estimate
/// (empty mask, no logits) and an error for masks that do not fit the
/// attention.
pub trait AblationEstimator: Send + Sync {
    /// How this estimator obtains its numbers.
    fn method(&self) -> AblationMethod;

    /// Estimate the impact of ablating `mask`.
    ///
    /// `logits` are the final-position logits of the original forward pass;
    /// `decode` maps token IDs to display strings.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] if the mask references heads
    /// outside `attention`.
    fn estimate(
        &self,
        attention: &ResolvedAttention,
        mask: &AblationMask,
        logits: &[f32],
        decode: &dyn Fn(u32) -> String,
    ) -> Result<Option<AblationReport>>;
}

/// The built-in estimator: attention statistics and a rank-decayed logit
/// penalty, no model re-run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeuristicAblation {
    /// Tunable constants.
    params: AblationParams,
}

impl HeuristicAblation {
    /// Create an estimator with the given parameters.
    #[must_use]
    pub const fn new(params: AblationParams) -> Self {
        Self { params }
    }

    /// The estimator's parameters.
    #[must_use]
    pub const fn params(&self) -> &AblationParams {
        &self.params
    }
}

impl AblationEstimator for HeuristicAblation {
    fn method(&self) -> AblationMethod {
        AblationMethod::Heuristic
    }

    fn estimate(
        &self,
        attention: &ResolvedAttention,
        mask: &AblationMask,
        logits: &[f32],
        decode: &dyn Fn(u32) -> String,
    ) -> Result<Option<AblationReport>> {
        if mask.is_empty() || logits.is_empty() {
            return Ok(None);
        }
        let tensor = &attention.tensor;
        let ablated_attention = apply_ablation(tensor, mask)?;

        let strength = ablation_strength(tensor, mask, &self.params);
        let counterfactual = counterfactual_logits(logits, strength, &self.params);
        let (core, rank_changes) =
            compare_distributions(logits, &counterfactual, &self.params, decode);

        debug!(
            heads = mask.len(),
            total_heads = tensor.total_heads(),
            strength,
            kl = core.kl_divergence,
            source = %attention.source,
            "estimated ablation impact"
        );

        let (original_top_token, original_top_prob) = core.original_top;
        let (ablated_top_token, ablated_top_prob) = core.ablated_top;
        Ok(Some(AblationReport {
            impact: AblationImpact {
                original_top_token,
                original_top_prob,
                ablated_top_token,
                ablated_top_prob,
                probability_shift: core.probability_shift,
                entropy_change: core.entropy_change,
                kl_divergence: core.kl_divergence,
                rank_changes,
                ablation_strength: strength,
                attention_source: attention.source,
                method: self.method(),
            },
            contributions: head_contributions(tensor, mask, &self.params),
            ablated_attention,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::indexing_slicing,
    clippy::cast_precision_loss,
    clippy::as_conversions
)]
mod tests {
    use super::*;
    use crate::interp::circuits::Confidence;
    use crate::interp::resolver::synthetic_attention;

    /// Causal uniform attention: row `i` spreads `1/(i+1)` over `j <= i`.
    fn causal_uniform(n_layers: usize, n_heads: usize, seq: usize) -> AttentionTensor {
        let mut data = Vec::with_capacity(n_layers * n_heads * seq * seq);
        for _ in 0..n_layers * n_heads {
            for i in 0..seq {
                for j in 0..seq {
                    data.push(if j <= i { 1.0 / (i + 1) as f32 } else { 0.0 });
                }
            }
        }
        AttentionTensor::new(n_layers, n_heads, seq, data).unwrap()
    }

    fn decode(id: u32) -> String {
        format!("tok{id}")
    }

    fn peaked_logits() -> Vec<f32> {
        let mut logits = vec![0.0; 32];
        logits[3] = 6.0;
        logits[7] = 4.0;
        logits[1] = 3.0;
        logits
    }

    #[test]
    fn mask_builder_dedups_and_validates() {
        let tensor = causal_uniform(2, 3, 4);
        let mask = AblationMask::new().heads(&[(0, 1), (1, 2), (0, 1)]);
        assert_eq!(mask.len(), 2);
        assert!(mask.validate(&tensor).is_ok());
        assert!(AblationMask::new().head(2, 0).validate(&tensor).is_err());
        assert!(AblationMask::new().head(0, 3).validate(&tensor).is_err());
    }

    #[test]
    fn mask_from_findings_filters_kind() {
        let finding = |kind, layer, head| CircuitFinding {
            kind,
            layer,
            head,
            score: 0.9,
            confidence: Confidence::High,
            evidence: String::new(),
            explanation: String::new(),
        };
        let findings = vec![
            finding(CircuitKind::PreviousToken, 0, 1),
            finding(CircuitKind::Induction, 1, 0),
            finding(CircuitKind::PreviousToken, 2, 3),
        ];
        let mask = AblationMask::from_findings(&findings, CircuitKind::PreviousToken);
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![(0, 1), (2, 3)]);
    }

    #[test]
    fn empty_mask_returns_equal_independent_copy() {
        let tensor = synthetic_attention(2, 2, 5, 11);
        let copy = apply_ablation(&tensor, &AblationMask::new()).unwrap();
        assert_eq!(copy, tensor);
        assert_ne!(copy.as_slice().as_ptr(), tensor.as_slice().as_ptr());
    }

    #[test]
    fn masked_heads_are_uniform_filled() {
        let tensor = synthetic_attention(2, 2, 4, 3);
        let mask = AblationMask::new().head(1, 0);
        let ablated = apply_ablation(&tensor, &mask).unwrap();

        assert!(ablated.is_uniform_filled(1, 0));
        assert!(!ablated.is_uniform_filled(0, 0));
        assert!(ablated.head(1, 0).unwrap().iter().all(|&w| w == 0.25));
        assert_eq!(ablated.head(0, 1), tensor.head(0, 1));
        // Original untouched and still causal.
        assert!(tensor.check_causal(1e-6).is_ok());
        assert!(ablated.check_causal(1e-6).is_ok());
    }

    #[test]
    fn out_of_range_mask_errors() {
        let tensor = causal_uniform(1, 2, 3);
        assert!(apply_ablation(&tensor, &AblationMask::new().head(0, 5)).is_err());
    }

    #[test]
    fn focused_late_heads_matter_more() {
        let params = AblationParams::default();
        let seq = 8;
        let mut data = causal_uniform(2, 1, seq).as_slice().to_vec();
        // Layer 1: final row attends only to the last token.
        let last_row = seq * seq + (seq - 1) * seq;
        for j in 0..seq {
            data[last_row + j] = if j == seq - 1 { 1.0 } else { 0.0 };
        }
        let tensor = AttentionTensor::new(2, 1, seq, data).unwrap();

        let early = head_importance(&tensor, 0, 0, &params);
        let late = head_importance(&tensor, 1, 0, &params);
        assert!(late > early);
        // focus 1, recency 0.2, depth 1.1
        assert!((late - (0.6 + 0.4 * 0.2) * 1.1).abs() < 1e-5);
    }

    #[test]
    fn two_of_seventy_two_strength_magnitude() {
        let tensor = causal_uniform(6, 12, 12);
        let mask = AblationMask::new().head(5, 0).head(5, 1);
        let strength = ablation_strength(&tensor, &mask, &AblationParams::default());
        // sqrt(2/72) ≈ 0.167 times a near-0.5 importance factor.
        let expected = (2.0_f32 / 72.0).sqrt() * 0.5;
        assert!(strength > expected, "{strength}");
        assert!(strength < 0.11, "{strength}");
    }

    #[test]
    fn zero_strength_leaves_logits_unchanged() {
        let logits = peaked_logits();
        let cf = counterfactual_logits(&logits, 0.0, &AblationParams::default());
        assert_eq!(cf, logits);
        let p = softmax(&logits);
        assert_eq!(kl_divergence(&p, &softmax(&cf)), 0.0);
    }

    #[test]
    fn penalty_only_touches_top_tokens() {
        let logits: Vec<f32> = (0..20).map(|i| i as f32 * 0.1).collect();
        let params = AblationParams::default();
        let cf = counterfactual_logits(&logits, 1.0, &params);
        // Indices 10..20 are the top 10; 0..10 unchanged.
        assert_eq!(&cf[..10], &logits[..10]);
        assert!(cf[19] < logits[19]);
    }

    #[test]
    fn heuristic_report() {
        let attention = ResolvedAttention {
            tensor: synthetic_attention(6, 12, 12, 5),
            source: AttentionSource::Synthetic,
        };
        let mask = AblationMask::new().head(5, 3).head(4, 7);
        let report = HeuristicAblation::default()
            .estimate(&attention, &mask, &peaked_logits(), &decode)
            .unwrap()
            .unwrap();
        let impact = &report.impact;

        assert_eq!(impact.method, AblationMethod::Heuristic);
        assert_eq!(impact.attention_source, AttentionSource::Synthetic);
        assert_eq!(impact.original_top_token, "tok3");
        assert!(impact.probability_shift < 0.0);
        assert!(impact.entropy_change > 0.0);
        assert!(impact.kl_divergence > 0.0);

        assert_eq!(impact.rank_changes.len(), 5);
        assert_eq!(impact.rank_changes[0].original_rank, 1);
        assert_eq!(impact.rank_changes[0].token_id, 3);
        assert_eq!(impact.rank_changes[1].token, "tok7");

        assert_eq!(report.contributions.len(), 2);
        let pct: f32 = report.contributions.iter().map(|c| c.percent).sum();
        assert!((pct - 100.0).abs() < 1e-3);
        assert!(report.contributions[0].importance >= report.contributions[1].importance);
        assert!(report.ablated_attention.is_uniform_filled(5, 3));
    }

    #[test]
    fn heuristic_returns_none_without_inputs() {
        let attention = ResolvedAttention {
            tensor: causal_uniform(1, 2, 3),
            source: AttentionSource::Real,
        };
        let est = HeuristicAblation::default();
        let none = est
            .estimate(&attention, &AblationMask::new(), &peaked_logits(), &decode)
            .unwrap();
        assert!(none.is_none());
        let none = est
            .estimate(&attention, &AblationMask::new().head(0, 0), &[], &decode)
            .unwrap();
        assert!(none.is_none());
        assert!(
            est.estimate(&attention, &AblationMask::new().head(3, 0), &peaked_logits(), &decode)
                .is_err()
        );
    }

    #[test]
    fn params_deserialize_with_defaults() {
        let params: AblationParams = serde_json::from_str(r#"{"penalty_scale": 4.0}"#).unwrap();
        assert_eq!(params.penalty_scale, 4.0);
        assert_eq!(params.top_k_penalized, 10);
    }
}

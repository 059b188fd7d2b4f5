// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit detection over attention tensors.
//!
//! Three detectors run independently over every `(layer, head)`:
//!
//! - **Previous-token**: mean of the sub-diagonal `m[i][i-1]`.
//! - **Induction**: for each repeated token at `j < i` with `j + 1 < i`,
//!   the attention `m[i][j+1]` to whatever followed the earlier occurrence.
//! - **Duplicate-token**: for each repeated token at `j < i`, the attention
//!   `m[i][j]` to the earlier occurrence itself.
//!
//! Induction and duplicate-token read different cells for the same pair of
//! positions and detect structurally different circuits. Scores are not on
//! comparable scales, so each detector has its own [`DetectorThresholds`].
//! Heads below a detector's emit threshold produce no finding.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::AttentionTensor;
use crate::interp::logit_lens::format_token;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// The circuit patterns the detector recognizes.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitKind {
    /// Attends to the immediately preceding position.
    PreviousToken,
    /// Attends to the token after an earlier occurrence of the current token.
    Induction,
    /// Attends to an earlier occurrence of the current token.
    DuplicateToken,
}

impl CircuitKind {
    /// All kinds, in detection order.
    pub const ALL: [Self; 3] = [Self::PreviousToken, Self::Induction, Self::DuplicateToken];

    /// Plain-language description of what a head of this kind does.
    #[must_use]
    pub const fn explanation(self) -> &'static str {
        match self {
            Self::PreviousToken => {
                "Attends to the immediately preceding token; often feeds positional \
                 information into later induction heads."
            }
            Self::Induction => {
                "When a token repeats, attends to the token that followed its earlier \
                 occurrence; supports in-context pattern completion."
            }
            Self::DuplicateToken => {
                "When a token repeats, attends back to its earlier occurrence; marks \
                 repeated content."
            }
        }
    }
}

impl fmt::Display for CircuitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PreviousToken => write!(f, "previous_token"),
            Self::Induction => write!(f, "induction"),
            Self::DuplicateToken => write!(f, "duplicate_token"),
        }
    }
}

/// Qualitative confidence band for a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Above the emit threshold but below medium.
    Low,
    /// At or above the medium threshold.
    Medium,
    /// At or above the high threshold.
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// One detected circuit head.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitFinding {
    /// Which pattern matched.
    pub kind: CircuitKind,
    /// Layer index.
    pub layer: usize,
    /// Head index within the layer.
    pub head: usize,
    /// Detector score in `[0, 1]`.
    pub score: f32,
    /// Confidence band for `score`.
    pub confidence: Confidence,
    /// Concrete example with positions and percentage.
    pub evidence: String,
    /// What this kind of head does.
    pub explanation: String,
}

/// Score bands for one detector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorThresholds {
    /// Findings are emitted only for scores strictly above this.
    pub emit: f32,
    /// Scores at or above this are [`Confidence::Medium`].
    pub medium: f32,
    /// Scores at or above this are [`Confidence::High`].
    pub high: f32,
}

impl DetectorThresholds {
    /// Create a set of thresholds.
    #[must_use]
    pub const fn new(emit: f32, medium: f32, high: f32) -> Self {
        Self { emit, medium, high }
    }

    /// Band a score, or `None` if it does not clear the emit threshold.
    #[must_use]
    pub fn classify(&self, score: f32) -> Option<Confidence> {
        if score >= self.high && score > self.emit {
            Some(Confidence::High)
        } else if score >= self.medium && score > self.emit {
            Some(Confidence::Medium)
        } else if score > self.emit {
            Some(Confidence::Low)
        } else {
            None
        }
    }
}

/// Per-detector thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Previous-token bands.
    pub previous_token: DetectorThresholds,
    /// Induction bands.
    pub induction: DetectorThresholds,
    /// Duplicate-token bands.
    pub duplicate_token: DetectorThresholds,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            previous_token: DetectorThresholds::new(0.30, 0.50, 0.70),
            induction: DetectorThresholds::new(0.20, 0.35, 0.50),
            duplicate_token: DetectorThresholds::new(0.25, 0.40, 0.60),
        }
    }
}

impl CircuitConfig {
    /// Thresholds for one detector.
    #[must_use]
    pub const fn thresholds(&self, kind: CircuitKind) -> &DetectorThresholds {
        match kind {
            CircuitKind::PreviousToken => &self.previous_token,
            CircuitKind::Induction => &self.induction,
            CircuitKind::DuplicateToken => &self.duplicate_token,
        }
    }
}

/// Raw output of one detector on one head.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorScore {
    /// Mean attention over the detector's cells.
    pub score: f32,
    /// Best single example.
    pub evidence: String,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// `m[i][j]` for a row-major `seq × seq` matrix; zero when out of range.
fn cell(matrix: &[f32], seq_len: usize, i: usize, j: usize) -> f32 {
    matrix.get(i * seq_len + j).copied().unwrap_or(0.0)
}

/// Tokens compare equal after trimming and lowercasing; blank tokens never match.
fn normalize(token: &str) -> String {
    token.trim().to_lowercase()
}

/// Every pair `(j, i)` with `j < i` whose normalized tokens are equal.
fn repeated_pairs(tokens: &[String]) -> Vec<(usize, usize)> {
    let normalized: Vec<String> = tokens.iter().map(|t| normalize(t)).collect();
    let mut pairs = Vec::new();
    for (i, ti) in normalized.iter().enumerate() {
        if ti.is_empty() {
            continue;
        }
        for (j, tj) in normalized.iter().enumerate().take(i) {
            if ti == tj {
                pairs.push((j, i));
            }
        }
    }
    pairs
}

/// Display a token at a position, or `?` if out of range.
fn token_at(tokens: &[String], pos: usize) -> String {
    tokens.get(pos).map_or_else(|| "?".to_string(), |t| format_token(t))
}

/// Mean of the sub-diagonal `m[i][i-1]` for `i = 1..seq_len`.
///
/// `None` when `seq_len < 2`.
#[must_use]
pub fn previous_token_score(
    matrix: &[f32],
    seq_len: usize,
    tokens: &[String],
) -> Option<DetectorScore> {
    if seq_len < 2 {
        return None;
    }
    let mut sum = 0.0_f32;
    let mut best = (1, f32::NEG_INFINITY);
    for i in 1..seq_len {
        let w = cell(matrix, seq_len, i, i - 1);
        sum += w;
        if w > best.1 {
            best = (i, w);
        }
    }
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let score = sum / (seq_len - 1) as f32;
    let (pos, w) = best;
    Some(DetectorScore {
        score,
        evidence: format!(
            "position {pos} ('{}') attends to position {} ('{}') with {:.1}%",
            token_at(tokens, pos),
            pos - 1,
            token_at(tokens, pos - 1),
            w * 100.0
        ),
    })
}

/// Mean of `m[i][j+1]` over repeated-token pairs `j < i` with `j + 1 < i`.
///
/// `None` when no such pair exists.
#[must_use]
pub fn induction_score(
    matrix: &[f32],
    seq_len: usize,
    tokens: &[String],
) -> Option<DetectorScore> {
    let limit = seq_len.min(tokens.len());
    let mut sum = 0.0_f32;
    let mut count = 0_usize;
    let mut best: Option<(usize, usize, f32)> = None;

    for (j, i) in repeated_pairs(tokens.get(..limit).unwrap_or(tokens)) {
        if j + 1 >= i {
            continue;
        }
        let w = cell(matrix, seq_len, i, j + 1);
        sum += w;
        count += 1;
        if best.is_none_or(|(_, _, b)| w > b) {
            best = Some((j, i, w));
        }
    }

    let (j, i, w) = best?;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let score = sum / count as f32;
    Some(DetectorScore {
        score,
        evidence: format!(
            "position {i} ('{}') attends to position {} ('{}'), which followed the \
             earlier occurrence at position {j}, with {:.1}%",
            token_at(tokens, i),
            j + 1,
            token_at(tokens, j + 1),
            w * 100.0
        ),
    })
}

/// Mean of `m[i][j]` over repeated-token pairs `j < i`.
///
/// `None` when no token repeats.
#[must_use]
pub fn duplicate_token_score(
    matrix: &[f32],
    seq_len: usize,
    tokens: &[String],
) -> Option<DetectorScore> {
    let limit = seq_len.min(tokens.len());
    let mut sum = 0.0_f32;
    let mut count = 0_usize;
    let mut best: Option<(usize, usize, f32)> = None;

    for (j, i) in repeated_pairs(tokens.get(..limit).unwrap_or(tokens)) {
        let w = cell(matrix, seq_len, i, j);
        sum += w;
        count += 1;
        if best.is_none_or(|(_, _, b)| w > b) {
            best = Some((j, i, w));
        }
    }

    let (j, i, w) = best?;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let score = sum / count as f32;
    Some(DetectorScore {
        score,
        evidence: format!(
            "position {i} ('{}') attends to its earlier occurrence at position {j} with {:.1}%",
            token_at(tokens, i),
            w * 100.0
        ),
    })
}

/// Run one detector on one head.
fn score_head(
    kind: CircuitKind,
    matrix: &[f32],
    seq_len: usize,
    tokens: &[String],
) -> Option<DetectorScore> {
    match kind {
        CircuitKind::PreviousToken => previous_token_score(matrix, seq_len, tokens),
        CircuitKind::Induction => induction_score(matrix, seq_len, tokens),
        CircuitKind::DuplicateToken => duplicate_token_score(matrix, seq_len, tokens),
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Scan every head for every circuit kind.
///
/// Returns findings sorted by score, highest first, with all kinds mixed.
/// A head may appear under several kinds. Ties keep detection order
/// (layer, head, then [`CircuitKind::ALL`] order).
#[must_use]
pub fn detect_circuits(
    tensor: &AttentionTensor,
    tokens: &[String],
    config: &CircuitConfig,
) -> Vec<CircuitFinding> {
    let seq_len = tensor.seq_len();
    if tokens.len() != seq_len {
        warn!(
            tokens = tokens.len(),
            seq_len, "token count differs from attention length; repeated-token detectors use the overlap"
        );
    }

    let mut findings = Vec::new();
    for layer in 0..tensor.n_layers() {
        for head in 0..tensor.n_heads() {
            let Some(matrix) = tensor.head(layer, head) else {
                continue;
            };
            for kind in CircuitKind::ALL {
                let Some(scored) = score_head(kind, matrix, seq_len, tokens) else {
                    continue;
                };
                let Some(confidence) = config.thresholds(kind).classify(scored.score) else {
                    continue;
                };
                findings.push(CircuitFinding {
                    kind,
                    layer,
                    head,
                    score: scored.score.clamp(0.0, 1.0),
                    confidence,
                    evidence: scored.evidence,
                    explanation: kind.explanation().to_string(),
                });
            }
        }
    }

    findings.sort_by(|a, b| b.score.total_cmp(&a.score));
    findings
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::float_cmp,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    fn toks(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    /// Row-major matrix from rows.
    fn flat(rows: &[&[f32]]) -> Vec<f32> {
        rows.iter().flat_map(|r| r.iter().copied()).collect()
    }

    /// `m[i][i-1] = 1` for `i >= 1`, `m[0][0] = 1`.
    fn shifted_identity(seq: usize) -> Vec<f32> {
        let mut m = vec![0.0; seq * seq];
        m[0] = 1.0;
        for i in 1..seq {
            m[i * seq + i - 1] = 1.0;
        }
        m
    }

    #[test]
    fn previous_token_on_shifted_identity_is_one() {
        let seq = 6;
        let m = shifted_identity(seq);
        let scored = previous_token_score(&m, seq, &toks(&["a"; 6])).unwrap();
        assert_eq!(scored.score, 1.0);
        assert!(scored.evidence.contains("100.0%"));
    }

    #[test]
    fn previous_token_needs_two_positions() {
        assert!(previous_token_score(&[1.0], 1, &toks(&["a"])).is_none());
    }

    #[test]
    fn induction_on_abca() {
        let tokens = toks(&["A", "B", "C", "A"]);
        let m = flat(&[
            &[1.0, 0.0, 0.0, 0.0],
            &[0.5, 0.5, 0.0, 0.0],
            &[0.3, 0.3, 0.4, 0.0],
            &[0.02, 0.05, 0.9, 0.03],
        ]);
        let scored = induction_score(&m, 4, &tokens).unwrap();
        // Only pair (0, 3): reads m[3][1].
        assert!((scored.score - 0.05).abs() < 1e-6);
        assert!(scored.score > 0.0);
        assert!(scored.evidence.contains("position 3"));
    }

    #[test]
    fn induction_and_duplicate_read_different_cells() {
        let tokens = toks(&["A", "B", "C", "A"]);
        let m = flat(&[
            &[1.0, 0.0, 0.0, 0.0],
            &[0.5, 0.5, 0.0, 0.0],
            &[0.3, 0.3, 0.4, 0.0],
            &[0.7, 0.2, 0.05, 0.05],
        ]);
        let induction = induction_score(&m, 4, &tokens).unwrap();
        let duplicate = duplicate_token_score(&m, 4, &tokens).unwrap();
        assert!((induction.score - 0.2).abs() < 1e-6);
        assert!((duplicate.score - 0.7).abs() < 1e-6);
        assert!(duplicate.evidence.contains("position 0"));
    }

    #[test]
    fn adjacent_repeats_are_not_induction_pairs() {
        let tokens = toks(&["x", "x"]);
        let m = flat(&[&[1.0, 0.0], &[0.4, 0.6]]);
        assert!(induction_score(&m, 2, &tokens).is_none());
        assert!(duplicate_token_score(&m, 2, &tokens).is_some());
    }

    #[test]
    fn tokens_match_case_insensitively_and_trimmed() {
        let tokens = toks(&["The", "cat", " the"]);
        let m = flat(&[&[1.0, 0.0, 0.0], &[0.5, 0.5, 0.0], &[0.8, 0.1, 0.1]]);
        let dup = duplicate_token_score(&m, 3, &tokens).unwrap();
        assert!((dup.score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn no_repeats_no_token_scores() {
        let tokens = toks(&["a", "b", "c"]);
        let m = shifted_identity(3);
        assert!(induction_score(&m, 3, &tokens).is_none());
        assert!(duplicate_token_score(&m, 3, &tokens).is_none());
    }

    #[test]
    fn confidence_bands() {
        let t = CircuitConfig::default().previous_token;
        assert_eq!(t.classify(0.30), None);
        assert_eq!(t.classify(0.31), Some(Confidence::Low));
        assert_eq!(t.classify(0.50), Some(Confidence::Medium));
        assert_eq!(t.classify(0.95), Some(Confidence::High));
    }

    #[test]
    fn induction_confidence_bands() {
        let t = CircuitConfig::default().induction;
        assert_eq!(t.classify(0.20), None);
        assert_eq!(t.classify(0.21), Some(Confidence::Low));
        assert_eq!(t.classify(0.35), Some(Confidence::Medium));
        assert_eq!(t.classify(0.49), Some(Confidence::Medium));
        assert_eq!(t.classify(0.50), Some(Confidence::High));
    }

    #[test]
    fn duplicate_token_confidence_bands() {
        let t = CircuitConfig::default().duplicate_token;
        assert_eq!(t.classify(0.25), None);
        assert_eq!(t.classify(0.26), Some(Confidence::Low));
        assert_eq!(t.classify(0.40), Some(Confidence::Medium));
        assert_eq!(t.classify(0.59), Some(Confidence::Medium));
        assert_eq!(t.classify(0.60), Some(Confidence::High));
        // A score that is only low for duplicate-token is medium for induction.
        assert_eq!(
            CircuitConfig::default().induction.classify(0.36),
            Some(Confidence::Medium)
        );
        assert_eq!(t.classify(0.36), Some(Confidence::Low));
    }

    #[test]
    fn repeated_prompt_yields_previous_token_finding() {
        let tokens = toks(&[
            "The", "cat", "sat", "on", "the", "mat", ".", "The", "cat", "sat", "on", "the",
        ]);
        let seq = tokens.len();
        let mut m = vec![0.0; seq * seq];
        m[0] = 1.0;
        for i in 1..seq {
            m[i * seq + i - 1] = 0.8;
            m[i * seq + i] = 0.2;
        }
        let tensor = AttentionTensor::new(1, 1, seq, m).unwrap();
        assert!(tensor.check_causal(1e-6).is_ok());

        let findings = detect_circuits(&tensor, &tokens, &CircuitConfig::default());
        let top = findings.first().unwrap();
        assert_eq!(top.kind, CircuitKind::PreviousToken);
        assert!(top.score > 0.3);
        assert_eq!(top.confidence, Confidence::High);
        assert_eq!((top.layer, top.head), (0, 0));
    }

    #[test]
    fn findings_sorted_across_kinds() {
        let seq = 4;
        let tokens = toks(&["A", "B", "C", "A"]);
        // Head 0: previous-token 0.6; head 1: duplicate-token, m[3][0] = 0.9.
        let mut data = Vec::new();
        data.extend(flat(&[
            &[1.0, 0.0, 0.0, 0.0],
            &[0.6, 0.4, 0.0, 0.0],
            &[0.0, 0.6, 0.4, 0.0],
            &[0.0, 0.0, 0.6, 0.4],
        ]));
        data.extend(flat(&[
            &[1.0, 0.0, 0.0, 0.0],
            &[1.0, 0.0, 0.0, 0.0],
            &[1.0, 0.0, 0.0, 0.0],
            &[0.9, 0.0, 0.0, 0.1],
        ]));
        let tensor = AttentionTensor::new(1, 2, seq, data).unwrap();
        let findings = detect_circuits(&tensor, &tokens, &CircuitConfig::default());

        assert!(findings.len() >= 2);
        for pair in findings.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
        assert_eq!(findings[0].kind, CircuitKind::DuplicateToken);
        assert_eq!(findings[0].head, 1);
        assert!(
            findings
                .iter()
                .any(|f| f.kind == CircuitKind::PreviousToken && f.head == 0)
        );
    }

    #[test]
    fn empty_tensor_has_no_findings() {
        let findings = detect_circuits(&AttentionTensor::empty(), &[], &CircuitConfig::default());
        assert!(findings.is_empty());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&CircuitKind::DuplicateToken).unwrap();
        assert_eq!(json, "\"duplicate_token\"");
        assert_eq!(CircuitKind::PreviousToken.to_string(), "previous_token");
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Normalized attention tensor and its provenance tag.
//!
//! [`AttentionTensor`] stores post-softmax attention for every layer and head
//! of one forward pass in a single row-major buffer, regardless of where the
//! weights came from. [`AttentionSource`] records where they came from; the
//! pair travels together as [`ResolvedAttention`].
//!
//! Logical shape is `[layers, heads, seq_q, seq_k]` with `seq_q == seq_k`.

use std::collections::BTreeSet;
use std::fmt;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{MIError, Result};

/// Where the attention weights in an [`AttentionTensor`] came from.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionSource {
    /// Read from the model's attention outputs, or recomputed exactly from
    /// captured queries and keys.
    Real,
    /// Reconstructed from cached keys alone (`K·Kᵀ` similarity proxy).
    KvDerived,
    /// Pseudo-random causal filler. Conclusions drawn from it are invalid.
    Synthetic,
}

impl AttentionSource {
    /// Whether the weights are random filler rather than model data.
    #[must_use]
    pub const fn is_synthetic(self) -> bool {
        matches!(self, Self::Synthetic)
    }

    /// Whether the weights are the model's actual attention.
    #[must_use]
    pub const fn is_trustworthy(self) -> bool {
        matches!(self, Self::Real)
    }
}

impl fmt::Display for AttentionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::KvDerived => write!(f, "kv_derived"),
            Self::Synthetic => write!(f, "synthetic"),
        }
    }
}

/// Per-layer, per-head attention weights from one forward pass.
///
/// Rows are query positions and columns key positions. For every head not
/// flagged as uniform-filled, entries above the diagonal are zero and each
/// row sums to one.
///
/// # Example
///
/// ```
/// use circuit_lens::AttentionTensor;
///
/// // 1 layer, 1 head, 2 positions
/// let t = AttentionTensor::new(1, 1, 2, vec![1.0, 0.0, 0.4, 0.6]).unwrap();
/// assert_eq!(t.get(0, 0, 1, 0), Some(0.4));
/// assert!(t.check_causal(1e-6).is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttentionTensor {
    /// Number of layers.
    n_layers: usize,
    /// Heads per layer.
    n_heads: usize,
    /// Sequence length (query and key).
    seq_len: usize,
    /// Row-major `[layers, heads, seq_q, seq_k]` weights.
    data: Vec<f32>,
    /// Heads overwritten with uniform attention by ablation.
    uniform_filled: BTreeSet<(usize, usize)>,
}

impl AttentionTensor {
    /// Build a tensor from a flat row-major buffer.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `data.len()` is not
    /// `n_layers * n_heads * seq_len * seq_len`.
    pub fn new(n_layers: usize, n_heads: usize, seq_len: usize, data: Vec<f32>) -> Result<Self> {
        let expected = n_layers * n_heads * seq_len * seq_len;
        if data.len() != expected {
            return Err(MIError::Hook(format!(
                "attention buffer has {} values, expected {expected} \
                 ({n_layers} layers x {n_heads} heads x {seq_len}^2)",
                data.len()
            )));
        }
        Ok(Self {
            n_layers,
            n_heads,
            seq_len,
            data,
            uniform_filled: BTreeSet::new(),
        })
    }

    /// An empty tensor (no layers, no heads, no positions).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            n_layers: 0,
            n_heads: 0,
            seq_len: 0,
            data: Vec::new(),
            uniform_filled: BTreeSet::new(),
        }
    }

    /// Number of layers.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Heads per layer.
    #[must_use]
    pub const fn n_heads(&self) -> usize {
        self.n_heads
    }

    /// Sequence length.
    #[must_use]
    pub const fn seq_len(&self) -> usize {
        self.seq_len
    }

    /// Total number of heads across all layers.
    #[must_use]
    pub const fn total_heads(&self) -> usize {
        self.n_layers * self.n_heads
    }

    /// Whether the tensor holds no attention at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The raw row-major buffer.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Offset of the first value of `(layer, head)` in the buffer.
    const fn head_offset(&self, layer: usize, head: usize) -> usize {
        (layer * self.n_heads + head) * self.seq_len * self.seq_len
    }

    /// The `seq × seq` matrix of one head, row-major.
    #[must_use]
    pub fn head(&self, layer: usize, head: usize) -> Option<&[f32]> {
        if layer >= self.n_layers || head >= self.n_heads {
            return None;
        }
        let start = self.head_offset(layer, head);
        self.data.get(start..start + self.seq_len * self.seq_len)
    }

    /// Mutable access to one head's matrix.
    pub(crate) fn head_mut(&mut self, layer: usize, head: usize) -> Option<&mut [f32]> {
        if layer >= self.n_layers || head >= self.n_heads {
            return None;
        }
        let start = self.head_offset(layer, head);
        let len = self.seq_len * self.seq_len;
        self.data.get_mut(start..start + len)
    }

    /// One query row of one head.
    #[must_use]
    pub fn row(&self, layer: usize, head: usize, query: usize) -> Option<&[f32]> {
        if query >= self.seq_len {
            return None;
        }
        let seq = self.seq_len;
        self.head(layer, head)
            .and_then(|m| m.get(query * seq..(query + 1) * seq))
    }

    /// A single weight: how much `query` attends to `key`.
    #[must_use]
    pub fn get(&self, layer: usize, head: usize, query: usize, key: usize) -> Option<f32> {
        if key >= self.seq_len {
            return None;
        }
        self.row(layer, head, query).and_then(|r| r.get(key).copied())
    }

    /// Flag a head as overwritten with uniform attention.
    pub(crate) fn mark_uniform_filled(&mut self, layer: usize, head: usize) {
        self.uniform_filled.insert((layer, head));
    }

    /// Whether a head was overwritten with uniform attention by ablation.
    #[must_use]
    pub fn is_uniform_filled(&self, layer: usize, head: usize) -> bool {
        self.uniform_filled.contains(&(layer, head))
    }

    /// All heads flagged as uniform-filled.
    #[must_use]
    pub const fn uniform_filled_heads(&self) -> &BTreeSet<(usize, usize)> {
        &self.uniform_filled
    }

    /// Verify causality and row normalization for every non-ablated head.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] naming the first row that has weight on a
    /// future position or does not sum to one within `tolerance`.
    pub fn check_causal(&self, tolerance: f32) -> Result<()> {
        for layer in 0..self.n_layers {
            for head in 0..self.n_heads {
                if self.is_uniform_filled(layer, head) {
                    continue;
                }
                for i in 0..self.seq_len {
                    let row = self.row(layer, head, i).unwrap_or(&[]);
                    let mut sum = 0.0_f32;
                    for (j, &w) in row.iter().enumerate() {
                        if j > i && w != 0.0 {
                            return Err(MIError::Hook(format!(
                                "layer {layer} head {head}: row {i} attends to future position {j}"
                            )));
                        }
                        sum += w;
                    }
                    if (sum - 1.0).abs() > tolerance {
                        return Err(MIError::Hook(format!(
                            "layer {layer} head {head}: row {i} sums to {sum}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Attention FROM a query position, averaged across heads.
    ///
    /// # Shapes
    ///
    /// - returns: `[seq_k]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer or position is out of range.
    pub fn attention_from_position(&self, layer: usize, position: usize) -> Result<Vec<f32>> {
        if layer >= self.n_layers {
            return Err(MIError::Hook(format!(
                "layer {layer} not in attention tensor ({} layers)",
                self.n_layers
            )));
        }
        if position >= self.seq_len {
            return Err(MIError::Hook(format!(
                "position {position} out of range (seq_len={})",
                self.seq_len
            )));
        }

        let mut avg = vec![0.0_f32; self.seq_len];
        for head in 0..self.n_heads {
            if let Some(row) = self.row(layer, head, position) {
                for (a, w) in avg.iter_mut().zip(row) {
                    *a += w;
                }
            }
        }
        #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
        let n = self.n_heads.max(1) as f32;
        Ok(avg.into_iter().map(|v| v / n).collect())
    }

    /// The top-k key positions a query position attends to, head-averaged.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the layer or position is out of range.
    pub fn top_attended_positions(
        &self,
        layer: usize,
        from_position: usize,
        k: usize,
    ) -> Result<Vec<(usize, f32)>> {
        let attn = self.attention_from_position(layer, from_position)?;
        let mut indexed: Vec<(usize, f32)> = attn.into_iter().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        indexed.truncate(k);
        Ok(indexed)
    }

    /// Convert to a candle tensor for downstream tensor math or export.
    ///
    /// # Shapes
    ///
    /// - returns: `[layers, heads, seq_q, seq_k]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if tensor creation fails.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(
            &self.data,
            (self.n_layers, self.n_heads, self.seq_len, self.seq_len),
            device,
        )?)
    }
}

/// An attention tensor together with its mandatory provenance tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedAttention {
    /// The normalized weights.
    pub tensor: AttentionTensor,
    /// Where the weights came from.
    pub source: AttentionSource,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    /// One layer, two heads, three positions.
    ///
    /// - Head 0: attends only to itself.
    /// - Head 1: previous-token (row 0 attends to itself).
    fn sample_tensor() -> AttentionTensor {
        #[rustfmt::skip]
        let data: Vec<f32> = vec![
            // Head 0 (diagonal)
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
            0.0, 0.0, 1.0,
            // Head 1 (previous token)
            1.0, 0.0, 0.0,
            1.0, 0.0, 0.0,
            0.0, 1.0, 0.0,
        ];
        AttentionTensor::new(1, 2, 3, data).unwrap()
    }

    #[test]
    fn empty_tensor() {
        let t = AttentionTensor::empty();
        assert!(t.is_empty());
        assert_eq!(t.total_heads(), 0);
        assert!(t.head(0, 0).is_none());
        assert!(t.check_causal(1e-6).is_ok());
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(AttentionTensor::new(1, 2, 3, vec![0.0; 17]).is_err());
    }

    #[test]
    fn element_access() {
        let t = sample_tensor();
        assert_eq!(t.get(0, 1, 2, 1), Some(1.0));
        assert_eq!(t.get(0, 0, 2, 1), Some(0.0));
        assert_eq!(t.get(0, 2, 0, 0), None);
        assert_eq!(t.get(0, 0, 3, 0), None);
        assert_eq!(t.row(0, 1, 1).unwrap(), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn causality_check() {
        let t = sample_tensor();
        assert!(t.check_causal(1e-6).is_ok());

        let bad = AttentionTensor::new(1, 1, 2, vec![0.5, 0.5, 0.5, 0.5]).unwrap();
        assert!(bad.check_causal(1e-6).is_err());

        let unnormalized = AttentionTensor::new(1, 1, 2, vec![1.0, 0.0, 0.3, 0.3]).unwrap();
        assert!(unnormalized.check_causal(1e-6).is_err());
    }

    #[test]
    fn uniform_filled_heads_skip_causality() {
        let mut bad = AttentionTensor::new(1, 1, 2, vec![0.5, 0.5, 0.5, 0.5]).unwrap();
        bad.mark_uniform_filled(0, 0);
        assert!(bad.is_uniform_filled(0, 0));
        assert!(bad.check_causal(1e-6).is_ok());
    }

    #[test]
    fn attention_from_position_averages_heads() {
        let t = sample_tensor();
        // Row 2: head0=[0,0,1], head1=[0,1,0] -> [0, 0.5, 0.5]
        let attn = t.attention_from_position(0, 2).unwrap();
        assert!((attn[1] - 0.5).abs() < 1e-6);
        assert!((attn[2] - 0.5).abs() < 1e-6);
        assert!(t.attention_from_position(1, 0).is_err());
        assert!(t.attention_from_position(0, 3).is_err());
    }

    #[test]
    fn top_attended_positions_sorted() {
        let t = sample_tensor();
        let top = t.top_attended_positions(0, 1, 1).unwrap();
        assert_eq!(top.len(), 1);
        // Row 1: head0=[0,1,0], head1=[1,0,0] -> tie, first index wins
        assert!((top[0].1 - 0.5).abs() < 1e-6);
    }

    #[test]
    fn to_tensor_shape() {
        let t = sample_tensor();
        let tensor = t.to_tensor(&Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 2, 3, 3]);
    }

    #[test]
    fn source_tags() {
        assert_eq!(AttentionSource::KvDerived.to_string(), "kv_derived");
        assert!(AttentionSource::Synthetic.is_synthetic());
        assert!(!AttentionSource::KvDerived.is_trustworthy());
        assert!(AttentionSource::Real.is_trustworthy());
        let json = serde_json::to_string(&AttentionSource::KvDerived).unwrap();
        assert_eq!(json, "\"kv_derived\"");
    }
}

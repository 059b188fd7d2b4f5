// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention source resolution.
//!
//! Turns whatever a forward pass produced into a normalized
//! [`AttentionTensor`] plus an [`AttentionSource`] tag. Strategies are tried
//! in order of fidelity and the first that succeeds wins:
//!
//! 1. **Direct**: post-softmax patterns captured at `AttnPattern(layer)`.
//!    Tagged [`AttentionSource::Real`].
//! 2. **KV-derived**: attention recomputed from cached keys, as
//!    `softmax(mask + Q·Kᵀ / √d)` when queries are present (tagged `Real`) or
//!    `softmax(mask + K·Kᵀ / √d)` from keys alone (tagged `KvDerived`).
//! 3. **Synthetic**: seeded causal filler biased toward the previous
//!    position and the diagonal. Tagged `Synthetic`.
//!
//! Resolution never fails. Each rejected strategy is logged at `debug`
//! level; synthetic output is logged at `warn` level.

use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::cache::{AttentionSource, AttentionTensor, KVCache, ResolvedAttention};
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint};
use crate::util::masks::causal_mask;

/// Default seed for synthetic attention.
pub const DEFAULT_SYNTHETIC_SEED: u64 = 42;

/// Row-sum tolerance when sanity-checking directly captured patterns.
const PATTERN_TOLERANCE: f32 = 1e-3;

// ---------------------------------------------------------------------------
// KV layout detection
// ---------------------------------------------------------------------------

/// Axis order of a per-layer key/query tensor after dropping the batch axis.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    /// `[heads, seq, head_dim]`, the layout of `HuggingFace` `past_key_values`.
    HeadsFirst,
    /// `[seq, heads, head_dim]`, common in quantized and exported runtimes.
    SeqFirst,
}

impl KvLayout {
    /// Decide the layout from the two leading dimensions and the realized
    /// sequence length.
    ///
    /// | `dim1 == seq` | `dim2 == seq` | other condition             | layout      |
    /// |---------------|---------------|-----------------------------|-------------|
    /// | no            | yes           |                             | heads-first |
    /// | yes           | no            |                             | seq-first   |
    /// | no            | no            | `dim1 >= seq > dim2`        | seq-first   |
    /// | no            | no            | `dim2 >= seq > dim1`        | heads-first |
    /// | any           | any           | `dim1 > 128 && dim1 > dim2` | seq-first   |
    /// | any           | any           | otherwise                   | heads-first |
    ///
    /// A cached sequence may be longer than `seq_len` (earlier turns), which
    /// is why the third and fourth rows compare with `>=`.
    #[must_use]
    pub const fn detect(dim1: usize, dim2: usize, seq_len: usize) -> Self {
        match (dim1 == seq_len, dim2 == seq_len) {
            (false, true) => Self::HeadsFirst,
            (true, false) => Self::SeqFirst,
            (false, false) if dim1 >= seq_len && seq_len > dim2 => Self::SeqFirst,
            (false, false) if dim2 >= seq_len && seq_len > dim1 => Self::HeadsFirst,
            _ if dim1 > 128 && dim1 > dim2 => Self::SeqFirst,
            _ => Self::HeadsFirst,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolves forward-pass output into tagged attention.
///
/// `n_layers` and `n_heads` come from the runtime's metadata and are only
/// used to size synthetic output; real data determines its own dimensions.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use circuit_lens::{AttentionResolver, AttentionSource, HookCache};
///
/// let logits = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu).unwrap();
/// let output = HookCache::new(logits);
///
/// let resolved = AttentionResolver::new(2, 4).resolve(&output, 4);
/// assert_eq!(resolved.source, AttentionSource::Synthetic);
/// assert_eq!(resolved.tensor.n_heads(), 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionResolver {
    /// Layer count hint.
    n_layers: usize,
    /// Head count hint.
    n_heads: usize,
    /// Seed for the synthetic fallback.
    seed: u64,
}

impl AttentionResolver {
    /// Create a resolver with the given shape hint and the default seed.
    #[must_use]
    pub const fn new(n_layers: usize, n_heads: usize) -> Self {
        Self {
            n_layers,
            n_heads,
            seed: DEFAULT_SYNTHETIC_SEED,
        }
    }

    /// Use a specific seed for synthetic output.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Resolve attention for a forward pass over `seq_len` tokens.
    ///
    /// Never fails: malformed or missing data falls through to the next
    /// strategy, and if even the shape hint is degenerate an empty tensor
    /// tagged [`AttentionSource::Synthetic`] is returned.
    #[must_use]
    pub fn resolve(&self, output: &HookCache, seq_len: usize) -> ResolvedAttention {
        if seq_len == 0 {
            warn!("zero-length sequence; returning empty synthetic attention");
            return ResolvedAttention {
                tensor: AttentionTensor::empty(),
                source: AttentionSource::Synthetic,
            };
        }

        if output.has_attention_patterns() {
            match direct_attention(output, seq_len) {
                Ok(tensor) => {
                    debug!(
                        layers = tensor.n_layers(),
                        heads = tensor.n_heads(),
                        seq_len,
                        source = %AttentionSource::Real,
                        "resolved attention from captured patterns"
                    );
                    return ResolvedAttention {
                        tensor,
                        source: AttentionSource::Real,
                    };
                }
                Err(e) => debug!(error = %e, "captured attention patterns unusable"),
            }
        }

        if let Some(kv) = output.kv_cache() {
            match kv_attention(&kv, self.n_heads, seq_len) {
                Ok(resolved) => {
                    debug!(
                        layers = resolved.tensor.n_layers(),
                        heads = resolved.tensor.n_heads(),
                        seq_len,
                        source = %resolved.source,
                        "resolved attention from key cache"
                    );
                    return resolved;
                }
                Err(e) => debug!(error = %e, "key cache unusable for attention"),
            }
        }

        warn!(
            layers = self.n_layers,
            heads = self.n_heads,
            seq_len,
            seed = self.seed,
            "no attention data available; using synthetic attention"
        );
        ResolvedAttention {
            tensor: synthetic_attention(self.n_layers, self.n_heads, seq_len, self.seed),
            source: AttentionSource::Synthetic,
        }
    }
}

// ---------------------------------------------------------------------------
// Direct strategy
// ---------------------------------------------------------------------------

/// Read the leading run of `AttnPattern` captures into one tensor.
///
/// # Shapes
/// - each capture: `[1, heads, seq, seq]` or `[heads, seq, seq]`
///
/// # Errors
///
/// Returns [`MIError::Hook`] if a pattern does not reshape into whole
/// `seq × seq` matrices or head counts disagree across layers.
fn direct_attention(output: &HookCache, seq_len: usize) -> Result<AttentionTensor> {
    let n_layers = output.attention_pattern_layers();
    let block = seq_len * seq_len;
    let mut data = Vec::new();
    let mut n_heads = None;

    for layer in 0..n_layers {
        let pattern = output.require(&HookPoint::AttnPattern(layer))?;
        let pattern = drop_batch(pattern)?;
        // PROMOTE: patterns may arrive in F16/BF16
        let values: Vec<f32> = pattern.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

        if values.is_empty() || values.len() % block != 0 {
            return Err(MIError::Hook(format!(
                "layer {layer}: pattern with {} values is not a whole number of {seq_len}x{seq_len} heads",
                values.len()
            )));
        }
        let heads = values.len() / block;
        match n_heads {
            None => n_heads = Some(heads),
            Some(expected) if expected != heads => {
                return Err(MIError::Hook(format!(
                    "layer {layer} has {heads} heads, layer 0 has {expected}"
                )));
            }
            Some(_) => {}
        }
        data.extend(values);
    }

    let tensor = AttentionTensor::new(n_layers, n_heads.unwrap_or(0), seq_len, data)?;
    if let Err(e) = tensor.check_causal(PATTERN_TOLERANCE) {
        warn!(error = %e, "captured attention is not causal and row-normalized");
    }
    Ok(tensor)
}

/// Drop a leading batch axis of size 1; other batch sizes take batch 0.
fn drop_batch(t: &Tensor) -> Result<Tensor> {
    match t.rank() {
        4 => Ok(t.get(0)?),
        3 => Ok(t.clone()),
        r => Err(MIError::Hook(format!(
            "expected a 3D or 4D attention tensor, got {r}D"
        ))),
    }
}

// ---------------------------------------------------------------------------
// KV-derived strategy
// ---------------------------------------------------------------------------

/// Recompute attention for every layer of a key cache.
///
/// # Errors
///
/// Returns an error if any layer's tensors have an unusable shape, a cached
/// sequence is shorter than `seq_len`, or head counts disagree across layers.
fn kv_attention(kv: &KVCache, n_heads_hint: usize, seq_len: usize) -> Result<ResolvedAttention> {
    let n_layers = kv.n_layers();
    let with_queries = kv.has_queries();
    let device = kv
        .key(0)
        .map(Tensor::device)
        .cloned()
        .unwrap_or(Device::Cpu);
    let mask = causal_mask(seq_len, &device)?;

    let mut data = Vec::new();
    let mut n_heads = None;

    for layer in 0..n_layers {
        let key = kv
            .key(layer)
            .ok_or_else(|| MIError::Hook(format!("layer {layer} has no cached keys")))?;
        let key = to_heads_first(key, seq_len)?;
        let kv_heads = key.dim(0)?;

        let (query, target_heads) = if with_queries {
            let q = kv
                .query(layer)
                .ok_or_else(|| MIError::Hook(format!("layer {layer} has no captured queries")))?;
            let q = to_heads_first(q, seq_len)?;
            let heads = q.dim(0)?;
            (q, heads)
        } else {
            // K·Kᵀ is identical for repeated heads, so widen only when the
            // hint is a clean multiple of the key heads.
            let heads = if n_heads_hint > kv_heads && n_heads_hint % kv_heads == 0 {
                n_heads_hint
            } else {
                kv_heads
            };
            (key.clone(), heads)
        };

        let key = repeat_kv(key, target_heads, kv_heads)?;
        let query = repeat_kv(query, target_heads, kv_heads.min(target_heads))?;
        let pattern = scaled_dot_attention(&query, &key, &mask)?;

        match n_heads {
            None => n_heads = Some(target_heads),
            Some(expected) if expected != target_heads => {
                return Err(MIError::Hook(format!(
                    "layer {layer} has {target_heads} heads, layer 0 has {expected}"
                )));
            }
            Some(_) => {}
        }
        data.extend(pattern.flatten_all()?.to_vec1::<f32>()?);
    }

    let tensor = AttentionTensor::new(n_layers, n_heads.unwrap_or(0), seq_len, data)?;
    let source = if with_queries {
        AttentionSource::Real
    } else {
        AttentionSource::KvDerived
    };
    Ok(ResolvedAttention { tensor, source })
}

/// Bring a key or query tensor to `[heads, seq_len, head_dim]` in F32,
/// keeping the last `seq_len` cached positions.
///
/// # Shapes
/// - `t`: `[1, a, b, head_dim]` or `[a, b, head_dim]`, layout per [`KvLayout::detect`]
/// - returns: `[heads, seq_len, head_dim]`
fn to_heads_first(t: &Tensor, seq_len: usize) -> Result<Tensor> {
    let t = drop_batch(t)?;
    let (dim1, dim2, _head_dim) = t.dims3()?;
    let t = match KvLayout::detect(dim1, dim2, seq_len) {
        KvLayout::HeadsFirst => t,
        KvLayout::SeqFirst => t.transpose(0, 1)?,
    };
    let cached = t.dim(1)?;
    if cached < seq_len {
        return Err(MIError::Hook(format!(
            "cache holds {cached} positions, need {seq_len}"
        )));
    }
    let t = t.narrow(1, cached - seq_len, seq_len)?;
    // PROMOTE: attention math in F32
    Ok(t.to_dtype(DType::F32)?.contiguous()?)
}

/// Expand `[n_kv_heads, seq, head_dim]` to `[n_heads, seq, head_dim]` for GQA.
///
/// Returns the input unchanged when the counts already match.
///
/// # Errors
///
/// Returns [`MIError::Hook`] if `n_heads` is not a multiple of `n_kv_heads`.
fn repeat_kv(x: Tensor, n_heads: usize, n_kv_heads: usize) -> Result<Tensor> {
    let current = x.dim(0)?;
    if current == n_heads {
        return Ok(x);
    }
    if n_kv_heads == 0 || current != n_kv_heads || n_heads % n_kv_heads != 0 {
        return Err(MIError::Hook(format!(
            "cannot expand {current} key heads to {n_heads} query heads"
        )));
    }
    let repeats = n_heads / n_kv_heads;
    let (_, seq_len, head_dim) = x.dims3()?;
    Ok(x.unsqueeze(1)?
        .expand((n_kv_heads, repeats, seq_len, head_dim))?
        .reshape((n_heads, seq_len, head_dim))?)
}

/// `softmax(mask + Q·Kᵀ / √head_dim)` per head.
///
/// # Shapes
/// - `query`, `key`: `[heads, seq, head_dim]`
/// - `mask`: `[seq, seq]`
/// - returns: `[heads, seq, seq]`
fn scaled_dot_attention(query: &Tensor, key: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let head_dim = query.dim(2)?;
    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let scale = 1.0 / (head_dim.max(1) as f64).sqrt();
    // CONTIGUOUS: transpose produces non-unit strides; matmul requires contiguous layout
    let k_t = key.t()?.contiguous()?;
    let scores = (query.matmul(&k_t)? * scale)?;
    let scores = scores.broadcast_add(mask)?;
    Ok(candle_nn::ops::softmax_last_dim(&scores)?)
}

// ---------------------------------------------------------------------------
// Synthetic strategy
// ---------------------------------------------------------------------------

/// Seeded causal filler attention.
///
/// Each row `i` gets a uniform `[0, 0.3)` base over `j <= i`, `+0.5` at
/// `j = i - 1` and `+0.3` at `j = i`, then is normalized to sum to one.
/// The same arguments always produce the same tensor.
#[must_use]
pub fn synthetic_attention(
    n_layers: usize,
    n_heads: usize,
    seq_len: usize,
    seed: u64,
) -> AttentionTensor {
    if n_layers == 0 || n_heads == 0 || seq_len == 0 {
        return AttentionTensor::empty();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = Vec::with_capacity(n_layers * n_heads * seq_len * seq_len);
    for _ in 0..n_layers * n_heads {
        for i in 0..seq_len {
            let mut row = vec![0.0_f32; seq_len];
            for (j, w) in row.iter_mut().enumerate().take(i + 1) {
                *w = rng.gen_range(0.0..0.3);
                if j + 1 == i {
                    *w += 0.5;
                }
                if j == i {
                    *w += 0.3;
                }
            }
            let sum: f32 = row.iter().sum();
            data.extend(row.into_iter().map(|w| w / sum));
        }
    }

    AttentionTensor::new(n_layers, n_heads, seq_len, data).unwrap_or_else(|_| AttentionTensor::empty())
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

    fn logits(seq: usize) -> Tensor {
        Tensor::zeros((1, seq, 16), DType::F32, &Device::Cpu).unwrap()
    }

    fn assert_close(a: &AttentionTensor, b: &AttentionTensor) {
        assert_eq!(a.n_layers(), b.n_layers());
        assert_eq!(a.n_heads(), b.n_heads());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    // -- Layout decision table --

    #[test]
    fn layout_for_known_model_families() {
        let seq = 10;
        // GPT-2: [1, 12, seq, 64]
        assert_eq!(KvLayout::detect(12, seq, seq), KvLayout::HeadsFirst);
        // Llama-3.2-1B (GQA, 8 kv heads): [1, 8, seq, 64]
        assert_eq!(KvLayout::detect(8, seq, seq), KvLayout::HeadsFirst);
        // Qwen2.5-0.5B (2 kv heads): [1, 2, seq, 64]
        assert_eq!(KvLayout::detect(2, seq, seq), KvLayout::HeadsFirst);
        // Phi-3-mini: [1, 32, seq, 96]
        assert_eq!(KvLayout::detect(32, seq, seq), KvLayout::HeadsFirst);
        // Seq-first export: [1, seq, 8, 64]
        assert_eq!(KvLayout::detect(seq, 8, seq), KvLayout::SeqFirst);
    }

    #[test]
    fn layout_with_longer_cache() {
        // Seq-first with 20 cached positions, 4 heads, 10 new tokens.
        assert_eq!(KvLayout::detect(20, 4, 10), KvLayout::SeqFirst);
        // Heads-first with 20 cached positions.
        assert_eq!(KvLayout::detect(4, 20, 10), KvLayout::HeadsFirst);
        // Long seq-first cache with a short prompt.
        assert_eq!(KvLayout::detect(300, 8, 5), KvLayout::SeqFirst);
        // Heads larger than the prompt, long cache: ambiguous, default.
        assert_eq!(KvLayout::detect(8, 20, 5), KvLayout::HeadsFirst);
    }

    #[test]
    fn layout_when_heads_equal_seq() {
        // GPT-2 with a 12-token prompt: both dims match.
        assert_eq!(KvLayout::detect(12, 12, 12), KvLayout::HeadsFirst);
        assert_eq!(KvLayout::detect(256, 256, 256), KvLayout::HeadsFirst);
    }

    // -- Direct --

    #[test]
    fn direct_patterns_are_real() {
        let seq = 3;
        let synthetic = synthetic_attention(2, 2, seq, 7);
        let mut output = HookCache::new(logits(seq));
        for layer in 0..2 {
            let start = layer * 2 * seq * seq;
            let slice = &synthetic.as_slice()[start..start + 2 * seq * seq];
            let t = Tensor::from_slice(slice, (1, 2, seq, seq), &Device::Cpu).unwrap();
            output.store(HookPoint::AttnPattern(layer), t);
        }

        let resolved = AttentionResolver::new(2, 2).resolve(&output, seq);
        assert_eq!(resolved.source, AttentionSource::Real);
        assert_close(&resolved.tensor, &synthetic);
    }

    #[test]
    fn malformed_patterns_fall_through() {
        let mut output = HookCache::new(logits(4));
        let bad = Tensor::zeros((1, 2, 3, 3), DType::F32, &Device::Cpu).unwrap();
        output.store(HookPoint::AttnPattern(0), bad);

        let resolved = AttentionResolver::new(1, 2).resolve(&output, 4);
        assert_eq!(resolved.source, AttentionSource::Synthetic);
    }

    // -- KV-derived --

    #[test]
    fn zero_keys_give_uniform_causal_attention() {
        let seq = 4;
        let mut output = HookCache::new(logits(seq));
        output.store(
            HookPoint::AttnK(0),
            Tensor::zeros((1, 2, seq, 8), DType::F32, &Device::Cpu).unwrap(),
        );

        let resolved = AttentionResolver::new(1, 2).resolve(&output, seq);
        assert_eq!(resolved.source, AttentionSource::KvDerived);
        let t = &resolved.tensor;
        assert!(t.check_causal(1e-5).is_ok());
        assert!((t.get(0, 1, 3, 0).unwrap() - 0.25).abs() < 1e-6);
        assert!((t.get(0, 0, 1, 1).unwrap() - 0.5).abs() < 1e-6);
        assert_eq!(t.get(0, 0, 1, 2).unwrap(), 0.0);
    }

    #[test]
    fn queries_make_kv_attention_real() {
        let seq = 5;
        let q = Tensor::randn(0.0_f32, 1.0, (1, 4, seq, 8), &Device::Cpu).unwrap();
        let k = Tensor::randn(0.0_f32, 1.0, (1, 2, seq, 8), &Device::Cpu).unwrap();
        let mut output = HookCache::new(logits(seq));
        output.store(HookPoint::AttnQ(0), q);
        output.store(HookPoint::AttnK(0), k);

        let resolved = AttentionResolver::new(1, 4).resolve(&output, seq);
        assert_eq!(resolved.source, AttentionSource::Real);
        // GQA keys expanded to the 4 query heads.
        assert_eq!(resolved.tensor.n_heads(), 4);
        assert!(resolved.tensor.check_causal(1e-5).is_ok());
    }

    #[test]
    fn explicit_key_cache_with_captured_queries_is_real() {
        let seq = 5;
        let mut kv = KVCache::new(1);
        kv.set_key(
            0,
            Tensor::randn(0.0_f32, 1.0, (1, 2, seq, 8), &Device::Cpu).unwrap(),
        )
        .unwrap();
        let mut output = HookCache::new(logits(seq));
        output.set_kv_cache(kv);
        output.store(
            HookPoint::AttnQ(0),
            Tensor::randn(0.0_f32, 1.0, (1, 4, seq, 8), &Device::Cpu).unwrap(),
        );

        let resolved = AttentionResolver::new(1, 4).resolve(&output, seq);
        assert_eq!(resolved.source, AttentionSource::Real);
        assert_eq!(resolved.tensor.n_heads(), 4);
    }

    #[test]
    fn keys_only_widen_to_hint_heads() {
        let seq = 4;
        let mut output = HookCache::new(logits(seq));
        output.store(
            HookPoint::AttnK(0),
            Tensor::randn(0.0_f32, 1.0, (1, 2, seq, 8), &Device::Cpu).unwrap(),
        );
        let resolved = AttentionResolver::new(1, 6).resolve(&output, seq);
        assert_eq!(resolved.source, AttentionSource::KvDerived);
        assert_eq!(resolved.tensor.n_heads(), 6);
        // Heads 0, 1 and 2 share key head 0.
        assert_eq!(resolved.tensor.head(0, 0), resolved.tensor.head(0, 2));
    }

    #[test]
    fn seq_first_layout_matches_heads_first() {
        let seq = 6;
        let heads_first = Tensor::randn(0.0_f32, 1.0, (1, 3, seq, 8), &Device::Cpu).unwrap();
        let seq_first = heads_first.transpose(1, 2).unwrap().contiguous().unwrap();

        let mut a = HookCache::new(logits(seq));
        a.store(HookPoint::AttnK(0), heads_first);
        let mut b = HookCache::new(logits(seq));
        b.store(HookPoint::AttnK(0), seq_first);

        let resolver = AttentionResolver::new(1, 3);
        assert_close(&resolver.resolve(&a, seq).tensor, &resolver.resolve(&b, seq).tensor);
    }

    #[test]
    fn longer_cache_is_narrowed_to_last_positions() {
        let seq = 4;
        let full = Tensor::randn(0.0_f32, 1.0, (1, 2, 9, 8), &Device::Cpu).unwrap();
        let tail = full.narrow(2, 5, seq).unwrap().contiguous().unwrap();

        let mut kv = KVCache::new(1);
        kv.set_key(0, full).unwrap();
        let mut a = HookCache::new(logits(seq));
        a.set_kv_cache(kv);
        let mut b = HookCache::new(logits(seq));
        b.store(HookPoint::AttnK(0), tail);

        let resolver = AttentionResolver::new(1, 2);
        let ra = resolver.resolve(&a, seq);
        assert_eq!(ra.tensor.seq_len(), seq);
        assert_close(&ra.tensor, &resolver.resolve(&b, seq).tensor);
    }

    #[test]
    fn short_cache_falls_back_to_synthetic() {
        let mut output = HookCache::new(logits(8));
        output.store(
            HookPoint::AttnK(0),
            Tensor::zeros((1, 2, 3, 8), DType::F32, &Device::Cpu).unwrap(),
        );
        let resolved = AttentionResolver::new(1, 2).resolve(&output, 8);
        assert_eq!(resolved.source, AttentionSource::Synthetic);
    }

    // -- Synthetic --

    #[test]
    fn synthetic_is_causal_for_any_seed() {
        for seed in [0, 1, 42, 1234, u64::MAX] {
            let t = synthetic_attention(3, 4, 9, seed);
            assert!(t.check_causal(1e-6).is_ok(), "seed {seed}");
        }
    }

    #[test]
    fn synthetic_is_reproducible() {
        assert_eq!(synthetic_attention(2, 2, 5, 9), synthetic_attention(2, 2, 5, 9));
        assert_ne!(synthetic_attention(2, 2, 5, 9), synthetic_attention(2, 2, 5, 10));
    }

    #[test]
    fn synthetic_favors_previous_token() {
        let t = synthetic_attention(1, 1, 6, 3);
        for i in 2..6 {
            let row = t.row(0, 0, i).unwrap();
            assert!(row[i - 1] > row[0]);
        }
    }

    #[test]
    fn degenerate_dimensions_give_empty_synthetic() {
        let output = HookCache::new(logits(1));
        let resolved = AttentionResolver::new(0, 0).resolve(&output, 4);
        assert!(resolved.tensor.is_empty());
        assert!(resolved.source.is_synthetic());

        let resolved = AttentionResolver::new(2, 2).resolve(&output, 0);
        assert!(resolved.tensor.is_empty());
        assert!(resolved.source.is_synthetic());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook system for activation capture and intervention.
//!
//! Provides [`HookPoint`] (named locations in a forward pass),
//! [`HookSpec`] (what to capture and where to intervene), and
//! [`HookCache`] (whatever the runtime produced for one forward pass).
//!
//! A [`HookCache`] is a capability bag: a runtime may fill in attention
//! patterns, key/query captures, an explicit [`KVCache`], hidden states, or
//! none of these. Consumers probe with the `has_*` accessors and degrade
//! accordingly instead of branching on concrete model types.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use candle_core::Tensor;

use crate::cache::KVCache;
use crate::error::{MIError, Result};

// ---------------------------------------------------------------------------
// HookPoint
// ---------------------------------------------------------------------------

/// Named location in a forward pass where activations can be captured
/// or interventions applied.
///
/// Mirrors the `TransformerLens` hook point naming convention via
/// [`Display`](std::fmt::Display) and [`FromStr`].
///
/// ```
/// use circuit_lens::HookPoint;
///
/// let hook = HookPoint::AttnPattern(5);
/// assert_eq!(hook.to_string(), "blocks.5.attn.hook_pattern");
///
/// let parsed: HookPoint = "blocks.5.attn.hook_pattern".parse().unwrap();
/// assert_eq!(parsed, hook);
/// ```
///
/// Unknown strings parse as [`HookPoint::Custom`].
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After token embedding (`hook_embed`). Steering deltas land here.
    Embed,
    /// Query vectors in layer `i` (`blocks.{i}.attn.hook_q`).
    AttnQ(usize),
    /// Key vectors in layer `i` (`blocks.{i}.attn.hook_k`).
    AttnK(usize),
    /// Post-softmax attention pattern in layer `i` (`blocks.{i}.attn.hook_pattern`).
    AttnPattern(usize),
    /// Residual stream after full layer `i` (`blocks.{i}.hook_resid_post`).
    ResidPost(usize),
    /// Runtime-specific hook point not covered by the standard enum.
    Custom(String),
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Embed => write!(f, "hook_embed"),
            Self::AttnQ(i) => write!(f, "blocks.{i}.attn.hook_q"),
            Self::AttnK(i) => write!(f, "blocks.{i}.attn.hook_k"),
            Self::AttnPattern(i) => write!(f, "blocks.{i}.attn.hook_pattern"),
            Self::ResidPost(i) => write!(f, "blocks.{i}.hook_resid_post"),
            Self::Custom(s) => write!(f, "{s}"),
        }
    }
}

/// Parse a `TransformerLens`-style string into a [`HookPoint`].
impl FromStr for HookPoint {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(parse_hook_string(s))
    }
}

impl From<&str> for HookPoint {
    fn from(s: &str) -> Self {
        parse_hook_string(s)
    }
}

/// Parse a hook string, falling back to [`HookPoint::Custom`] for unknown patterns.
fn parse_hook_string(s: &str) -> HookPoint {
    if s == "hook_embed" {
        return HookPoint::Embed;
    }

    if let Some(rest) = s.strip_prefix("blocks.") {
        if let Some((layer_str, suffix)) = rest.split_once('.') {
            if let Ok(layer) = layer_str.parse::<usize>() {
                return match suffix {
                    "attn.hook_q" => HookPoint::AttnQ(layer),
                    "attn.hook_k" => HookPoint::AttnK(layer),
                    "attn.hook_pattern" => HookPoint::AttnPattern(layer),
                    "hook_resid_post" => HookPoint::ResidPost(layer),
                    _ => HookPoint::Custom(s.to_string()),
                };
            }
        }
    }

    HookPoint::Custom(s.to_string())
}

// ---------------------------------------------------------------------------
// Intervention
// ---------------------------------------------------------------------------

/// An intervention to apply at a hook point during the forward pass.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum Intervention {
    /// Add a tensor to the activation, broadcasting over leading axes
    /// (embedding steering).
    Add(Tensor),
}

/// Apply a single [`Intervention`] to a tensor.
///
/// Runtime implementors call this at every hook point where
/// [`HookSpec::interventions_at`] yields something.
///
/// # Shapes
/// - `tensor`: any shape; the activation at the hook point.
/// - returns: same shape as `tensor`.
///
/// # Errors
///
/// Returns [`MIError::Model`] if the underlying tensor operation fails
/// (for `Add`, when the delta does not broadcast against `tensor`).
pub fn apply_intervention(tensor: &Tensor, intervention: &Intervention) -> Result<Tensor> {
    match intervention {
        Intervention::Add(delta) => Ok(tensor.broadcast_add(&delta.to_dtype(tensor.dtype())?)?),
    }
}

// ---------------------------------------------------------------------------
// HookSpec
// ---------------------------------------------------------------------------

/// Declares which activations to capture and which interventions to apply.
///
/// Passed to [`MIBackend::forward`](crate::MIBackend::forward). An empty spec
/// asks the runtime for logits only.
///
/// ```
/// use circuit_lens::{HookPoint, HookSpec};
///
/// let mut hooks = HookSpec::new();
/// hooks.capture(HookPoint::AttnPattern(5))
///      .capture("blocks.5.hook_resid_post");
/// assert_eq!(hooks.num_captures(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct HookSpec {
    /// Hook points to capture during the forward pass.
    captures: HashSet<HookPoint>,
    /// Interventions to apply, stored as (`hook_point`, intervention) pairs.
    interventions: Vec<(HookPoint, Intervention)>,
}

impl HookSpec {
    /// Create an empty hook specification (no captures, no interventions).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request capture of the activation at the given hook point.
    pub fn capture<H: Into<HookPoint>>(&mut self, hook: H) -> &mut Self {
        self.captures.insert(hook.into());
        self
    }

    /// Request the hook points the attention resolver can use for every
    /// layer: patterns, queries and keys.
    pub fn capture_attention(&mut self, n_layers: usize) -> &mut Self {
        for layer in 0..n_layers {
            self.captures.insert(HookPoint::AttnPattern(layer));
            self.captures.insert(HookPoint::AttnQ(layer));
            self.captures.insert(HookPoint::AttnK(layer));
        }
        self
    }

    /// Register an intervention at the given hook point.
    pub fn intervene<H: Into<HookPoint>>(
        &mut self,
        hook: H,
        intervention: Intervention,
    ) -> &mut Self {
        self.interventions.push((hook.into(), intervention));
        self
    }

    /// Check whether a specific hook point should be captured.
    #[must_use]
    pub fn is_captured(&self, hook: &HookPoint) -> bool {
        self.captures.contains(hook)
    }

    /// Check whether this spec has no captures and no interventions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.captures.is_empty() && self.interventions.is_empty()
    }

    /// Number of requested captures.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of registered interventions.
    #[must_use]
    pub const fn num_interventions(&self) -> usize {
        self.interventions.len()
    }

    /// Iterate over interventions registered at a specific hook point.
    pub fn interventions_at(&self, hook: &HookPoint) -> impl Iterator<Item = &Intervention> {
        self.interventions
            .iter()
            .filter(move |(h, _)| h == hook)
            .map(|(_, intervention)| intervention)
    }

    /// Check whether any intervention targets the given hook point.
    #[must_use]
    pub fn has_intervention_at(&self, hook: &HookPoint) -> bool {
        self.interventions.iter().any(|(h, _)| h == hook)
    }
}

// ---------------------------------------------------------------------------
// HookCache
// ---------------------------------------------------------------------------

/// Tensors produced by one forward pass, plus the output logits.
///
/// Returned by [`MIBackend::forward`](crate::MIBackend::forward). Every
/// field other than the output is optional; use the `has_*` probes before
/// relying on a capability.
///
/// ```
/// use circuit_lens::{HookCache, HookPoint};
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 10, 32000), DType::F32, &Device::Cpu).unwrap();
/// let mut cache = HookCache::new(logits);
///
/// let pattern = Tensor::zeros((1, 8, 10, 10), DType::F32, &Device::Cpu).unwrap();
/// cache.store(HookPoint::AttnPattern(0), pattern);
///
/// assert!(cache.has_attention_patterns());
/// assert!(!cache.has_keys());
/// ```
#[derive(Debug)]
pub struct HookCache {
    /// Output tensor from the forward pass (logits).
    output: Tensor,
    /// Captured activations keyed by hook point.
    captures: HashMap<HookPoint, Tensor>,
    /// KV cache exported by the runtime, if any.
    kv_cache: Option<KVCache>,
}

impl HookCache {
    /// Create a new cache with the given output tensor and no captures.
    #[must_use]
    pub fn new(output: Tensor) -> Self {
        Self {
            output,
            captures: HashMap::new(),
            kv_cache: None,
        }
    }

    /// The output tensor from the forward pass.
    #[must_use]
    pub const fn output(&self) -> &Tensor {
        &self.output
    }

    /// Consume the cache and return the output tensor.
    #[must_use]
    pub fn into_output(self) -> Tensor {
        self.output
    }

    /// Retrieve a captured tensor by hook point.
    #[must_use]
    pub fn get(&self, hook: &HookPoint) -> Option<&Tensor> {
        self.captures.get(hook)
    }

    /// Retrieve a captured tensor, returning an error if not found.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the hook point was not captured.
    pub fn require(&self, hook: &HookPoint) -> Result<&Tensor> {
        self.captures
            .get(hook)
            .ok_or_else(|| MIError::Hook(format!("hook point `{hook}` was not captured")))
    }

    /// Store a captured activation. Called by runtime implementations.
    pub fn store(&mut self, hook: HookPoint, tensor: Tensor) {
        self.captures.insert(hook, tensor);
    }

    /// Attach the runtime's exported KV cache.
    pub fn set_kv_cache(&mut self, kv: KVCache) {
        self.kv_cache = Some(kv);
    }

    /// Number of captured tensors (excludes the output and KV cache).
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.captures.len()
    }

    /// Number of leading layers `0..n` with a captured attention pattern.
    #[must_use]
    pub fn attention_pattern_layers(&self) -> usize {
        (0..)
            .take_while(|&l| self.captures.contains_key(&HookPoint::AttnPattern(l)))
            .count()
    }

    /// Whether attention patterns were captured for at least layer 0.
    #[must_use]
    pub fn has_attention_patterns(&self) -> bool {
        self.attention_pattern_layers() > 0
    }

    /// Whether keys are available, from an explicit KV cache or `AttnK`
    /// captures starting at layer 0.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        self.kv_cache.as_ref().is_some_and(KVCache::has_keys)
            || self.captures.contains_key(&HookPoint::AttnK(0))
    }

    /// Whether hidden states were captured for the given layer.
    #[must_use]
    pub fn has_hidden_state(&self, layer: usize) -> bool {
        self.captures.contains_key(&HookPoint::ResidPost(layer))
    }

    /// The key/query cache for attention reconstruction.
    ///
    /// Returns the explicit cache if the runtime attached one with keys for
    /// every layer, filling its query slots from `AttnQ(layer)` captures when
    /// it carries no queries of its own. Otherwise assembles one from the
    /// leading run of `AttnK(layer)` captures, adding `AttnQ(layer)` where
    /// present. `None` when no keys exist.
    #[must_use]
    pub fn kv_cache(&self) -> Option<KVCache> {
        if let Some(kv) = self.kv_cache.as_ref().filter(|kv| kv.has_keys()) {
            let mut kv = kv.clone();
            if kv.has_no_queries() {
                for layer in 0..kv.n_layers() {
                    if let Some(q) = self.captures.get(&HookPoint::AttnQ(layer)) {
                        kv.set_query(layer, q.clone()).ok()?;
                    }
                }
            }
            return Some(kv);
        }

        let n_layers = (0..)
            .take_while(|&l| self.captures.contains_key(&HookPoint::AttnK(l)))
            .count();
        if n_layers == 0 {
            return None;
        }

        let mut kv = KVCache::new(n_layers);
        for layer in 0..n_layers {
            let key = self.captures.get(&HookPoint::AttnK(layer))?.clone();
            kv.set_key(layer, key).ok()?;
            if let Some(q) = self.captures.get(&HookPoint::AttnQ(layer)) {
                kv.set_query(layer, q.clone()).ok()?;
            }
        }
        Some(kv)
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
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn hook_point_display_roundtrip() {
        let cases: Vec<(HookPoint, &str)> = vec![
            (HookPoint::Embed, "hook_embed"),
            (HookPoint::AttnQ(3), "blocks.3.attn.hook_q"),
            (HookPoint::AttnK(3), "blocks.3.attn.hook_k"),
            (HookPoint::AttnPattern(5), "blocks.5.attn.hook_pattern"),
            (HookPoint::ResidPost(9), "blocks.9.hook_resid_post"),
        ];

        for (hook, expected_str) in cases {
            assert_eq!(hook.to_string(), expected_str, "Display failed for {hook:?}");
            let parsed: HookPoint = expected_str.parse().unwrap();
            assert_eq!(parsed, hook, "FromStr failed for {expected_str:?}");
        }
    }

    #[test]
    fn unknown_string_becomes_custom() {
        let hook: HookPoint = "blocks.2.mlp.hook_post".parse().unwrap();
        assert_eq!(hook, HookPoint::Custom("blocks.2.mlp.hook_post".to_string()));
    }

    #[test]
    fn hook_spec_capture_attention() {
        let mut spec = HookSpec::new();
        assert!(spec.is_empty());
        spec.capture_attention(2);
        assert_eq!(spec.num_captures(), 6);
        assert!(spec.is_captured(&HookPoint::AttnQ(1)));
        assert!(!spec.is_captured(&HookPoint::Embed));
    }

    #[test]
    fn hook_spec_intervention_query() {
        let mut spec = HookSpec::new();
        let delta = zeros(&[8]);
        spec.intervene(HookPoint::Embed, Intervention::Add(delta.clone()));
        spec.intervene(HookPoint::Embed, Intervention::Add(delta.clone()));
        spec.intervene(HookPoint::ResidPost(1), Intervention::Add(delta));

        assert_eq!(spec.num_interventions(), 3);
        assert!(spec.has_intervention_at(&HookPoint::Embed));
        assert!(!spec.has_intervention_at(&HookPoint::ResidPost(0)));
        assert_eq!(spec.interventions_at(&HookPoint::Embed).count(), 2);
    }

    #[test]
    fn add_intervention_broadcasts() {
        let x = Tensor::ones((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let delta = Tensor::new(&[1.0_f32, 2.0, 3.0, 4.0], &Device::Cpu).unwrap();
        let out = apply_intervention(&x, &Intervention::Add(delta)).unwrap();
        let rows: Vec<Vec<f32>> = out.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[2], vec![2.0, 3.0, 4.0, 5.0]);

        let mismatched = Tensor::new(&[1.0_f32, 2.0], &Device::Cpu).unwrap();
        assert!(apply_intervention(&x, &Intervention::Add(mismatched)).is_err());
    }

    #[test]
    fn capability_probes() {
        let mut cache = HookCache::new(zeros(&[1, 4, 10]));
        assert!(!cache.has_attention_patterns());
        assert!(!cache.has_keys());
        assert!(cache.kv_cache().is_none());

        // Gap at layer 1 stops the contiguous run.
        cache.store(HookPoint::AttnPattern(0), zeros(&[1, 2, 4, 4]));
        cache.store(HookPoint::AttnPattern(2), zeros(&[1, 2, 4, 4]));
        assert_eq!(cache.attention_pattern_layers(), 1);

        cache.store(HookPoint::ResidPost(0), zeros(&[1, 4, 8]));
        assert!(cache.has_hidden_state(0));
        assert!(!cache.has_hidden_state(1));
    }

    #[test]
    fn kv_cache_assembled_from_captures() {
        let mut cache = HookCache::new(zeros(&[1, 4, 10]));
        cache.store(HookPoint::AttnK(0), zeros(&[1, 2, 4, 8]));
        cache.store(HookPoint::AttnK(1), zeros(&[1, 2, 4, 8]));
        cache.store(HookPoint::AttnQ(0), zeros(&[1, 4, 4, 8]));
        assert!(cache.has_keys());

        let kv = cache.kv_cache().unwrap();
        assert_eq!(kv.n_layers(), 2);
        assert!(kv.has_keys());
        assert!(!kv.has_queries());
        assert!(kv.query(0).is_some());
    }

    #[test]
    fn explicit_kv_cache_preferred() {
        let mut cache = HookCache::new(zeros(&[1, 4, 10]));
        let mut kv = KVCache::new(3);
        for l in 0..3 {
            kv.set_key(l, zeros(&[1, 2, 4, 8])).unwrap();
        }
        cache.set_kv_cache(kv);
        cache.store(HookPoint::AttnK(0), zeros(&[1, 2, 4, 8]));
        assert_eq!(cache.kv_cache().unwrap().n_layers(), 3);
    }

    #[test]
    fn explicit_kv_cache_picks_up_captured_queries() {
        let mut cache = HookCache::new(zeros(&[1, 4, 10]));
        let mut kv = KVCache::new(2);
        for l in 0..2 {
            kv.set_key(l, zeros(&[1, 2, 4, 8])).unwrap();
        }
        cache.set_kv_cache(kv);
        cache.store(HookPoint::AttnQ(0), zeros(&[1, 4, 4, 8]));
        cache.store(HookPoint::AttnQ(1), zeros(&[1, 4, 4, 8]));

        let merged = cache.kv_cache().unwrap();
        assert!(merged.has_queries());
        assert_eq!(merged.query(1).unwrap().dims(), &[1, 4, 4, 8]);
    }

    #[test]
    fn explicit_queries_are_not_overwritten() {
        let mut cache = HookCache::new(zeros(&[1, 4, 10]));
        let mut kv = KVCache::new(1);
        kv.set_key(0, zeros(&[1, 2, 4, 8])).unwrap();
        kv.set_query(0, zeros(&[1, 2, 4, 8])).unwrap();
        cache.set_kv_cache(kv);
        cache.store(HookPoint::AttnQ(0), zeros(&[1, 4, 4, 8]));

        let merged = cache.kv_cache().unwrap();
        assert_eq!(merged.query(0).unwrap().dims(), &[1, 2, 4, 8]);
    }
}

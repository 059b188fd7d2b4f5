// SPDX-License-Identifier: MIT OR Apache-2.0

//! Snapshot of per-layer key and query tensors from one forward pass.
//!
//! Runtimes export their KV cache in whatever layout they use internally.
//! [`KVCache`] stores the tensors as-is; the attention resolver detects the
//! layout and reconstructs attention from them.
//!
//! ## Layouts
//!
//! Each layer stores, after dropping a leading batch axis of size 1:
//! - heads-first: `[num_kv_heads, seq_len, head_dim]`
//! - seq-first: `[seq_len, num_kv_heads, head_dim]`

use candle_core::Tensor;

use crate::error::{MIError, Result};

/// Per-layer keys and (optionally) queries from one forward pass.
///
/// # Shapes
///
/// - `keys[i]`: `[batch?, num_kv_heads, seq_len, head_dim]` or `[batch?, seq_len, num_kv_heads, head_dim]`
/// - `queries[i]`: same layout, with `num_heads` in place of `num_kv_heads`
#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached key tensors per layer.
    keys: Vec<Option<Tensor>>,
    /// Captured query tensors per layer.
    queries: Vec<Option<Tensor>>,
}

impl KVCache {
    /// Create a new empty cache for the given number of layers.
    #[must_use]
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            queries: vec![None; n_layers],
        }
    }

    /// Whether no layer has keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(Option::is_none)
    }

    /// Number of layers in the cache.
    #[must_use]
    pub const fn n_layers(&self) -> usize {
        self.keys.len()
    }

    /// Store the key tensor for one layer.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `layer` is out of range.
    pub fn set_key(&mut self, layer: usize, key: Tensor) -> Result<()> {
        let n = self.n_layers();
        let slot = self.keys.get_mut(layer).ok_or_else(|| {
            MIError::Hook(format!("layer {layer} out of range for KV cache ({n} layers)"))
        })?;
        *slot = Some(key);
        Ok(())
    }

    /// Store the query tensor for one layer.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if `layer` is out of range.
    pub fn set_query(&mut self, layer: usize, query: Tensor) -> Result<()> {
        let n = self.n_layers();
        let slot = self.queries.get_mut(layer).ok_or_else(|| {
            MIError::Hook(format!("layer {layer} out of range for KV cache ({n} layers)"))
        })?;
        *slot = Some(query);
        Ok(())
    }

    /// Keys for one layer, if captured.
    #[must_use]
    pub fn key(&self, layer: usize) -> Option<&Tensor> {
        self.keys.get(layer).and_then(Option::as_ref)
    }

    /// Queries for one layer, if captured.
    #[must_use]
    pub fn query(&self, layer: usize) -> Option<&Tensor> {
        self.queries.get(layer).and_then(Option::as_ref)
    }

    /// Whether every layer has keys.
    #[must_use]
    pub fn has_keys(&self) -> bool {
        !self.keys.is_empty() && self.keys.iter().all(Option::is_some)
    }

    /// Whether every layer has queries.
    #[must_use]
    pub fn has_queries(&self) -> bool {
        !self.queries.is_empty() && self.queries.iter().all(Option::is_some)
    }

    /// Whether no layer has queries.
    #[must_use]
    pub fn has_no_queries(&self) -> bool {
        self.queries.iter().all(Option::is_none)
    }
}

impl Default for KVCache {
    fn default() -> Self {
        Self::new(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn zeros(shape: &[usize]) -> Tensor {
        Tensor::zeros(shape, DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn new_cache() {
        let cache = KVCache::new(32);
        assert_eq!(cache.n_layers(), 32);
        assert!(cache.is_empty());
        assert!(!cache.has_keys());
        assert!(!cache.has_queries());
    }

    #[test]
    fn set_and_get_layers() {
        let mut cache = KVCache::new(2);
        cache.set_key(0, zeros(&[1, 2, 4, 8])).unwrap();
        assert!(!cache.is_empty());
        assert!(!cache.has_keys());
        cache.set_key(1, zeros(&[1, 2, 9, 8])).unwrap();
        assert!(cache.has_keys());
        assert_eq!(cache.key(1).unwrap().dims(), &[1, 2, 9, 8]);
        assert!(cache.query(0).is_none());
        assert!(cache.has_no_queries());
    }

    #[test]
    fn queries_tracked_separately() {
        let mut cache = KVCache::new(1);
        cache.set_query(0, zeros(&[1, 4, 4, 8])).unwrap();
        assert!(cache.has_queries());
        assert!(!cache.has_no_queries());
        assert!(!cache.has_keys());
    }

    #[test]
    fn out_of_range_layer() {
        let mut cache = KVCache::new(4);
        assert!(cache.set_key(10, zeros(&[1])).is_err());
        assert!(cache.set_query(4, zeros(&[1])).is_err());
        assert!(cache.key(10).is_none());
    }

    #[test]
    fn default_cache() {
        let cache = KVCache::default();
        assert_eq!(cache.n_layers(), 0);
        assert!(cache.is_empty());
        assert!(!cache.has_keys());
    }
}

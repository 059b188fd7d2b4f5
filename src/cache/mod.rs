// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attention and KV storage for one forward pass.
//!
//! - [`AttentionTensor`]: per-layer, per-head post-softmax attention.
//! - [`KVCache`]: per-layer keys, values and queries as the runtime exported them.

mod attention;
mod kv;

pub use attention::{AttentionSource, AttentionTensor, ResolvedAttention};
pub use kv::KVCache;

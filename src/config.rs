// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model dimensions, vocabulary inference and analysis parameters.
//!
//! - [`ModelDims`]: the few `HuggingFace` `config.json` fields the analysis
//!   needs, read from both `LLaMA`-style and GPT-2-style key names.
//! - [`infer_vocab_size`]: best-effort vocabulary size for flat logits when
//!   runtime metadata is missing or unreliable.
//! - [`AnalysisConfig`]: circuit thresholds, ablation constants and the
//!   remaining knobs of an analysis session, loadable from JSON.
//!
//! # Usage
//!
//! ```
//! use circuit_lens::ModelDims;
//!
//! let json = serde_json::json!({
//!     "model_type": "gpt2", "n_layer": 12, "n_head": 12,
//!     "n_embd": 768, "vocab_size": 50257
//! });
//! let dims = ModelDims::from_hf_config(&json).unwrap();
//! assert_eq!(dims.head_dim, 64);
//! assert_eq!(dims.total_heads(), 144);
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{MIError, Result};
use crate::interp::ablation::AblationParams;
use crate::interp::circuits::CircuitConfig;
use crate::interp::resolver::DEFAULT_SYNTHETIC_SEED;

// ---------------------------------------------------------------------------
// ModelDims
// ---------------------------------------------------------------------------

/// Dimensions of a decoder-only transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDims {
    /// `model_type` from `config.json`, if present.
    pub model_type: Option<String>,
    /// Number of transformer layers.
    pub num_layers: usize,
    /// Query heads per layer.
    pub num_heads: usize,
    /// Key/value heads per layer (GQA when fewer than `num_heads`).
    pub num_kv_heads: usize,
    /// Hidden dimension (`d_model`).
    pub hidden_size: usize,
    /// Dimension per head.
    pub head_dim: usize,
    /// Vocabulary size, when declared.
    pub vocab_size: Option<usize>,
}

impl ModelDims {
    /// Read dimensions from a `HuggingFace` `config.json` value.
    ///
    /// Accepts `num_hidden_layers`/`n_layer`, `num_attention_heads`/`n_head`,
    /// `hidden_size`/`n_embd`/`d_model`, and optional `num_key_value_heads`,
    /// `head_dim` and `vocab_size`.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if a required dimension is missing or
    /// the head count is zero.
    pub fn from_hf_config(config: &Value) -> Result<Self> {
        let num_layers = get_first_usize(config, &["num_hidden_layers", "n_layer", "num_layers"])?;
        let num_heads = get_first_usize(config, &["num_attention_heads", "n_head"])?;
        let hidden_size = get_first_usize(config, &["hidden_size", "n_embd", "d_model"])?;

        Ok(Self {
            model_type: config
                .get("model_type")
                .and_then(Value::as_str)
                .map(str::to_string),
            num_layers,
            num_heads,
            num_kv_heads: get_usize_or(config, "num_key_value_heads", num_heads),
            hidden_size,
            head_dim: get_head_dim(config, hidden_size, num_heads)?,
            vocab_size: get_optional_usize(config, "vocab_size"),
        })
    }

    /// Total attention heads across all layers.
    #[must_use]
    pub const fn total_heads(&self) -> usize {
        self.num_layers * self.num_heads
    }
}

// ---------------------------------------------------------------------------
// JSON extraction helpers
// ---------------------------------------------------------------------------

/// Extract the first present `usize` field among `keys`.
fn get_first_usize(config: &Value, keys: &[&str]) -> Result<usize> {
    for key in keys {
        if let Some(val) = config.get(*key).and_then(Value::as_u64) {
            return usize::try_from(val)
                .map_err(|_| MIError::Config(format!("field '{key}' value {val} overflows usize")));
        }
    }
    Err(MIError::Config(format!(
        "missing or invalid field (tried {})",
        keys.join(", ")
    )))
}

/// Extract an optional `usize` field, returning a default if absent.
fn get_usize_or(config: &Value, key: &str, default: usize) -> usize {
    get_optional_usize(config, key).unwrap_or(default)
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

/// Extract `head_dim`, falling back to `hidden_size / num_heads`.
fn get_head_dim(config: &Value, hidden_size: usize, num_heads: usize) -> Result<usize> {
    let explicit = config.get("head_dim").and_then(Value::as_u64).map(|hd| {
        usize::try_from(hd).map_err(|_| MIError::Config("head_dim overflows usize".into()))
    });

    match explicit {
        Some(result) => result,
        None if num_heads == 0 => Err(MIError::Config(
            "num_attention_heads is 0, cannot compute head_dim".into(),
        )),
        None => Ok(hidden_size / num_heads),
    }
}

// ---------------------------------------------------------------------------
// Vocabulary inference
// ---------------------------------------------------------------------------

/// Vocabulary sizes of common model families, tried by the divisor heuristic.
pub const KNOWN_VOCAB_SIZES: [usize; 10] = [
    50257,  // GPT-2
    50304,  // GPT-NeoX, Pythia
    32000,  // LLaMA 1/2, Mistral
    32064,  // Phi-3
    49152,  // StarCoder2, SmolLM
    65024,  // Falcon
    100352, // Phi-4
    128256, // LLaMA 3
    151936, // Qwen2
    256000, // Gemma
];

/// Which signal a vocabulary size was inferred from, most trusted first.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabSource {
    /// Declared by the runtime or `config.json`.
    Explicit,
    /// Last axis of the logits tensor.
    TensorShape,
    /// A known vocabulary size that explains the length.
    KnownVocabulary,
    /// Flat length divided by the sequence length.
    SequenceDivision,
    /// The whole flat length, as a last resort.
    RawLength,
}

impl fmt::Display for VocabSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => write!(f, "explicit"),
            Self::TensorShape => write!(f, "tensor_shape"),
            Self::KnownVocabulary => write!(f, "known_vocabulary"),
            Self::SequenceDivision => write!(f, "sequence_division"),
            Self::RawLength => write!(f, "raw_length"),
        }
    }
}

/// Outcome of [`infer_vocab_size`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VocabInference {
    /// Inferred vocabulary size; never zero for non-empty logits.
    pub vocab_size: usize,
    /// Signal the size came from.
    pub source: VocabSource,
}

/// Infer the vocabulary size of `logits_len` flat logits over `seq_len` positions.
///
/// Cascade, first match wins:
/// 1. `explicit`, if non-zero and it divides `logits_len`;
/// 2. the last axis of `shape`, if the tensor has at least two axes;
/// 3. a [`KNOWN_VOCAB_SIZES`] entry `v` with `v · seq_len == logits_len`;
/// 4. `logits_len / seq_len`, if it divides evenly;
/// 5. the largest [`KNOWN_VOCAB_SIZES`] entry dividing `logits_len`;
/// 6. `logits_len` itself.
///
/// Every outcome other than `Explicit` logs a warning. Never fails.
#[must_use]
pub fn infer_vocab_size(
    logits_len: usize,
    seq_len: usize,
    explicit: Option<usize>,
    shape: Option<&[usize]>,
) -> VocabInference {
    let divides = |v: usize| v > 0 && logits_len % v == 0;

    if let Some(v) = explicit.filter(|&v| divides(v)) {
        return VocabInference {
            vocab_size: v,
            source: VocabSource::Explicit,
        };
    }

    let inferred = shape
        .filter(|s| s.len() >= 2)
        .and_then(|s| s.last().copied())
        .filter(|&v| divides(v))
        .map(|v| (v, VocabSource::TensorShape))
        .or_else(|| {
            KNOWN_VOCAB_SIZES
                .iter()
                .copied()
                .find(|&v| seq_len > 0 && v.checked_mul(seq_len) == Some(logits_len))
                .map(|v| (v, VocabSource::KnownVocabulary))
        })
        .or_else(|| {
            (seq_len > 0 && logits_len % seq_len == 0 && logits_len > 0)
                .then(|| (logits_len / seq_len, VocabSource::SequenceDivision))
        })
        .or_else(|| {
            KNOWN_VOCAB_SIZES
                .iter()
                .copied()
                .filter(|&v| divides(v))
                .max()
                .map(|v| (v, VocabSource::KnownVocabulary))
        })
        .unwrap_or((logits_len, VocabSource::RawLength));

    let (vocab_size, source) = inferred;
    warn!(
        logits_len,
        seq_len,
        explicit = ?explicit,
        vocab_size,
        source = %source,
        "vocabulary size inferred without trusted metadata"
    );
    VocabInference { vocab_size, source }
}

// ---------------------------------------------------------------------------
// AnalysisConfig
// ---------------------------------------------------------------------------

/// Parameters of an analysis session.
///
/// Every field has a default, so partial JSON is accepted:
///
/// ```
/// use circuit_lens::AnalysisConfig;
///
/// let cfg = AnalysisConfig::from_json_str(r#"{"top_k_predictions": 3}"#).unwrap();
/// assert_eq!(cfg.top_k_predictions, 3);
/// assert_eq!(cfg.ablation.top_k_penalized, 10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Circuit detector thresholds.
    pub circuits: CircuitConfig,
    /// Heuristic ablation constants.
    pub ablation: AblationParams,
    /// Seed for synthetic attention.
    pub synthetic_seed: u64,
    /// Number of next-token predictions reported.
    pub top_k_predictions: usize,
    /// Layer whose residual stream feeds steering vectors; last layer when `None`.
    pub steering_layer: Option<usize>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            circuits: CircuitConfig::default(),
            ablation: AblationParams::default(),
            synthetic_seed: DEFAULT_SYNTHETIC_SEED,
            top_k_predictions: 10,
            steering_layer: None,
        }
    }
}

impl AnalysisConfig {
    /// Parse from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Json`] if the string is not valid JSON for this type.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Io`] if the file cannot be read, or
    /// [`MIError::Json`] if its contents do not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn parse_llama_dims() {
        let json = serde_json::json!({
            "model_type": "llama",
            "hidden_size": 2048,
            "num_hidden_layers": 16,
            "num_attention_heads": 32,
            "num_key_value_heads": 8,
            "vocab_size": 128256
        });
        let dims = ModelDims::from_hf_config(&json).unwrap();
        assert_eq!(dims.model_type.as_deref(), Some("llama"));
        assert_eq!(dims.num_layers, 16);
        assert_eq!(dims.num_heads, 32);
        assert_eq!(dims.num_kv_heads, 8);
        assert_eq!(dims.head_dim, 64);
        assert_eq!(dims.vocab_size, Some(128256));
    }

    #[test]
    fn parse_gpt2_dims() {
        let json = serde_json::json!({ "n_layer": 6, "n_head": 12, "n_embd": 768 });
        let dims = ModelDims::from_hf_config(&json).unwrap();
        assert_eq!(dims.total_heads(), 72);
        assert_eq!(dims.num_kv_heads, 12);
        assert!(dims.vocab_size.is_none());
    }

    #[test]
    fn explicit_head_dim_wins() {
        let json = serde_json::json!({
            "num_hidden_layers": 26, "num_attention_heads": 8,
            "hidden_size": 2304, "head_dim": 256
        });
        assert_eq!(ModelDims::from_hf_config(&json).unwrap().head_dim, 256);
    }

    #[test]
    fn missing_dims_error() {
        assert!(ModelDims::from_hf_config(&serde_json::json!({ "n_layer": 2 })).is_err());
        let zero_heads = serde_json::json!({ "n_layer": 2, "n_head": 0, "n_embd": 64 });
        assert!(ModelDims::from_hf_config(&zero_heads).is_err());
    }

    #[test]
    fn vocab_explicit_when_it_divides() {
        let v = infer_vocab_size(32000 * 4, 4, Some(32000), None);
        assert_eq!(v, VocabInference { vocab_size: 32000, source: VocabSource::Explicit });

        // Explicit size that does not divide is ignored.
        let v = infer_vocab_size(50257 * 2, 2, Some(50304), Some(&[1, 2, 50257]));
        assert_eq!(v.source, VocabSource::TensorShape);
        assert_eq!(v.vocab_size, 50257);
    }

    #[test]
    fn vocab_from_known_sizes_and_division() {
        let v = infer_vocab_size(151936 * 3, 3, None, Some(&[151936 * 3]));
        assert_eq!(v, VocabInference { vocab_size: 151936, source: VocabSource::KnownVocabulary });

        let v = infer_vocab_size(1000 * 5, 5, None, None);
        assert_eq!(v, VocabInference { vocab_size: 1000, source: VocabSource::SequenceDivision });

        // Only the final position survived: length is one known vocabulary.
        let v = infer_vocab_size(32064, 7, None, None);
        assert_eq!(v, VocabInference { vocab_size: 32064, source: VocabSource::KnownVocabulary });
    }

    #[test]
    fn vocab_raw_fallback() {
        let v = infer_vocab_size(17, 3, None, None);
        assert_eq!(v, VocabInference { vocab_size: 17, source: VocabSource::RawLength });
    }

    #[test]
    fn analysis_config_defaults_and_partial_json() {
        let cfg = AnalysisConfig::from_json_str(
            r#"{"circuits": {"induction": {"emit": 0.1, "medium": 0.2, "high": 0.3}}, "steering_layer": 4}"#,
        )
        .unwrap();
        assert_eq!(cfg.circuits.induction.emit, 0.1);
        assert_eq!(cfg.circuits.previous_token.emit, 0.30);
        assert_eq!(cfg.steering_layer, Some(4));
        assert_eq!(cfg.synthetic_seed, DEFAULT_SYNTHETIC_SEED);
        assert!(AnalysisConfig::from_json_str("{not json").is_err());
    }

    #[test]
    fn analysis_config_from_file() {
        let path = std::env::temp_dir().join(format!("circuit-lens-cfg-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"synthetic_seed": 7}"#).unwrap();
        let cfg = AnalysisConfig::from_file(&path).unwrap();
        assert_eq!(cfg.synthetic_seed, 7);
        std::fs::remove_file(&path).unwrap();
        assert!(AnalysisConfig::from_file(&path).is_err());
    }
}

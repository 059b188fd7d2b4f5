// SPDX-License-Identifier: MIT OR Apache-2.0

//! # circuit-lens
//!
//! Attention circuit analysis for small causal language models in Rust,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! circuit-lens sits on top of any model runtime implementing [`MIBackend`]
//! and turns one forward pass into:
//!
//! - an [`AttentionTensor`] tagged with its [`AttentionSource`]: captured
//!   patterns (`real`), reconstructed from cached keys (`kv_derived`), or a
//!   clearly labeled `synthetic` fallback;
//! - ranked [`CircuitFinding`]s for previous-token, induction and
//!   duplicate-token heads;
//! - heuristic [`AblationReport`]s for disabling chosen heads;
//! - contrastive [`SteeringVector`]s injected at the embeddings during
//!   [`MIModel::generate`].
//!
//! ## Quick start
//!
//! ```
//! use circuit_lens::{AblationMask, AttentionResolver, AttentionSource, HookCache};
//! use circuit_lens::interp::ablation::{AblationEstimator, HeuristicAblation};
//! use candle_core::{DType, Device, Tensor};
//!
//! // A runtime that captured nothing: the resolver falls back to synthetic data.
//! let logits = Tensor::zeros((1, 6, 10), DType::F32, &Device::Cpu).unwrap();
//! let resolved = AttentionResolver::new(2, 4).resolve(&HookCache::new(logits), 6);
//! assert!(resolved.source.is_synthetic());
//!
//! let mask = AblationMask::new().head(1, 0);
//! let logits: Vec<f32> = (0..10u8).map(f32::from).collect();
//! let report = HeuristicAblation::default()
//!     .estimate(&resolved, &mask, &logits, &|id| format!("t{id}"))
//!     .unwrap()
//!     .unwrap();
//! assert_eq!(report.impact.attention_source, AttentionSource::Synthetic);
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod hooks;
pub mod interp;
pub mod library;
pub mod session;
pub mod util;

// --- Public re-exports ---------------------------------------------------

// Runtime and session
pub use backend::{GenerationConfig, GenerationResult, MIBackend, MIModel, sample_token};
pub use session::AnalysisReport;

// Attention data
pub use cache::{AttentionSource, AttentionTensor, KVCache, ResolvedAttention};

// Configuration
pub use config::{AnalysisConfig, ModelDims, VocabInference, VocabSource, infer_vocab_size};

// Errors
pub use error::{MIError, Result};

// Hooks
pub use hooks::{HookCache, HookPoint, HookSpec, Intervention, apply_intervention};

// Analyses
pub use interp::ablation::{
    AblationEstimator, AblationImpact, AblationMask, AblationMethod, AblationParams,
    AblationReport, HeadContribution, HeuristicAblation, RankChange,
};
pub use interp::circuits::{
    CircuitConfig, CircuitFinding, CircuitKind, Confidence, DetectorThresholds, detect_circuits,
};
pub use interp::logit_lens::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
pub use interp::resolver::{AttentionResolver, KvLayout};
pub use interp::steering::{SteeringConfig, SteeringVector, compute_steering_vector};

// Vector storage
pub use library::{InMemoryLibrary, JsonFileLibrary, VectorLibrary};

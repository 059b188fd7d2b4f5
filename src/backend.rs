// SPDX-License-Identifier: MIT OR Apache-2.0

//! Model runtime trait, loaded model session and generation.
//!
//! [`MIBackend`] is the seam to whatever executes the language model.
//! [`MIModel`] wraps a backend together with its device, the analysis
//! configuration and the ablation estimator; every analysis in
//! [`session`](crate::session) runs against an `MIModel`, so no state is
//! shared between sessions.

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::error::{MIError, Result};
use crate::hooks::{HookCache, HookPoint, HookSpec, Intervention};
use crate::interp::ablation::{AblationEstimator, HeuristicAblation};
use crate::interp::logit_lens::final_position_logits;
use crate::interp::steering::SteeringConfig;
use crate::util::stats::{argsort_desc, softmax};

// ---------------------------------------------------------------------------
// MIBackend trait
// ---------------------------------------------------------------------------

/// Unified interface for model runtimes with hook-aware forward passes.
///
/// The single [`forward`](Self::forward) method takes a [`HookSpec`]
/// declaring captures and interventions, and returns a [`HookCache`]
/// holding the logits plus whatever the runtime could capture. Runtimes
/// are free to return fewer captures than requested; analyses degrade
/// rather than fail.
///
/// Optional capabilities have default implementations that return `None`
/// or an error.
pub trait MIBackend: Send + Sync {
    // --- Metadata --------------------------------------------------------

    /// Number of transformer layers.
    fn num_layers(&self) -> usize;

    /// Hidden dimension (`d_model`).
    fn hidden_size(&self) -> usize;

    /// Number of query attention heads per layer.
    fn num_heads(&self) -> usize;

    /// Vocabulary size, if the runtime knows it.
    fn vocab_size(&self) -> Option<usize> {
        None
    }

    // --- Tokenization ----------------------------------------------------

    /// Encode text to token IDs.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if encoding fails.
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Decode token IDs to text.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if an ID is unknown.
    fn decode(&self, ids: &[u32]) -> Result<String>;

    // --- Core forward pass -----------------------------------------------

    /// Forward pass with optional hook capture and interventions.
    ///
    /// Interventions registered at [`HookPoint::Embed`] must be applied to
    /// the token embeddings (every position) before the first layer, using
    /// [`apply_intervention`](crate::apply_intervention).
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] on tensor operation failures and
    /// [`MIError::Intervention`] if an intervention is invalid for
    /// the current model dimensions.
    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache>;

    // --- Optional capabilities -------------------------------------------

    /// Project a hidden-state tensor to vocabulary logits.
    ///
    /// # Shapes
    /// - `hidden`: `[batch, hidden_size]` -- hidden states
    /// - returns: `[batch, vocab_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the runtime does not expose its
    /// unembedding.
    fn project_to_vocab(&self, _hidden: &Tensor) -> Result<Tensor> {
        Err(MIError::Hook(
            "project_to_vocab not supported for this backend".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// MIModel
// ---------------------------------------------------------------------------

/// A loaded model session: runtime, device, analysis settings and ablation
/// estimator.
pub struct MIModel {
    /// The underlying model runtime.
    // TRAIT_OBJECT: heterogeneous model runtimes require dynamic dispatch
    backend: Box<dyn MIBackend>,
    /// The device input tensors are created on.
    device: Device,
    /// Thresholds and constants for every analysis.
    config: AnalysisConfig,
    /// Estimator behind [`ablate`](Self::ablate).
    // TRAIT_OBJECT: an exact estimator can replace the heuristic one
    estimator: Box<dyn AblationEstimator>,
}

impl std::fmt::Debug for MIModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MIModel")
            .field("num_layers", &self.backend.num_layers())
            .field("num_heads", &self.backend.num_heads())
            .field("hidden_size", &self.backend.hidden_size())
            .field("device", &self.device)
            .field("estimator", &self.estimator.method())
            .finish_non_exhaustive()
    }
}

impl MIModel {
    /// Wrap an existing runtime with the default analysis configuration and
    /// the heuristic ablation estimator.
    // TRAIT_OBJECT: heterogeneous model runtimes require dynamic dispatch
    #[must_use]
    pub fn new(backend: Box<dyn MIBackend>, device: Device) -> Self {
        let config = AnalysisConfig::default();
        let estimator = Box::new(HeuristicAblation::new(config.ablation));
        Self {
            backend,
            device,
            config,
            estimator,
        }
    }

    /// Replace the analysis configuration.
    ///
    /// Resets the estimator to a heuristic one using `config.ablation`.
    #[must_use]
    pub fn with_config(mut self, config: AnalysisConfig) -> Self {
        self.estimator = Box::new(HeuristicAblation::new(config.ablation));
        self.config = config;
        self
    }

    /// Replace the ablation estimator.
    // TRAIT_OBJECT: caller-supplied estimator
    #[must_use]
    pub fn with_estimator(mut self, estimator: Box<dyn AblationEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// The device this model lives on.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// The analysis configuration.
    #[must_use]
    pub const fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Number of layers.
    #[must_use]
    pub fn num_layers(&self) -> usize {
        self.backend.num_layers()
    }

    /// Hidden dimension.
    #[must_use]
    pub fn hidden_size(&self) -> usize {
        self.backend.hidden_size()
    }

    /// Vocabulary size, if the runtime declares it.
    #[must_use]
    pub fn vocab_size(&self) -> Option<usize> {
        self.backend.vocab_size()
    }

    /// Number of attention heads.
    #[must_use]
    pub fn num_heads(&self) -> usize {
        self.backend.num_heads()
    }

    /// Run a forward pass with the given hook specification.
    ///
    /// # Shapes
    /// - `input_ids`: `[batch, seq]` -- token IDs
    /// - returns: [`HookCache`] containing `logits` at `[batch, seq, vocab_size]`
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying runtime.
    pub fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.backend.forward(input_ids, hooks)
    }

    /// Project hidden states to vocabulary logits.
    ///
    /// # Errors
    ///
    /// Propagates errors from the underlying runtime.
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        self.backend.project_to_vocab(hidden)
    }

    /// Access the underlying runtime.
    // TRAIT_OBJECT: caller needs dynamic dispatch for runtime-specific methods
    #[must_use]
    pub fn backend(&self) -> &dyn MIBackend {
        &*self.backend
    }

    /// Access the ablation estimator.
    #[must_use]
    pub fn estimator(&self) -> &dyn AblationEstimator {
        &*self.estimator
    }

    /// Tokenize `text`, rejecting empty results.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] if tokenization fails or yields no
    /// tokens.
    pub fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let ids = self.backend.tokenize(text)?;
        if ids.is_empty() {
            return Err(MIError::Tokenizer(format!("no tokens for input {text:?}")));
        }
        Ok(ids)
    }

    /// Decode a single token, falling back to `<id>` for unknown IDs.
    #[must_use]
    pub fn decode_token(&self, id: u32) -> String {
        self.backend
            .decode(&[id])
            .unwrap_or_else(|_| format!("<{id}>"))
    }

    /// Build a `[1, seq]` input tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Model`] if tensor creation fails.
    pub fn input_tensor(&self, ids: &[u32]) -> Result<Tensor> {
        Ok(Tensor::new(ids, &self.device)?.unsqueeze(0)?)
    }

    /// Generate a continuation of `prompt`, optionally steered.
    ///
    /// Each step re-runs the full sequence. When steering yields a delta it
    /// is registered as an [`Intervention::Add`] at [`HookPoint::Embed`] for
    /// every forward pass, so prompt and generated positions are shifted
    /// alike. With no delta the hook spec is empty and the run is an exact
    /// pass-through.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] for an empty prompt,
    /// [`MIError::Steering`] if the vector dimension differs from the
    /// hidden size, and propagates runtime errors.
    pub fn generate(
        &self,
        prompt: &str,
        generation: &GenerationConfig,
        steering: &SteeringConfig,
    ) -> Result<GenerationResult> {
        let prompt_tokens = self.tokenize(prompt)?;
        let delta = steering.delta_tensor(self.hidden_size(), &self.device)?;
        let steered = delta.is_some();

        let mut hooks = HookSpec::new();
        if let Some(delta) = delta {
            hooks.intervene(HookPoint::Embed, Intervention::Add(delta));
        }
        info!(
            prompt_tokens = prompt_tokens.len(),
            max_new_tokens = generation.max_new_tokens,
            steered,
            strength = steering.strength,
            "generating"
        );

        let mut rng = StdRng::seed_from_u64(generation.seed);
        let mut tokens = prompt_tokens.clone();
        let mut generated_tokens = Vec::with_capacity(generation.max_new_tokens);

        for step in 0..generation.max_new_tokens {
            let input = self.input_tensor(&tokens)?;
            let cache = self.backend.forward(&input, &hooks)?;
            let logits = final_position_logits(cache.output(), tokens.len(), self.vocab_size())?;
            let next = sample_token(&logits, generation.temperature, generation.top_k, &mut rng)?;
            tokens.push(next);
            generated_tokens.push(next);
            if generation.stop_token == Some(next) {
                debug!(step, token = next, "stop token reached");
                break;
            }
        }

        let generated_text = self.backend.decode(&generated_tokens)?;
        let full_text = self.backend.decode(&tokens)?;
        Ok(GenerationResult {
            prompt: prompt.to_string(),
            full_text,
            generated_text,
            total_tokens: tokens.len(),
            prompt_tokens,
            generated_tokens,
            steered,
        })
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Sampling settings for [`MIModel::generate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to append.
    pub max_new_tokens: usize,
    /// Softmax temperature; `<= 0` means greedy decoding.
    pub temperature: f32,
    /// Restrict sampling to the `k` most likely tokens.
    pub top_k: Option<usize>,
    /// Seed of the sampling RNG.
    pub seed: u64,
    /// Token that ends generation once produced.
    pub stop_token: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 32,
            temperature: 0.7,
            top_k: Some(50),
            seed: 42,
            stop_token: None,
        }
    }
}

impl GenerationConfig {
    /// Greedy decoding of up to `max_new_tokens` tokens.
    #[must_use]
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            top_k: None,
            ..Self::default()
        }
    }
}

/// Output of a text generation run with token-level details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// Original prompt text.
    pub prompt: String,
    /// Full output (prompt + generated).
    pub full_text: String,
    /// Only the generated portion.
    pub generated_text: String,
    /// Token IDs from the prompt.
    pub prompt_tokens: Vec<u32>,
    /// Token IDs that were generated.
    pub generated_tokens: Vec<u32>,
    /// Total token count (prompt + generated).
    pub total_tokens: usize,
    /// Whether a steering delta was applied.
    pub steered: bool,
}

// ---------------------------------------------------------------------------
// Sampling helpers
// ---------------------------------------------------------------------------

/// Sample a token from logits.
///
/// When `temperature <= 0.0`, performs greedy (argmax) decoding; ties go to
/// the lowest ID. Otherwise samples from `softmax(logits / temperature)`,
/// restricted to the `top_k` most likely tokens when given.
///
/// # Errors
///
/// Returns [`MIError::Model`] if `logits` is empty.
pub fn sample_token(
    logits: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    rng: &mut impl Rng,
) -> Result<u32> {
    if logits.is_empty() {
        return Err(MIError::Model(candle_core::Error::Msg("empty logits".into())));
    }
    let idx = if temperature <= 0.0 {
        argmax(logits)
    } else {
        sample_with_temperature(logits, temperature, top_k, rng)
    };
    u32::try_from(idx)
        .map_err(|_| MIError::Model(candle_core::Error::Msg(format!("token index {idx} overflows u32"))))
}

/// Greedy (argmax) sampling over non-empty logits.
fn argmax(logits: &[f32]) -> usize {
    argsort_desc(logits).first().copied().unwrap_or(0)
}

/// Temperature-scaled softmax sampling with optional top-k truncation.
fn sample_with_temperature(
    logits: &[f32],
    temperature: f32,
    top_k: Option<usize>,
    rng: &mut impl Rng,
) -> usize {
    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();
    let probs = softmax(&scaled);

    let mut candidates = argsort_desc(&probs);
    if let Some(k) = top_k.filter(|&k| k > 0) {
        candidates.truncate(k);
    }
    let mass: f32 = candidates.iter().filter_map(|&i| probs.get(i)).sum();

    let r: f32 = rng.r#gen::<f32>() * mass;
    let mut cumsum = 0.0;
    for &idx in &candidates {
        cumsum += probs.get(idx).copied().unwrap_or(0.0);
        if r < cumsum {
            return idx;
        }
    }

    // Floating-point rounding edge case.
    candidates.last().copied().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn greedy_picks_argmax() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(sample_token(&[0.1, 5.0, 2.0], 0.0, None, &mut rng).unwrap(), 1);
        assert_eq!(sample_token(&[3.0, 3.0], -1.0, None, &mut rng).unwrap(), 0);
        assert!(sample_token(&[], 0.0, None, &mut rng).is_err());
    }

    #[test]
    fn top_k_one_is_greedy() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            assert_eq!(sample_token(&[0.0, 1.0, 4.0, 2.0], 1.0, Some(1), &mut rng).unwrap(), 2);
        }
    }

    #[test]
    fn top_k_restricts_support() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..200 {
            let t = sample_token(&[5.0, 4.9, 0.0, 0.0, 0.0], 2.0, Some(2), &mut rng).unwrap();
            assert!(t < 2);
        }
    }

    #[test]
    fn sampling_is_reproducible_per_seed() {
        let logits = [0.5, 0.4, 0.3, 0.2, 0.1];
        let draw = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..16)
                .map(|_| sample_token(&logits, 1.0, None, &mut rng).unwrap())
                .collect::<Vec<_>>()
        };
        assert_eq!(draw(11), draw(11));
    }

    #[test]
    fn generation_config_defaults() {
        let g = GenerationConfig::greedy(4);
        assert_eq!(g.max_new_tokens, 4);
        assert!(g.temperature <= 0.0);
        let parsed: GenerationConfig = serde_json::from_str(r#"{"seed": 9}"#).unwrap();
        assert_eq!(parsed.seed, 9);
        assert_eq!(parsed.top_k, Some(50));
    }
}

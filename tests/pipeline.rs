// SPDX-License-Identifier: MIT OR Apache-2.0

//! Integration tests: drive `MIModel` end to end against a deterministic
//! in-process runtime built on candle tensors.
//!
//! The mock runtime can expose attention in each of the ways real runtimes
//! do (captured patterns, key/query captures, keys only, nothing) so every
//! branch of attention resolution is reached through the public pipeline.
//!
//! Run with logs:
//!   `RUST_LOG=circuit_lens=debug cargo test --test pipeline -- --nocapture`

#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::as_conversions,
    clippy::missing_docs_in_private_items,
    missing_docs
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Tensor};
use circuit_lens::{
    AblationMask, AblationMethod, AnalysisConfig, AttentionSource, CircuitKind, Confidence,
    GenerationConfig, HookCache, HookPoint, HookSpec, InMemoryLibrary, JsonFileLibrary,
    MIBackend, MIError, MIModel, Result, SteeringConfig, SteeringVector, VectorLibrary,
    apply_intervention, compute_steering_vector,
};

// ---------------------------------------------------------------------------
// Mock runtime
// ---------------------------------------------------------------------------

const VOCAB: [&str; 18] = [
    "<unk>", "The", "the", "cat", "sat", "on", "mat", ".", "A", "B", "C", "dog", "happy", "sad",
    "great", "awful", "good", "bad",
];
const N_LAYERS: usize = 2;
const N_HEADS: usize = 4;
const HIDDEN: usize = 8;
const HEAD_DIM: usize = HIDDEN / N_HEADS;

/// How the mock exposes attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Capability {
    /// `AttnPattern` captures: head 0 attends to the previous token, other
    /// heads spread uniformly.
    Patterns,
    /// `AttnQ` and `AttnK` captures.
    KeysQueries,
    /// `AttnK` captures only.
    KeysOnly,
    /// Logits and hidden states only.
    Nothing,
}

#[derive(Debug, Default)]
struct Counters {
    forwards: AtomicUsize,
    steered_forwards: AtomicUsize,
}

struct MockRuntime {
    capability: Capability,
    can_project: bool,
    /// `[vocab, hidden]`, tied with the unembedding.
    embedding: Tensor,
    counters: Arc<Counters>,
}

impl MockRuntime {
    fn new(capability: Capability) -> Self {
        let data: Vec<f32> = (0..VOCAB.len())
            .flat_map(|id| (0..HIDDEN).map(move |d| ((id + 1) as f32 * (d + 1) as f32 * 0.37).sin()))
            .collect();
        Self {
            capability,
            can_project: true,
            embedding: Tensor::from_vec(data, (VOCAB.len(), HIDDEN), &Device::Cpu).unwrap(),
            counters: Arc::new(Counters::default()),
        }
    }

    fn without_projection(mut self) -> Self {
        self.can_project = false;
        self
    }

    fn pattern(seq: usize) -> Tensor {
        let mut data = vec![0f32; N_HEADS * seq * seq];
        for h in 0..N_HEADS {
            for i in 0..seq {
                let row = (h * seq + i) * seq;
                if h == 0 {
                    data[row + i.saturating_sub(1)] = 1.0;
                } else {
                    for j in 0..=i {
                        data[row + j] = 1.0 / (i + 1) as f32;
                    }
                }
            }
        }
        Tensor::from_vec(data, (1, N_HEADS, seq, seq), &Device::Cpu).unwrap()
    }

    /// `[seq, hidden]` to `[1, heads, seq, head_dim]`.
    fn split_heads(x: &Tensor, seq: usize) -> Result<Tensor> {
        Ok(x.reshape((seq, N_HEADS, HEAD_DIM))?
            .transpose(0, 1)?
            .contiguous()?
            .unsqueeze(0)?)
    }
}

impl MIBackend for MockRuntime {
    fn num_layers(&self) -> usize {
        N_LAYERS
    }

    fn hidden_size(&self) -> usize {
        HIDDEN
    }

    fn num_heads(&self) -> usize {
        N_HEADS
    }

    fn vocab_size(&self) -> Option<usize> {
        Some(VOCAB.len())
    }

    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        text.split_whitespace()
            .map(|w| {
                VOCAB
                    .iter()
                    .position(|v| *v == w)
                    .map(|i| i as u32)
                    .ok_or_else(|| MIError::Tokenizer(format!("unknown word {w:?}")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let words = ids
            .iter()
            .map(|&id| {
                VOCAB
                    .get(id as usize)
                    .copied()
                    .ok_or_else(|| MIError::Tokenizer(format!("unknown id {id}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(words.join(" "))
    }

    fn forward(&self, input_ids: &Tensor, hooks: &HookSpec) -> Result<HookCache> {
        self.counters.forwards.fetch_add(1, Ordering::SeqCst);
        let ids = input_ids.flatten_all()?;
        let seq = ids.dim(0)?;

        let mut x = self.embedding.index_select(&ids, 0)?;
        if hooks.has_intervention_at(&HookPoint::Embed) {
            self.counters.steered_forwards.fetch_add(1, Ordering::SeqCst);
        }
        for intervention in hooks.interventions_at(&HookPoint::Embed) {
            x = apply_intervention(&x, intervention)?;
        }

        let mut captures = Vec::new();
        for layer in 0..N_LAYERS {
            match self.capability {
                Capability::Patterns => {
                    captures.push((HookPoint::AttnPattern(layer), Self::pattern(seq)));
                }
                Capability::KeysQueries => {
                    captures.push((HookPoint::AttnK(layer), Self::split_heads(&x, seq)?));
                    captures.push((
                        HookPoint::AttnQ(layer),
                        Self::split_heads(&x.affine(1.5, 0.1)?, seq)?,
                    ));
                }
                Capability::KeysOnly => {
                    captures.push((HookPoint::AttnK(layer), Self::split_heads(&x, seq)?));
                }
                Capability::Nothing => {}
            }
            x = (x.tanh()? + &x)?.affine(0.5, 0.01 * (layer + 1) as f64)?;
            captures.push((HookPoint::ResidPost(layer), x.unsqueeze(0)?));
        }

        let logits = x.matmul(&self.embedding.t()?.contiguous()?)?.unsqueeze(0)?;
        let mut cache = HookCache::new(logits);
        for (hook, tensor) in captures {
            if hooks.is_captured(&hook) {
                cache.store(hook, tensor);
            }
        }
        Ok(cache)
    }

    fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        if !self.can_project {
            return Err(MIError::Hook("no unembedding".into()));
        }
        Ok(hidden.matmul(&self.embedding.t()?.contiguous()?)?)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn model(capability: Capability) -> (MIModel, Arc<Counters>) {
    init_tracing();
    let runtime = MockRuntime::new(capability);
    let counters = Arc::clone(&runtime.counters);
    (MIModel::new(Box::new(runtime), Device::Cpu), counters)
}

const CAT_PROMPT: &str = "The cat sat on the mat . The cat sat on the";

// ---------------------------------------------------------------------------
// Attention resolution through the pipeline
// ---------------------------------------------------------------------------

#[test]
fn captured_patterns_are_real_and_detected() {
    let (model, _) = model(Capability::Patterns);
    let report = model.analyze("A B C A B C").unwrap();

    assert_eq!(report.source, AttentionSource::Real);
    assert_eq!(report.tokens, vec!["A", "B", "C", "A", "B", "C"]);
    report.attention.check_causal(1e-6).unwrap();

    let prev: Vec<_> = report.findings_of(CircuitKind::PreviousToken).collect();
    assert_eq!(prev.len(), N_LAYERS);
    for f in &prev {
        assert_eq!(f.head, 0);
        assert!((f.score - 1.0).abs() < 1e-6);
        assert_eq!(f.confidence, Confidence::High);
    }
    // Sorted by score, highest first.
    assert!(report.findings.windows(2).all(|w| w[0].score >= w[1].score));
}

#[test]
fn key_query_captures_reconstruct_real_attention() {
    let (model, _) = model(Capability::KeysQueries);
    let report = model.analyze("The cat sat on the mat").unwrap();
    assert_eq!(report.source, AttentionSource::Real);
    assert_eq!(report.attention.n_layers(), N_LAYERS);
    assert_eq!(report.attention.n_heads(), N_HEADS);
    report.attention.check_causal(1e-5).unwrap();
}

#[test]
fn keys_only_is_tagged_kv_derived() {
    let (model, _) = model(Capability::KeysOnly);
    let report = model.analyze("The cat sat on the mat").unwrap();
    assert_eq!(report.source, AttentionSource::KvDerived);
    assert!(!report.source.is_synthetic());
    report.attention.check_causal(1e-5).unwrap();
}

#[test]
fn no_attention_falls_back_to_labeled_synthetic() {
    let (model, _) = model(Capability::Nothing);
    let report = model.analyze(CAT_PROMPT).unwrap();

    assert_eq!(report.source, AttentionSource::Synthetic);
    assert!(!report.source.is_trustworthy());
    assert_eq!(report.tokens.len(), 12);
    report.attention.check_causal(1e-6).unwrap();

    let best_prev = report
        .findings_of(CircuitKind::PreviousToken)
        .next()
        .expect("synthetic attention is biased toward the previous token");
    assert!(best_prev.score > 0.3);

    // The tag survives serialization to the display layer.
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["source"], "synthetic");
}

#[test]
fn synthetic_attention_is_reproducible_per_seed() {
    let (model, _) = model(Capability::Nothing);
    let a = model.analyze(CAT_PROMPT).unwrap();
    let b = model.analyze(CAT_PROMPT).unwrap();
    assert_eq!(a.attention, b.attention);

    let cfg = AnalysisConfig {
        synthetic_seed: 7,
        ..AnalysisConfig::default()
    };
    let (other, _) = model_with_config(Capability::Nothing, cfg);
    assert_ne!(other.analyze(CAT_PROMPT).unwrap().attention, a.attention);
}

fn model_with_config(capability: Capability, config: AnalysisConfig) -> (MIModel, Arc<Counters>) {
    let (model, counters) = model(capability);
    (model.with_config(config), counters)
}

#[test]
fn analysis_reports_predictions() {
    let cfg = AnalysisConfig {
        top_k_predictions: 3,
        ..AnalysisConfig::default()
    };
    let (model, _) = model_with_config(Capability::Patterns, cfg);
    let report = model.analyze("The cat sat").unwrap();

    assert_eq!(report.final_logits.len(), VOCAB.len());
    assert_eq!(report.top_predictions.len(), 3);
    assert!(
        report
            .top_predictions
            .windows(2)
            .all(|w| w[0].probability >= w[1].probability)
    );
    let top = &report.top_predictions[0];
    assert_eq!(top.token, VOCAB[top.token_id as usize]);
}

#[test]
fn empty_or_unknown_prompt_is_an_error() {
    let (model, _) = model(Capability::Patterns);
    assert!(matches!(model.analyze(""), Err(MIError::Tokenizer(_))));
    assert!(matches!(model.analyze("zebra"), Err(MIError::Tokenizer(_))));
}

// ---------------------------------------------------------------------------
// Ablation
// ---------------------------------------------------------------------------

#[test]
fn ablating_detected_heads_reports_heuristic_impact() {
    let (model, _) = model(Capability::Patterns);
    let report = model.analyze("A B C A B C").unwrap();
    let mask = AblationMask::from_findings(&report.findings, CircuitKind::PreviousToken);
    assert_eq!(mask.len(), 2);

    let ablation = model.ablate(&report, &mask).unwrap();
    let impact = &ablation.impact;
    assert_eq!(impact.method, AblationMethod::Heuristic);
    assert_eq!(impact.attention_source, AttentionSource::Real);
    assert!(impact.kl_divergence >= 0.0);
    assert!(impact.ablation_strength > 0.0);
    assert_eq!(impact.original_top_token, report.top_predictions[0].token);
    assert!(impact.rank_changes.len() <= 5);

    assert_eq!(ablation.contributions.len(), 2);
    let total: f32 = ablation.contributions.iter().map(|c| c.percent).sum();
    assert!((total - 100.0).abs() < 1e-3);

    assert!(ablation.ablated_attention.is_uniform_filled(0, 0));
    assert!(!report.attention.is_uniform_filled(0, 0));
}

#[test]
fn ablation_on_synthetic_attention_keeps_the_tag() {
    let (model, _) = model(Capability::Nothing);
    let report = model.analyze(CAT_PROMPT).unwrap();
    let ablation = model
        .ablate(&report, &AblationMask::new().head(1, 2))
        .unwrap();
    assert_eq!(ablation.impact.attention_source, AttentionSource::Synthetic);
}

#[test]
fn invalid_masks_are_rejected() {
    let (model, _) = model(Capability::Patterns);
    let report = model.analyze("A B C").unwrap();
    assert!(matches!(
        model.ablate(&report, &AblationMask::new()),
        Err(MIError::Intervention(_))
    ));
    assert!(matches!(
        model.ablate(&report, &AblationMask::new().head(N_LAYERS, 0)),
        Err(MIError::Intervention(_))
    ));
    assert!(matches!(
        model.ablate(&report, &AblationMask::new().head(0, N_HEADS)),
        Err(MIError::Intervention(_))
    ));
}

// ---------------------------------------------------------------------------
// Steering
// ---------------------------------------------------------------------------

#[test]
fn steering_vector_is_mean_hidden_state_difference() {
    let (model, counters) = model(Capability::Nothing);
    let positives = ["happy dog", "great cat", "good mat"];
    let negatives = ["sad dog", "awful cat"];

    let before = counters.forwards.load(Ordering::SeqCst);
    let vector = model
        .build_steering_vector("mood", &positives, &negatives)
        .unwrap();
    assert_eq!(counters.forwards.load(Ordering::SeqCst) - before, 5);

    let states = |texts: &[&str]| -> Vec<Vec<f32>> {
        texts
            .iter()
            .map(|t| model.last_token_hidden_state(t).unwrap())
            .collect()
    };
    let expected = compute_steering_vector(&states(&positives[..]), &states(&negatives[..])).unwrap();
    assert_eq!(vector.name, "mood");
    assert_eq!(vector.dim(), HIDDEN);
    assert_eq!(vector.values, expected);
}

#[test]
fn steering_vector_needs_both_sides() {
    let (model, _) = model(Capability::Nothing);
    let none: [&str; 0] = [];
    assert!(matches!(
        model.build_steering_vector("x", &["happy"], &none),
        Err(MIError::Steering(_))
    ));
    assert!(matches!(
        model.build_steering_vector("x", &none, &["sad"]),
        Err(MIError::Steering(_))
    ));
}

#[test]
fn steering_layer_out_of_range_is_a_config_error() {
    let cfg = AnalysisConfig {
        steering_layer: Some(N_LAYERS),
        ..AnalysisConfig::default()
    };
    let (model, _) = model_with_config(Capability::Nothing, cfg);
    assert!(matches!(
        model.last_token_hidden_state("happy"),
        Err(MIError::Config(_))
    ));
}

#[test]
fn zero_strength_generation_equals_unsteered() {
    let (model, counters) = model(Capability::Nothing);
    let generation = GenerationConfig {
        max_new_tokens: 6,
        temperature: 0.8,
        top_k: Some(5),
        seed: 1234,
        stop_token: None,
    };
    let vector = SteeringVector::new("v", vec![0.75; HIDDEN]);

    let plain = model
        .generate("The cat", &generation, &SteeringConfig::disabled())
        .unwrap();
    let zero = model
        .generate("The cat", &generation, &SteeringConfig::new(vector.clone(), 0.0))
        .unwrap();
    let mut off = SteeringConfig::new(vector, 3.0);
    off.enabled = false;
    let disabled = model.generate("The cat", &generation, &off).unwrap();

    assert_eq!(plain.generated_tokens, zero.generated_tokens);
    assert_eq!(plain.generated_tokens, disabled.generated_tokens);
    assert_eq!(plain.generated_tokens.len(), 6);
    assert!(!zero.steered);
    assert_eq!(counters.steered_forwards.load(Ordering::SeqCst), 0);
}

#[test]
fn steering_is_applied_on_every_forward_pass() {
    let (model, counters) = model(Capability::Nothing);
    let generation = GenerationConfig::greedy(4);
    let vector = SteeringVector::new("v", vec![0.5; HIDDEN]);

    let result = model
        .generate("The cat", &generation, &SteeringConfig::new(vector, 2.0))
        .unwrap();
    assert!(result.steered);
    assert_eq!(result.prompt_tokens, vec![1, 3]);
    assert_eq!(result.total_tokens, 6);
    assert_eq!(counters.steered_forwards.load(Ordering::SeqCst), 4);
    assert_eq!(counters.forwards.load(Ordering::SeqCst), 4);
}

#[test]
fn greedy_generation_stops_at_stop_token() {
    let (model, _) = model(Capability::Nothing);
    let first = model
        .generate("The cat", &GenerationConfig::greedy(1), &SteeringConfig::disabled())
        .unwrap();
    let stop = first.generated_tokens[0];

    let generation = GenerationConfig {
        stop_token: Some(stop),
        ..GenerationConfig::greedy(10)
    };
    let result = model
        .generate("The cat", &generation, &SteeringConfig::disabled())
        .unwrap();
    assert_eq!(result.generated_tokens, vec![stop]);
    assert_eq!(result.generated_text, VOCAB[stop as usize]);
}

#[test]
fn steering_dimension_must_match_hidden_size() {
    let (model, _) = model(Capability::Nothing);
    let bad = SteeringConfig::new(SteeringVector::new("bad", vec![1.0; HIDDEN + 1]), 1.0);
    assert!(matches!(
        model.generate("The cat", &GenerationConfig::greedy(2), &bad),
        Err(MIError::Steering(_))
    ));
}

// ---------------------------------------------------------------------------
// Vector library
// ---------------------------------------------------------------------------

#[test]
fn library_round_trip_feeds_generation() {
    let (model, _) = model(Capability::Nothing);
    let vector = model
        .build_steering_vector("mood", &["happy dog"], &["sad dog"])
        .unwrap();

    let path = std::env::temp_dir().join(format!("circuit-lens-pipeline-{}.json", std::process::id()));
    let _ = std::fs::remove_file(&path);
    JsonFileLibrary::open(&path).unwrap().save(vector.clone()).unwrap();

    let library = JsonFileLibrary::open(&path).unwrap();
    let loaded = library.get_by_name("mood").unwrap().unwrap();
    assert_eq!(loaded, vector);
    std::fs::remove_file(&path).unwrap();

    let generation = GenerationConfig::greedy(3);
    let steered = model
        .generate("The cat", &generation, &SteeringConfig::new(loaded, 1.0))
        .unwrap();
    assert!(steered.steered);
    assert_eq!(steered.generated_tokens.len(), 3);
}

#[test]
fn in_memory_library_replaces_by_name() {
    let library = InMemoryLibrary::new();
    library.save(SteeringVector::new("a", vec![1.0])).unwrap();
    library.save(SteeringVector::new("a", vec![2.0])).unwrap();
    let all = library.list().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].values, vec![2.0]);
}

// ---------------------------------------------------------------------------
// Logit lens
// ---------------------------------------------------------------------------

#[test]
fn logit_lens_covers_every_layer() {
    let (model, _) = model(Capability::Nothing);
    let analysis = model.logit_lens("The cat sat", 3).unwrap();
    assert_eq!(analysis.layer_results.len(), N_LAYERS);
    for (layer, result) in analysis.layer_results.iter().enumerate() {
        assert_eq!(result.layer, layer);
        assert_eq!(result.predictions.len(), 3);
    }
    assert_eq!(analysis.top_predictions().len(), N_LAYERS);
}

#[test]
fn logit_lens_without_projection_errors() {
    init_tracing();
    let runtime = MockRuntime::new(Capability::Nothing).without_projection();
    let model = MIModel::new(Box::new(runtime), Device::Cpu);
    assert!(matches!(model.logit_lens("The cat", 2), Err(MIError::Hook(_))));
    // Other analyses are unaffected.
    assert!(model.analyze("The cat").is_ok());
}

#[test]
fn final_logits_match_runtime_output() {
    let (model, _) = model(Capability::Patterns);
    let ids = model.tokenize("The cat sat").unwrap();
    let output = model
        .forward(&model.input_tensor(&ids).unwrap(), &HookSpec::new())
        .unwrap();
    let last: Vec<f32> = output
        .output()
        .get(0)
        .unwrap()
        .get(2)
        .unwrap()
        .to_dtype(DType::F32)
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(model.analyze("The cat sat").unwrap().final_logits, last);
}

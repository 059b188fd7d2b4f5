// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end analyses on a loaded [`MIModel`].
//!
//! - [`MIModel::analyze`]: one forward pass, attention resolution, circuit
//!   detection and next-token predictions, bundled as an [`AnalysisReport`].
//! - [`MIModel::ablate`]: estimate the effect of disabling heads of a report.
//! - [`MIModel::build_steering_vector`]: contrastive vector from example
//!   texts, one runtime call per example.
//! - [`MIModel::logit_lens`]: per-layer predictions through the unembedding.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::MIModel;
use crate::cache::{AttentionSource, AttentionTensor, ResolvedAttention};
use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, HookSpec};
use crate::interp::ablation::{AblationMask, AblationReport};
use crate::interp::circuits::{CircuitFinding, CircuitKind, detect_circuits};
use crate::interp::logit_lens::{
    LogitLensAnalysis, LogitLensResult, TokenPrediction, final_position_logits, top_k_predictions,
};
use crate::interp::resolver::AttentionResolver;
use crate::interp::steering::{SteeringVector, compute_steering_vector};

/// Everything one analysis pass produces, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    /// Analyzed text.
    pub prompt: String,
    /// Token IDs of the prompt.
    pub token_ids: Vec<u32>,
    /// Decoded token strings, one per ID.
    pub tokens: Vec<String>,
    /// Resolved attention.
    pub attention: AttentionTensor,
    /// Where the attention came from. Consumers must surface `synthetic`.
    pub source: AttentionSource,
    /// Detected circuits, highest score first.
    pub findings: Vec<CircuitFinding>,
    /// Ranked next-token predictions.
    pub top_predictions: Vec<TokenPrediction>,
    /// Final-position logits of the forward pass.
    pub final_logits: Vec<f32>,
}

impl AnalysisReport {
    /// The attention paired with its source tag.
    #[must_use]
    pub fn resolved_attention(&self) -> ResolvedAttention {
        ResolvedAttention {
            tensor: self.attention.clone(),
            source: self.source,
        }
    }

    /// Findings of a single circuit kind, highest score first.
    pub fn findings_of(&self, kind: CircuitKind) -> impl Iterator<Item = &CircuitFinding> {
        self.findings.iter().filter(move |f| f.kind == kind)
    }
}

impl MIModel {
    /// Analyze `prompt`: resolve attention, detect circuits, rank predictions.
    ///
    /// Requests attention patterns, queries and keys for every layer; the
    /// runtime returns what it can and the resolver picks the best source.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Tokenizer`] for an empty prompt, and propagates
    /// runtime errors and logits extraction failures.
    pub fn analyze(&self, prompt: &str) -> Result<AnalysisReport> {
        let token_ids = self.tokenize(prompt)?;
        let seq_len = token_ids.len();

        let mut hooks = HookSpec::new();
        hooks.capture_attention(self.num_layers());
        let output = self.forward(&self.input_tensor(&token_ids)?, &hooks)?;

        let resolved = AttentionResolver::new(self.num_layers(), self.num_heads())
            .with_seed(self.config().synthetic_seed)
            .resolve(&output, seq_len);
        let tokens: Vec<String> = token_ids.iter().map(|&id| self.decode_token(id)).collect();
        let findings = detect_circuits(&resolved.tensor, &tokens, &self.config().circuits);

        let final_logits = final_position_logits(output.output(), seq_len, self.vocab_size())?;
        let top_predictions = top_k_predictions(&final_logits, self.config().top_k_predictions, |id| {
            self.decode_token(id)
        });

        info!(
            seq_len,
            source = %resolved.source,
            findings = findings.len(),
            "analysis complete"
        );
        Ok(AnalysisReport {
            prompt: prompt.to_string(),
            token_ids,
            tokens,
            attention: resolved.tensor,
            source: resolved.source,
            findings,
            top_predictions,
            final_logits,
        })
    }

    /// Estimate the effect of ablating `mask` on the analyzed prompt.
    ///
    /// The report carries the attention source of `report`, so estimates
    /// over synthetic attention stay recognizable.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Intervention`] if the mask is empty, references
    /// heads outside the report's attention, or the report has no logits.
    pub fn ablate(&self, report: &AnalysisReport, mask: &AblationMask) -> Result<AblationReport> {
        if mask.is_empty() {
            return Err(MIError::Intervention("ablation mask is empty".into()));
        }
        let decode = |id: u32| self.decode_token(id);
        self.estimator()
            .estimate(&report.resolved_attention(), mask, &report.final_logits, &decode)?
            .ok_or_else(|| MIError::Intervention("analysis report has no logits to ablate".into()))
    }

    /// Layer whose residual stream feeds steering vectors.
    fn steering_layer(&self) -> Result<usize> {
        let n_layers = self.num_layers();
        let layer = self
            .config()
            .steering_layer
            .unwrap_or_else(|| n_layers.saturating_sub(1));
        if layer >= n_layers {
            return Err(MIError::Config(format!(
                "steering layer {layer} out of range (model has {n_layers} layers)"
            )));
        }
        Ok(layer)
    }

    /// Hidden state of the final token of `text` at the steering layer.
    ///
    /// # Shapes
    /// - returns: `[hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if the steering layer is out of range,
    /// [`MIError::Hook`] if the runtime did not capture the residual stream,
    /// and [`MIError::Steering`] if its width differs from the hidden size.
    pub fn last_token_hidden_state(&self, text: &str) -> Result<Vec<f32>> {
        let layer = self.steering_layer()?;
        let ids = self.tokenize(text)?;

        let mut hooks = HookSpec::new();
        hooks.capture(HookPoint::ResidPost(layer));
        let output = self.forward(&self.input_tensor(&ids)?, &hooks)?;

        let hidden = last_row(output.require(&HookPoint::ResidPost(layer))?)?;
        let values: Vec<f32> = hidden.to_dtype(DType::F32)?.to_vec1()?;
        if values.len() != self.hidden_size() {
            return Err(MIError::Steering(format!(
                "hidden state has width {}, model hidden size is {}",
                values.len(),
                self.hidden_size()
            )));
        }
        Ok(values)
    }

    /// Build a steering vector from contrastive example texts.
    ///
    /// Runs one forward pass per example, sequentially, and returns
    /// `mean(positives) - mean(negatives)` of their final-token hidden
    /// states.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Steering`] if either list is empty, and propagates
    /// errors from [`last_token_hidden_state`](Self::last_token_hidden_state).
    pub fn build_steering_vector<S: AsRef<str>>(
        &self,
        name: &str,
        positives: &[S],
        negatives: &[S],
    ) -> Result<SteeringVector> {
        if positives.is_empty() || negatives.is_empty() {
            return Err(MIError::Steering(
                "steering needs at least one positive and one negative example".into(),
            ));
        }
        let collect = |texts: &[S]| -> Result<Vec<Vec<f32>>> {
            texts
                .iter()
                .map(|t| self.last_token_hidden_state(t.as_ref()))
                .collect()
        };
        let pos = collect(positives)?;
        let neg = collect(negatives)?;
        let values = compute_steering_vector(&pos, &neg)?;
        debug!(
            name,
            positives = pos.len(),
            negatives = neg.len(),
            dim = values.len(),
            "built steering vector"
        );
        Ok(SteeringVector::new(name, values))
    }

    /// Top-`k` predictions of every layer's final-position hidden state.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Hook`] if the runtime cannot project to the
    /// vocabulary or did not capture a layer's residual stream.
    pub fn logit_lens(&self, prompt: &str, k: usize) -> Result<LogitLensAnalysis> {
        let ids = self.tokenize(prompt)?;
        let n_layers = self.num_layers();

        let mut hooks = HookSpec::new();
        for layer in 0..n_layers {
            hooks.capture(HookPoint::ResidPost(layer));
        }
        let output = self.forward(&self.input_tensor(&ids)?, &hooks)?;

        let mut analysis = LogitLensAnalysis::new(prompt.to_string(), n_layers);
        for layer in 0..n_layers {
            let hidden = last_row(output.require(&HookPoint::ResidPost(layer))?)?;
            let logits = self.project_to_vocab(&hidden.unsqueeze(0)?)?;
            let logits: Vec<f32> = logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
            analysis.push(LogitLensResult {
                layer,
                predictions: top_k_predictions(&logits, k, |id| self.decode_token(id)),
            });
        }
        Ok(analysis)
    }
}

/// Final-position row of a residual-stream capture.
///
/// # Shapes
/// - `hidden`: `[batch, seq, hidden]` (batch 0 is used) or `[seq, hidden]`
/// - returns: `[hidden]`
fn last_row(hidden: &Tensor) -> Result<Tensor> {
    let hidden = match hidden.rank() {
        3 => hidden.get(0)?,
        2 => hidden.clone(),
        r => {
            return Err(MIError::Hook(format!(
                "residual stream capture has rank {r}, expected 2 or 3"
            )));
        }
    };
    let seq = hidden.dim(0)?;
    if seq == 0 {
        return Err(MIError::Hook("residual stream capture is empty".into()));
    }
    Ok(hidden.get(seq - 1)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn last_row_handles_batched_and_unbatched() {
        let t = Tensor::arange(0f32, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 3, 2))
            .unwrap();
        assert_eq!(last_row(&t).unwrap().to_vec1::<f32>().unwrap(), vec![4.0, 5.0]);
        let t2 = t.get(0).unwrap();
        assert_eq!(last_row(&t2).unwrap().to_vec1::<f32>().unwrap(), vec![4.0, 5.0]);
    }

    #[test]
    fn last_row_rejects_bad_shapes() {
        let flat = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        assert!(last_row(&flat).is_err());
        let empty = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(last_row(&empty).is_err());
    }
}

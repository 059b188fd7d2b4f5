// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interpretability analyses over a forward pass.
//!
//! - [`resolver`]: pick the best available attention source (captured
//!   patterns, key/query caches, or a labeled synthetic fallback).
//! - [`circuits`]: previous-token, induction and duplicate-token heads.
//! - [`ablation`]: heuristic estimate of disabling a set of heads.
//! - [`steering`]: contrastive steering vectors and their persistence.
//! - [`logit_lens`]: ranked next-token predictions, per layer.

pub mod ablation;
pub mod circuits;
pub mod logit_lens;
pub mod resolver;
pub mod steering;

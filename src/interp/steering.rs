// SPDX-License-Identifier: MIT OR Apache-2.0

//! Contrastive activation steering.
//!
//! A steering vector is the difference between the mean hidden state of a
//! set of "positive" examples and the mean of a set of "negative" examples,
//! taken at the final token of each example. During generation the scaled
//! vector is added to the token embeddings of every position before that
//! position's forward pass.
//!
//! Vectors persist as base64 of their little-endian IEEE-754 single
//! precision bytes, which round-trips bit for bit.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use candle_core::{Device, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MIError, Result};
use crate::util::vector;

// ---------------------------------------------------------------------------
// Construction
// ---------------------------------------------------------------------------

/// `mean(positives) - mean(negatives)`, element-wise.
///
/// # Errors
///
/// Returns [`MIError::Steering`] if either list is empty or any vector's
/// dimension differs from the first positive example.
///
/// # Example
///
/// ```
/// use circuit_lens::interp::steering::compute_steering_vector;
///
/// let pos = vec![vec![1.0, 2.0], vec![3.0, 2.0]];
/// let neg = vec![vec![0.0, 1.0]];
/// assert_eq!(compute_steering_vector(&pos, &neg).unwrap(), vec![2.0, 1.0]);
/// ```
pub fn compute_steering_vector(positives: &[Vec<f32>], negatives: &[Vec<f32>]) -> Result<Vec<f32>> {
    if positives.is_empty() {
        return Err(MIError::Steering("no positive examples".into()));
    }
    if negatives.is_empty() {
        return Err(MIError::Steering("no negative examples".into()));
    }
    let pos = vector::mean(positives)?;
    let neg = vector::mean(negatives)?;
    vector::sub(&pos, &neg)
}

// ---------------------------------------------------------------------------
// Persistence encoding
// ---------------------------------------------------------------------------

/// Encode values as base64 of their little-endian `f32` bytes.
#[must_use]
pub fn encode_values(values: &[f32]) -> String {
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    STANDARD.encode(bytes)
}

/// Decode values produced by [`encode_values`].
///
/// # Errors
///
/// Returns [`MIError::Encoding`] for invalid base64, and
/// [`MIError::Steering`] if the byte count is not a multiple of four or
/// the dimension differs from `expected_dim`.
pub fn decode_values(encoded: &str, expected_dim: Option<usize>) -> Result<Vec<f32>> {
    let bytes = STANDARD.decode(encoded)?;
    if bytes.len() % 4 != 0 {
        return Err(MIError::Steering(format!(
            "encoded vector has {} bytes, not a multiple of 4",
            bytes.len()
        )));
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| <[u8; 4]>::try_from(c).map(f32::from_le_bytes))
        .collect::<std::result::Result<Vec<f32>, _>>()
        .map_err(|e| MIError::Steering(format!("malformed vector bytes: {e}")))?;
    if let Some(dim) = expected_dim {
        if values.len() != dim {
            return Err(MIError::Steering(format!(
                "decoded vector has dimension {}, expected {dim}",
                values.len()
            )));
        }
    }
    Ok(values)
}

/// Serde adapter storing `Vec<f32>` as an [`encode_values`] string.
mod base64_values {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(values: &[f32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::encode_values(values))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f32>, D::Error> {
        let encoded = String::deserialize(d)?;
        super::decode_values(&encoded, None).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// SteeringVector
// ---------------------------------------------------------------------------

/// A named steering direction in hidden-state space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteeringVector {
    /// Unique identifier.
    pub id: String,
    /// Name, unique within a vector library.
    pub name: String,
    /// Direction, one value per hidden dimension.
    #[serde(with = "base64_values")]
    pub values: Vec<f32>,
    /// Creation time in Unix milliseconds.
    pub created_at: u64,
}

impl SteeringVector {
    /// Create a vector with a fresh ID stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, values: Vec<f32>) -> Self {
        let created_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
        let nonce: u32 = rand::thread_rng().r#gen();
        Self {
            id: format!("sv-{created_at:x}-{nonce:08x}"),
            name: name.into(),
            values,
            created_at,
        }
    }

    /// Hidden dimension of the vector.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

// ---------------------------------------------------------------------------
// SteeringConfig
// ---------------------------------------------------------------------------

/// Steering settings for one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SteeringConfig {
    /// Whether steering is on.
    pub enabled: bool,
    /// The vector to apply.
    pub vector: Option<SteeringVector>,
    /// Multiplier on the vector.
    pub strength: f32,
    /// Name of the selected vector, for display.
    pub vector_name: Option<String>,
}

impl SteeringConfig {
    /// Steering off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Steering on with the given vector and strength.
    #[must_use]
    pub fn new(vector: SteeringVector, strength: f32) -> Self {
        Self {
            enabled: true,
            vector_name: Some(vector.name.clone()),
            vector: Some(vector),
            strength,
        }
    }

    /// `vector · strength`, or `None` when steering is disabled, no vector
    /// is set, or the strength is zero.
    ///
    /// `None` means generation must run without any intervention.
    #[must_use]
    pub fn effective_delta(&self) -> Option<Vec<f32>> {
        if !self.enabled || self.strength == 0.0 {
            return None;
        }
        self.vector
            .as_ref()
            .map(|v| vector::scale(&v.values, self.strength))
    }

    /// The effective delta as a `[hidden_size]` tensor.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Steering`] if the vector's dimension differs from
    /// `hidden_size`, or [`MIError::Model`] if tensor creation fails.
    pub fn delta_tensor(&self, hidden_size: usize, device: &Device) -> Result<Option<Tensor>> {
        let Some(delta) = self.effective_delta() else {
            return Ok(None);
        };
        if delta.len() != hidden_size {
            return Err(MIError::Steering(format!(
                "steering vector has dimension {}, model hidden size is {hidden_size}",
                delta.len()
            )));
        }
        Ok(Some(Tensor::from_vec(delta, hidden_size, device)?))
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

    #[test]
    fn vector_is_mean_difference() {
        let pos = vec![vec![1.0, 0.0, 2.0], vec![3.0, 2.0, 0.0]];
        let neg = vec![vec![0.5, 0.5, 0.5], vec![1.5, -0.5, 0.5], vec![1.0, 0.0, 2.0]];
        let v = compute_steering_vector(&pos, &neg).unwrap();
        let expected = [2.0 - 1.0, 1.0 - 0.0, 1.0 - 1.0];
        for (a, b) in v.iter().zip(expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn construction_rejects_bad_input() {
        assert!(compute_steering_vector(&[], &[vec![1.0]]).is_err());
        assert!(compute_steering_vector(&[vec![1.0]], &[]).is_err());
        assert!(compute_steering_vector(&[vec![1.0, 2.0], vec![1.0]], &[vec![1.0, 2.0]]).is_err());
        assert!(compute_steering_vector(&[vec![1.0, 2.0]], &[vec![1.0]]).is_err());
    }

    #[test]
    fn encoding_is_little_endian_f32() {
        assert_eq!(encode_values(&[1.0]), "AACAPw==");
        assert_eq!(encode_values(&[]), "");
    }

    #[test]
    fn encoding_round_trips_bit_exact() {
        let values = vec![
            0.1,
            -0.0,
            f32::MIN_POSITIVE,
            f32::from_bits(1),
            f32::MAX,
            f32::NEG_INFINITY,
            std::f32::consts::PI,
        ];
        let decoded = decode_values(&encode_values(&values), Some(values.len())).unwrap();
        let bits = |v: &[f32]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&decoded), bits(&values));
    }

    #[test]
    fn decoding_checks_length_and_dimension() {
        assert!(decode_values("AACA", None).is_err());
        assert!(decode_values("not base64!", None).is_err());
        assert!(decode_values(&encode_values(&[1.0, 2.0]), Some(3)).is_err());
    }

    #[test]
    fn steering_vector_serializes_values_as_base64() {
        let v = SteeringVector::new("formal", vec![1.0, -2.5]);
        assert!(v.id.starts_with("sv-"));
        assert_eq!(v.dim(), 2);

        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["values"], serde_json::json!(encode_values(&[1.0, -2.5])));
        let back: SteeringVector = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn fresh_vectors_get_distinct_ids() {
        let a = SteeringVector::new("a", vec![0.0]);
        let b = SteeringVector::new("a", vec![0.0]);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn effective_delta_pass_through_cases() {
        let v = SteeringVector::new("v", vec![1.0, 2.0]);
        assert!(SteeringConfig::disabled().effective_delta().is_none());
        assert!(SteeringConfig::new(v.clone(), 0.0).effective_delta().is_none());

        let mut off = SteeringConfig::new(v.clone(), 3.0);
        off.enabled = false;
        assert!(off.effective_delta().is_none());

        let mut no_vector = SteeringConfig::new(v.clone(), 3.0);
        no_vector.vector = None;
        assert!(no_vector.effective_delta().is_none());

        let on = SteeringConfig::new(v, -2.0);
        assert_eq!(on.vector_name.as_deref(), Some("v"));
        assert_eq!(on.effective_delta().unwrap(), vec![-2.0, -4.0]);
    }

    #[test]
    fn delta_tensor_checks_hidden_size() {
        let cfg = SteeringConfig::new(SteeringVector::new("v", vec![1.0, 2.0]), 1.5);
        let t = cfg.delta_tensor(2, &Device::Cpu).unwrap().unwrap();
        assert_eq!(t.to_vec1::<f32>().unwrap(), vec![1.5, 3.0]);
        assert!(cfg.delta_tensor(4, &Device::Cpu).is_err());
        assert!(SteeringConfig::disabled().delta_tensor(4, &Device::Cpu).unwrap().is_none());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Element-wise algebra over fixed-length `f32` vectors.
//!
//! Hidden-state vectors arrive from the model runtime as plain `Vec<f32>`
//! (one per example); steering-vector construction only needs these four
//! operations, so they work on slices rather than candle tensors.

use crate::error::{MIError, Result};

/// Check that two vectors share a dimension.
fn check_same_dim(a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() != b.len() {
        return Err(MIError::Steering(format!(
            "dimension mismatch: {} vs {}",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

/// Element-wise `a + b`.
///
/// # Errors
///
/// Returns [`MIError::Steering`] if the dimensions differ.
pub fn add(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    check_same_dim(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x + y).collect())
}

/// Element-wise `a - b`.
///
/// # Errors
///
/// Returns [`MIError::Steering`] if the dimensions differ.
pub fn sub(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    check_same_dim(a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

/// Multiply every element by `factor`.
#[must_use]
pub fn scale(a: &[f32], factor: f32) -> Vec<f32> {
    a.iter().map(|x| x * factor).collect()
}

/// Element-wise mean of a non-empty list of equal-length vectors.
///
/// # Errors
///
/// Returns [`MIError::Steering`] if `vectors` is empty or any vector's
/// dimension disagrees with the first.
pub fn mean(vectors: &[Vec<f32>]) -> Result<Vec<f32>> {
    let first = vectors
        .first()
        .ok_or_else(|| MIError::Steering("cannot average an empty list of vectors".into()))?;

    let mut acc = vec![0.0_f32; first.len()];
    for (idx, v) in vectors.iter().enumerate() {
        if v.len() != first.len() {
            return Err(MIError::Steering(format!(
                "vector {idx} has dimension {}, expected {}",
                v.len(),
                first.len()
            )));
        }
        for (a, x) in acc.iter_mut().zip(v) {
            *a += x;
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::as_conversions)]
    let n = vectors.len() as f32;
    Ok(scale(&acc, 1.0 / n))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn add_and_sub() {
        let a = [1.0, 2.0, 3.0];
        let b = [0.5, -1.0, 2.0];
        assert_eq!(add(&a, &b).unwrap(), vec![1.5, 1.0, 5.0]);
        assert_eq!(sub(&a, &b).unwrap(), vec![0.5, 3.0, 1.0]);
    }

    #[test]
    fn mismatched_dimensions_error() {
        assert!(add(&[1.0, 2.0], &[1.0]).is_err());
        assert!(sub(&[1.0], &[1.0, 2.0]).is_err());
    }

    #[test]
    fn scale_by_zero_is_zero() {
        assert_eq!(scale(&[1.0, -2.0], 0.0), vec![0.0, 0.0]);
    }

    #[test]
    fn mean_of_vectors() {
        let m = mean(&[vec![1.0, 4.0], vec![3.0, 0.0]]).unwrap();
        assert!((m[0] - 2.0).abs() < 1e-6);
        assert!((m[1] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn mean_rejects_empty_and_ragged() {
        assert!(mean(&[]).is_err());
        assert!(mean(&[vec![1.0, 2.0], vec![1.0]]).is_err());
    }
}

// SPDX-License-Identifier: MIT OR Apache-2.0

//! Additive attention masks.

use candle_core::{Device, Tensor};

use crate::error::Result;

/// Build an additive causal mask: `0.0` where `j <= i`, `-inf` where `j > i`.
///
/// Added to attention scores before softmax so future positions receive
/// exactly zero weight.
///
/// # Shapes
/// - returns: `[seq_len, seq_len]`
///
/// # Errors
///
/// Returns [`MIError::Model`](crate::MIError::Model) if tensor creation fails.
pub fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(mask, (seq_len, seq_len), device)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_layout() {
        let mask = causal_mask(3, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[3, 3]);
        let rows: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite() && rows[0][1].is_sign_negative());
        assert_eq!(rows[2][0], 0.0);
        assert_eq!(rows[2][2], 0.0);
        assert!(rows[1][2].is_infinite());
    }
}

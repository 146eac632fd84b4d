//! Shared attention primitives for the vision tower and the text decoder.
//!
//! Everything here operates on batch-1 tensors; the service runs one image
//! per generation, so the batched padding-mask machinery a multi-image
//! pipeline needs does not exist in this crate.

use candle_core::{D, DType, Device, Result, Tensor};

/// Scaled dot-product attention: `softmax(Q K^T * scale) V`.
///
/// Shapes are `(batch, heads, seq, head_dim)`. With `is_causal` and no
/// explicit mask a lower-triangular mask is applied; decode steps with a
/// single query position pass `is_causal = false` since the KV cache only
/// contains past positions.
pub fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    scale: f64,
    is_causal: bool,
) -> Result<Tensor> {
    let attn_weights = (q.matmul(&k.transpose(2, 3)?)? * scale)?;

    let attn_weights = if is_causal && attn_weights.dim(2)? > 1 {
        let seq_len = attn_weights.dim(2)?;
        let kv_len = attn_weights.dim(3)?;
        let mask = causal_mask(seq_len, kv_len, attn_weights.dtype(), q.device())?;
        attn_weights.broadcast_add(&mask)?
    } else {
        attn_weights
    };

    // Softmax in F32 for numerical stability, then cast back.
    let input_dtype = attn_weights.dtype();
    let attn_weights = attn_weights.to_dtype(DType::F32)?;
    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_weights = attn_weights.to_dtype(input_dtype)?;

    attn_weights.matmul(v)
}

/// Lower-triangular mask of shape `(1, 1, seq_len, kv_len)`: 0 where
/// attention is allowed, -inf elsewhere.
fn causal_mask(seq_len: usize, kv_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let offset = kv_len.saturating_sub(seq_len);
    let mut data = vec![0f32; seq_len * kv_len];
    for row in 0..seq_len {
        for col in (row + offset + 1)..kv_len {
            data[row * kv_len + col] = f32::NEG_INFINITY;
        }
    }
    Tensor::from_vec(data, (1, 1, seq_len, kv_len), device)?.to_dtype(dtype)
}

/// Rotates the last dimension halves: `[x1, x2] -> [-x2, x1]`.
pub fn rotate_half(x: &Tensor) -> Result<Tensor> {
    let last_dim = x.dim(D::Minus1)?;
    let x1 = x.narrow(D::Minus1, 0, last_dim / 2)?;
    let x2 = x.narrow(D::Minus1, last_dim / 2, last_dim / 2)?;
    Tensor::cat(&[&x2.neg()?, &x1], D::Minus1)
}

/// Repeats KV heads for grouped-query attention.
///
/// Input `(batch, num_kv_heads, seq, head_dim)`, output
/// `(batch, num_kv_heads * n_rep, seq, head_dim)`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .expand((batch, num_kv_heads, n_rep, seq_len, head_dim))?
        .reshape((batch, num_kv_heads * n_rep, seq_len, head_dim))
}

/// Multi-axis rotary embedding (M-RoPE) computed on the fly from inverse
/// frequencies. Position ids carry three axes (text, height, width).
#[derive(Debug, Clone)]
pub struct MultiAxisRope {
    inv_freq: Tensor,
    num_axes: usize,
}

impl MultiAxisRope {
    pub fn new(head_dim: usize, rope_theta: f64, num_axes: usize, device: &Device) -> Result<Self> {
        let half = head_dim / 2;
        let mut inv_freq = Vec::with_capacity(half);
        for i in (0..head_dim).step_by(2) {
            inv_freq.push((1f64 / rope_theta.powf(i as f64 / head_dim as f64)) as f32);
        }
        let inv_freq = Tensor::from_vec(inv_freq, (half,), device)?;
        Ok(Self { inv_freq, num_axes })
    }

    /// Computes `(cos, sin)` of shape `(num_axes, batch, seq, head_dim)` for
    /// position ids of shape `(num_axes, batch, seq)`.
    pub fn cos_sin(&self, position_ids: &Tensor, dtype: DType) -> Result<(Tensor, Tensor)> {
        let dims = position_ids.dims();
        if dims.len() != 3 || dims[0] != self.num_axes {
            candle_core::bail!(
                "expected position_ids shape ({}, B, S), got {dims:?}",
                self.num_axes
            );
        }

        let position_ids = position_ids.to_dtype(DType::F32)?;
        let inv_len = self.inv_freq.dims1()?;
        let inv = self.inv_freq.reshape((1usize, 1usize, 1usize, inv_len))?;
        let freqs = position_ids.unsqueeze(3)?.broadcast_mul(&inv)?;
        let emb = Tensor::cat(&[&freqs, &freqs], D::Minus1)?;
        Ok((emb.cos()?.to_dtype(dtype)?, emb.sin()?.to_dtype(dtype)?))
    }
}

/// Collapses the axis dimension of an M-RoPE cos/sin tensor into a single
/// `(batch, 1, seq, head_dim)` tensor by taking each head-dim section from
/// its assigned axis.
///
/// `mrope_section` sizes must sum to `head_dim / 2`; the sections repeat over
/// both rotary halves.
pub fn select_rope_sections(cos_or_sin: &Tensor, mrope_section: &[usize]) -> Result<Tensor> {
    let dims = cos_or_sin.dims();
    let (num_axes, head_dim) = match dims {
        [axes, _, _, dim] => (*axes, *dim),
        _ => candle_core::bail!("expected (axes, B, S, D) tensor, got {dims:?}"),
    };
    let section_sum: usize = mrope_section.iter().sum();
    if section_sum * 2 != head_dim {
        candle_core::bail!(
            "mrope_section {mrope_section:?} does not cover head_dim {head_dim}"
        );
    }

    let mut parts = Vec::with_capacity(mrope_section.len() * 2);
    let mut offset = 0usize;
    for (i, &section) in mrope_section.iter().chain(mrope_section.iter()).enumerate() {
        let axis = i % num_axes;
        let part = cos_or_sin
            .narrow(0, axis, 1)?
            .squeeze(0)?
            .narrow(D::Minus1, offset, section)?;
        parts.push(part);
        offset += section;
    }
    let refs: Vec<&Tensor> = parts.iter().collect();
    Tensor::cat(&refs, D::Minus1)?.unsqueeze(1)
}

/// Applies M-RoPE to query and key tensors.
pub fn apply_multimodal_rope(
    q: &Tensor,
    k: &Tensor,
    cos: &Tensor,
    sin: &Tensor,
    mrope_section: &[usize],
) -> Result<(Tensor, Tensor)> {
    let cos = select_rope_sections(cos, mrope_section)?;
    let sin = select_rope_sections(sin, mrope_section)?;

    let q_rot = (q.broadcast_mul(&cos)? + rotate_half(q)?.broadcast_mul(&sin)?)?;
    let k_rot = (k.broadcast_mul(&cos)? + rotate_half(k)?.broadcast_mul(&sin)?)?;
    Ok((q_rot, k_rot))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_blocks_future_positions() {
        let mask = causal_mask(3, 3, DType::F32, &Device::Cpu).unwrap();
        let values: Vec<f32> = mask.flatten_all().unwrap().to_vec1().unwrap();
        // Row 0 may only see column 0.
        assert_eq!(values[0], 0.0);
        assert_eq!(values[1], f32::NEG_INFINITY);
        // Last row sees everything.
        assert!(values[6..9].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn rotate_half_swaps_and_negates() {
        let x = Tensor::from_vec(vec![1f32, 2.0, 3.0, 4.0], (1, 4), &Device::Cpu).unwrap();
        let rotated = rotate_half(&x).unwrap();
        let values: Vec<f32> = rotated.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![-3.0, -4.0, 1.0, 2.0]);
    }

    #[test]
    fn repeat_kv_expands_head_dimension() {
        let x = Tensor::zeros((1, 2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        let repeated = repeat_kv(&x, 3).unwrap();
        assert_eq!(repeated.dims(), &[1, 6, 5, 8]);
    }

    #[test]
    fn select_rope_sections_rejects_bad_layout() {
        let t = Tensor::zeros((3, 1, 4, 8), DType::F32, &Device::Cpu).unwrap();
        // Sections sum to 3, head_dim/2 is 4.
        assert!(select_rope_sections(&t, &[1, 1, 1]).is_err());
        // Sections sum to 4, accepted.
        let out = select_rope_sections(&t, &[2, 1, 1]).unwrap();
        assert_eq!(out.dims(), &[1, 1, 4, 8]);
    }

    #[test]
    fn multi_axis_rope_shapes() {
        let rope = MultiAxisRope::new(8, 10_000.0, 3, &Device::Cpu).unwrap();
        let pos = Tensor::zeros((3, 1, 5), DType::I64, &Device::Cpu).unwrap();
        let (cos, sin) = rope.cos_sin(&pos, DType::F32).unwrap();
        assert_eq!(cos.dims(), &[3, 1, 5, 8]);
        assert_eq!(sin.dims(), &[3, 1, 5, 8]);
    }
}

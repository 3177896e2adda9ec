//! Decoder building blocks on candle tensors
//!
//! Norms, activations, softmax and rotary embedding are candle-nn's fused
//! ops; this module adds the pieces specific to the packed batch layout.

use candle_core::{DType, Device, Tensor};
use candle_nn::rotary_emb::rope;
use shardline_common::Result;

/// Score added to attention logits a query must not see
pub const MASKED: f32 = -1.0e30;

/// `x @ w^T` for `x: [n, in]`, `w: [out, in]`
pub fn linear(x: &Tensor, weight: &Tensor) -> Result<Tensor> {
    Ok(x.matmul(&weight.t()?)?)
}

/// SwiGLU feed-forward: `down(silu(gate(x)) * up(x))`
pub fn swiglu(x: &Tensor, gate: &Tensor, up: &Tensor, down: &Tensor) -> Result<Tensor> {
    let activated = candle_nn::ops::silu(&linear(x, gate)?)?.broadcast_mul(&linear(x, up)?)?;
    linear(&activated, down)
}

/// Repeat key/value heads to match the query heads: `[n, kv, d] -> [n, kv * rep, d]`
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (n, kv_heads, head_dim) = x.dims3()?;
    Ok(x
        .unsqueeze(2)?
        .expand((n, kv_heads, n_rep, head_dim))?
        .contiguous()?
        .reshape((n, kv_heads * n_rep, head_dim))?)
}

/// Rotary position embedding tables for one forward call
///
/// Tokens of a packed batch sit at unrelated positions, so the tables hold
/// one row per token rather than one per position.
#[derive(Debug, Clone)]
pub struct Rotary {
    cos: Tensor,
    sin: Tensor,
}

impl Rotary {
    /// Build `[n, head_dim / 2]` cos/sin tables for the given token positions
    pub fn new(
        positions: &[u32],
        head_dim: usize,
        theta: f64,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let half = head_dim / 2;
        let inv_freq: Vec<f64> = (0..half)
            .map(|i| 1.0 / theta.powf(2.0 * i as f64 / head_dim as f64))
            .collect();

        let mut cos = Vec::with_capacity(positions.len() * half);
        let mut sin = Vec::with_capacity(positions.len() * half);
        for &position in positions {
            for freq in &inv_freq {
                let angle = position as f64 * freq;
                cos.push(angle.cos() as f32);
                sin.push(angle.sin() as f32);
            }
        }

        let shape = (positions.len(), half);
        Ok(Self {
            cos: Tensor::from_vec(cos, shape, device)?.to_dtype(dtype)?,
            sin: Tensor::from_vec(sin, shape, device)?.to_dtype(dtype)?,
        })
    }

    /// Rotate `x: [n, heads, head_dim]`
    pub fn apply(&self, x: &Tensor) -> Result<Tensor> {
        // rope() wants [batch, heads, seq, head_dim]; the packed tokens form the sequence
        let x = x.transpose(0, 1)?.unsqueeze(0)?.contiguous()?;
        let rotated = rope(&x, &self.cos, &self.sin)?;
        Ok(rotated.squeeze(0)?.transpose(0, 1)?)
    }
}

/// Additive causal mask `[q_len, k_len]` for queries at `query_positions`
/// against keys at positions `key_start..key_start + k_len`
pub fn causal_mask(
    query_positions: &[u32],
    key_start: usize,
    k_len: usize,
    device: &Device,
) -> Result<Tensor> {
    let mut mask = Vec::with_capacity(query_positions.len() * k_len);
    for &query in query_positions {
        for key in key_start..key_start + k_len {
            mask.push(if key > query as usize { MASKED } else { 0.0 });
        }
    }
    Ok(Tensor::from_vec(mask, (query_positions.len(), k_len), device)?)
}

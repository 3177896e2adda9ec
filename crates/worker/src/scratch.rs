//! Intermediate tensor pool
//!
//! Preallocated f32 staging buffers for split-KV decode attention. Each
//! decode token gets one row holding a partial attention output and a
//! log-sum-exp value per KV split (one split per cache block).

use crate::model::tensor_bytes;
use candle_core::{DType, Device, Tensor};
use shardline_common::{InferenceConfig, Result, ShardlineError};
use tracing::debug;

/// Dimensions of the pool's buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchShape {
    /// Rows: `max_batch_size * (max_n_spec_tokens + 1)`
    pub max_tokens: usize,
    pub num_heads: usize,
    /// `ceil((max_input_len + max_output_len) / block_size)`
    pub kv_max_split_num: usize,
    pub head_dim: usize,
}

impl ScratchShape {
    pub fn new(config: &InferenceConfig, num_heads_local: usize, head_dim: usize) -> Self {
        Self {
            max_tokens: config.max_tokens_per_step(),
            num_heads: num_heads_local,
            kv_max_split_num: config.kv_max_split_num(),
            head_dim,
        }
    }
}

#[derive(Debug)]
struct ScratchBuffers {
    shape: ScratchShape,
    /// `[max_tokens, num_heads, kv_max_split_num, head_dim]`
    mid_output: Tensor,
    /// `[max_tokens, num_heads, kv_max_split_num]`
    mid_output_lse: Tensor,
}

/// Reusable split-reduction accumulators
#[derive(Debug, Default)]
pub struct IntermediateTensorPool {
    buffers: Option<ScratchBuffers>,
}

impl IntermediateTensorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate zeroed buffers, dropping any previous ones first
    pub fn initialize(&mut self, shape: ScratchShape, device: &Device) -> Result<()> {
        if self.buffers.take().is_some() {
            debug!("reinitializing intermediate tensor pool");
        }

        let ScratchShape {
            max_tokens,
            num_heads,
            kv_max_split_num,
            head_dim,
        } = shape;

        let mid_output = Tensor::zeros(
            (max_tokens, num_heads, kv_max_split_num, head_dim),
            DType::F32,
            device,
        )?;
        let mid_output_lse =
            Tensor::zeros((max_tokens, num_heads, kv_max_split_num), DType::F32, device)?;

        debug!(
            "intermediate tensor pool: {} rows, {} heads, {} splits, head dim {}",
            max_tokens, num_heads, kv_max_split_num, head_dim
        );

        self.buffers = Some(ScratchBuffers {
            shape,
            mid_output,
            mid_output_lse,
        });
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.buffers.is_some()
    }

    fn buffers(&self) -> Result<&ScratchBuffers> {
        self.buffers
            .as_ref()
            .ok_or_else(|| ShardlineError::internal("intermediate tensor pool is not initialized"))
    }

    pub fn shape(&self) -> Result<ScratchShape> {
        Ok(self.buffers()?.shape)
    }

    /// Partial attention outputs, one slot per split
    pub fn mid_output(&self) -> Result<&Tensor> {
        Ok(&self.buffers()?.mid_output)
    }

    /// Log-sum-exp of each split's scores
    pub fn mid_output_lse(&self) -> Result<&Tensor> {
        Ok(&self.buffers()?.mid_output_lse)
    }

    /// Bytes held by the pool
    pub fn bytes(&self) -> usize {
        self.buffers
            .as_ref()
            .map(|b| tensor_bytes(&b.mid_output) + tensor_bytes(&b.mid_output_lse))
            .unwrap_or(0)
    }
}

//! Forward execution pipeline
//!
//! One call runs the local slice of the model over a bound batch: embedding
//! on the first pipeline stage, the stage's decoder layers with
//! tensor-parallel reductions, hand-off of hidden states between stages, and
//! on the last stage the final norm and LM head over the requested output
//! rows. Logits are broadcast back over the pipeline group so every worker
//! returns them.

use crate::attention::{decode_attention, prefill_attention, AttentionInput};
use crate::batch::{bind, BatchLimits, BoundBatch};
use crate::cache::KvCacheStore;
use crate::model::layers::{linear, swiglu, Rotary};
use crate::scratch::IntermediateTensorPool;
use crate::sharding::{ShardedLayer, ShardedModel};
use candle_core::{DType, Tensor};
use candle_nn::ops::rms_norm;
use shardline_common::{BatchDescriptor, InferenceConfig, Result, ShardlineError, METRICS};
use std::time::Instant;
use tracing::{debug, trace};

/// Logits of one forward call, row-major `[num_rows, row_width]`
#[derive(Debug, Clone, PartialEq)]
pub struct Logits {
    pub values: Vec<f32>,
    pub num_rows: usize,
    pub row_width: usize,
}

impl Logits {
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.values.chunks(self.row_width.max(1))
    }

    /// Index of the largest logit in each row
    pub fn argmax(&self) -> Vec<usize> {
        self.rows()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                    .0
            })
            .collect()
    }
}

/// Runs forward steps of a sharded model
#[derive(Debug)]
pub struct ForwardPipeline {
    config: InferenceConfig,
    /// `[max_batch_size * (max_n_spec_tokens + 1), hidden]`, last stage only
    output: Option<Tensor>,
}

impl ForwardPipeline {
    pub fn new(config: &InferenceConfig, model: &ShardedModel) -> Result<Self> {
        let output = if model.layout.is_last_stage() {
            Some(Tensor::zeros(
                (config.max_tokens_per_step(), model.config.hidden_size),
                model.dtype,
                &model.device,
            )?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            output,
        })
    }

    /// Execute one step. Validation completes before the cache is touched.
    pub fn execute(
        &self,
        model: &ShardedModel,
        cache: &KvCacheStore,
        scratch: &IntermediateTensorPool,
        tokens: &[i64],
        descriptor: &BatchDescriptor,
    ) -> Result<Logits> {
        debug!("batch descriptor: {:?}", descriptor);

        let result = METRICS
            .forward
            .duration
            .observe_closure_duration(|| self.run(model, cache, scratch, tokens, descriptor));

        match &result {
            Ok(_) => {
                METRICS.forward.batch_size.observe(descriptor.batch_size as f64);
                METRICS.forward.tokens_total.inc_by(tokens.len() as u64);
            }
            Err(_) => METRICS.forward.failures_total.inc(),
        }
        result
    }

    fn run(
        &self,
        model: &ShardedModel,
        cache: &KvCacheStore,
        scratch: &IntermediateTensorPool,
        tokens: &[i64],
        descriptor: &BatchDescriptor,
    ) -> Result<Logits> {
        let start = Instant::now();
        if cache.num_layers() != model.num_local_layers() {
            return Err(ShardlineError::internal(format!(
                "cache holds {} layers, stage owns {}",
                cache.num_layers(),
                model.num_local_layers()
            )));
        }

        let limits = BatchLimits::new(
            &self.config,
            model.config.vocab_size,
            scratch.shape()?,
            cache.shape(),
            model.policy.padded_input(),
        );
        let batch = bind(descriptor, tokens, &limits)?;

        let mut hidden = self.stage_input(model, &batch)?;
        let rotary = Rotary::new(
            &batch.positions,
            model.head_dim(),
            model.config.rope_theta,
            model.dtype,
            &model.device,
        )?;

        for (local, layer) in model.layers.iter().enumerate() {
            hidden = decoder_layer(model, layer, local, &hidden, &rotary, cache, scratch, &batch)?;
            trace!("layer {} done", layer.index);
        }

        let layout = &model.layout;
        let mut values = Vec::new();
        if let Some(next) = layout.next_stage_rank() {
            let data = hidden.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            layout.pp_group.send_to(next, &data)?;
        } else {
            values = self.logits(model, &hidden, &batch)?;
        }
        layout.pp_group.broadcast(layout.last_stage_rank(), &mut values)?;

        let num_rows = batch.output_rows.len();
        let row_width = model.config.vocab_size;
        if values.len() != num_rows * row_width {
            return Err(ShardlineError::internal(format!(
                "received {} logits for {} rows of {}",
                values.len(),
                num_rows,
                row_width
            )));
        }

        debug!(
            "forward over {} tokens ({} rows) took {:?}",
            batch.num_tokens(),
            num_rows,
            start.elapsed()
        );
        Ok(Logits {
            values,
            num_rows,
            row_width,
        })
    }

    /// Hidden states entering this stage: `[tokens, hidden]`
    fn stage_input(&self, model: &ShardedModel, batch: &BoundBatch) -> Result<Tensor> {
        let hidden_size = model.config.hidden_size;
        let tokens = batch.num_tokens();

        match (&model.embed_tokens, model.layout.prev_stage_rank()) {
            (Some(embed), _) => {
                let ids = Tensor::new(batch.token_ids.as_slice(), &model.device)?;
                Ok(embed.index_select(&ids, 0)?)
            }
            (None, Some(prev)) => {
                let data = model.layout.pp_group.recv_from(prev)?;
                if data.len() != tokens * hidden_size {
                    return Err(ShardlineError::collective(format!(
                        "stage {} received {} hidden values, expected {}",
                        model.layout.stage(),
                        data.len(),
                        tokens * hidden_size
                    )));
                }
                Ok(Tensor::from_vec(data, (tokens, hidden_size), &model.device)?.to_dtype(model.dtype)?)
            }
            (None, None) => Err(ShardlineError::internal("first stage has no embedding")),
        }
    }

    /// Norm and LM head over the output rows, staged through the output buffer
    fn logits(&self, model: &ShardedModel, hidden: &Tensor, batch: &BoundBatch) -> Result<Vec<f32>> {
        let (Some(output), Some(norm), Some(lm_head)) = (&self.output, &model.norm, &model.lm_head) else {
            return Err(ShardlineError::internal("last stage is missing its head"));
        };

        let rows = batch.output_rows.len();
        let index = Tensor::new(batch.output_rows.as_slice(), &model.device)?;
        let selected = hidden.index_select(&index, 0)?.contiguous()?;
        output.slice_set(&selected, 0, 0)?;

        let final_rows = output.narrow(0, 0, rows)?.contiguous()?;
        let normed = rms_norm(&final_rows, norm, model.config.rms_norm_eps as f32)?;
        Ok(linear(&normed, lm_head)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }
}

#[allow(clippy::too_many_arguments)]
fn decoder_layer(
    model: &ShardedModel,
    layer: &ShardedLayer,
    local: usize,
    hidden: &Tensor,
    rotary: &Rotary,
    cache: &KvCacheStore,
    scratch: &IntermediateTensorPool,
    batch: &BoundBatch,
) -> Result<Tensor> {
    let eps = model.config.rms_norm_eps as f32;
    let tokens = batch.num_tokens();
    let head_dim = model.head_dim();
    let heads = model.num_heads_local();
    let kv_heads = model.num_kv_heads_local();
    let tp_group = &model.layout.tp_group;

    let normed = rms_norm(&hidden.contiguous()?, &layer.input_layernorm, eps)?;
    let query = rotary.apply(&linear(&normed, &layer.q_proj)?.reshape((tokens, heads, head_dim))?)?;
    let key = rotary.apply(&linear(&normed, &layer.k_proj)?.reshape((tokens, kv_heads, head_dim))?)?;
    let value = linear(&normed, &layer.v_proj)?.reshape((tokens, kv_heads, head_dim))?;

    let input = AttentionInput {
        query: &query,
        key: &key,
        value: &value,
    };
    let attention = if batch.is_prompts {
        prefill_attention(cache, local, batch, &input)?
    } else {
        decode_attention(cache, scratch, local, batch, &input)?
    };

    let attention = linear(&attention.reshape((tokens, heads * head_dim))?, &layer.o_proj)?;
    let hidden = (hidden + tp_group.all_reduce_tensor(&attention)?)?;

    let normed = rms_norm(&hidden.contiguous()?, &layer.post_attention_layernorm, eps)?;
    let mlp = swiglu(&normed, &layer.gate_proj, &layer.up_proj, &layer.down_proj)?;
    Ok((hidden + tp_group.all_reduce_tensor(&mlp)?)?)
}

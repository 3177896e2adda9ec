//! Paged attention over the KV cache store
//!
//! Prefill attends causally over the prompt's own keys and values, then
//! stores them in the cache. Decode stores the new keys and values first and
//! attends over the cache blocks of each sequence, one split per block: every
//! split produces a partial output and the log-sum-exp of its scores, staged
//! in the intermediate tensor pool, and the partials are combined by
//! softmax-weighting their log-sum-exp values.

use crate::batch::{BoundBatch, SequenceSlot};
use crate::cache::KvCacheStore;
use crate::model::layers::{causal_mask, repeat_kv};
use crate::scratch::IntermediateTensorPool;
use candle_core::{DType, Tensor, D};
use candle_nn::ops::softmax_last_dim;
use shardline_common::{Result, ShardlineError};

/// Projected attention inputs for every token of a step
///
/// `query` is `[tokens, heads, head_dim]`, `key` and `value` are
/// `[tokens, kv_heads, head_dim]`, all after rotary embedding.
pub struct AttentionInput<'a> {
    pub query: &'a Tensor,
    pub key: &'a Tensor,
    pub value: &'a Tensor,
}

impl AttentionInput<'_> {
    fn n_rep(&self) -> Result<usize> {
        Ok(self.query.dim(1)? / self.key.dim(1)?)
    }

    fn scale(&self) -> Result<f64> {
        Ok(1.0 / (self.query.dim(2)? as f64).sqrt())
    }
}

/// Store this step's keys and values of every sequence in `layer`
pub fn write_kv(
    cache: &KvCacheStore,
    layer: usize,
    batch: &BoundBatch,
    input: &AttentionInput<'_>,
) -> Result<()> {
    let block_size = cache.shape().block_size;
    for seq in &batch.sequences {
        let start = seq.start_pos();
        for (block, slot, first, count) in seq.block_runs(start, seq.context_len, block_size) {
            let offset = seq.token_offset + first;
            cache.write(
                layer,
                block,
                slot,
                &input.key.narrow(0, offset, count)?,
                &input.value.narrow(0, offset, count)?,
            )?;
        }
    }
    Ok(())
}

/// Causal self-attention over each prompt, returning `[tokens, heads, head_dim]`
pub fn prefill_attention(
    cache: &KvCacheStore,
    layer: usize,
    batch: &BoundBatch,
    input: &AttentionInput<'_>,
) -> Result<Tensor> {
    let dtype = input.query.dtype();
    let device = input.query.device();
    let n_rep = input.n_rep()?;
    let scale = input.scale()?;

    let mut outputs = Vec::with_capacity(batch.sequences.len());
    for seq in &batch.sequences {
        let n = seq.num_new;
        let positions = &batch.positions[seq.token_offset..seq.token_offset + n];

        let q = heads_first(&input.query.narrow(0, seq.token_offset, n)?)?;
        let k = heads_first(&repeat_kv(&input.key.narrow(0, seq.token_offset, n)?, n_rep)?)?;
        let v = heads_first(&repeat_kv(&input.value.narrow(0, seq.token_offset, n)?, n_rep)?)?;

        let scores = (q.matmul(&k.t()?)? * scale)?;
        let mask = causal_mask(positions, seq.start_pos(), n, device)?;
        let probs = softmax_last_dim(&scores.broadcast_add(&mask)?)?;

        // [heads, n, d] -> [n, heads, d]
        outputs.push(probs.matmul(&v)?.transpose(0, 1)?);
    }

    write_kv(cache, layer, batch, input)?;
    Ok(Tensor::cat(&outputs, 0)?.to_dtype(dtype)?)
}

/// Split-KV attention of the new tokens over the cache, returning `[tokens, heads, head_dim]`
pub fn decode_attention(
    cache: &KvCacheStore,
    scratch: &IntermediateTensorPool,
    layer: usize,
    batch: &BoundBatch,
    input: &AttentionInput<'_>,
) -> Result<Tensor> {
    write_kv(cache, layer, batch, input)?;

    let mut outputs = Vec::with_capacity(batch.sequences.len());
    for seq in &batch.sequences {
        let splits = stage_splits(cache, scratch, layer, batch, seq, input)?;
        outputs.push(reduce_splits(scratch, seq, splits)?);
    }

    Ok(Tensor::cat(&outputs, 0)?.to_dtype(input.query.dtype())?)
}

/// Compute one partial per cache block and stage them in the pool rows of `seq`
fn stage_splits(
    cache: &KvCacheStore,
    scratch: &IntermediateTensorPool,
    layer: usize,
    batch: &BoundBatch,
    seq: &SequenceSlot,
    input: &AttentionInput<'_>,
) -> Result<usize> {
    let shape = scratch.shape()?;
    let block_size = cache.shape().block_size;
    let n_rep = input.n_rep()?;
    let scale = input.scale()?;
    let m = seq.num_new;
    let splits = seq.blocks.len();
    if splits > shape.kv_max_split_num {
        return Err(ShardlineError::invalid_input(format!(
            "sequence spans {} blocks, scratch holds {} splits",
            splits, shape.kv_max_split_num
        )));
    }

    let device = input.query.device();
    let positions = &batch.positions[seq.token_offset..seq.token_offset + m];
    let q = heads_first(&input.query.narrow(0, seq.token_offset, m)?.to_dtype(DType::F32)?)?;

    let mut partials = Vec::with_capacity(splits);
    let mut lses = Vec::with_capacity(splits);
    for (split, &block) in seq.blocks.iter().enumerate() {
        let key_start = split * block_size;
        let valid = block_size.min(seq.context_len - key_start);

        let (key, value) = cache.read_block(layer, block)?;
        let k = cached_heads(&key, valid, n_rep)?;
        let v = cached_heads(&value, valid, n_rep)?;

        // [heads, m, valid]
        let mut scores = (q.matmul(&k.t()?)? * scale)?;
        if m > 1 {
            scores = scores.broadcast_add(&causal_mask(positions, key_start, valid, device)?)?;
        }

        let max = scores.max_keepdim(D::Minus1)?;
        let exp = scores.broadcast_sub(&max)?.exp()?;
        let sum = exp.sum_keepdim(D::Minus1)?;
        let partial = exp.matmul(&v)?.broadcast_div(&sum)?;
        let lse = (max + sum.log()?)?;

        // [heads, m, d] -> [m, heads, 1, d] and [heads, m, 1] -> [m, heads, 1]
        partials.push(partial.transpose(0, 1)?.unsqueeze(2)?);
        lses.push(lse.transpose(0, 1)?);
    }

    let heads = q.dim(0)?;
    let unused = shape.kv_max_split_num - splits;
    if unused > 0 {
        partials.push(Tensor::zeros((m, heads, unused, shape.head_dim), DType::F32, device)?);
        lses.push(Tensor::zeros((m, heads, unused), DType::F32, device)?);
    }

    let mid = Tensor::cat(&partials, 2)?.contiguous()?;
    let mid_lse = Tensor::cat(&lses, 2)?.contiguous()?;
    scratch.mid_output()?.slice_set(&mid, 0, seq.token_offset)?;
    scratch.mid_output_lse()?.slice_set(&mid_lse, 0, seq.token_offset)?;
    Ok(splits)
}

/// Combine the staged partials of `seq`: `[m, heads, head_dim]`
fn reduce_splits(scratch: &IntermediateTensorPool, seq: &SequenceSlot, splits: usize) -> Result<Tensor> {
    let mid = scratch
        .mid_output()?
        .narrow(0, seq.token_offset, seq.num_new)?
        .narrow(2, 0, splits)?;
    let lse = scratch
        .mid_output_lse()?
        .narrow(0, seq.token_offset, seq.num_new)?
        .narrow(2, 0, splits)?;

    let weights = softmax_last_dim(&lse.contiguous()?)?.unsqueeze(3)?;
    Ok(mid.broadcast_mul(&weights)?.sum(2)?)
}

/// `[n, heads, d] -> [heads, n, d]`, contiguous
fn heads_first(x: &Tensor) -> Result<Tensor> {
    Ok(x.transpose(0, 1)?.contiguous()?.to_dtype(DType::F32)?)
}

/// First `valid` slots of a cached block `[kv_heads, block_size, d]`,
/// repeated to `[heads, valid, d]` in f32
fn cached_heads(block: &Tensor, valid: usize, n_rep: usize) -> Result<Tensor> {
    let rows = block.narrow(1, 0, valid)?.transpose(0, 1)?.contiguous()?;
    heads_first(&repeat_kv(&rows.to_dtype(DType::F32)?, n_rep)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{bind, BatchLimits};
    use crate::cache::CacheShape;
    use crate::scratch::ScratchShape;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use shardline_common::{BatchDescriptor, ModelDType};

    const HEADS: usize = 4;
    const KV_HEADS: usize = 2;
    const HEAD_DIM: usize = 8;
    const BLOCK: usize = 4;

    fn random(rng: &mut StdRng, shape: (usize, usize, usize)) -> Tensor {
        let data: Vec<f32> = (0..shape.0 * shape.1 * shape.2)
            .map(|_| rng.gen_range(-1.0..1.0))
            .collect();
        Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
    }

    fn limits() -> BatchLimits {
        BatchLimits {
            max_batch_size: 2,
            max_input_len: 16,
            max_context_len: 24,
            max_n_spec_tokens: 2,
            vocab_size: 100,
            max_rows: 6,
            block_size: BLOCK,
            num_blocks: 8,
            dtype: ModelDType::Float32,
            padded_prefill: false,
        }
    }

    fn fixtures() -> (KvCacheStore, IntermediateTensorPool) {
        let shape = CacheShape::from_alloc(&[8, KV_HEADS, BLOCK, HEAD_DIM]).unwrap();
        let cache = KvCacheStore::allocate(shape, 1, DType::F32, &Device::Cpu, None).unwrap();
        let mut scratch = IntermediateTensorPool::new();
        scratch
            .initialize(
                ScratchShape {
                    max_tokens: 6,
                    num_heads: HEADS,
                    kv_max_split_num: 6,
                    head_dim: HEAD_DIM,
                },
                &Device::Cpu,
            )
            .unwrap();
        (cache, scratch)
    }

    fn descriptor(lengths: Vec<usize>, tables: Vec<Vec<i64>>, is_prompts: bool, spec: usize) -> BatchDescriptor {
        BatchDescriptor {
            batch_size: lengths.len(),
            sequence_lengths: lengths,
            block_tables: tables,
            is_prompts,
            use_spec_dec: spec > 0,
            num_tokens_to_verify: spec,
            dtype: None,
        }
    }

    fn assert_close(a: &Tensor, b: &Tensor) {
        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_split_decode_matches_full_attention() {
        // A 10-token prompt over blocks 5, 1, 6 followed by a 3-token speculative step
        let (cache, scratch) = fixtures();
        let mut rng = StdRng::seed_from_u64(3);
        let table = vec![vec![5, 1, 6, 3]];

        let q = random(&mut rng, (13, HEADS, HEAD_DIM));
        let k = random(&mut rng, (13, KV_HEADS, HEAD_DIM));
        let v = random(&mut rng, (13, KV_HEADS, HEAD_DIM));

        let prompt = bind(&descriptor(vec![10], table.clone(), true, 0), &[1; 10], &limits()).unwrap();
        let prompt_input = AttentionInput {
            query: &q.narrow(0, 0, 10).unwrap(),
            key: &k.narrow(0, 0, 10).unwrap(),
            value: &v.narrow(0, 0, 10).unwrap(),
        };
        prefill_attention(&cache, 0, &prompt, &prompt_input).unwrap();

        let step = bind(&descriptor(vec![13], table, false, 2), &[1; 3], &limits()).unwrap();
        let step_input = AttentionInput {
            query: &q.narrow(0, 10, 3).unwrap(),
            key: &k.narrow(0, 10, 3).unwrap(),
            value: &v.narrow(0, 10, 3).unwrap(),
        };
        let decoded = decode_attention(&cache, &scratch, 0, &step, &step_input).unwrap();

        // Same 13 tokens attended in one causal pass
        let full = bind(&descriptor(vec![13], vec![vec![0, 2, 4, 7]], true, 0), &[1; 13], &limits()).unwrap();
        let input = AttentionInput {
            query: &q,
            key: &k,
            value: &v,
        };
        let reference = prefill_attention(&cache, 0, &full, &input).unwrap();

        assert_eq!(decoded.dims(), &[3, HEADS, HEAD_DIM]);
        assert_close(&decoded, &reference.narrow(0, 10, 3).unwrap());
    }

    #[test]
    fn test_writes_stay_in_referenced_blocks() {
        let (cache, scratch) = fixtures();
        let mut rng = StdRng::seed_from_u64(9);

        let batch = bind(
            &descriptor(vec![3, 6], vec![vec![2, -1], vec![4, 0]], true, 0),
            &[1; 9],
            &limits(),
        )
        .unwrap();
        let q = random(&mut rng, (9, HEADS, HEAD_DIM));
        let k = random(&mut rng, (9, KV_HEADS, HEAD_DIM));
        let v = random(&mut rng, (9, KV_HEADS, HEAD_DIM));
        let input = AttentionInput {
            query: &q,
            key: &k,
            value: &v,
        };
        prefill_attention(&cache, 0, &batch, &input).unwrap();
        assert_eq!(cache.nonzero_blocks(0).unwrap(), vec![0, 2, 4]);

        // one decode token for the first sequence lands at slot 3 of block 2
        let step = bind(&descriptor(vec![4, 7], vec![vec![2], vec![4, 0]], false, 0), &[1, 1], &limits()).unwrap();
        let q = random(&mut rng, (2, HEADS, HEAD_DIM));
        let k = random(&mut rng, (2, KV_HEADS, HEAD_DIM));
        let input = AttentionInput {
            query: &q,
            key: &k,
            value: &k,
        };
        decode_attention(&cache, &scratch, 0, &step, &input).unwrap();
        assert_eq!(cache.nonzero_blocks(0).unwrap(), vec![0, 2, 4]);

        let (stored, _) = cache.read_block(0, 2).unwrap();
        let stored = stored.narrow(1, 3, 1).unwrap().squeeze(1).unwrap();
        assert_close(&stored, &k.get(0).unwrap());
    }
}

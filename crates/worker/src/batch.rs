//! Binding a batch descriptor to the worker's buffers
//!
//! Everything about a forward call is checked here, before any cache write:
//! batch and token counts, token ids, context lengths, scratch capacity and
//! block-table coverage.

use crate::cache::CacheShape;
use crate::scratch::ScratchShape;
use shardline_common::{BatchDescriptor, InferenceConfig, ModelDType, Result, ShardlineError};

/// Capacity limits a batch is checked against
#[derive(Debug, Clone)]
pub struct BatchLimits {
    pub max_batch_size: usize,
    pub max_input_len: usize,
    pub max_context_len: usize,
    pub max_n_spec_tokens: usize,
    pub vocab_size: usize,
    pub max_rows: usize,
    pub block_size: usize,
    pub num_blocks: usize,
    pub dtype: ModelDType,
    /// Prefill tokens arrive as a right-padded `[batch, max_len]` grid
    pub padded_prefill: bool,
}

impl BatchLimits {
    pub fn new(
        config: &InferenceConfig,
        vocab_size: usize,
        scratch: ScratchShape,
        cache: CacheShape,
        padded_prefill: bool,
    ) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            max_input_len: config.max_input_len,
            max_context_len: config.max_context_len(),
            max_n_spec_tokens: config.max_n_spec_tokens,
            vocab_size,
            max_rows: scratch.max_tokens,
            block_size: cache.block_size,
            num_blocks: cache.num_blocks,
            dtype: config.dtype,
            padded_prefill,
        }
    }
}

/// One sequence's part of a bound batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceSlot {
    /// Offset of this sequence's first new token in the packed token list
    pub token_offset: usize,
    pub num_new: usize,
    /// Context length after this step
    pub context_len: usize,
    /// Block ids covering `0..context_len`
    pub blocks: Vec<usize>,
}

impl SequenceSlot {
    /// Position of the first new token
    pub fn start_pos(&self) -> usize {
        self.context_len - self.num_new
    }

    /// Blocks touched by positions `start..end`, as `(block, slot, first_token, count)`
    /// with `first_token` relative to `start`
    pub fn block_runs(&self, start: usize, end: usize, block_size: usize) -> Vec<(usize, usize, usize, usize)> {
        let mut runs = Vec::new();
        let mut pos = start;
        while pos < end {
            let slot = pos % block_size;
            let count = (block_size - slot).min(end - pos);
            runs.push((self.blocks[pos / block_size], slot, pos - start, count));
            pos += count;
        }
        runs
    }
}

/// A validated batch, tokens packed without padding
#[derive(Debug, Clone)]
pub struct BoundBatch {
    pub is_prompts: bool,
    pub token_ids: Vec<u32>,
    /// Position of each packed token within its sequence
    pub positions: Vec<u32>,
    pub sequences: Vec<SequenceSlot>,
    /// Packed token indices whose logits are returned, in batch order
    pub output_rows: Vec<u32>,
}

impl BoundBatch {
    pub fn num_tokens(&self) -> usize {
        self.token_ids.len()
    }
}

/// Validate `descriptor` and `tokens` and lay the batch out for the forward pass
pub fn bind(descriptor: &BatchDescriptor, tokens: &[i64], limits: &BatchLimits) -> Result<BoundBatch> {
    let batch_size = descriptor.batch_size;
    if batch_size == 0 {
        return Err(ShardlineError::invalid_input("batch is empty"));
    }
    if batch_size > limits.max_batch_size {
        return Err(ShardlineError::invalid_input(format!(
            "batch of {} exceeds max_batch_size {}",
            batch_size, limits.max_batch_size
        )));
    }
    if descriptor.sequence_lengths.len() != batch_size || descriptor.block_tables.len() != batch_size {
        return Err(ShardlineError::invalid_input(format!(
            "batch of {} has {} sequence lengths and {} block tables",
            batch_size,
            descriptor.sequence_lengths.len(),
            descriptor.block_tables.len()
        )));
    }
    if let Some(dtype) = descriptor.dtype {
        if dtype != limits.dtype {
            return Err(ShardlineError::invalid_input(format!(
                "batch dtype {} does not match model dtype {}",
                dtype, limits.dtype
            )));
        }
    }
    if !descriptor.is_prompts
        && descriptor.use_spec_dec
        && descriptor.num_tokens_to_verify > limits.max_n_spec_tokens
    {
        return Err(ShardlineError::invalid_input(format!(
            "{} speculated tokens exceed max_n_spec_tokens {}",
            descriptor.num_tokens_to_verify, limits.max_n_spec_tokens
        )));
    }

    let mut sequences = Vec::with_capacity(batch_size);
    let mut token_offset = 0;
    for (index, (&context_len, table)) in descriptor
        .sequence_lengths
        .iter()
        .zip(&descriptor.block_tables)
        .enumerate()
    {
        let num_new = descriptor.num_new_tokens(index);
        if context_len == 0 || context_len < num_new {
            return Err(ShardlineError::invalid_input(format!(
                "sequence {} has length {} but adds {} tokens",
                index, context_len, num_new
            )));
        }
        if descriptor.is_prompts && context_len > limits.max_input_len {
            return Err(ShardlineError::invalid_input(format!(
                "prompt {} of {} tokens exceeds max_input_len {}",
                index, context_len, limits.max_input_len
            )));
        }
        if context_len > limits.max_context_len {
            return Err(ShardlineError::invalid_input(format!(
                "sequence {} reaches {} tokens, limit is {}",
                index, context_len, limits.max_context_len
            )));
        }

        let blocks = covering_blocks(index, table, context_len, limits)?;
        sequences.push(SequenceSlot {
            token_offset,
            num_new,
            context_len,
            blocks,
        });
        token_offset += num_new;
    }

    let output_rows: Vec<u32> = if descriptor.is_prompts {
        sequences
            .iter()
            .map(|s| (s.token_offset + s.num_new - 1) as u32)
            .collect()
    } else {
        (0..token_offset as u32).collect()
    };
    if output_rows.len() > limits.max_rows {
        return Err(ShardlineError::invalid_input(format!(
            "{} output rows exceed capacity {}",
            output_rows.len(),
            limits.max_rows
        )));
    }

    let token_ids = pack_tokens(descriptor, tokens, &sequences, limits)?;
    let positions = sequences
        .iter()
        .flat_map(|s| (s.start_pos()..s.context_len).map(|p| p as u32))
        .collect();

    Ok(BoundBatch {
        is_prompts: descriptor.is_prompts,
        token_ids,
        positions,
        sequences,
        output_rows,
    })
}

fn covering_blocks(
    index: usize,
    table: &[i64],
    context_len: usize,
    limits: &BatchLimits,
) -> Result<Vec<usize>> {
    let needed = context_len.div_ceil(limits.block_size);
    if table.len() < needed {
        return Err(ShardlineError::invalid_input(format!(
            "sequence {} needs {} blocks, block table has {}",
            index,
            needed,
            table.len()
        )));
    }

    table[..needed]
        .iter()
        .map(|&block| {
            if block < 0 || block as usize >= limits.num_blocks {
                Err(ShardlineError::invalid_input(format!(
                    "sequence {} references block {} outside a cache of {} blocks",
                    index, block, limits.num_blocks
                )))
            } else {
                Ok(block as usize)
            }
        })
        .collect()
}

fn pack_tokens(
    descriptor: &BatchDescriptor,
    tokens: &[i64],
    sequences: &[SequenceSlot],
    limits: &BatchLimits,
) -> Result<Vec<u32>> {
    let packed_len: usize = sequences.iter().map(|s| s.num_new).sum();

    let packed: Vec<i64> = if descriptor.is_prompts && limits.padded_prefill {
        let width = sequences.iter().map(|s| s.num_new).max().unwrap_or(0);
        if tokens.len() != sequences.len() * width {
            return Err(ShardlineError::invalid_input(format!(
                "padded prefill expects {} x {} tokens, got {}",
                sequences.len(),
                width,
                tokens.len()
            )));
        }
        tokens
            .chunks(width)
            .zip(sequences)
            .flat_map(|(row, s)| row[..s.num_new].iter().copied())
            .collect()
    } else {
        if tokens.len() != packed_len {
            return Err(ShardlineError::invalid_input(format!(
                "batch expects {} tokens, got {}",
                packed_len,
                tokens.len()
            )));
        }
        tokens.to_vec()
    };

    packed
        .into_iter()
        .map(|id| {
            if id < 0 || id as usize >= limits.vocab_size {
                Err(ShardlineError::invalid_input(format!(
                    "token id {} outside vocabulary of {}",
                    id, limits.vocab_size
                )))
            } else {
                Ok(id as u32)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> BatchLimits {
        BatchLimits {
            max_batch_size: 4,
            max_input_len: 32,
            max_context_len: 48,
            max_n_spec_tokens: 2,
            vocab_size: 100,
            max_rows: 12,
            block_size: 4,
            num_blocks: 8,
            dtype: ModelDType::Float32,
            padded_prefill: false,
        }
    }

    fn prefill(lengths: Vec<usize>, tables: Vec<Vec<i64>>) -> BatchDescriptor {
        BatchDescriptor {
            batch_size: lengths.len(),
            sequence_lengths: lengths,
            block_tables: tables,
            is_prompts: true,
            use_spec_dec: false,
            num_tokens_to_verify: 0,
            dtype: None,
        }
    }

    #[test]
    fn test_packed_prefill() {
        let descriptor = prefill(vec![3, 5], vec![vec![0, -1], vec![1, 2]]);
        let bound = bind(&descriptor, &[1, 2, 3, 4, 5, 6, 7, 8], &limits()).unwrap();

        assert_eq!(bound.token_ids, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bound.positions, vec![0, 1, 2, 0, 1, 2, 3, 4]);
        assert_eq!(bound.output_rows, vec![2, 7]);
        assert_eq!(bound.sequences[1].token_offset, 3);
        assert_eq!(
            bound.sequences[1].block_runs(0, 5, 4),
            vec![(1, 0, 0, 4), (2, 0, 4, 1)]
        );
    }

    #[test]
    fn test_padded_prefill_strips_padding() {
        let descriptor = prefill(vec![2, 3], vec![vec![0], vec![1]]);
        let limits = BatchLimits {
            padded_prefill: true,
            ..limits()
        };
        let bound = bind(&descriptor, &[1, 2, 0, 4, 5, 6], &limits).unwrap();
        assert_eq!(bound.token_ids, vec![1, 2, 4, 5, 6]);
        assert_eq!(bound.output_rows, vec![1, 4]);

        assert!(bind(&descriptor, &[1, 2, 4, 5, 6], &limits).is_err());
    }

    #[test]
    fn test_speculative_decode() {
        let descriptor = BatchDescriptor {
            batch_size: 2,
            sequence_lengths: vec![6, 9],
            block_tables: vec![vec![0, 1, -1], vec![2, 3, 4]],
            is_prompts: false,
            use_spec_dec: true,
            num_tokens_to_verify: 2,
            dtype: Some(ModelDType::Float32),
        };
        let bound = bind(&descriptor, &[1, 2, 3, 4, 5, 6], &limits()).unwrap();

        assert_eq!(bound.positions, vec![3, 4, 5, 6, 7, 8]);
        assert_eq!(bound.output_rows, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(bound.sequences[1].start_pos(), 6);
        assert_eq!(
            bound.sequences[1].block_runs(6, 9, 4),
            vec![(3, 2, 0, 2), (4, 0, 2, 1)]
        );
    }

    #[test]
    fn test_rejections() {
        let ok = prefill(vec![3], vec![vec![0]]);
        assert!(bind(&ok, &[1, 2, 3], &limits()).is_ok());

        // token id outside the vocabulary
        assert!(bind(&ok, &[1, 2, 100], &limits()).is_err());
        // wrong token count
        assert!(bind(&ok, &[1, 2], &limits()).is_err());
        // block id outside the cache
        assert!(bind(&prefill(vec![3], vec![vec![8]]), &[1, 2, 3], &limits()).is_err());
        // block table does not cover the context
        assert!(bind(&prefill(vec![5], vec![vec![0, -1]]), &[1; 5], &limits()).is_err());
        // batch too large
        let big = prefill(vec![1; 5], vec![vec![0]; 5]);
        assert!(bind(&big, &[1; 5], &limits()).is_err());
        // dtype mismatch
        let mut half = ok.clone();
        half.dtype = Some(ModelDType::Float16);
        assert!(bind(&half, &[1, 2, 3], &limits()).is_err());
        // too many speculated tokens
        let decode = BatchDescriptor {
            is_prompts: false,
            use_spec_dec: true,
            num_tokens_to_verify: 3,
            sequence_lengths: vec![8],
            ..ok
        };
        assert!(bind(&decode, &[1; 4], &limits()).is_err());
    }
}

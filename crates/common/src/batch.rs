//! Batch descriptor exchanged with every forward call

use crate::config::ModelDType;
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Metadata for one forward call over a batch of sequences
///
/// Built by the coordinator per call and discarded afterwards. All sequences
/// of a batch are either in prefill or in decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDescriptor {
    pub batch_size: usize,

    /// Context length of each sequence once this step's tokens are in
    pub sequence_lengths: Vec<usize>,

    /// Cache block ids per sequence, padded with -1
    pub block_tables: Vec<Vec<i64>>,

    /// Prefill (whole prompt) when true, decode otherwise
    pub is_prompts: bool,

    /// Decode steps verify speculated tokens
    #[serde(default)]
    pub use_spec_dec: bool,

    /// Speculated tokens per sequence when `use_spec_dec` is set
    #[serde(default)]
    pub num_tokens_to_verify: usize,

    #[serde(default)]
    pub dtype: Option<ModelDType>,
}

impl BatchDescriptor {
    pub fn from_rpc_param(param: &str) -> Result<Self> {
        Ok(serde_json::from_str(param)?)
    }

    pub fn to_rpc_param(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Tokens each sequence contributes to this step
    pub fn num_new_tokens(&self, sequence: usize) -> usize {
        if self.is_prompts {
            self.sequence_lengths.get(sequence).copied().unwrap_or(0)
        } else if self.use_spec_dec {
            self.num_tokens_to_verify + 1
        } else {
            1
        }
    }

    /// Number of logits rows the call returns
    pub fn num_output_rows(&self) -> usize {
        if self.is_prompts {
            self.batch_size
        } else {
            (0..self.batch_size).map(|i| self.num_new_tokens(i)).sum()
        }
    }
}

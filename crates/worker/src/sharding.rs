//! Model sharding engine
//!
//! A [`ShardingPolicy`] turns an unsharded [`CausalLm`] into the slice this
//! process owns. Attention and MLP projections are split Megatron-style:
//! q/k/v, gate and up are column-parallel (each rank keeps a block of output
//! rows), o and down are row-parallel (each rank keeps a block of input
//! columns) and their partial outputs are summed over the tensor-parallel
//! group. Embedding, norms and LM head are replicated. Layers are split into
//! contiguous pipeline stages.
//!
//! The result is an explicit [`ShardedModel`] carrying the process groups and
//! per-tensor [`SliceSpec`]s next to the weights.

use crate::fabric::ProcessGroup;
use crate::model::{tensor_bytes, CausalLm, DecoderLayerWeights, ModelArchitecture, ModelConfig, QkvWeights};
use candle_core::{DType, Device, Tensor};
use shardline_common::{Result, ShardlineError};
use std::fmt;
use std::ops::Range;
use tracing::{debug, info};

/// Named strategy for sharding one model family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardingPolicy {
    NoPaddingLlama,
    PaddingLlama,
    NoPaddingBaichuan,
}

impl ShardingPolicy {
    /// Look up a policy by name
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "NoPaddingLlamaModelInferPolicy" | "nopadding_llama" => Ok(ShardingPolicy::NoPaddingLlama),
            "PaddingLlamaModelInferPolicy" | "padding_llama" => Ok(ShardingPolicy::PaddingLlama),
            "NoPaddingBaichuanModelInferPolicy" | "nopadding_baichuan" => {
                Ok(ShardingPolicy::NoPaddingBaichuan)
            }
            other => Err(ShardlineError::UnknownPolicy(other.to_string())),
        }
    }

    /// Pick the policy for a model type and input layout
    pub fn auto(pad_input: bool, model_type: &str) -> Result<Self> {
        let prefix = if pad_input { "padding_" } else { "nopadding_" };
        let key = format!("{}{}", prefix, model_type);
        match key.as_str() {
            "padding_llama" | "nopadding_llama" | "nopadding_baichuan" => Self::from_name(&key),
            _ => Err(ShardlineError::UnknownPolicy(key)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ShardingPolicy::NoPaddingLlama => "NoPaddingLlamaModelInferPolicy",
            ShardingPolicy::PaddingLlama => "PaddingLlamaModelInferPolicy",
            ShardingPolicy::NoPaddingBaichuan => "NoPaddingBaichuanModelInferPolicy",
        }
    }

    /// Architecture this policy knows how to shard
    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            ShardingPolicy::NoPaddingLlama | ShardingPolicy::PaddingLlama => ModelArchitecture::Llama,
            ShardingPolicy::NoPaddingBaichuan => ModelArchitecture::Baichuan,
        }
    }

    /// Whether prefill tokens arrive as a right-padded `[batch, max_len]` grid
    pub fn padded_input(&self) -> bool {
        matches!(self, ShardingPolicy::PaddingLlama)
    }

    /// Shard `model` for this process's position in `layout`
    pub fn shard(&self, model: CausalLm, layout: ParallelLayout) -> Result<ShardedModel> {
        if model.architecture != self.architecture() {
            return Err(ShardlineError::IncompatiblePolicy(format!(
                "{} cannot shard {}",
                self.name(),
                model.architecture
            )));
        }

        let config = model.config.clone();
        let tp = layout.tp_size();
        let tp_rank = layout.tp_rank();
        check_divisible("num_attention_heads", config.num_attention_heads, tp)?;
        check_divisible("num_key_value_heads", config.num_kv_heads(), tp)?;
        check_divisible("intermediate_size", config.intermediate_size, tp)?;

        let layer_range = stage_layers(config.num_hidden_layers, layout.num_stages(), layout.stage())?;
        let is_first = layout.is_first_stage();
        let is_last = layout.is_last_stage();
        let dtype = model.dtype();
        let device = model.embed_tokens.device().clone();

        let head_dim = config.head_dim();
        let q_rows = config.num_attention_heads * head_dim;
        let kv_rows = config.num_kv_heads() * head_dim;
        let mut slices = Vec::new();

        let CausalLm {
            embed_tokens,
            layers,
            norm,
            lm_head,
            ..
        } = model;

        let mut sharded_layers = Vec::with_capacity(layer_range.len());
        for (index, layer) in layers.into_iter().enumerate() {
            if !layer_range.contains(&index) {
                continue;
            }
            let mut slicer = Slicer {
                prefix: format!("layers.{}", index),
                rank: tp_rank,
                size: tp,
                slices: &mut slices,
            };
            sharded_layers.push(shard_layer(index, layer, &mut slicer, q_rows, kv_rows)?);
        }

        let sharded = ShardedModel {
            config,
            policy: *self,
            layout,
            layer_range,
            embed_tokens: is_first.then_some(embed_tokens),
            layers: sharded_layers,
            norm: is_last.then_some(norm),
            lm_head: is_last.then_some(lm_head),
            slices,
            dtype,
            device,
        };

        debug!(
            "sharded with {}: tp {}/{}, stage {}/{}, layers {:?}",
            self.name(),
            tp_rank,
            tp,
            sharded.layout.stage(),
            sharded.layout.num_stages(),
            sharded.layer_range
        );
        Ok(sharded)
    }
}

impl fmt::Display for ShardingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn check_divisible(name: &str, value: usize, tp: usize) -> Result<()> {
    if value % tp != 0 {
        return Err(ShardlineError::IncompatiblePolicy(format!(
            "{} ({}) is not divisible by tp_size ({})",
            name, value, tp
        )));
    }
    Ok(())
}

/// Contiguous layer range of pipeline `stage`; earlier stages take the remainder
pub fn stage_layers(num_layers: usize, num_stages: usize, stage: usize) -> Result<Range<usize>> {
    if num_stages > num_layers {
        return Err(ShardlineError::IncompatiblePolicy(format!(
            "{} pipeline stages for {} layers leaves a stage empty",
            num_stages, num_layers
        )));
    }

    let base = num_layers / num_stages;
    let remainder = num_layers % num_stages;
    let start = stage * base + stage.min(remainder);
    let len = base + usize::from(stage < remainder);
    Ok(start..start + len)
}

/// This process's position in the tensor/pipeline-parallel layout
#[derive(Debug, Clone)]
pub struct ParallelLayout {
    pub tp_group: ProcessGroup,
    pub pp_group: ProcessGroup,
}

impl ParallelLayout {
    pub fn new(tp_group: ProcessGroup, pp_group: ProcessGroup) -> Self {
        Self { tp_group, pp_group }
    }

    pub fn tp_size(&self) -> usize {
        self.tp_group.size()
    }

    pub fn tp_rank(&self) -> usize {
        self.tp_group.group_rank()
    }

    pub fn num_stages(&self) -> usize {
        self.pp_group.size()
    }

    pub fn stage(&self) -> usize {
        self.pp_group.group_rank()
    }

    pub fn is_first_stage(&self) -> bool {
        self.stage() == 0
    }

    pub fn is_last_stage(&self) -> bool {
        self.stage() + 1 == self.num_stages()
    }

    /// Global rank of the previous stage on this tensor-parallel lane
    pub fn prev_stage_rank(&self) -> Option<usize> {
        let stage = self.stage();
        (stage > 0).then(|| self.pp_group.ranks()[stage - 1])
    }

    /// Global rank of the next stage on this tensor-parallel lane
    pub fn next_stage_rank(&self) -> Option<usize> {
        self.pp_group.ranks().get(self.stage() + 1).copied()
    }

    /// Global rank of the last stage on this tensor-parallel lane
    pub fn last_stage_rank(&self) -> usize {
        let ranks = self.pp_group.ranks();
        ranks[ranks.len() - 1]
    }
}

/// How one local tensor relates to its unsharded original
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSpec {
    pub tensor: String,
    pub axis: usize,
    pub offset: usize,
    pub length: usize,
    pub full_length: usize,
}

struct Slicer<'a> {
    prefix: String,
    rank: usize,
    size: usize,
    slices: &'a mut Vec<SliceSpec>,
}

impl Slicer<'_> {
    /// Keep this rank's block of `tensor` along `axis` and record it
    fn slice(&mut self, name: &str, tensor: &Tensor, axis: usize) -> Result<Tensor> {
        let full_length = tensor.dim(axis)?;
        let length = full_length / self.size;
        let offset = self.rank * length;

        self.slices.push(SliceSpec {
            tensor: format!("{}.{}", self.prefix, name),
            axis,
            offset,
            length,
            full_length,
        });

        if self.size == 1 {
            return Ok(tensor.clone());
        }
        compact(&tensor.narrow(axis, offset, length)?)
    }
}

/// Copy a view into storage of its own so the parent tensor can be released
fn compact(view: &Tensor) -> Result<Tensor> {
    if !view.is_contiguous() {
        return Ok(view.contiguous()?);
    }
    let owned = Tensor::zeros(view.shape(), view.dtype(), view.device())?;
    owned.slice_set(view, 0, 0)?;
    Ok(owned)
}

fn shard_layer(
    index: usize,
    layer: DecoderLayerWeights,
    slicer: &mut Slicer<'_>,
    q_rows: usize,
    kv_rows: usize,
) -> Result<ShardedLayer> {
    let (q_proj, k_proj, v_proj) = match &layer.qkv {
        QkvWeights::Split { q, k, v } => (
            slicer.slice("q_proj", q, 0)?,
            slicer.slice("k_proj", k, 0)?,
            slicer.slice("v_proj", v, 0)?,
        ),
        QkvWeights::Packed(w_pack) => {
            // Slice each segment of the fused projection on its own
            let q = w_pack.narrow(0, 0, q_rows)?;
            let k = w_pack.narrow(0, q_rows, kv_rows)?;
            let v = w_pack.narrow(0, q_rows + kv_rows, kv_rows)?;
            (
                slicer.slice("W_pack.q", &q, 0)?,
                slicer.slice("W_pack.k", &k, 0)?,
                slicer.slice("W_pack.v", &v, 0)?,
            )
        }
    };

    Ok(ShardedLayer {
        index,
        input_layernorm: layer.input_layernorm,
        q_proj,
        k_proj,
        v_proj,
        o_proj: slicer.slice("o_proj", &layer.o_proj, 1)?,
        post_attention_layernorm: layer.post_attention_layernorm,
        gate_proj: slicer.slice("gate_proj", &layer.gate_proj, 0)?,
        up_proj: slicer.slice("up_proj", &layer.up_proj, 0)?,
        down_proj: slicer.slice("down_proj", &layer.down_proj, 1)?,
    })
}

/// One decoder layer's local slice
#[derive(Debug, Clone)]
pub struct ShardedLayer {
    /// Index of the layer in the unsharded model
    pub index: usize,
    pub input_layernorm: Tensor,
    pub q_proj: Tensor,
    pub k_proj: Tensor,
    pub v_proj: Tensor,
    pub o_proj: Tensor,
    pub post_attention_layernorm: Tensor,
    pub gate_proj: Tensor,
    pub up_proj: Tensor,
    pub down_proj: Tensor,
}

impl ShardedLayer {
    fn tensors(&self) -> [&Tensor; 9] {
        [
            &self.input_layernorm,
            &self.q_proj,
            &self.k_proj,
            &self.v_proj,
            &self.o_proj,
            &self.post_attention_layernorm,
            &self.gate_proj,
            &self.up_proj,
            &self.down_proj,
        ]
    }
}

/// The part of a model that lives on this process
#[derive(Debug, Clone)]
pub struct ShardedModel {
    pub config: ModelConfig,
    pub policy: ShardingPolicy,
    pub layout: ParallelLayout,
    /// Layers owned by this pipeline stage
    pub layer_range: Range<usize>,
    /// Present on the first stage
    pub embed_tokens: Option<Tensor>,
    pub layers: Vec<ShardedLayer>,
    /// Present on the last stage
    pub norm: Option<Tensor>,
    /// Present on the last stage
    pub lm_head: Option<Tensor>,
    pub slices: Vec<SliceSpec>,
    pub dtype: DType,
    pub device: Device,
}

impl ShardedModel {
    pub fn head_dim(&self) -> usize {
        self.config.head_dim()
    }

    pub fn num_heads_local(&self) -> usize {
        self.config.num_attention_heads / self.layout.tp_size()
    }

    pub fn num_kv_heads_local(&self) -> usize {
        self.config.num_kv_heads() / self.layout.tp_size()
    }

    pub fn num_local_layers(&self) -> usize {
        self.layers.len()
    }

    /// Bytes held by the local weights
    pub fn weight_bytes(&self) -> usize {
        let layer_bytes: usize = self
            .layers
            .iter()
            .flat_map(|layer| layer.tensors())
            .map(tensor_bytes)
            .sum();
        let edge_bytes: usize = [&self.embed_tokens, &self.norm, &self.lm_head]
            .into_iter()
            .flatten()
            .map(tensor_bytes)
            .sum();
        layer_bytes + edge_bytes
    }

    /// Log the footprint change produced by sharding
    pub fn log_footprint(&self, unsharded_bytes: usize) {
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;
        info!(
            "model size before sharding: {:.3} GB, after sharding: {:.3} GB ({} tensors sliced)",
            unsharded_bytes as f64 / GB,
            self.weight_bytes() as f64 / GB,
            self.slices.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{LocalTransport, ProcessGroupMesh, Transport, PP_AXIS, TP_AXIS};
    use crate::model::tests::tiny_config;
    use std::sync::Arc;

    fn layouts(pp: usize, tp: usize) -> Vec<ParallelLayout> {
        LocalTransport::group(pp * tp)
            .into_iter()
            .map(|transport| {
                let transport: Arc<dyn Transport> = Arc::new(transport);
                let mesh = ProcessGroupMesh::new(transport, pp, tp).unwrap();
                ParallelLayout::new(
                    mesh.group_along_axis(TP_AXIS).unwrap(),
                    mesh.group_along_axis(PP_AXIS).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_policy_lookup() {
        assert_eq!(
            ShardingPolicy::auto(false, "llama").unwrap(),
            ShardingPolicy::NoPaddingLlama
        );
        assert_eq!(
            ShardingPolicy::auto(true, "llama").unwrap(),
            ShardingPolicy::PaddingLlama
        );
        assert!(matches!(
            ShardingPolicy::auto(true, "baichuan"),
            Err(ShardlineError::UnknownPolicy(_))
        ));
        assert!(matches!(
            ShardingPolicy::from_name("BloomModelInferPolicy"),
            Err(ShardlineError::UnknownPolicy(_))
        ));
        assert_eq!(
            ShardingPolicy::from_name("NoPaddingBaichuanModelInferPolicy").unwrap(),
            ShardingPolicy::NoPaddingBaichuan
        );
    }

    #[test]
    fn test_stage_layers() {
        assert_eq!(stage_layers(5, 2, 0).unwrap(), 0..3);
        assert_eq!(stage_layers(5, 2, 1).unwrap(), 3..5);
        assert_eq!(stage_layers(4, 1, 0).unwrap(), 0..4);
        assert!(stage_layers(2, 3, 0).is_err());
    }

    #[test]
    fn test_incompatible_policy() {
        let model = CausalLm::from_config(tiny_config("BaichuanForCausalLM")).unwrap();
        let layout = layouts(1, 1).remove(0);
        let err = ShardingPolicy::NoPaddingLlama.shard(model, layout).unwrap_err();
        assert!(matches!(err, ShardlineError::IncompatiblePolicy(_)));
    }

    #[test]
    fn test_tp_slices_reconstruct_full_shapes() {
        let model = CausalLm::from_config(tiny_config("LlamaForCausalLM")).unwrap();
        let full_q = model.layers[0].qkv.clone();
        let full_down = model.layers[0].down_proj.clone();

        let shards: Vec<ShardedModel> = layouts(1, 2)
            .into_iter()
            .map(|layout| ShardingPolicy::NoPaddingLlama.shard(model.clone(), layout).unwrap())
            .collect();

        for shard in &shards {
            assert_eq!(shard.num_heads_local(), 2);
            assert_eq!(shard.layers[0].q_proj.dims(), &[32, 64]);
            assert_eq!(shard.layers[0].down_proj.dims(), &[64, 64]);
            assert!(shard.embed_tokens.is_some() && shard.lm_head.is_some());
        }

        let q_parts: Vec<&Tensor> = shards.iter().map(|s| &s.layers[0].q_proj).collect();
        let q = Tensor::cat(&q_parts, 0).unwrap();
        let down_parts: Vec<&Tensor> = shards.iter().map(|s| &s.layers[0].down_proj).collect();
        let down = Tensor::cat(&down_parts, 1).unwrap();

        let QkvWeights::Split { q: full_q, .. } = full_q else {
            panic!("llama uses split projections");
        };
        let flat = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(flat(&q), flat(&full_q));
        assert_eq!(flat(&down), flat(&full_down));

        let spec = &shards[1].slices[0];
        assert_eq!(spec.tensor, "layers.0.q_proj");
        assert_eq!((spec.axis, spec.offset, spec.length, spec.full_length), (0, 32, 32, 64));
    }

    #[test]
    fn test_baichuan_pack_is_split_per_segment() {
        let model = CausalLm::from_config(tiny_config("BaichuanForCausalLM")).unwrap();
        let QkvWeights::Packed(w_pack) = model.layers[1].qkv.clone() else {
            panic!("baichuan uses a packed projection");
        };

        let shard = ShardingPolicy::NoPaddingBaichuan
            .shard(model, layouts(1, 2).remove(1))
            .unwrap();
        let flat = |t: &Tensor| t.flatten_all().unwrap().to_vec1::<f32>().unwrap();

        // rank 1 holds the second half of the k segment
        let expected_k = w_pack.narrow(0, 64 + 32, 32).unwrap();
        assert_eq!(flat(&shard.layers[1].k_proj), flat(&expected_k));
    }

    #[test]
    fn test_pipeline_stages_split_layers_and_edges() {
        let model = CausalLm::from_config(tiny_config("LlamaForCausalLM")).unwrap();
        let full_bytes = model.weight_bytes();
        let shards: Vec<ShardedModel> = layouts(2, 1)
            .into_iter()
            .map(|layout| ShardingPolicy::NoPaddingLlama.shard(model.clone(), layout).unwrap())
            .collect();

        assert_eq!(shards[0].layer_range, 0..1);
        assert_eq!(shards[1].layer_range, 1..2);
        assert_eq!(shards[1].layers[0].index, 1);
        assert!(shards[0].embed_tokens.is_some() && shards[0].lm_head.is_none());
        assert!(shards[1].embed_tokens.is_none() && shards[1].lm_head.is_some());
        assert!(shards.iter().all(|s| s.weight_bytes() < full_bytes));
    }
}

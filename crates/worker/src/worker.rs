//! Worker lifecycle
//!
//! A worker moves through `Uninitialized -> Joined -> ModelReady -> Serving`
//! as join-group, init-model and init-cache succeed. The phase is derived
//! from which parts of the state exist, so a failed call can never leave the
//! worker half-way between two phases.

use crate::cache::{CacheShape, KvCacheStore};
use crate::fabric::{LinkOptions, ProcessGroup, ProcessGroupMesh, TcpTransport, Transport, PP_AXIS, TP_AXIS};
use crate::forward::{ForwardPipeline, Logits};
use crate::model::ModelSource;
use crate::scratch::{IntermediateTensorPool, ScratchShape};
use crate::sharding::{ParallelLayout, ShardedModel, ShardingPolicy};
use candle_core::Device;
use shardline_common::{
    BatchDescriptor, DeviceKind, InferenceConfig, Result, ShardlineError, WorkerServiceConfig, METRICS,
};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Lifecycle phase of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerPhase {
    Uninitialized,
    Joined,
    ModelReady,
    Serving,
}

impl WorkerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerPhase::Uninitialized => "uninitialized",
            WorkerPhase::Joined => "joined",
            WorkerPhase::ModelReady => "model-ready",
            WorkerPhase::Serving => "serving",
        }
    }

    fn gauge_value(&self) -> i64 {
        *self as i64
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where this worker sits in its group and how to reach the rendezvous
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub rank: usize,
    pub world_size: usize,
    /// Host of rank 0's rendezvous listener
    pub address: String,
    pub port: u16,
}

struct GroupState {
    identity: WorkerIdentity,
    transport: Arc<dyn Transport>,
    world: ProcessGroup,
}

struct ModelState {
    inference: InferenceConfig,
    model: ShardedModel,
    scratch: IntermediateTensorPool,
    pipeline: ForwardPipeline,
}

/// One process of a distributed inference group
pub struct Worker {
    config: WorkerServiceConfig,
    group: Option<GroupState>,
    model: Option<ModelState>,
    cache: Option<KvCacheStore>,
}

impl Worker {
    pub fn new(config: WorkerServiceConfig) -> Self {
        METRICS.worker.phase.set(WorkerPhase::Uninitialized.gauge_value());
        Self {
            config,
            group: None,
            model: None,
            cache: None,
        }
    }

    pub fn phase(&self) -> WorkerPhase {
        if self.cache.is_some() {
            WorkerPhase::Serving
        } else if self.model.is_some() {
            WorkerPhase::ModelReady
        } else if self.group.is_some() {
            WorkerPhase::Joined
        } else {
            WorkerPhase::Uninitialized
        }
    }

    pub fn identity(&self) -> Option<&WorkerIdentity> {
        self.group.as_ref().map(|g| &g.identity)
    }

    pub fn inference_config(&self) -> Option<&InferenceConfig> {
        self.model.as_ref().map(|m| &m.inference)
    }

    pub fn model(&self) -> Option<&ShardedModel> {
        self.model.as_ref().map(|m| &m.model)
    }

    pub fn scratch(&self) -> Option<&IntermediateTensorPool> {
        self.model.as_ref().map(|m| &m.scratch)
    }

    pub fn cache(&self) -> Option<&KvCacheStore> {
        self.cache.as_ref()
    }

    /// Join the group over gRPC peer links, blocking until every rank is connected
    pub fn join_group(&mut self, identity: WorkerIdentity) -> Result<()> {
        self.check_not_joined()?;
        let options = LinkOptions {
            join_timeout: self.config.join_timeout(),
            max_frame_bytes: self.config.max_message_bytes,
        };
        let transport = TcpTransport::connect(
            identity.rank,
            identity.world_size,
            &identity.address,
            identity.port,
            &options,
        )?;
        self.join_with_transport(identity, Arc::new(transport))
    }

    /// Join the group over an already connected transport
    pub fn join_with_transport(&mut self, identity: WorkerIdentity, transport: Arc<dyn Transport>) -> Result<()> {
        self.check_not_joined()?;
        if transport.rank() != identity.rank || transport.world_size() != identity.world_size {
            return Err(ShardlineError::invalid_input(format!(
                "transport is rank {} of {}, worker expects rank {} of {}",
                transport.rank(),
                transport.world_size(),
                identity.rank,
                identity.world_size
            )));
        }

        let world = ProcessGroup::world(transport.clone());
        info!("rank {} joined a group of {}", identity.rank, identity.world_size);
        self.group = Some(GroupState {
            identity,
            transport,
            world,
        });
        self.publish_phase();
        Ok(())
    }

    fn check_not_joined(&self) -> Result<()> {
        match &self.group {
            Some(group) => Err(ShardlineError::AlreadyJoined {
                rank: group.identity.rank,
            }),
            None => Ok(()),
        }
    }

    /// Resolve, shard and place the model, then prepare the scratch pool
    ///
    /// Allowed again once a model is loaded: the new model replaces the old
    /// one and the KV cache is dropped. On failure the previous state is kept.
    pub fn init_model(
        &mut self,
        inference: InferenceConfig,
        source: ModelSource,
        policy: Option<&str>,
    ) -> Result<()> {
        let group = self
            .group
            .as_ref()
            .ok_or_else(|| ShardlineError::sequencing("init-model", self.phase()))?;
        let rank = group.identity.rank;

        inference.validate()?;
        inference.validate_world(group.identity.world_size)?;
        let device = self.device(rank)?;

        let model = source.resolve()?;
        let policy = match policy {
            Some(name) => ShardingPolicy::from_name(name)?,
            None => ShardingPolicy::auto(inference.pad_input, &model.config.model_type)?,
        };

        let unsharded_bytes =
            model.weight_bytes() / model.dtype().size_in_bytes() * inference.dtype.size_in_bytes();
        if let Some(budget) = self.config.memory_budget_bytes {
            if unsharded_bytes as u64 > budget {
                return Err(ShardlineError::resource(format!(
                    "model needs {} bytes, budget is {}",
                    unsharded_bytes, budget
                )));
            }
        }

        let model = model.to(&device, inference.dtype.as_candle())?;
        let mesh = ProcessGroupMesh::new(group.transport.clone(), inference.pp_size, inference.tp_size)?;
        let layout = ParallelLayout::new(mesh.group_along_axis(TP_AXIS)?, mesh.group_along_axis(PP_AXIS)?);
        let model = policy.shard(model, layout)?;
        model.log_footprint(unsharded_bytes);

        let mut scratch = IntermediateTensorPool::new();
        scratch.initialize(
            ScratchShape::new(&inference, model.num_heads_local(), model.head_dim()),
            &device,
        )?;
        let pipeline = ForwardPipeline::new(&inference, &model)?;

        info!(
            "rank {} model ready: {} with {}, {} local layers, peak weight memory {:.3} GB",
            rank,
            model.config.architectures.join(","),
            policy,
            model.num_local_layers(),
            model.weight_bytes() as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        if self.cache.take().is_some() {
            warn!("rank {} dropped its KV cache for the new model", rank);
        }
        METRICS.worker.model_weight_bytes.set(model.weight_bytes() as i64);
        METRICS.worker.scratch_bytes.set(scratch.bytes() as i64);
        METRICS.worker.kv_cache_bytes.set(0);

        self.model = Some(ModelState {
            inference,
            model,
            scratch,
            pipeline,
        });
        self.publish_phase();
        Ok(())
    }

    /// Allocate the KV cache for this stage's layers, replacing any previous one
    ///
    /// `num_layers` is the layer count of the whole model, the same on every
    /// rank; each pipeline stage allocates only the layers it owns.
    pub fn init_cache(&mut self, alloc_shape: &[usize], num_layers: usize) -> Result<()> {
        let state = self
            .model
            .as_ref()
            .ok_or_else(|| ShardlineError::sequencing("init-cache", self.phase()))?;
        let model = &state.model;

        let shape = CacheShape::from_alloc(alloc_shape)?;
        shape.check_model(model.num_kv_heads_local(), state.inference.block_size, model.head_dim())?;
        if num_layers != model.config.num_hidden_layers {
            return Err(ShardlineError::invalid_input(format!(
                "cache for {} layers requested, model has {}",
                num_layers, model.config.num_hidden_layers
            )));
        }

        let budget = self.config.memory_budget_bytes.map(|budget| {
            budget.saturating_sub((model.weight_bytes() + state.scratch.bytes()) as u64)
        });

        // Release the old arrays before allocating new ones
        self.cache = None;
        let cache = KvCacheStore::allocate(shape, model.num_local_layers(), model.dtype, &model.device, budget);
        self.publish_phase();
        let cache = cache?;

        METRICS.worker.kv_cache_bytes.set(cache.bytes() as i64);
        self.cache = Some(cache);
        self.publish_phase();
        Ok(())
    }

    /// Run one forward step, returning the logits of the batch's output rows
    pub fn execute_forward(&self, tokens: &[i64], descriptor: &BatchDescriptor) -> Result<Logits> {
        let (Some(state), Some(cache)) = (&self.model, &self.cache) else {
            return Err(ShardlineError::sequencing("execute-forward", self.phase()));
        };
        state
            .pipeline
            .execute(&state.model, cache, &state.scratch, tokens, descriptor)
    }

    /// All-reduce each rank's id over the world; every rank gets `world*(world-1)/2`
    pub fn self_test_collective(&self) -> Result<f32> {
        let group = self
            .group
            .as_ref()
            .ok_or_else(|| ShardlineError::sequencing("self-test", self.phase()))?;

        group.world.barrier()?;
        let mut value = [group.identity.rank as f32];
        group.world.all_reduce_sum(&mut value)?;
        group.world.barrier()?;
        Ok(value[0])
    }

    fn device(&self, rank: usize) -> Result<Device> {
        match self.config.device {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => {
                let ordinal = self.config.device_ordinal.unwrap_or(rank);
                Device::new_cuda(ordinal).map_err(|e| {
                    ShardlineError::config(format!("cannot bind cuda device {}: {}", ordinal, e))
                })
            }
        }
    }

    fn publish_phase(&self) {
        METRICS.worker.phase.set(self.phase().gauge_value());
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("phase", &self.phase())
            .field("identity", &self.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::LocalTransport;
    use crate::model::tests::tiny_config;
    use shardline_common::ModelDType;

    fn identity() -> WorkerIdentity {
        WorkerIdentity {
            rank: 0,
            world_size: 1,
            address: "127.0.0.1".into(),
            port: 0,
        }
    }

    fn joined() -> Worker {
        let mut worker = Worker::new(WorkerServiceConfig::default());
        let transport = LocalTransport::group(1).remove(0);
        worker.join_with_transport(identity(), Arc::new(transport)).unwrap();
        worker
    }

    fn inference() -> InferenceConfig {
        InferenceConfig {
            dtype: ModelDType::Float32,
            max_batch_size: 2,
            max_input_len: 16,
            max_output_len: 16,
            block_size: 4,
            tp_size: 1,
            pp_size: 1,
            max_n_spec_tokens: 0,
            pad_input: false,
        }
    }

    #[test]
    fn test_phase_order() {
        let mut worker = Worker::new(WorkerServiceConfig::default());
        assert_eq!(worker.phase(), WorkerPhase::Uninitialized);
        assert!(worker.self_test_collective().unwrap_err().is_sequencing());
        assert!(worker.init_cache(&[4, 4, 4, 16], 2).unwrap_err().is_sequencing());

        let err = worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap_err();
        assert!(err.is_sequencing());

        let mut worker = joined();
        assert_eq!(worker.phase(), WorkerPhase::Joined);
        assert_eq!(worker.self_test_collective().unwrap(), 0.0);

        worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap();
        assert_eq!(worker.phase(), WorkerPhase::ModelReady);

        worker.init_cache(&[4, 4, 4, 16], 2).unwrap();
        assert_eq!(worker.phase(), WorkerPhase::Serving);
    }

    #[test]
    fn test_join_twice() {
        let mut worker = joined();
        let transport = LocalTransport::group(1).remove(0);
        let err = worker
            .join_with_transport(identity(), Arc::new(transport))
            .unwrap_err();
        assert!(matches!(err, ShardlineError::AlreadyJoined { rank: 0 }));
    }

    #[test]
    fn test_failed_init_model_keeps_state() {
        let mut worker = joined();
        worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap();
        worker.init_cache(&[4, 4, 4, 16], 2).unwrap();

        let err = worker
            .init_model(inference(), ModelSource::Config(tiny_config("GPT2LMHeadModel")), None)
            .unwrap_err();
        assert!(matches!(err, ShardlineError::UnsupportedModel(_)));
        assert_eq!(worker.phase(), WorkerPhase::Serving);

        let err = worker
            .init_model(
                inference(),
                ModelSource::Config(tiny_config("LlamaForCausalLM")),
                Some("NoPaddingBaichuanModelInferPolicy"),
            )
            .unwrap_err();
        assert!(matches!(err, ShardlineError::IncompatiblePolicy(_)));
        assert_eq!(worker.phase(), WorkerPhase::Serving);
    }

    #[test]
    fn test_repeated_init_model_is_equivalent() {
        let weights = |worker: &Worker| -> Vec<f32> {
            let model = worker.model().unwrap();
            let layer = &model.layers[1];
            [&layer.q_proj, &layer.down_proj]
                .iter()
                .flat_map(|t| t.flatten_all().unwrap().to_vec1::<f32>().unwrap())
                .collect()
        };

        let mut worker = joined();
        worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap();
        worker.init_cache(&[4, 4, 4, 16], 2).unwrap();
        let first = weights(&worker);

        // re-init drops the cache and rebuilds the scratch pool
        worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap();
        assert_eq!(worker.phase(), WorkerPhase::ModelReady);
        assert!(worker.cache().is_none());
        assert!(worker.scratch().is_some());
        assert_eq!(weights(&worker), first);
    }

    #[test]
    fn test_init_cache_validation() {
        let mut worker = joined();
        worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap();

        // head_dim is 16, block_size 4, 4 kv heads, 2 layers
        assert!(worker.init_cache(&[4, 4, 8, 16], 2).is_err());
        assert!(worker.init_cache(&[4, 2, 4, 16], 2).is_err());
        assert!(worker.init_cache(&[4, 4, 4, 16], 3).is_err());
        assert_eq!(worker.phase(), WorkerPhase::ModelReady);
    }

    #[test]
    fn test_memory_budget() {
        let config = WorkerServiceConfig {
            memory_budget_bytes: Some(1024),
            ..WorkerServiceConfig::default()
        };
        let mut worker = Worker::new(config);
        let transport = LocalTransport::group(1).remove(0);
        worker.join_with_transport(identity(), Arc::new(transport)).unwrap();

        let err = worker
            .init_model(inference(), ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap_err();
        assert!(matches!(err, ShardlineError::Resource(_)));
        assert_eq!(worker.phase(), WorkerPhase::Joined);
    }

    #[test]
    fn test_world_mismatch() {
        let mut worker = joined();
        let config = InferenceConfig {
            tp_size: 2,
            ..inference()
        };
        let err = worker
            .init_model(config, ModelSource::Config(tiny_config("LlamaForCausalLM")), None)
            .unwrap_err();
        assert!(matches!(err, ShardlineError::Config(_)));
    }
}

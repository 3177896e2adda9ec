//! Shardline Worker
//!
//! One process of a tensor/pipeline-parallel inference group. A worker joins
//! the group, shards a model for its place in the layout, allocates a paged
//! KV cache and executes forward steps driven by an external coordinator.

pub mod attention;
pub mod batch;
pub mod cache;
pub mod fabric;
pub mod forward;
pub mod grpc;
pub mod model;
pub mod scratch;
pub mod sharding;
pub mod worker;

pub use batch::{BatchLimits, BoundBatch};
pub use cache::{CacheShape, KvCacheStore};
pub use fabric::{LinkOptions, LocalTransport, ProcessGroup, ProcessGroupMesh, TcpTransport, Transport};
pub use forward::{ForwardPipeline, Logits};
pub use grpc::{WorkerGrpcService, WorkerServer};
pub use model::{CausalLm, ModelArchitecture, ModelConfig, ModelSource};
pub use scratch::{IntermediateTensorPool, ScratchShape};
pub use sharding::{ParallelLayout, ShardedModel, ShardingPolicy};
pub use worker::{Worker, WorkerIdentity, WorkerPhase};

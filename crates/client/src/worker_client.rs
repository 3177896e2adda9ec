//! Typed client for one worker's gRPC service

use shardline_common::{BatchDescriptor, InferenceConfig, Result, DEFAULT_MAX_MESSAGE_BYTES};
use shardline_proto::worker::init_model_request::Model;
use shardline_proto::worker::{
    ForwardRequest, InitCacheRequest, InitModelRequest, JoinGroupRequest, SelfTestRequest,
};
use shardline_proto::WorkerServiceClient;
use tonic::transport::Channel;
use tracing::debug;

/// Where a worker gets its model from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSpec {
    /// Directory holding `config.json` on the worker's filesystem
    Checkpoint(String),
    /// Inline JSON model description
    ConfigJson(String),
}

impl From<ModelSpec> for Model {
    fn from(spec: ModelSpec) -> Self {
        match spec {
            ModelSpec::Checkpoint(path) => Model::CheckpointPath(path),
            ModelSpec::ConfigJson(json) => Model::ModelConfigJson(json),
        }
    }
}

/// Logits returned by one forward call, row-major
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOutput {
    pub logits: Vec<f32>,
    pub num_rows: usize,
    pub row_width: usize,
}

impl ForwardOutput {
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.logits.chunks(self.row_width.max(1))
    }
}

/// Worker client wrapper
#[derive(Clone)]
pub struct WorkerClient {
    endpoint: String,
    inner: WorkerServiceClient<Channel>,
}

impl WorkerClient {
    /// Connect to a worker endpoint, e.g. `http://10.0.0.2:50051`
    pub async fn connect(endpoint: &str) -> Result<Self> {
        Self::connect_with_limit(endpoint, DEFAULT_MAX_MESSAGE_BYTES).await
    }

    /// Connect with a message size limit matching the worker's `max_message_bytes`
    pub async fn connect_with_limit(endpoint: &str, max_message_bytes: usize) -> Result<Self> {
        let inner = WorkerServiceClient::connect(endpoint.to_string())
            .await?
            .max_decoding_message_size(max_message_bytes)
            .max_encoding_message_size(max_message_bytes);
        debug!("connected to worker at {}", endpoint);
        Ok(Self {
            endpoint: endpoint.to_string(),
            inner,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Join the group whose rendezvous rank 0 hosts at `address:port`
    pub async fn join_group(&mut self, rank: usize, world_size: usize, address: &str, port: u16) -> Result<()> {
        self.inner
            .join_group(JoinGroupRequest {
                rank: rank as u32,
                world_size: world_size as u32,
                address: address.to_string(),
                port: port as u32,
            })
            .await?;
        Ok(())
    }

    /// Load and shard a model; `policy` of `None` lets the worker pick one
    pub async fn init_model(
        &mut self,
        config: &InferenceConfig,
        model: ModelSpec,
        policy: Option<&str>,
    ) -> Result<()> {
        self.inner
            .init_model(InitModelRequest {
                inference_config_json: config.to_rpc_param()?,
                model: Some(model.into()),
                policy: policy.unwrap_or_default().to_string(),
            })
            .await?;
        Ok(())
    }

    /// Allocate the KV cache: `[num_blocks, num_kv_heads, block_size, head_dim]`
    /// per layer, for a model of `num_layers` layers
    pub async fn init_cache(&mut self, alloc_shape: &[usize], num_layers: usize) -> Result<()> {
        self.inner
            .init_cache(InitCacheRequest {
                alloc_shape: alloc_shape.iter().map(|&d| d as u64).collect(),
                num_layers: num_layers as u32,
            })
            .await?;
        Ok(())
    }

    /// Run one forward step
    pub async fn execute_forward(&mut self, tokens: &[i64], batch: &BatchDescriptor) -> Result<ForwardOutput> {
        let response = self
            .inner
            .execute_forward(ForwardRequest {
                input_token_ids: tokens.to_vec(),
                batch_descriptor_json: batch.to_rpc_param()?,
            })
            .await?
            .into_inner();

        Ok(ForwardOutput {
            logits: response.logits,
            num_rows: response.num_rows as usize,
            row_width: response.row_width as usize,
        })
    }

    /// Sum of all ranks as computed by a world all-reduce
    pub async fn self_test_collective(&mut self) -> Result<f32> {
        Ok(self
            .inner
            .self_test_collective(SelfTestRequest {})
            .await?
            .into_inner()
            .sum)
    }
}

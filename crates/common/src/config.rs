//! Configuration structures for Shardline
//!
//! Two kinds of configuration live here:
//! - `InferenceConfig`, sent by the coordinator with init-model (JSON)
//! - `WorkerServiceConfig`, read by the worker process at startup from an
//!   optional YAML file layered under `SHARDLINE_*` environment variables.

use crate::error::{Result, ShardlineError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Numeric precision of weights, activations and the KV cache
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelDType {
    #[serde(rename = "fp32", alias = "float32")]
    Float32,

    #[serde(rename = "fp16", alias = "float16")]
    Float16,

    #[serde(rename = "bf16", alias = "bfloat16")]
    BFloat16,
}

impl ModelDType {
    /// Candle dtype for this precision
    pub fn as_candle(&self) -> candle_core::DType {
        match self {
            ModelDType::Float32 => candle_core::DType::F32,
            ModelDType::Float16 => candle_core::DType::F16,
            ModelDType::BFloat16 => candle_core::DType::BF16,
        }
    }

    /// Size of one element in bytes
    pub fn size_in_bytes(&self) -> usize {
        match self {
            ModelDType::Float32 => 4,
            ModelDType::Float16 | ModelDType::BFloat16 => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelDType::Float32 => "fp32",
            ModelDType::Float16 => "fp16",
            ModelDType::BFloat16 => "bf16",
        }
    }
}

impl fmt::Display for ModelDType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelDType {
    type Err = ShardlineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp32" | "float32" => Ok(ModelDType::Float32),
            "fp16" | "float16" => Ok(ModelDType::Float16),
            "bf16" | "bfloat16" => Ok(ModelDType::BFloat16),
            other => Err(ShardlineError::config(format!("Unknown dtype: {}", other))),
        }
    }
}

/// Inference configuration sent with init-model
///
/// Every field is required; there are no defaults beyond policy
/// auto-selection when the policy name is omitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InferenceConfig {
    /// Precision of weights and cache
    pub dtype: ModelDType,

    /// Maximum number of sequences per forward call
    pub max_batch_size: usize,

    /// Maximum prompt length
    pub max_input_len: usize,

    /// Maximum number of generated tokens per sequence
    pub max_output_len: usize,

    /// Tokens per KV cache block
    pub block_size: usize,

    /// Tensor-parallel degree
    pub tp_size: usize,

    /// Pipeline-parallel degree
    pub pp_size: usize,

    /// Speculative tokens verified per decode step
    pub max_n_spec_tokens: usize,

    /// Whether prefill inputs arrive as a right-padded grid
    pub pad_input: bool,
}

impl InferenceConfig {
    /// Parse and validate the serialized form received over the service boundary
    pub fn from_rpc_param(param: &str) -> Result<Self> {
        let config: InferenceConfig = serde_json::from_str(param)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize for the service boundary
    pub fn to_rpc_param(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Validate sizes that must be non-zero
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("max_batch_size", self.max_batch_size),
            ("max_input_len", self.max_input_len),
            ("max_output_len", self.max_output_len),
            ("block_size", self.block_size),
            ("tp_size", self.tp_size),
            ("pp_size", self.pp_size),
        ];

        for (name, value) in required {
            if value == 0 {
                return Err(ShardlineError::config(format!("{} must be greater than zero", name)));
            }
        }

        Ok(())
    }

    /// Check `tp_size * pp_size == world_size`
    pub fn validate_world(&self, world_size: usize) -> Result<()> {
        if self.tp_size * self.pp_size != world_size {
            return Err(ShardlineError::config(format!(
                "tp_size ({}) * pp_size ({}) must equal world_size ({})",
                self.tp_size, self.pp_size, world_size
            )));
        }
        Ok(())
    }

    /// Longest context a sequence can reach
    pub fn max_context_len(&self) -> usize {
        self.max_input_len + self.max_output_len
    }

    /// Number of KV splits (one per block) needed for the longest context
    pub fn kv_max_split_num(&self) -> usize {
        self.max_context_len().div_ceil(self.block_size)
    }

    /// Tokens processed per decode step, speculated tokens included
    pub fn max_tokens_per_step(&self) -> usize {
        self.max_batch_size * (self.max_n_spec_tokens + 1)
    }
}

/// Compute device the worker binds to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Cpu,
    Cuda,
}

/// Largest gRPC message a worker or client encodes or accepts by default
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 256 * 1024 * 1024;

/// Worker process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerServiceConfig {
    /// Server binding address
    pub bind_address: String,

    /// Server port
    pub port: u16,

    /// Device kind
    pub device: DeviceKind,

    /// Device ordinal; defaults to the worker's rank
    pub device_ordinal: Option<usize>,

    /// How long join-group waits for the rendezvous to complete
    pub join_timeout_secs: u64,

    /// Device memory available for weights, scratch and cache
    pub memory_budget_bytes: Option<u64>,

    /// Message size limit for the worker service and the peer fabric
    pub max_message_bytes: usize,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Enable Prometheus metrics
    pub enable_metrics: bool,
}

impl Default for WorkerServiceConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 50051,
            device: DeviceKind::Cpu,
            device_ordinal: None,
            join_timeout_secs: 60,
            memory_budget_bytes: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enable_metrics: true,
        }
    }
}

impl WorkerServiceConfig {
    /// Load configuration from an optional YAML file, overridden by
    /// `SHARDLINE_*` environment variables (`__` separates nested keys)
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("SHARDLINE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: WorkerServiceConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(ShardlineError::config("bind_address must not be empty"));
        }
        if self.join_timeout_secs == 0 {
            return Err(ShardlineError::config("join_timeout_secs must be greater than zero"));
        }
        if self.memory_budget_bytes == Some(0) {
            return Err(ShardlineError::config("memory_budget_bytes must be greater than zero"));
        }
        if self.max_message_bytes < 4 * 1024 * 1024 {
            return Err(ShardlineError::config("max_message_bytes must be at least 4 MiB"));
        }
        Ok(())
    }

    /// Socket address the gRPC server binds to
    pub fn listen_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(format!("{}:{}", self.bind_address, self.port).parse()?)
    }

    /// Get join timeout as Duration
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

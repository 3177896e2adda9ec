//! Shardline common library
//!
//! Shared error type, configuration and metrics used by the worker and its clients.

pub mod batch;
pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use batch::BatchDescriptor;
pub use config::{
    DeviceKind, InferenceConfig, ModelDType, ObservabilityConfig, WorkerServiceConfig,
    DEFAULT_MAX_MESSAGE_BYTES,
};
pub use error::{Result, ShardlineError};
pub use metrics::{MetricsRegistry, METRICS};

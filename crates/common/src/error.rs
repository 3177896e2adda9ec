//! Common error types for Shardline
//!
//! Every worker operation fails with a `ShardlineError`. Errors are surfaced to
//! the caller immediately; the worker never retries or recovers locally.
//! All errors are convertible to gRPC status codes for the service boundary.

use std::net::AddrParseError;
use thiserror::Error;

/// Main error type for Shardline
#[derive(Error, Debug)]
pub enum ShardlineError {
    /// Operation invoked outside of the documented lifecycle order
    #[error("Sequencing error: {operation} is not allowed while the worker is {phase}")]
    Sequencing {
        operation: &'static str,
        phase: String,
    },

    /// join-group called on a worker that already belongs to a group
    #[error("Worker already joined process group (rank {rank})")]
    AlreadyJoined { rank: usize },

    /// Architecture identifier missing from the model registry
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// Unknown sharding policy name
    #[error("Unknown sharding policy: {0}")]
    UnknownPolicy(String),

    /// Policy cannot be applied to the resolved model or layout
    #[error("Incompatible sharding policy: {0}")]
    IncompatiblePolicy(String),

    /// Device memory exhausted or budget exceeded
    #[error("Resource exhausted: {0}")]
    Resource(String),

    /// Collective communication failure inside a process group
    #[error("Collective error: {0}")]
    Collective(String),

    /// Another operation is already running on this worker
    #[error("Worker busy: {0}")]
    WorkerBusy(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// gRPC communication errors
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    GrpcTransport(#[from] tonic::transport::Error),

    /// Connection errors
    #[error("Connection error: {0}")]
    Connection(String),

    /// Model construction errors
    #[error("Model error: {0}")]
    Model(String),

    /// Tensor operation errors
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<AddrParseError> for ShardlineError {
    fn from(err: AddrParseError) -> Self {
        ShardlineError::Parse(err.to_string())
    }
}

impl From<config::ConfigError> for ShardlineError {
    fn from(err: config::ConfigError) -> Self {
        ShardlineError::Config(err.to_string())
    }
}

impl ShardlineError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            ShardlineError::Grpc(status) => status.clone(),
            ShardlineError::GrpcTransport(_) => tonic::Status::unavailable("Transport error"),
            ShardlineError::Sequencing { .. } => tonic::Status::failed_precondition(self.to_string()),
            ShardlineError::AlreadyJoined { .. } => tonic::Status::already_exists(self.to_string()),
            ShardlineError::UnsupportedModel(_) | ShardlineError::UnknownPolicy(_) => {
                tonic::Status::not_found(self.to_string())
            }
            ShardlineError::IncompatiblePolicy(_)
            | ShardlineError::InvalidInput(_)
            | ShardlineError::Parse(_)
            | ShardlineError::Serialization(_) => tonic::Status::invalid_argument(self.to_string()),
            ShardlineError::Resource(_) | ShardlineError::WorkerBusy(_) => {
                tonic::Status::resource_exhausted(self.to_string())
            }
            ShardlineError::Collective(_) | ShardlineError::Connection(_) => {
                tonic::Status::unavailable(self.to_string())
            }
            ShardlineError::Config(_)
            | ShardlineError::Model(_)
            | ShardlineError::Tensor(_)
            | ShardlineError::Io(_)
            | ShardlineError::Internal(_) => tonic::Status::internal(self.to_string()),
        }
    }

    /// Create a sequencing error for `operation` attempted in `phase`
    pub fn sequencing(operation: &'static str, phase: impl ToString) -> Self {
        ShardlineError::Sequencing {
            operation,
            phase: phase.to_string(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ShardlineError::Config(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        ShardlineError::Model(msg.into())
    }

    /// Create a resource error
    pub fn resource(msg: impl Into<String>) -> Self {
        ShardlineError::Resource(msg.into())
    }

    /// Create a collective error
    pub fn collective(msg: impl Into<String>) -> Self {
        ShardlineError::Collective(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        ShardlineError::Connection(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        ShardlineError::InvalidInput(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ShardlineError::Internal(msg.into())
    }

    /// Whether the error belongs to the lifecycle-ordering class
    pub fn is_sequencing(&self) -> bool {
        matches!(
            self,
            ShardlineError::Sequencing { .. } | ShardlineError::AlreadyJoined { .. }
        )
    }

    /// Whether the error belongs to the model/policy resolution class
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            ShardlineError::UnsupportedModel(_)
                | ShardlineError::UnknownPolicy(_)
                | ShardlineError::IncompatiblePolicy(_)
        )
    }
}

/// Result type alias for Shardline operations
pub type Result<T> = std::result::Result<T, ShardlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = ShardlineError::sequencing("execute_forward", "ModelReady");
        assert_eq!(err.to_status().code(), tonic::Code::FailedPrecondition);
        assert!(err.is_sequencing());

        let err = ShardlineError::UnsupportedModel("GPT2LMHeadModel".into());
        assert_eq!(err.to_status().code(), tonic::Code::NotFound);
        assert!(err.is_resolution());

        let err = ShardlineError::resource("cache needs 8 GiB, budget is 4 GiB");
        assert_eq!(err.to_status().code(), tonic::Code::ResourceExhausted);
    }

    #[test]
    fn test_sequencing_message() {
        let err = ShardlineError::sequencing("init_cache", "Joined");
        assert_eq!(
            err.to_string(),
            "Sequencing error: init_cache is not allowed while the worker is Joined"
        );
    }
}

//! Shardline Protocol Buffers
//!
//! gRPC definitions generated by tonic-build: the coordinator-facing worker
//! service and the peer fabric the ranks of a group talk over.

pub mod worker {
    tonic::include_proto!("shardline.worker");
}

pub mod fabric {
    tonic::include_proto!("shardline.fabric");
}

pub use fabric::fabric_service_client::FabricServiceClient;
pub use fabric::fabric_service_server::{FabricService, FabricServiceServer};
pub use worker::worker_service_client::WorkerServiceClient;
pub use worker::worker_service_server::{WorkerService, WorkerServiceServer};

//! gRPC server for the worker service boundary

pub mod server;

pub use server::{WorkerGrpcService, WorkerServer};

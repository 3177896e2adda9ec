//! Shardline Client
//!
//! Typed access to worker services. [`WorkerClient`] talks to one worker;
//! [`WorkerGroup`] issues each lifecycle call to every worker of a group at
//! once, since the collectives inside those calls need all ranks present.

pub mod group;
pub mod worker_client;

pub use group::WorkerGroup;
pub use worker_client::{ForwardOutput, ModelSpec, WorkerClient};

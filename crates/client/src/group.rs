//! Lockstep driver for a whole worker group
//!
//! Collective operations (join, init-model, forward) only complete when every
//! rank takes part, so each call is issued to all workers concurrently and
//! awaited together. Results come back in rank order.

use crate::worker_client::{ForwardOutput, ModelSpec, WorkerClient};
use shardline_common::{BatchDescriptor, InferenceConfig, Result, ShardlineError};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Clients for ranks `0..world_size`, in rank order
pub struct WorkerGroup {
    clients: Vec<WorkerClient>,
}

impl WorkerGroup {
    /// Connect to every worker; the i-th endpoint becomes rank i
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ShardlineError::config("worker group needs at least one endpoint"));
        }

        let mut clients = Vec::with_capacity(endpoints.len());
        for endpoint in endpoints {
            clients.push(WorkerClient::connect(endpoint).await?);
        }
        info!("connected to {} workers", clients.len());
        Ok(Self { clients })
    }

    pub fn world_size(&self) -> usize {
        self.clients.len()
    }

    pub fn client(&self, rank: usize) -> Option<&WorkerClient> {
        self.clients.get(rank)
    }

    /// Run `op` on every worker at once, failing with the lowest rank's error
    async fn fan_out<T, F, Fut>(&self, op: F) -> Result<Vec<T>>
    where
        F: Fn(usize, WorkerClient) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<JoinHandle<Result<T>>> = self
            .clients
            .iter()
            .enumerate()
            .map(|(rank, client)| tokio::spawn(op(rank, client.clone())))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for (rank, handle) in handles.into_iter().enumerate() {
            let outcome = handle
                .await
                .map_err(|e| ShardlineError::internal(format!("rank {} task failed: {}", rank, e)))
                .and_then(|r| r);
            match outcome {
                Ok(value) => results.push(value),
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(_) => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(results),
        }
    }

    /// Join every worker to one group; rank 0 hosts the rendezvous at `address:port`
    pub async fn join_group(&self, address: &str, port: u16) -> Result<()> {
        let world_size = self.world_size();
        let address = Arc::new(address.to_string());
        self.fan_out(|rank, mut client| {
            let address = address.clone();
            async move { client.join_group(rank, world_size, &address, port).await }
        })
        .await?;
        info!("group of {} joined via {}:{}", world_size, address, port);
        Ok(())
    }

    pub async fn init_model(&self, config: &InferenceConfig, model: ModelSpec, policy: Option<&str>) -> Result<()> {
        let config = Arc::new(config.clone());
        let policy = policy.map(str::to_string);
        self.fan_out(|_, mut client| {
            let config = config.clone();
            let model = model.clone();
            let policy = policy.clone();
            async move { client.init_model(&config, model, policy.as_deref()).await }
        })
        .await?;
        Ok(())
    }

    pub async fn init_cache(&self, alloc_shape: &[usize], num_layers: usize) -> Result<()> {
        let alloc_shape = Arc::new(alloc_shape.to_vec());
        self.fan_out(|_, mut client| {
            let alloc_shape = alloc_shape.clone();
            async move { client.init_cache(&alloc_shape, num_layers).await }
        })
        .await?;
        Ok(())
    }

    /// Run one forward step on every rank, returning each rank's logits
    pub async fn execute_forward(&self, tokens: &[i64], batch: &BatchDescriptor) -> Result<Vec<ForwardOutput>> {
        let tokens = Arc::new(tokens.to_vec());
        let batch = Arc::new(batch.clone());
        self.fan_out(|_, mut client| {
            let tokens = tokens.clone();
            let batch = batch.clone();
            async move { client.execute_forward(&tokens, &batch).await }
        })
        .await
    }

    /// Run the collective self-test on every rank
    pub async fn self_test_collective(&self) -> Result<Vec<f32>> {
        self.fan_out(|_, mut client| async move { client.self_test_collective().await })
            .await
    }
}

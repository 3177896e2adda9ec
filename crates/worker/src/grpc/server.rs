//! Worker gRPC server implementation

use crate::model::{ModelConfig, ModelSource};
use crate::worker::{Worker, WorkerIdentity};
use parking_lot::Mutex;
use shardline_common::{BatchDescriptor, InferenceConfig, Result, ShardlineError, WorkerServiceConfig};
use shardline_proto::worker::init_model_request::Model;
use shardline_proto::worker::{
    Ack, ForwardRequest, ForwardResponse, InitCacheRequest, InitModelRequest, JoinGroupRequest,
    SelfTestRequest, SelfTestResponse,
};
use shardline_proto::{WorkerService, WorkerServiceServer};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

/// Worker gRPC server
pub struct WorkerServer {
    config: WorkerServiceConfig,
    worker: Arc<Mutex<Worker>>,
}

impl WorkerServer {
    /// Create a new worker server
    pub fn new(config: WorkerServiceConfig) -> Self {
        let worker = Worker::new(config.clone());
        Self {
            config,
            worker: Arc::new(Mutex::new(worker)),
        }
    }

    /// Shared handle to the worker behind the service
    pub fn worker(&self) -> Arc<Mutex<Worker>> {
        self.worker.clone()
    }

    /// Convert into a tonic service for serving
    pub fn into_service(self) -> WorkerServiceServer<WorkerGrpcService> {
        let limit = self.config.max_message_bytes;
        WorkerServiceServer::new(WorkerGrpcService {
            worker: self.worker,
        })
        .max_decoding_message_size(limit)
        .max_encoding_message_size(limit)
    }

    /// Serve on the configured address until `shutdown` resolves
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.config.listen_addr()?;
        info!("worker gRPC server listening on {}", addr);

        Server::builder()
            .add_service(self.into_service())
            .serve_with_shutdown(addr, shutdown)
            .await?;

        info!("worker gRPC server stopped");
        Ok(())
    }
}

/// tonic service over one worker
///
/// Core operations are blocking and run on the blocking pool. A call that
/// arrives while another holds the worker is rejected with `WorkerBusy`.
#[derive(Clone)]
pub struct WorkerGrpcService {
    worker: Arc<Mutex<Worker>>,
}

impl WorkerGrpcService {
    async fn run<T, F>(&self, operation: &'static str, f: F) -> std::result::Result<T, Status>
    where
        F: FnOnce(&mut Worker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let worker = self.worker.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = worker.try_lock().ok_or_else(|| {
                ShardlineError::WorkerBusy(format!("{} rejected, another operation is in flight", operation))
            })?;
            f(&mut guard)
        })
        .await
        .map_err(|e| Status::internal(format!("{} task failed: {}", operation, e)))?;

        result.map_err(|e| {
            warn!("{} failed: {}", operation, e);
            e.to_status()
        })
    }
}

fn model_source(model: Option<Model>) -> Result<ModelSource> {
    match model {
        Some(Model::CheckpointPath(path)) => Ok(ModelSource::Locator(PathBuf::from(path))),
        Some(Model::ModelConfigJson(json)) => {
            let config: ModelConfig = serde_json::from_str(&json)?;
            Ok(ModelSource::Config(config))
        }
        None => Err(ShardlineError::invalid_input("init-model request names no model")),
    }
}

#[tonic::async_trait]
impl WorkerService for WorkerGrpcService {
    async fn join_group(&self, request: Request<JoinGroupRequest>) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let port = u16::try_from(req.port)
            .map_err(|_| Status::invalid_argument(format!("port {} out of range", req.port)))?;
        let identity = WorkerIdentity {
            rank: req.rank as usize,
            world_size: req.world_size as usize,
            address: req.address,
            port,
        };

        self.run("join-group", move |worker| {
            let rank = identity.rank;
            worker.join_group(identity)?;
            Ok(Ack {
                message: format!("rank {} joined", rank),
            })
        })
        .await
        .map(Response::new)
    }

    async fn init_model(&self, request: Request<InitModelRequest>) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();

        self.run("init-model", move |worker| {
            let inference = InferenceConfig::from_rpc_param(&req.inference_config_json)?;
            let source = model_source(req.model)?;
            let policy = (!req.policy.is_empty()).then_some(req.policy.as_str());
            worker.init_model(inference, source, policy)?;
            Ok(Ack {
                message: format!("model ready ({})", worker.phase()),
            })
        })
        .await
        .map(Response::new)
    }

    async fn init_cache(&self, request: Request<InitCacheRequest>) -> std::result::Result<Response<Ack>, Status> {
        let req = request.into_inner();
        let alloc_shape: Vec<usize> = req.alloc_shape.iter().map(|&d| d as usize).collect();

        self.run("init-cache", move |worker| {
            worker.init_cache(&alloc_shape, req.num_layers as usize)?;
            Ok(Ack {
                message: format!("cache allocated {:?}", alloc_shape),
            })
        })
        .await
        .map(Response::new)
    }

    async fn execute_forward(
        &self,
        request: Request<ForwardRequest>,
    ) -> std::result::Result<Response<ForwardResponse>, Status> {
        let req = request.into_inner();

        self.run("execute-forward", move |worker| {
            let descriptor = BatchDescriptor::from_rpc_param(&req.batch_descriptor_json)?;
            let logits = worker.execute_forward(&req.input_token_ids, &descriptor)?;
            Ok(ForwardResponse {
                num_rows: logits.num_rows as u32,
                row_width: logits.row_width as u32,
                logits: logits.values,
            })
        })
        .await
        .map(Response::new)
    }

    async fn self_test_collective(
        &self,
        _request: Request<SelfTestRequest>,
    ) -> std::result::Result<Response<SelfTestResponse>, Status> {
        self.run("self-test", |worker| {
            Ok(SelfTestResponse {
                sum: worker.self_test_collective()?,
            })
        })
        .await
        .map(Response::new)
    }
}

//! Integration tests driving a group of real worker servers.
//!
//! Workers run in-process on loopback listeners and form their group over
//! the gRPC rendezvous, exactly as separate processes would.

use shardline_client::{ModelSpec, WorkerGroup};
use shardline_common::{BatchDescriptor, InferenceConfig, ModelDType, WorkerServiceConfig};
use shardline_worker::WorkerServer;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

async fn start_workers(count: usize) -> Vec<String> {
    let mut endpoints = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        endpoints.push(format!("http://{}", listener.local_addr().unwrap()));
        let service = WorkerServer::new(WorkerServiceConfig::default()).into_service();
        tokio::spawn(async move {
            Server::builder()
                .add_service(service)
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });
    }
    endpoints
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn inference(tp_size: usize) -> InferenceConfig {
    InferenceConfig {
        dtype: ModelDType::Float32,
        max_batch_size: 2,
        max_input_len: 16,
        max_output_len: 16,
        block_size: 4,
        tp_size,
        pp_size: 1,
        max_n_spec_tokens: 0,
        pad_input: false,
    }
}

fn model_with_layers(num_layers: usize) -> ModelSpec {
    ModelSpec::ConfigJson(
        serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 64,
            "intermediate_size": 128,
            "num_attention_heads": 4,
            "num_key_value_heads": 2,
            "num_hidden_layers": num_layers,
            "vocab_size": 48,
            "initializer_range": 0.1,
            "seed": 5
        })
        .to_string(),
    )
}

fn model() -> ModelSpec {
    model_with_layers(2)
}

fn prefill() -> BatchDescriptor {
    BatchDescriptor {
        batch_size: 2,
        sequence_lengths: vec![4, 2],
        block_tables: vec![vec![0, -1], vec![1, -1]],
        is_prompts: true,
        use_spec_dec: false,
        num_tokens_to_verify: 0,
        dtype: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tensor_parallel_group() {
    let group = WorkerGroup::connect(&start_workers(2).await).await.unwrap();
    assert_eq!(group.world_size(), 2);

    group.join_group("127.0.0.1", free_port()).await.unwrap();
    assert_eq!(group.self_test_collective().await.unwrap(), vec![1.0, 1.0]);

    group.init_model(&inference(2), model(), None).await.unwrap();
    group.init_cache(&[4, 1, 4, 16], 2).await.unwrap();

    let outputs = group
        .execute_forward(&[3, 9, 27, 1, 40, 2], &prefill())
        .await
        .unwrap();
    assert_eq!(outputs.len(), 2);
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0].num_rows, 2);
    assert_eq!(outputs[0].rows().count(), 2);

    // the same model on one worker gives the same logits
    let single = WorkerGroup::connect(&start_workers(1).await).await.unwrap();
    single.join_group("127.0.0.1", free_port()).await.unwrap();
    single.init_model(&inference(1), model(), None).await.unwrap();
    single.init_cache(&[4, 2, 4, 16], 2).await.unwrap();
    let reference = single
        .execute_forward(&[3, 9, 27, 1, 40, 2], &prefill())
        .await
        .unwrap();

    for (a, b) in outputs[0].logits.iter().zip(&reference[0].logits) {
        assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_uneven_pipeline_stages_share_layer_count() {
    // three layers over two stages; both ranks get the model's layer count
    let group = WorkerGroup::connect(&start_workers(2).await).await.unwrap();
    group.join_group("127.0.0.1", free_port()).await.unwrap();

    let config = InferenceConfig {
        pp_size: 2,
        ..inference(1)
    };
    group.init_model(&config, model_with_layers(3), None).await.unwrap();
    group.init_cache(&[4, 2, 4, 16], 3).await.unwrap();

    let outputs = group
        .execute_forward(&[3, 9, 27, 1, 40, 2], &prefill())
        .await
        .unwrap();
    assert_eq!(outputs[0], outputs[1]);

    let single = WorkerGroup::connect(&start_workers(1).await).await.unwrap();
    single.join_group("127.0.0.1", free_port()).await.unwrap();
    single.init_model(&inference(1), model_with_layers(3), None).await.unwrap();
    single.init_cache(&[4, 2, 4, 16], 3).await.unwrap();
    let reference = single
        .execute_forward(&[3, 9, 27, 1, 40, 2], &prefill())
        .await
        .unwrap();

    for (a, b) in outputs[0].logits.iter().zip(&reference[0].logits) {
        assert!((a - b).abs() < 1e-3, "{} vs {}", a, b);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_logits_above_default_message_limit() {
    let group = WorkerGroup::connect(&start_workers(1).await).await.unwrap();
    group.join_group("127.0.0.1", free_port()).await.unwrap();

    let vocab_size = 40_000;
    let config = InferenceConfig {
        max_batch_size: 32,
        ..inference(1)
    };
    let model = ModelSpec::ConfigJson(
        serde_json::json!({
            "architectures": ["LlamaForCausalLM"],
            "model_type": "llama",
            "hidden_size": 16,
            "intermediate_size": 32,
            "num_attention_heads": 2,
            "num_hidden_layers": 1,
            "vocab_size": vocab_size,
            "seed": 3
        })
        .to_string(),
    );
    group.init_model(&config, model, None).await.unwrap();
    group.init_cache(&[32, 2, 4, 8], 1).await.unwrap();

    // 32 one-token prompts: 32 x 40000 f32 logits, over tonic's 4 MiB default
    let batch = BatchDescriptor {
        batch_size: 32,
        sequence_lengths: vec![1; 32],
        block_tables: (0..32).map(|block| vec![block]).collect(),
        is_prompts: true,
        use_spec_dec: false,
        num_tokens_to_verify: 0,
        dtype: None,
    };
    let tokens: Vec<i64> = (0..32).map(|i| i * 1000 + 7).collect();
    let outputs = group.execute_forward(&tokens, &batch).await.unwrap();

    assert_eq!(outputs[0].num_rows, 32);
    assert_eq!(outputs[0].row_width, vocab_size);
    assert!(outputs[0].logits.len() * 4 > 4 * 1024 * 1024);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_group_surfaces_lowest_rank_error() {
    let group = WorkerGroup::connect(&start_workers(1).await).await.unwrap();

    // init-model before join-group is a sequencing error
    let err = group.init_model(&inference(1), model(), None).await.unwrap_err();
    match err {
        shardline_common::ShardlineError::Grpc(status) => {
            assert_eq!(status.code(), tonic::Code::FailedPrecondition)
        }
        other => panic!("unexpected error: {}", other),
    }
}

//! Dispatcher behavior against a stubbed OpenAI-compatible embeddings API.

use serde_json::{json, Value};
use std::time::{Duration, Instant};

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use helpdex::config::EmbeddingConfig;
use helpdex::embedding::EmbeddingService;

fn api_config(url: &str) -> EmbeddingConfig {
    EmbeddingConfig {
        backend: "openai_api".into(),
        model: "test-embed".into(),
        api_url: format!("{}/v1", url),
        api_key: String::new(),
        dimension: None,
        batch_size: 4,
        workers: 2,
        force_batch: false,
        timeout_secs: 10,
        max_concurrent: 4,
        max_input_chars: 2000,
        max_retries: 3,
    }
}

async fn mount_models(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/v1/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [{ "id": "test-embed" }, { "id": "some-chat-model" }]
        })))
        .mount(server)
        .await;
}

/// Answers with one vector per input; the first vector component encodes
/// the numeric suffix of the input (`t7` → 7.0) so ordering is checkable.
struct TaggedEmbeddings;

fn tag_of(text: &str) -> f64 {
    text.trim_start_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .unwrap_or(-1.0)
}

impl Respond for TaggedEmbeddings {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap_or(Value::Null);
        let inputs: Vec<String> = match body.get("input") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().unwrap_or("").to_string())
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        };
        let data: Vec<Value> = inputs
            .iter()
            .enumerate()
            .map(|(i, text)| json!({ "index": i, "embedding": [tag_of(text), 1.0] }))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

/// Always returns three vectors, whatever was asked.
struct ThreeVectors;

impl Respond for ThreeVectors {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let data: Vec<Value> = (0..3)
            .map(|i| json!({ "index": i, "embedding": [99.0 + i as f64, 1.0] }))
            .collect();
        ResponseTemplate::new(200).set_body_json(json!({ "data": data }))
    }
}

#[tokio::test]
async fn batches_return_one_vector_per_input_in_order() {
    let server = MockServer::start().await;
    mount_models(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TaggedEmbeddings)
        .mount(&server)
        .await;

    let service = EmbeddingService::new(&api_config(&server.uri())).unwrap();
    // 10 inputs with batch_size 4 → three batches across two workers.
    let texts: Vec<String> = (0..10).map(|i| format!("t{}", i)).collect();
    let vectors = service.embed_many(&texts).await.unwrap();

    assert_eq!(vectors.len(), 10);
    for (i, v) in vectors.iter().enumerate() {
        assert_eq!(v[0], i as f32, "input order must be preserved");
    }
    assert!(!service.is_degraded());
}

#[tokio::test]
async fn count_mismatch_retries_splits_and_recovers_order() {
    let server = MockServer::start().await;
    mount_models(&server).await;

    // First two calls (the original batch and its silent retry) come up
    // short; every later call is answered correctly.
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(ThreeVectors)
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TaggedEmbeddings)
        .mount(&server)
        .await;

    let service = EmbeddingService::new(&api_config(&server.uri())).unwrap();
    let texts: Vec<String> = (0..4).map(|i| format!("t{}", i)).collect();
    let vectors = service.embed_many(&texts).await.unwrap();

    assert_eq!(vectors.len(), 4);
    for (i, v) in vectors.iter().enumerate() {
        assert_eq!(v[0], i as f32, "order must survive the half-split");
    }
    assert_eq!(service.count_mismatch_retries(), 1);
    assert!(!service.is_degraded());
}

#[tokio::test]
async fn retry_after_zero_is_clamped_to_minimum_backoff() {
    let server = MockServer::start().await;
    mount_models(&server).await;

    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(
            ResponseTemplate::new(429).insert_header("retry-after", "0"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TaggedEmbeddings)
        .mount(&server)
        .await;

    let service = EmbeddingService::new(&api_config(&server.uri())).unwrap();
    let started = Instant::now();
    let vector = service.embed_one("t5").await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(vector[0], 5.0);
    assert!(
        elapsed >= Duration::from_millis(900),
        "Retry-After: 0 must clamp to at least one second (took {:?})",
        elapsed
    );
    assert!(!service.is_degraded());
}

#[tokio::test]
async fn dimension_is_memoized_from_first_call() {
    let server = MockServer::start().await;
    mount_models(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TaggedEmbeddings)
        .mount(&server)
        .await;

    let service = EmbeddingService::new(&api_config(&server.uri())).unwrap();
    assert_eq!(service.dimension().await.unwrap(), 2);
    // Memoized: no further probe needed, same answer.
    assert_eq!(service.dimension().await.unwrap(), 2);
}

#[tokio::test]
async fn configured_dimension_overrides_probe() {
    let server = MockServer::start().await;
    mount_models(&server).await;

    let mut config = api_config(&server.uri());
    config.dimension = Some(1536);
    let service = EmbeddingService::new(&config).unwrap();
    assert_eq!(service.dimension().await.unwrap(), 1536);
}

#[tokio::test]
async fn unreachable_api_probes_unavailable_and_degrades() {
    let config = api_config("http://127.0.0.1:1");
    let mut config = config;
    config.max_retries = 1;
    config.timeout_secs = 5;
    let service = EmbeddingService::new(&config).unwrap();

    assert!(!service.is_available().await);

    // Non-strict embedding still returns one placeholder per input.
    let vectors = service
        .embed_many(&["a".to_string(), "b".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors.len(), 2);
    assert!(service.is_degraded());

    // Strict embedding refuses instead of inventing vectors.
    assert!(service.embed_one_strict("a").await.is_err());
}

#[tokio::test]
async fn force_batch_accepts_the_ceiling_in_one_call() {
    let server = MockServer::start().await;
    mount_models(&server).await;
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .respond_with(TaggedEmbeddings)
        .expect(1)
        .mount(&server)
        .await;

    let mut config = api_config(&server.uri());
    config.force_batch = true; // batch size pinned to 256
    let service = EmbeddingService::new(&config).unwrap();

    let texts: Vec<String> = (0..256).map(|i| format!("t{}", i)).collect();
    let vectors = service.embed_many(&texts).await.unwrap();
    assert_eq!(vectors.len(), 256);
    assert_eq!(vectors[255][0], 255.0);
}

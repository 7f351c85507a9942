//! Embedding backends and the dispatching service.
//!
//! Backends implement [`EmbeddingBackend`] and stay simple: one raw call, no
//! retry logic. The [`EmbeddingService`] wraps the selected backend with the
//! cross-cutting concerns — input sanitizing and truncation, batching, the
//! worker fan-out, the global concurrency semaphore, retries with backoff,
//! HTTP 429 handling, the vector-count mismatch protocol, and dimension
//! probing/memoization.
//!
//! # Backends
//!
//! | `EMBEDDING_BACKEND` | Behavior |
//! |---------------------|----------|
//! | `local` | in-process model (behind the `local-embeddings` feature) |
//! | `openai_api` | OpenAI-compatible HTTP endpoint |
//! | `deterministic` | reproducible hash-derived 384-dim vectors, offline |
//! | `none` | fixed placeholder vectors; semantic search degraded |
//!
//! # Guarantees
//!
//! [`EmbeddingService::embed_many`] returns exactly one vector per input in
//! input order. Slots whose every retry failed receive placeholder vectors
//! and flip the service into degraded mode; a changed backend dimension is
//! the only error surfaced to callers.

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use unicode_normalization::UnicodeNormalization;

use crate::config::EmbeddingConfig;

/// Fallback dimension when nothing better is known (the common size of
/// small sentence-embedding models).
pub const DEFAULT_DIMENSION: usize = 384;

/// Bound on waiting for a semaphore slot, so a wedged worker cannot
/// deadlock the dispatcher.
const SEMAPHORE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a backend availability probe result stays cached.
const AVAILABILITY_TTL: Duration = Duration::from_secs(60);

const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_AFTER_MIN: Duration = Duration::from_secs(1);
const RETRY_AFTER_MAX: Duration = Duration::from_secs(120);

/// Errors surfaced by a raw backend call.
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("backend error: {0}")]
    Backend(String),
    /// Local-model failures are terminal for the call: no retry.
    #[error("terminal backend error: {0}")]
    Terminal(String),
}

impl EmbedError {
    fn is_retriable(&self) -> bool {
        !matches!(self, EmbedError::Terminal(_))
    }
}

/// A single embedding backend. Implementations perform one raw call per
/// method; all policy lives in [`EmbeddingService`].
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Backend identifier as reported in status output (`local`,
    /// `openai_api`, `deterministic`, `none`).
    fn name(&self) -> &'static str;

    /// True when the backend can produce meaningful (non-placeholder)
    /// vectors right now. Drives the memory pending queue.
    async fn probe_available(&self) -> bool;

    /// Discover the vector dimension, possibly with a probe call.
    async fn probe_dimension(&self) -> Result<usize, EmbedError>;

    /// Embed one batch, one attempt. The returned count may disagree with
    /// the input count — the dispatcher owns the mismatch protocol.
    async fn embed_raw(
        &self,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Instantiate the backend selected by the configuration.
pub fn create_backend(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingBackend>> {
    match config.backend.as_str() {
        "none" => Ok(Arc::new(NoneBackend {
            dimension: config.dimension.unwrap_or(DEFAULT_DIMENSION),
        })),
        "deterministic" => Ok(Arc::new(DeterministicBackend)),
        "openai_api" => Ok(Arc::new(OpenAiApiBackend::new(config)?)),
        #[cfg(feature = "local-embeddings")]
        "local" => Ok(Arc::new(local::LocalBackend::new(config))),
        #[cfg(not(feature = "local-embeddings"))]
        "local" => bail!(
            "EMBEDDING_BACKEND=local requires building with --features local-embeddings"
        ),
        other => bail!("Unknown embedding backend: {}", other),
    }
}

// ============ Sanitizing & placeholders ============

/// Replace control bytes `0x00–0x1F` (except `\n`, `\r`, `\t`) with spaces.
pub fn sanitize_text(text: &str) -> String {
    text.chars()
        .map(|c| {
            if (c as u32) < 0x20 && !matches!(c, '\n' | '\r' | '\t') {
                ' '
            } else {
                c
            }
        })
        .collect()
}

/// Deterministic placeholder vector: SHA-256 bytes cycled over the
/// requested dimension, scaled into `[-1, 1)`.
pub fn placeholder_vector(text: &str, dimension: usize) -> Vec<f32> {
    let digest = Sha256::digest(text.as_bytes());
    (0..dimension)
        .map(|i| (f32::from(digest[i % digest.len()]) - 128.0) / 128.0)
        .collect()
}

// ============ none ============

/// Placeholder-only backend: the index stays populated so lexical
/// operations work, but semantic similarity is meaningless.
struct NoneBackend {
    dimension: usize,
}

#[async_trait]
impl EmbeddingBackend for NoneBackend {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn probe_available(&self) -> bool {
        false
    }

    async fn probe_dimension(&self) -> Result<usize, EmbedError> {
        Ok(self.dimension)
    }

    async fn embed_raw(
        &self,
        texts: &[String],
        _timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts
            .iter()
            .map(|t| placeholder_vector(t, self.dimension))
            .collect())
    }
}

// ============ deterministic ============

/// Hash-derived embeddings: NFC-normalize, tokenize, bucket token hashes
/// into 384 dimensions, mean-normalize. Reproducible and offline — builds a
/// usable-but-shallow index when no model is available.
struct DeterministicBackend;

fn deterministic_vector(text: &str) -> Vec<f32> {
    let normalized: String = text.nfc().collect::<String>().to_lowercase();
    let mut vec = vec![0.0f32; DEFAULT_DIMENSION];
    let mut tokens = 0usize;
    for (i, token) in tokenize(&normalized).enumerate() {
        tokens += 1;
        let digest = Sha256::digest(token.as_bytes());
        let h = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        vec[i % DEFAULT_DIMENSION] += ((h % 256) as f32 - 128.0) / 128.0;
    }
    let n = tokens.max(1) as f32;
    for v in &mut vec {
        *v /= n;
    }
    vec
}

/// Word runs and single punctuation marks, like a `\w+|[^\w\s]` scan.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut out = Vec::new();
    let mut word = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            word.push(c);
        } else {
            if !word.is_empty() {
                out.push(std::mem::take(&mut word));
            }
            if !c.is_whitespace() {
                out.push(c.to_string());
            }
        }
    }
    if !word.is_empty() {
        out.push(word);
    }
    out.into_iter()
}

#[async_trait]
impl EmbeddingBackend for DeterministicBackend {
    fn name(&self) -> &'static str {
        "deterministic"
    }

    async fn probe_available(&self) -> bool {
        true
    }

    async fn probe_dimension(&self) -> Result<usize, EmbedError> {
        Ok(DEFAULT_DIMENSION)
    }

    async fn embed_raw(
        &self,
        texts: &[String],
        _timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        Ok(texts.iter().map(|t| deterministic_vector(t)).collect())
    }
}

// ============ openai_api ============

/// OpenAI-compatible HTTP backend (LM Studio, Ollama's OpenAI shim,
/// llama.cpp server, hosted APIs).
struct OpenAiApiBackend {
    url: String,
    api_key: String,
    configured_model: String,
    client: reqwest::Client,
    /// Model id resolved against the server's `/models` list; cleared on
    /// request failure so the next call re-resolves.
    resolved_model: Mutex<Option<String>>,
    availability: Mutex<Option<(Instant, bool)>>,
}

impl OpenAiApiBackend {
    fn new(config: &EmbeddingConfig) -> Result<Self> {
        let url = config.api_url.trim_end_matches('/').to_string();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("embedding API URL must use http:// or https:// (got '{}')", url);
        }
        Ok(Self {
            url,
            api_key: config.api_key.clone(),
            configured_model: config.model.clone(),
            client: reqwest::Client::new(),
            resolved_model: Mutex::new(None),
            availability: Mutex::new(None),
        })
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.bearer_auth(&self.api_key)
        }
    }

    /// Pick the model id to send: the configured one when the server lists
    /// it, else a preferred embedding model by substring, else the first
    /// listed, else the configured name as-is.
    async fn resolve_model(&self) -> String {
        if let Some(model) = self.resolved_model.lock().ok().and_then(|g| g.clone()) {
            return model;
        }

        const PREFERRED: [&str; 3] = ["nomic-embed-text", "all-MiniLM-L6-v2", "text-embedding-3-small"];

        let mut ids: Vec<String> = Vec::new();
        let request = self
            .auth(self.client.get(format!("{}/models", self.url)))
            .timeout(Duration::from_secs(10));
        if let Ok(resp) = request.send().await {
            if let Ok(body) = resp.json::<serde_json::Value>().await {
                for item in body.get("data").and_then(|d| d.as_array()).into_iter().flatten() {
                    if let Some(id) = item.get("id").and_then(|v| v.as_str()) {
                        ids.push(id.to_string());
                    }
                }
            }
        }

        let chosen = if ids.iter().any(|id| id == &self.configured_model) {
            self.configured_model.clone()
        } else if let Some(id) = PREFERRED.iter().find_map(|p| {
            ids.iter()
                .find(|id| id.contains(p) || p.contains(id.as_str()))
                .cloned()
        }) {
            id
        } else if let Some(first) = ids.first() {
            first.clone()
        } else {
            self.configured_model.clone()
        };

        if let Ok(mut guard) = self.resolved_model.lock() {
            *guard = Some(chosen.clone());
        }
        chosen
    }

    fn forget_model(&self) {
        if let Ok(mut guard) = self.resolved_model.lock() {
            *guard = None;
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiApiBackend {
    fn name(&self) -> &'static str {
        "openai_api"
    }

    async fn probe_available(&self) -> bool {
        if let Ok(guard) = self.availability.lock() {
            if let Some((at, ok)) = *guard {
                if at.elapsed() < AVAILABILITY_TTL {
                    return ok;
                }
            }
        }
        let ok = self
            .auth(self.client.get(format!("{}/models", self.url)))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false);
        if !ok {
            tracing::warn!(url = %self.url, "embedding API unreachable; degraded mode");
        }
        if let Ok(mut guard) = self.availability.lock() {
            *guard = Some((Instant::now(), ok));
        }
        ok
    }

    async fn probe_dimension(&self) -> Result<usize, EmbedError> {
        let vectors = self
            .embed_raw(&[".".to_string()], Duration::from_secs(30))
            .await?;
        vectors
            .first()
            .map(|v| v.len())
            .filter(|len| *len > 0)
            .ok_or_else(|| EmbedError::Backend("empty dimension probe response".into()))
    }

    async fn embed_raw(
        &self,
        texts: &[String],
        timeout: Duration,
    ) -> Result<Vec<Vec<f32>>, EmbedError> {
        let model = self.resolve_model().await;
        let body = json!({ "model": model, "input": texts });

        let response = self
            .auth(self.client.post(format!("{}/embeddings", self.url)))
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                self.forget_model();
                if e.is_timeout() {
                    EmbedError::Timeout
                } else {
                    EmbedError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(EmbedError::RateLimited { retry_after });
        }
        if !status.is_success() {
            self.forget_model();
            let text = response.text().await.unwrap_or_default();
            return Err(EmbedError::Backend(format!("HTTP {}: {}", status, text)));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| EmbedError::Backend(format!("invalid response body: {}", e)))?;

        parse_embeddings_response(&payload)
    }
}

/// Extract `data[].embedding` in `data[].index` order.
fn parse_embeddings_response(payload: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbedError> {
    let data = payload
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| EmbedError::Backend("response missing data array".into()))?;

    let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| EmbedError::Backend("response item missing embedding".into()))?;
        let vector: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        let index = item
            .get("index")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(pos);
        indexed.push((index, vector));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ local (feature-gated) ============

#[cfg(feature = "local-embeddings")]
mod local {
    use super::*;

    /// In-process model via fastembed. Model weights download on first use
    /// and cache; afterwards no network is involved.
    pub struct LocalBackend {
        model_name: String,
        dimension: usize,
    }

    impl LocalBackend {
        pub fn new(config: &EmbeddingConfig) -> Self {
            let model_name = config.model.clone();
            let dimension = config.dimension.unwrap_or(match model_name.as_str() {
                "all-MiniLM-L6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
                "bge-base-en-v1.5" | "nomic-embed-text-v1.5" | "multilingual-e5-base" => 768,
                "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
                _ => super::DEFAULT_DIMENSION,
            });
            Self {
                model_name,
                dimension,
            }
        }

        fn fastembed_model(&self) -> Result<fastembed::EmbeddingModel, EmbedError> {
            match self.model_name.as_str() {
                "all-MiniLM-L6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
                "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
                "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
                "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
                "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
                "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
                "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
                "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
                other => Err(EmbedError::Terminal(format!(
                    "unknown local embedding model: {}",
                    other
                ))),
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for LocalBackend {
        fn name(&self) -> &'static str {
            "local"
        }

        async fn probe_available(&self) -> bool {
            self.fastembed_model().is_ok()
        }

        async fn probe_dimension(&self) -> Result<usize, EmbedError> {
            Ok(self.dimension)
        }

        async fn embed_raw(
            &self,
            texts: &[String],
            _timeout: Duration,
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            let model = self.fastembed_model()?;
            let texts = texts.to_vec();
            tokio::task::spawn_blocking(move || {
                let mut embedder = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(model),
                )
                .map_err(|e| EmbedError::Terminal(format!("model init failed: {}", e)))?;
                embedder
                    .embed(texts, None)
                    .map_err(|e| EmbedError::Terminal(format!("local embedding failed: {}", e)))
            })
            .await
            .map_err(|e| EmbedError::Terminal(format!("embedding task panicked: {}", e)))?
        }
    }
}

// ============ Dispatcher ============

/// Backend wrapper owning every cross-cutting concern. Cheap to clone via
/// `Arc` fields; one instance is shared process-wide.
pub struct EmbeddingService {
    backend: Arc<dyn EmbeddingBackend>,
    config: EmbeddingConfig,
    semaphore: Arc<Semaphore>,
    /// Dimension memoized from config or the first successful call.
    dimension: RwLock<Option<usize>>,
    degraded: AtomicBool,
    truncated_inputs: AtomicU64,
    count_retries: AtomicU64,
}

impl EmbeddingService {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let backend = create_backend(config)?;
        Ok(Self::with_backend(backend, config.clone()))
    }

    /// Wrap an explicit backend. Tests use this to script responses.
    pub fn with_backend(backend: Arc<dyn EmbeddingBackend>, config: EmbeddingConfig) -> Self {
        let slots = config.max_concurrent.max(1);
        Self {
            backend,
            config,
            semaphore: Arc::new(Semaphore::new(slots)),
            dimension: RwLock::new(None),
            degraded: AtomicBool::new(false),
            truncated_inputs: AtomicU64::new(0),
            count_retries: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// True once any call has fallen back to placeholder vectors.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Number of vector-count mismatch recoveries performed so far.
    pub fn count_mismatch_retries(&self) -> u64 {
        self.count_retries.load(Ordering::Relaxed)
    }

    /// True when the long memory tier can be written right now.
    pub async fn is_available(&self) -> bool {
        self.backend.probe_available().await
    }

    /// Vector dimension for collection creation: the configured override,
    /// the memoized probe result, or a fresh probe.
    pub async fn dimension(&self) -> Result<usize> {
        if let Some(dim) = self.config.dimension {
            return Ok(dim);
        }
        if let Some(dim) = self.read_memoized_dimension() {
            return Ok(dim);
        }
        match self.backend.probe_dimension().await {
            Ok(dim) => {
                self.memoize_dimension(dim);
                Ok(dim)
            }
            Err(e) => {
                tracing::warn!(error = %e, "dimension probe failed; assuming default");
                Ok(DEFAULT_DIMENSION)
            }
        }
    }

    fn read_memoized_dimension(&self) -> Option<usize> {
        self.dimension.read().ok().and_then(|g| *g)
    }

    fn memoize_dimension(&self, dim: usize) {
        if let Ok(mut guard) = self.dimension.write() {
            guard.get_or_insert(dim);
        }
    }

    fn placeholder_dimension(&self) -> usize {
        self.config
            .dimension
            .or_else(|| self.read_memoized_dimension())
            .unwrap_or(DEFAULT_DIMENSION)
    }

    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding result"))
    }

    /// Embed a list of texts: exactly one vector per input, input order.
    ///
    /// The only error is a dimension change against the memoized value —
    /// the orchestrator turns that into a collection-recreate requirement.
    /// Everything else degrades to placeholders.
    pub async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let prepared: Vec<String> = texts.iter().map(|t| self.prepare_input(t)).collect();
        let batch_size = self.config.effective_batch_size();
        let workers = self.config.effective_workers();

        let batches: Vec<(usize, Vec<String>)> = prepared
            .chunks(batch_size)
            .enumerate()
            .map(|(i, chunk)| (i, chunk.to_vec()))
            .collect();
        let batch_count = batches.len();

        let mut slots: Vec<Option<Vec<Vec<f32>>>> = vec![None; batch_count];
        let mut results = stream::iter(batches)
            .map(|(i, batch)| async move { (i, self.embed_batch_checked(batch).await) })
            .buffer_unordered(workers.min(batch_count).max(1));

        while let Some((i, result)) = results.next().await {
            slots[i] = Some(result?);
        }
        drop(results);

        let mut out = Vec::with_capacity(prepared.len());
        for slot in slots {
            out.extend(slot.unwrap_or_default());
        }
        debug_assert_eq!(out.len(), texts.len());
        Ok(out)
    }

    /// Strict single embedding: no placeholder fallback. The memory long
    /// tier uses this so a failed embed defers the event instead of
    /// persisting a meaningless vector.
    pub async fn embed_one_strict(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_many_strict(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding result"))
    }

    /// Strict batch embedding: returns an error (rather than placeholders)
    /// when any batch cannot be embedded after retries. Order and count are
    /// guaranteed on success.
    pub async fn embed_many_strict(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prepared: Vec<String> = texts.iter().map(|t| self.prepare_input(t)).collect();
        let batch_size = self.config.effective_batch_size();

        let mut out = Vec::with_capacity(prepared.len());
        for batch in prepared.chunks(batch_size) {
            let mut vectors = self
                .embed_attempts(batch)
                .await
                .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;
            if vectors.len() < batch.len() {
                self.count_retries.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    want = batch.len(),
                    got = vectors.len(),
                    "embedding_count_retry: short response on strict batch"
                );
                vectors = self
                    .embed_attempts(batch)
                    .await
                    .map_err(|e| anyhow::anyhow!("embedding failed: {}", e))?;
                if vectors.len() < batch.len() {
                    bail!(
                        "backend returned {} vectors for {} inputs",
                        vectors.len(),
                        batch.len()
                    );
                }
            }
            vectors.truncate(batch.len());
            if let Some(got) = vectors.iter().map(Vec::len).find(|len| *len > 0) {
                if let Some(expected) =
                    self.config.dimension.or_else(|| self.read_memoized_dimension())
                {
                    if got != expected {
                        bail!(
                            "embedding dimension changed: collection expects {}, backend returned {}",
                            expected,
                            got
                        );
                    }
                } else {
                    self.memoize_dimension(got);
                }
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    /// Sanitize control bytes and enforce the input character cap.
    fn prepare_input(&self, text: &str) -> String {
        let sanitized = sanitize_text(text);
        let cap = self.config.max_input_chars;
        if sanitized.chars().count() > cap {
            self.truncated_inputs.fetch_add(1, Ordering::Relaxed);
            sanitized.chars().take(cap).collect()
        } else {
            sanitized
        }
    }

    /// Run one batch through the mismatch protocol, then verify dimensions
    /// against the memoized value.
    async fn embed_batch_checked(&self, batch: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let vectors = self.embed_with_mismatch_protocol(&batch).await;
        debug_assert_eq!(vectors.len(), batch.len());

        if let Some(got) = vectors.iter().map(Vec::len).find(|len| *len > 0) {
            if let Some(expected) = self.config.dimension.or_else(|| self.read_memoized_dimension())
            {
                if got != expected {
                    bail!(
                        "embedding dimension changed: collection expects {}, backend returned {}",
                        expected,
                        got
                    );
                }
            } else {
                self.memoize_dimension(got);
            }
        }
        Ok(vectors)
    }

    /// The count-mismatch protocol: retry the same batch once, then split
    /// it in half, then fall back to one-by-one; slots that still fail get
    /// placeholders and flip the degraded flag.
    fn embed_with_mismatch_protocol<'a>(
        &'a self,
        batch: &'a [String],
    ) -> futures::future::BoxFuture<'a, Vec<Vec<f32>>> {
        Box::pin(async move {
            match self.embed_attempts(batch).await {
                Ok(vectors) if vectors.len() >= batch.len() => {
                    let mut vectors = vectors;
                    vectors.truncate(batch.len());
                    vectors
                }
                Ok(short) => {
                    self.count_retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        want = batch.len(),
                        got = short.len(),
                        "embedding_count_retry: backend returned fewer vectors than inputs"
                    );
                    // One silent retry of the identical batch.
                    if let Ok(vectors) = self.embed_attempts(batch).await {
                        if vectors.len() >= batch.len() {
                            let mut vectors = vectors;
                            vectors.truncate(batch.len());
                            return vectors;
                        }
                    }
                    if batch.len() == 1 {
                        self.mark_degraded("single input kept failing the count check");
                        return vec![placeholder_vector(&batch[0], self.placeholder_dimension())];
                    }
                    let mid = batch.len() / 2;
                    let (left, right) = batch.split_at(mid);
                    let mut vectors = self.embed_with_mismatch_protocol(left).await;
                    vectors.extend(self.embed_with_mismatch_protocol(right).await);
                    vectors
                }
                Err(e) => {
                    self.mark_degraded(&e.to_string());
                    batch
                        .iter()
                        .map(|t| placeholder_vector(t, self.placeholder_dimension()))
                        .collect()
                }
            }
        })
    }

    /// One batch with the retry/backoff loop, under the global semaphore.
    async fn embed_attempts(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let permit = tokio::time::timeout(SEMAPHORE_ACQUIRE_TIMEOUT, self.semaphore.acquire())
            .await
            .map_err(|_| EmbedError::Timeout)?
            .map_err(|_| EmbedError::Backend("semaphore closed".into()))?;

        let timeout = if batch.len() <= 1 {
            self.config.single_timeout()
        } else {
            self.config.batch_timeout(batch.len())
        };

        let max_attempts = self.config.max_retries.max(1);
        let mut last_err = EmbedError::Backend("no attempt made".into());
        for attempt in 0..max_attempts {
            match self.backend.embed_raw(batch, timeout).await {
                Ok(vectors) => {
                    drop(permit);
                    return Ok(vectors);
                }
                Err(EmbedError::RateLimited { retry_after }) => {
                    last_err = EmbedError::RateLimited { retry_after };
                    if attempt + 1 < max_attempts {
                        // Retry-After wins over exponential backoff, clamped.
                        let wait = retry_after
                            .unwrap_or(RETRY_BASE_DELAY)
                            .clamp(RETRY_AFTER_MIN, RETRY_AFTER_MAX);
                        tracing::debug!(wait_secs = wait.as_secs(), "rate limited by embedding API");
                        tokio::time::sleep(wait).await;
                    }
                }
                Err(e) if e.is_retriable() => {
                    tracing::debug!(attempt, error = %e, "embedding attempt failed");
                    last_err = e;
                    if attempt + 1 < max_attempts {
                        let delay = RETRY_BASE_DELAY * 2u32.pow(attempt.min(5));
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(terminal) => {
                    drop(permit);
                    return Err(terminal);
                }
            }
        }
        drop(permit);
        Err(last_err)
    }

    fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            tracing::warn!(reason, "embedding degraded; placeholder vectors in use");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig {
            backend: "deterministic".into(),
            model: String::new(),
            api_url: "http://localhost:1234/v1".into(),
            api_key: String::new(),
            dimension: None,
            batch_size: 4,
            workers: 2,
            force_batch: false,
            timeout_secs: 5,
            max_concurrent: 4,
            max_input_chars: 2000,
            max_retries: 2,
        }
    }

    #[test]
    fn sanitize_strips_control_bytes() {
        let input = "a\u{0}b\u{1f}c\nd\te\r";
        assert_eq!(sanitize_text(input), "a b c\nd\te\r");
    }

    #[test]
    fn placeholder_is_deterministic_with_requested_dimension() {
        let a = placeholder_vector("text", 384);
        let b = placeholder_vector("text", 384);
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        assert_eq!(placeholder_vector("text", 768).len(), 768);
        assert!(a.iter().all(|v| (-1.0..1.0).contains(v)));
    }

    #[test]
    fn deterministic_vectors_reproducible_and_distinct() {
        let a = deterministic_vector("Запрос выборка");
        let b = deterministic_vector("Запрос выборка");
        let c = deterministic_vector("another text entirely");
        assert_eq!(a, b);
        assert_eq!(a.len(), DEFAULT_DIMENSION);
        assert_ne!(a, c);
    }

    #[test]
    fn parse_response_sorts_by_index() {
        let payload = json!({
            "data": [
                { "index": 1, "embedding": [2.0] },
                { "index": 0, "embedding": [1.0] }
            ]
        });
        let vectors = parse_embeddings_response(&payload).unwrap();
        assert_eq!(vectors, vec![vec![1.0f32], vec![2.0f32]]);
    }

    /// Backend whose per-call vector counts are scripted, for exercising
    /// the mismatch protocol.
    struct ScriptedBackend {
        calls: AtomicUsize,
        /// For call `n`, return `min(requested, caps[n])` vectors.
        caps: Vec<usize>,
    }

    impl ScriptedBackend {
        fn new(caps: Vec<usize>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                caps,
            }
        }
    }

    #[async_trait]
    impl EmbeddingBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }
        async fn probe_available(&self) -> bool {
            true
        }
        async fn probe_dimension(&self) -> Result<usize, EmbedError> {
            Ok(2)
        }
        async fn embed_raw(
            &self,
            texts: &[String],
            _timeout: Duration,
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let cap = self.caps.get(call).copied().unwrap_or(usize::MAX);
            Ok(texts
                .iter()
                .take(cap)
                .map(|t| {
                    // Encode the input's identity so order is checkable.
                    let tag: f32 = t.parse().unwrap_or(-1.0);
                    vec![tag, tag]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn embed_many_preserves_input_order_across_batches() {
        let backend = Arc::new(ScriptedBackend::new(vec![]));
        let service = EmbeddingService::with_backend(backend, test_config());

        let texts: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let vectors = service.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 10);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], i as f32);
        }
        assert!(!service.is_degraded());
    }

    #[tokio::test]
    async fn count_mismatch_retries_then_splits_preserving_order() {
        // Request of 4: first call returns 3 (mismatch), the silent retry
        // returns 3 again, then halves of 2 succeed.
        let backend = Arc::new(ScriptedBackend::new(vec![3, 3]));
        let mut config = test_config();
        config.batch_size = 4;
        let service = EmbeddingService::with_backend(backend, config);

        let texts: Vec<String> = (0..4).map(|i| i.to_string()).collect();
        let vectors = service.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 4);
        for (i, v) in vectors.iter().enumerate() {
            assert_eq!(v[0], i as f32, "order must survive the split");
        }
        assert_eq!(service.count_mismatch_retries(), 1);
        assert!(!service.is_degraded());
    }

    /// Backend that always fails, for the placeholder path.
    struct FailingBackend;

    #[async_trait]
    impl EmbeddingBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }
        async fn probe_available(&self) -> bool {
            false
        }
        async fn probe_dimension(&self) -> Result<usize, EmbedError> {
            Err(EmbedError::Transport("down".into()))
        }
        async fn embed_raw(
            &self,
            _texts: &[String],
            _timeout: Duration,
        ) -> Result<Vec<Vec<f32>>, EmbedError> {
            Err(EmbedError::Terminal("down".into()))
        }
    }

    #[tokio::test]
    async fn total_failure_yields_placeholders_and_degraded_flag() {
        let mut config = test_config();
        config.dimension = Some(16);
        let service = EmbeddingService::with_backend(Arc::new(FailingBackend), config);

        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = service.embed_many(&texts).await.unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 16);
        assert_eq!(vectors[0], placeholder_vector("a", 16));
        assert!(service.is_degraded());
    }

    #[tokio::test]
    async fn dimension_change_is_surfaced_as_error() {
        struct GrowingBackend {
            calls: AtomicUsize,
        }
        #[async_trait]
        impl EmbeddingBackend for GrowingBackend {
            fn name(&self) -> &'static str {
                "growing"
            }
            async fn probe_available(&self) -> bool {
                true
            }
            async fn probe_dimension(&self) -> Result<usize, EmbedError> {
                Ok(384)
            }
            async fn embed_raw(
                &self,
                texts: &[String],
                _timeout: Duration,
            ) -> Result<Vec<Vec<f32>>, EmbedError> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                let dim = if call == 0 { 384 } else { 768 };
                Ok(texts.iter().map(|_| vec![0.0; dim]).collect())
            }
        }

        let service = EmbeddingService::with_backend(
            Arc::new(GrowingBackend {
                calls: AtomicUsize::new(0),
            }),
            test_config(),
        );

        service.embed_many(&["a".to_string()]).await.unwrap();
        let err = service.embed_many(&["b".to_string()]).await.unwrap_err();
        assert!(err.to_string().contains("dimension changed"));
    }

    #[tokio::test]
    async fn inputs_are_truncated_to_the_char_cap() {
        struct LenBackend;
        #[async_trait]
        impl EmbeddingBackend for LenBackend {
            fn name(&self) -> &'static str {
                "len"
            }
            async fn probe_available(&self) -> bool {
                true
            }
            async fn probe_dimension(&self) -> Result<usize, EmbedError> {
                Ok(1)
            }
            async fn embed_raw(
                &self,
                texts: &[String],
                _timeout: Duration,
            ) -> Result<Vec<Vec<f32>>, EmbedError> {
                Ok(texts
                    .iter()
                    .map(|t| vec![t.chars().count() as f32])
                    .collect())
            }
        }

        let mut config = test_config();
        config.max_input_chars = 10;
        let service = EmbeddingService::with_backend(Arc::new(LenBackend), config);
        let long = "x".repeat(100);
        let vectors = service.embed_many(&[long]).await.unwrap();
        assert_eq!(vectors[0][0], 10.0);
    }

    #[tokio::test]
    async fn none_backend_reports_unavailable_but_embeds() {
        let mut config = test_config();
        config.backend = "none".into();
        let service = EmbeddingService::new(&config).unwrap();
        assert_eq!(service.backend_name(), "none");
        assert!(!service.is_available().await);
        let vectors = service.embed_many(&["q".to_string()]).await.unwrap();
        assert_eq!(vectors[0].len(), DEFAULT_DIMENSION);
    }

    #[test]
    fn scheme_whitelist_enforced_at_construction() {
        let mut config = test_config();
        config.backend = "openai_api".into();
        config.api_url = "file:///etc/passwd".into();
        assert!(create_backend(&config).is_err());
    }
}

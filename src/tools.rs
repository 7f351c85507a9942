//! The tool façade exposed to agents.
//!
//! Tools implement [`Tool`] and are registered in an explicit
//! [`ToolRegistry`] — a plain table from operation name to handler that the
//! transport layer consumes. Cross-cutting policy lives in the registry
//! dispatch: a per-operation token bucket and typed error rendering.
//!
//! Input caps are enforced before any side effect: an oversized query is
//! rejected without a single embedding call.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::cache::IngestCache;
use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::index::{hit_from_payload, VectorIndex};
use crate::memory::MemoryStore;
use crate::models::{MemoryEventKind, SearchHit, SnippetKind};
use crate::snippets;
use crate::status::StatusBoard;

/// Typed tool errors. The `kind` is stable API surface; the message is
/// replaced by a short safe text in production mode.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidInput(String),
    #[error("rate limit exceeded for this operation")]
    RateLimited,
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ToolError {
    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::InvalidInput(_) => "invalid_input",
            ToolError::RateLimited => "rate_limited",
            ToolError::NotFound(_) => "not_found",
            ToolError::Conflict(_) => "conflict",
            ToolError::Internal(_) => "internal",
        }
    }

    /// Error body shown to the caller. Production mode keeps the kind and
    /// a generic message; the full text stays in the log.
    pub fn render(&self, production: bool) -> Value {
        let message = if production {
            match self {
                ToolError::InvalidInput(_) => "invalid input".to_string(),
                ToolError::RateLimited => "rate limit exceeded".to_string(),
                ToolError::NotFound(_) => "not found".to_string(),
                ToolError::Conflict(_) => "operation already in progress".to_string(),
                ToolError::Internal(_) => "internal error".to_string(),
            }
        } else {
            self.to_string()
        };
        json!({ "error": { "kind": self.kind(), "message": message } })
    }
}

/// Everything the tools operate on, held by the root service object and
/// passed explicitly — no ambient globals.
pub struct AppServices {
    pub config: Config,
    pub embeddings: Arc<EmbeddingService>,
    /// Help-topic collection.
    pub topics: Arc<VectorIndex>,
    pub memory: Arc<MemoryStore>,
    pub cache: Arc<IngestCache>,
    pub status: Arc<StatusBoard>,
    /// Wakes the watcher for an immediate rescan (`trigger_reindex`).
    pub reindex: tokio::sync::Notify,
}

impl AppServices {
    pub async fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let embeddings = Arc::new(EmbeddingService::new(&config.embedding)?);
        let topics = Arc::new(VectorIndex::new(
            &config.qdrant.url,
            &config.qdrant.collection,
        ));
        let memory_index = Arc::new(VectorIndex::new(
            &config.qdrant.url,
            &config.qdrant.memory_collection(),
        ));
        let memory = Arc::new(MemoryStore::new(
            config.memory.clone(),
            embeddings.clone(),
            memory_index,
        ));
        let cache = Arc::new(IngestCache::open(&config.cache.path).await);
        let status = Arc::new(StatusBoard::new(&config.ingest.status_path));
        Ok(Arc::new(Self {
            config,
            embeddings,
            topics,
            memory,
            cache,
            status,
            reindex: tokio::sync::Notify::new(),
        }))
    }

    fn input_cap(&self) -> usize {
        self.config.tools.input_max_bytes
    }
}

/// One named operation. Implementations stay handler-shaped: typed params
/// in, JSON out, typed error.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// JSON Schema of the accepted arguments.
    fn parameters_schema(&self) -> Value;
    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError>;
}

type OpLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Ordered table of operations plus one token bucket per operation.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    limiters: HashMap<&'static str, OpLimiter>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: Vec::new(),
            limiters: HashMap::new(),
        }
    }

    /// The full façade: search, retrieval, status, and write operations.
    pub fn with_builtins(rate_limit_rpm: u32) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SemanticSearchTool), rate_limit_rpm);
        registry.register(Arc::new(KeywordSearchTool), rate_limit_rpm);
        registry.register(Arc::new(GetTopicTool), rate_limit_rpm);
        registry.register(Arc::new(GetFunctionInfoTool), rate_limit_rpm);
        registry.register(Arc::new(ListTitlesTool), rate_limit_rpm);
        registry.register(Arc::new(IndexStatusTool), rate_limit_rpm);
        registry.register(Arc::new(SaveSnippetTool), rate_limit_rpm);
        registry.register(Arc::new(TriggerReindexTool), rate_limit_rpm);
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>, rate_limit_rpm: u32) {
        let quota = Quota::per_minute(
            NonZeroU32::new(rate_limit_rpm).unwrap_or(NonZeroU32::new(60).expect("nonzero")),
        );
        self.limiters.insert(tool.name(), RateLimiter::direct(quota));
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Dispatch one call: rate limit, then execute.
    pub async fn dispatch(
        &self,
        name: &str,
        params: Value,
        services: &AppServices,
    ) -> Result<Value, ToolError> {
        let tool = self
            .find(name)
            .ok_or_else(|| ToolError::NotFound(format!("no tool named '{}'", name)))?;
        if let Some(limiter) = self.limiters.get(tool.name()) {
            if limiter.check().is_err() {
                return Err(ToolError::RateLimited);
            }
        }
        tool.execute(params, services).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Param helpers ───────────────────────────────────────────────────────

fn require_str<'v>(params: &'v Value, key: &str) -> Result<&'v str, ToolError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidInput(format!("'{}' is required", key)))
}

fn optional_str<'v>(params: &'v Value, key: &str) -> Option<&'v str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Byte-size cap, checked before any work happens.
fn check_size(value: &str, cap: usize, field: &str) -> Result<(), ToolError> {
    if value.len() > cap {
        return Err(ToolError::InvalidInput(format!(
            "'{}' exceeds the {} byte limit ({} bytes)",
            field,
            cap,
            value.len()
        )));
    }
    Ok(())
}

fn bounded_k(params: &Value, default: i64) -> Result<usize, ToolError> {
    let k = params.get("k").and_then(Value::as_i64).unwrap_or(default);
    if !(1..=50).contains(&k) {
        return Err(ToolError::InvalidInput(format!(
            "'k' must be between 1 and 50 (got {})",
            k
        )));
    }
    Ok(k as usize)
}

// ── semantic_search ─────────────────────────────────────────────────────

pub struct SemanticSearchTool;

#[async_trait]
impl Tool for SemanticSearchTool {
    fn name(&self) -> &'static str {
        "semantic_search"
    }

    fn description(&self) -> &'static str {
        "Search help topics by meaning. Returns ranked topics with title, path, and an excerpt."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language query or API identifier" },
                "k": { "type": "integer", "description": "Max results (1-50)", "default": 10 },
                "version": { "type": "string", "description": "Filter by help version tag" },
                "language": { "type": "string", "description": "Filter by language tag" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let query = require_str(&params, "query")?;
        check_size(query, services.input_cap(), "query")?;
        let k = bounded_k(&params, 10)?;

        // Placeholder-only or degraded backend: semantic ranking would be
        // noise, fall back to lexical and say so.
        if services.embeddings.backend_name() == "none" || services.embeddings.is_degraded() {
            let hits = services
                .topics
                .keyword_search(query, None, k)
                .await
                .map_err(|e| ToolError::Internal(e.to_string()))?;
            return Ok(json!({ "results": hits, "degraded": true, "mode": "keyword" }));
        }

        let vector = services
            .embeddings
            .embed_one(query)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        let filter = build_tag_filter(&params);
        let scored = services
            .topics
            .search(&vector, k, filter)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;
        let hits: Vec<SearchHit> = scored
            .iter()
            .map(|p| hit_from_payload(&p.payload, Some(p.score)))
            .collect();

        let _ = services
            .memory
            .record_event(
                MemoryEventKind::Exchange,
                json!({
                    "query": query,
                    "topic_path": hits.iter().map(|h| h.path.clone()).collect::<Vec<_>>().join(", "),
                }),
                "sessions",
            )
            .await;

        Ok(json!({ "results": hits, "degraded": false, "mode": "semantic" }))
    }
}

fn build_tag_filter(params: &Value) -> Option<Value> {
    let mut must = Vec::new();
    if let Some(version) = optional_str(params, "version") {
        must.push(json!({ "key": "version", "match": { "value": version } }));
    }
    if let Some(language) = optional_str(params, "language") {
        must.push(json!({ "key": "language", "match": { "value": language } }));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

// ── keyword_search ──────────────────────────────────────────────────────

pub struct KeywordSearchTool;

#[async_trait]
impl Tool for KeywordSearchTool {
    fn name(&self) -> &'static str {
        "keyword_search"
    }

    fn description(&self) -> &'static str {
        "Substring search over topic titles and bodies. Finds exact identifiers semantic search blurs."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Substring to look for" },
                "path_prefix": { "type": "string", "description": "Restrict to topic paths with this prefix" },
                "k": { "type": "integer", "description": "Max results (1-50)", "default": 15 }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let query = require_str(&params, "query")?;
        check_size(query, services.input_cap(), "query")?;
        let k = bounded_k(&params, 15)?;
        let prefix = optional_str(&params, "path_prefix");

        let mut hits = services
            .topics
            .keyword_search(query, prefix, k)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        // Saved snippets and standards live in the sibling memory
        // collection; lexical lookups cover both.
        if hits.len() < k && prefix.is_none() {
            if let Ok(memory_hits) = services.memory.keyword_search(query, k - hits.len()).await {
                hits.extend(memory_hits);
            }
        }
        Ok(json!({ "results": hits }))
    }
}

// ── get_topic ───────────────────────────────────────────────────────────

pub struct GetTopicTool;

#[async_trait]
impl Tool for GetTopicTool {
    fn name(&self) -> &'static str {
        "get_topic"
    }

    fn description(&self) -> &'static str {
        "Fetch the full Markdown text of one help topic by its path."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "topic_path": { "type": "string", "description": "Topic path as returned by search" }
            },
            "required": ["topic_path"]
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let topic_path = require_str(&params, "topic_path")?;
        check_size(topic_path, services.input_cap(), "topic_path")?;

        let payload = services
            .topics
            .topic_by_path(topic_path)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?
            .ok_or_else(|| ToolError::NotFound(format!("topic not found: {}", topic_path)))?;

        let _ = services
            .memory
            .record_event(
                MemoryEventKind::TopicView,
                json!({
                    "topic_path": topic_path,
                    "title": payload.get("title").and_then(Value::as_str).unwrap_or(""),
                }),
                "sessions",
            )
            .await;

        Ok(json!({
            "title": payload.get("title").cloned().unwrap_or(Value::Null),
            "text": payload.get("text").cloned().unwrap_or(Value::Null),
            "path": payload.get("path").cloned().unwrap_or(Value::Null),
            "version": payload.get("version").cloned().unwrap_or(Value::Null),
            "language": payload.get("language").cloned().unwrap_or(Value::Null),
        }))
    }
}

// ── get_function_info ───────────────────────────────────────────────────

pub struct GetFunctionInfoTool;

/// Ranking bands for identifier lookup, strongest first. Stable order is
/// preserved within a band.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
enum MatchBand {
    ExactTitle,
    TitleCaseInsensitive,
    Body,
    SemanticNeighbor,
}

#[async_trait]
impl Tool for GetFunctionInfoTool {
    fn name(&self) -> &'static str {
        "get_function_info"
    }

    fn description(&self) -> &'static str {
        "Look up an API identifier (function, method, object). Returns the matching topic, or candidates with a choose_index when ambiguous."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": { "type": "string", "description": "Function, method, or object name" }
            },
            "required": ["name"]
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let name = require_str(&params, "name")?;
        check_size(name, services.input_cap(), "name")?;

        let keyword_hits = services
            .topics
            .keyword_search(name, None, 10)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        let semantic_hits: Vec<SearchHit> = if services.embeddings.backend_name() != "none"
            && !services.embeddings.is_degraded()
        {
            match services.embeddings.embed_one(name).await {
                Ok(vector) => services
                    .topics
                    .search(&vector, 5, None)
                    .await
                    .map(|scored| {
                        scored
                            .iter()
                            .map(|p| hit_from_payload(&p.payload, Some(p.score)))
                            .collect()
                    })
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            }
        } else {
            Vec::new()
        };

        // Band assignment; keyword hits first, then semantic neighbors.
        let name_lower = name.to_lowercase();
        let mut candidates: Vec<(MatchBand, SearchHit)> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for hit in keyword_hits {
            if !seen.insert(hit.path.clone()) {
                continue;
            }
            let band = if hit.title == name {
                MatchBand::ExactTitle
            } else if hit.title.to_lowercase() == name_lower {
                MatchBand::TitleCaseInsensitive
            } else {
                MatchBand::Body
            };
            candidates.push((band, hit));
        }
        for hit in semantic_hits {
            if seen.insert(hit.path.clone()) {
                candidates.push((MatchBand::SemanticNeighbor, hit));
            }
        }
        // Stable within bands.
        candidates.sort_by_key(|(band, _)| *band);

        if candidates.is_empty() {
            return Err(ToolError::NotFound(format!(
                "no topic found for '{}'; try semantic_search first",
                name
            )));
        }

        let top_band = candidates[0].0;
        let top_count = candidates.iter().filter(|(b, _)| *b == top_band).count();

        if top_count == 1 || top_band == MatchBand::ExactTitle {
            let path = candidates[0].1.path.clone();
            let payload = services
                .topics
                .topic_by_path(&path)
                .await
                .map_err(|e| ToolError::Internal(e.to_string()))?;
            if let Some(payload) = payload {
                return Ok(json!({
                    "title": payload.get("title").cloned().unwrap_or(Value::Null),
                    "text": payload.get("text").cloned().unwrap_or(Value::Null),
                    "path": path,
                }));
            }
        }

        let listed: Vec<Value> = candidates
            .iter()
            .enumerate()
            .map(|(i, (_, hit))| {
                json!({
                    "choose_index": i,
                    "title": hit.title,
                    "path": hit.path,
                    "snippet": hit.snippet,
                })
            })
            .collect();
        Ok(json!({
            "candidates": listed,
            "hint": "multiple topics match; fetch one with get_topic using its path",
        }))
    }
}

// ── list_titles ─────────────────────────────────────────────────────────

pub struct ListTitlesTool;

#[async_trait]
impl Tool for ListTitlesTool {
    fn name(&self) -> &'static str {
        "list_titles"
    }

    fn description(&self) -> &'static str {
        "List indexed topic titles and paths, optionally under a path prefix."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path_prefix": { "type": "string", "description": "Only paths starting with this prefix" },
                "limit": { "type": "integer", "description": "Max titles", "default": 200 }
            }
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let prefix = optional_str(&params, "path_prefix");
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .unwrap_or(200)
            .clamp(1, 1000) as usize;

        let titles = services
            .topics
            .list_titles(prefix, limit)
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;
        let listed: Vec<Value> = titles
            .into_iter()
            .map(|(title, path)| json!({ "title": title, "path": path }))
            .collect();
        Ok(json!({ "titles": listed }))
    }
}

// ── index_status ────────────────────────────────────────────────────────

pub struct IndexStatusTool;

#[async_trait]
impl Tool for IndexStatusTool {
    fn name(&self) -> &'static str {
        "index_status"
    }

    fn description(&self) -> &'static str {
        "Report index size, known versions and languages, the active embedding backend, and live ingest progress."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let exists = services.topics.collection_exists().await.unwrap_or(false);
        let points = if exists {
            services.topics.points_count().await.unwrap_or(0)
        } else {
            0
        };
        let (versions, languages) = if exists {
            services.topics.sample_tags(500).await.unwrap_or_default()
        } else {
            (Vec::new(), Vec::new())
        };

        // The in-process board during a run; the status file otherwise
        // (split mode: the ingest process is a different one).
        let mut ingest = services.status.snapshot();
        if !ingest.is_running() {
            if let Some(from_file) =
                crate::status::StatusBoard::read_file(&services.config.ingest.status_path)
            {
                ingest = from_file;
            }
        }

        Ok(json!({
            "collection": services.topics.collection(),
            "exists": exists,
            "topics_indexed": points,
            "versions": versions,
            "languages": languages,
            "backend": services.embeddings.backend_name(),
            "degraded": services.embeddings.is_degraded(),
            "cached_archives": services.cache.indexed_count().await,
            "pending_memory": services.memory.pending_count(),
            "ingest": ingest,
        }))
    }
}

// ── save_snippet ────────────────────────────────────────────────────────

pub struct SaveSnippetTool;

#[async_trait]
impl Tool for SaveSnippetTool {
    fn name(&self) -> &'static str {
        "save_snippet"
    }

    fn description(&self) -> &'static str {
        "Save a code snippet with a title and description into community memory."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string", "description": "Short snippet title" },
                "code": { "type": "string", "description": "The code itself" },
                "description": { "type": "string", "description": "What the snippet does" }
            },
            "required": ["title", "code"]
        })
    }

    async fn execute(&self, params: Value, services: &AppServices) -> Result<Value, ToolError> {
        let title = require_str(&params, "title")?;
        let code = require_str(&params, "code")?;
        let description = optional_str(&params, "description").unwrap_or("");
        check_size(title, services.input_cap(), "title")?;
        check_size(code, services.input_cap(), "code")?;
        check_size(description, services.input_cap(), "description")?;

        let kind = snippets::classify(title, description, code);
        let domain = match kind {
            SnippetKind::Snippet => "snippets",
            SnippetKind::Reference => "community_help",
        };
        let deferred = !services.embeddings.is_available().await;

        services
            .memory
            .record_event(
                MemoryEventKind::SnippetSave,
                json!({
                    "title": title,
                    "description": description,
                    "code_snippet": code,
                    "kind": match kind {
                        SnippetKind::Snippet => "snippet",
                        SnippetKind::Reference => "reference",
                    },
                }),
                domain,
            )
            .await
            .map_err(|e| ToolError::Internal(e.to_string()))?;

        Ok(json!({
            "saved": true,
            "domain": domain,
            "deferred": deferred,
        }))
    }
}

// ── trigger_reindex ─────────────────────────────────────────────────────

pub struct TriggerReindexTool;

#[async_trait]
impl Tool for TriggerReindexTool {
    fn name(&self) -> &'static str {
        "trigger_reindex"
    }

    fn description(&self) -> &'static str {
        "Ask the watcher to rescan the source tree and ingest new or changed archives."
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _params: Value, services: &AppServices) -> Result<Value, ToolError> {
        if services.status.snapshot().is_running() {
            return Err(ToolError::Conflict("an ingest run is already active".into()));
        }
        services.reindex.notify_one();
        Ok(json!({ "enqueued": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn test_services() -> Arc<AppServices> {
        let mut config = Config::from_env();
        // Leaked on purpose: the services outlive this helper.
        let tmp = tempfile::tempdir().unwrap().into_path();
        config.embedding.backend = "none".into();
        config.memory.enabled = true;
        config.memory.base_path = tmp.join("memory");
        config.cache.path = tmp.join("cache.db");
        config.ingest.status_path = tmp.join("status.json");
        // Point at a closed port so store calls fail fast rather than hang.
        config.qdrant.url = "http://127.0.0.1:1".into();
        AppServices::from_config(config).await.unwrap()
    }

    #[tokio::test]
    async fn oversized_query_rejected_before_any_work() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(1000);

        let cap = services.config.tools.input_max_bytes;
        let query = "q".repeat(cap + 1);
        let err = registry
            .dispatch("semantic_search", json!({ "query": query }), &services)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");

        // Exactly at the cap passes validation (and then fails on the
        // unreachable store, which is an internal error, not invalid_input).
        let query = "q".repeat(cap);
        let err = registry
            .dispatch("semantic_search", json!({ "query": query }), &services)
            .await
            .unwrap_err();
        assert_ne!(err.kind(), "invalid_input");
    }

    #[tokio::test]
    async fn k_bounds_enforced() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(1000);
        for bad in [0, 51, -3] {
            let err = registry
                .dispatch(
                    "semantic_search",
                    json!({ "query": "q", "k": bad }),
                    &services,
                )
                .await
                .unwrap_err();
            assert_eq!(err.kind(), "invalid_input");
        }
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_burst() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(5);

        let mut kinds = Vec::new();
        for _ in 0..6 {
            let result = registry
                .dispatch(
                    "save_snippet",
                    json!({ "title": "T", "code": "Возврат Истина;" }),
                    &services,
                )
                .await;
            kinds.push(result.map_err(|e| e.kind().to_string()));
        }
        let rejected = kinds
            .iter()
            .filter(|r| r.as_ref().err().map(String::as_str) == Some("rate_limited"))
            .count();
        assert_eq!(rejected, 1, "exactly the sixth call is rejected: {:?}", kinds);
    }

    #[tokio::test]
    async fn save_snippet_defers_when_backend_unavailable() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(1000);

        let result = registry
            .dispatch(
                "save_snippet",
                json!({ "title": "T", "code": "C", "description": "d" }),
                &services,
            )
            .await
            .unwrap();
        assert_eq!(result["saved"], true);
        assert_eq!(result["deferred"], true);
        assert_eq!(services.memory.pending_count(), 1);
    }

    #[tokio::test]
    async fn unknown_tool_is_not_found() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(1000);
        let err = registry
            .dispatch("no_such_tool", json!({}), &services)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn trigger_reindex_conflicts_while_running() {
        let services = test_services().await;
        let registry = ToolRegistry::with_builtins(1000);

        services.status.begin_run("none", 1, 0);
        let err = registry
            .dispatch("trigger_reindex", json!({}), &services)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "conflict");

        services.status.finish_run(true);
        let ok = registry
            .dispatch("trigger_reindex", json!({}), &services)
            .await
            .unwrap();
        assert_eq!(ok["enqueued"], true);
    }

    #[test]
    fn production_mode_hides_detail() {
        let err = ToolError::Internal("secret path /srv/help leaked".into());
        let open = err.render(false);
        assert!(open["error"]["message"]
            .as_str()
            .unwrap()
            .contains("/srv/help"));
        let safe = err.render(true);
        assert_eq!(safe["error"]["message"], "internal error");
        assert_eq!(safe["error"]["kind"], "internal");
    }

    #[test]
    fn registry_lists_all_operations_in_order() {
        let registry = ToolRegistry::with_builtins(60);
        let names: Vec<&str> = registry.tools().iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec![
                "semantic_search",
                "keyword_search",
                "get_topic",
                "get_function_info",
                "list_titles",
                "index_status",
                "save_snippet",
                "trigger_reindex",
            ]
        );
    }
}

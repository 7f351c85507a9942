//! Three-tier memory: session events and community-contributed snippets.
//!
//! | Tier | Store | Guarantee |
//! |------|-------|-----------|
//! | short | in-process ring | last N events, lost on restart |
//! | medium | append-only JSONL journal | survives restarts, 7-day TTL |
//! | long | vector store (`*_memory` collection), domain-tagged | at most once |
//!
//! Every recorded event is written to the short and medium tiers
//! synchronously. The long tier is written only when the embedding backend
//! can produce a real vector; otherwise the event lands in the pending
//! queue (an atomically rewritten JSON file) and the watcher drains it once
//! the backend comes back. After a successful drain an event is in the long
//! tier or in the queue, never both and never neither: drained points reuse
//! the event's id, so a crashed drain re-upserts idempotently.

use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::embedding::EmbeddingService;
use crate::index::{domain_filter, Point, VectorIndex};
use crate::models::{point_id_from_key, snippet_point_id, MemoryEventKind, SnippetItem};

const MEDIUM_FILE: &str = "session_memory.jsonl";
const PENDING_FILE: &str = "pending_memory.json";

/// One entry of the medium journal.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct JournalEntry {
    pub ts: i64,
    pub summary: String,
}

pub struct MemoryStore {
    config: MemoryConfig,
    embeddings: Arc<EmbeddingService>,
    /// Bound to the `{collection}_memory` sibling collection.
    index: Arc<VectorIndex>,
    short: Mutex<VecDeque<Value>>,
}

impl MemoryStore {
    pub fn new(
        config: MemoryConfig,
        embeddings: Arc<EmbeddingService>,
        index: Arc<VectorIndex>,
    ) -> Self {
        if config.enabled {
            if let Err(e) = std::fs::create_dir_all(&config.base_path) {
                tracing::warn!(
                    path = %config.base_path.display(),
                    error = %e,
                    "cannot create memory base path; journal writes will fail"
                );
            }
        }
        Self {
            config,
            embeddings,
            index,
            short: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn medium_path(&self) -> PathBuf {
        self.config.base_path.join(MEDIUM_FILE)
    }

    fn pending_path(&self) -> PathBuf {
        self.config.base_path.join(PENDING_FILE)
    }

    /// Record one event across the tiers. Always succeeds from the caller's
    /// view: long-tier trouble defers to the pending queue.
    pub async fn record_event(
        &self,
        kind: MemoryEventKind,
        payload: Value,
        domain: &str,
    ) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let ts = chrono::Utc::now().timestamp();
        let mut event = match payload {
            Value::Object(map) => Value::Object(map),
            other => json!({ "payload": other }),
        };
        event["type"] = json!(kind.as_str());
        event["ts"] = json!(ts);
        event["domain"] = json!(domain);

        self.push_short(event.clone());
        self.append_medium(ts, &format_medium_summary(&event));
        self.write_long_or_pending(event, ts).await;
        Ok(())
    }

    fn push_short(&self, event: Value) {
        if let Ok(mut short) = self.short.lock() {
            short.push_back(event);
            while short.len() > self.config.short_limit {
                short.pop_front();
            }
        }
    }

    /// Last N events, insertion order.
    pub fn short_events(&self) -> Vec<Value> {
        self.short
            .lock()
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn append_medium(&self, ts: i64, summary: &str) {
        let path = self.medium_path();
        let line = match serde_json::to_string(&JournalEntry {
            ts,
            summary: summary.to_string(),
        }) {
            Ok(line) => line,
            Err(_) => return,
        };
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut f| {
                use std::io::Write;
                writeln!(f, "{}", line)
            });
        if let Err(e) = appended {
            tracing::warn!(path = %path.display(), error = %e, "journal append failed");
            return;
        }
        self.trim_medium();
    }

    /// Compact out expired entries and enforce the entry cap. Runs on every
    /// append; the journal stays small by construction.
    fn trim_medium(&self) {
        let path = self.medium_path();
        let Ok(raw) = std::fs::read_to_string(&path) else {
            return;
        };
        let cutoff = chrono::Utc::now().timestamp() - self.config.medium_ttl_days as i64 * 86_400;
        let mut kept: Vec<String> = raw
            .lines()
            .filter(|line| {
                serde_json::from_str::<JournalEntry>(line)
                    .map(|e| e.ts > cutoff)
                    .unwrap_or(false)
            })
            .map(str::to_string)
            .collect();
        if kept.len() > self.config.medium_limit {
            kept.drain(..kept.len() - self.config.medium_limit);
        }
        let mut body = kept.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }
        if let Err(e) = std::fs::write(&path, body) {
            tracing::warn!(path = %path.display(), error = %e, "journal trim failed");
        }
    }

    /// Journal entries within the TTL window, oldest first.
    pub fn medium_entries(&self) -> Vec<JournalEntry> {
        let Ok(raw) = std::fs::read_to_string(self.medium_path()) else {
            return Vec::new();
        };
        let cutoff = chrono::Utc::now().timestamp() - self.config.medium_ttl_days as i64 * 86_400;
        let mut out: Vec<JournalEntry> = raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .filter(|e: &JournalEntry| e.ts > cutoff)
            .collect();
        if out.len() > self.config.medium_limit {
            out.drain(..out.len() - self.config.medium_limit);
        }
        out
    }

    async fn write_long_or_pending(&self, event: Value, ts: i64) {
        if !self.embeddings.is_available().await {
            self.append_pending(event, ts);
            return;
        }
        let summary = format_long_summary(&event);
        let id = Uuid::new_v4().to_string();
        match self.embeddings.embed_one_strict(&summary).await {
            Ok(vector) => {
                let mut payload = event.clone();
                payload["summary"] = json!(summary);
                let point = Point {
                    id: point_id_from_key(&id),
                    vector,
                    payload,
                };
                if let Err(e) = self.upsert_long(&[point]).await {
                    tracing::warn!(error = %e, "long-tier upsert failed; deferring event");
                    self.append_pending_with_id(event, ts, &id);
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "embedding unavailable; deferring event");
                self.append_pending(event, ts);
            }
        }
    }

    async fn upsert_long(&self, points: &[Point]) -> Result<()> {
        let dimension = points
            .first()
            .map(|p| p.vector.len())
            .unwrap_or(crate::embedding::DEFAULT_DIMENSION);
        self.index.ensure_collection(dimension).await?;
        self.index.upsert(points, crate::index::DEFAULT_UPSERT_CHUNK).await
    }

    fn append_pending(&self, payload: Value, ts: i64) {
        self.append_pending_entry(json!({
            "id": Uuid::new_v4().to_string(),
            "payload": payload,
            "created_at": ts,
        }));
    }

    fn append_pending_with_id(&self, payload: Value, ts: i64, id: &str) {
        self.append_pending_entry(json!({
            "id": id,
            "payload": payload,
            "created_at": ts,
        }));
    }

    fn append_pending_entry(&self, entry: Value) {
        let path = self.pending_path();
        let mut entries = read_pending(&path);
        entries.push(entry);
        if let Err(e) = crate::status::write_json_atomic(&path, &entries) {
            tracing::warn!(path = %path.display(), error = %e, "pending queue write failed");
        }
    }

    pub fn pending_count(&self) -> usize {
        read_pending(&self.pending_path()).len()
    }

    /// Drain the pending queue: embed and upsert each entry, removing the
    /// ones that made it. Idempotent — entries keep their ids, so re-entry
    /// after a crash upserts the same points again.
    pub async fn drain_pending(&self) -> Result<usize> {
        if !self.embeddings.is_available().await {
            return Ok(0);
        }
        let path = self.pending_path();
        let entries = read_pending(&path);
        if entries.is_empty() {
            return Ok(0);
        }

        let summaries: Vec<String> = entries
            .iter()
            .map(|e| format_long_summary(e.get("payload").unwrap_or(&Value::Null)))
            .collect();
        let vectors = match self.embeddings.embed_many_strict(&summaries).await {
            Ok(vectors) => vectors,
            Err(e) => {
                tracing::warn!(error = %e, "pending drain aborted; queue left intact");
                return Ok(0);
            }
        };

        let mut remaining = Vec::new();
        let mut processed = 0usize;
        for ((entry, summary), vector) in entries.iter().zip(&summaries).zip(vectors) {
            let id = entry
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            let mut payload = entry.get("payload").cloned().unwrap_or(Value::Null);
            if payload.is_object() {
                payload["summary"] = json!(summary);
            }
            let point = Point {
                id: point_id_from_key(&id),
                vector,
                payload,
            };
            match self.upsert_long(&[point]).await {
                Ok(()) => processed += 1,
                Err(e) => {
                    tracing::warn!(error = %e, "pending entry kept after failed upsert");
                    remaining.push(entry.clone());
                }
            }
        }

        crate::status::write_json_atomic(&path, &remaining)
            .context("cannot rewrite pending queue")?;
        Ok(processed)
    }

    /// Bulk upsert curated snippets/references into the long tier.
    /// Content-addressed ids make re-ingest an update, not a duplicate.
    pub async fn upsert_curated(
        &self,
        items: &[SnippetItem],
        domain: &str,
        kinds: Option<&[crate::models::SnippetKind]>,
    ) -> Result<usize> {
        if !self.embeddings.is_available().await {
            anyhow::bail!("embedding backend unavailable; cannot load curated items");
        }
        let mut valid: Vec<(String, Value, u64)> = Vec::new();
        for (i, item) in items.iter().enumerate() {
            if item.title.is_empty() && item.code.is_empty() {
                continue;
            }
            let summary = format!(
                "{} | {} | {}",
                item.title,
                item.description,
                crate::models::truncate_chars(&item.code, 300)
            );
            let kind = kinds
                .and_then(|k| k.get(i))
                .map(|k| match k {
                    crate::models::SnippetKind::Snippet => "snippet",
                    crate::models::SnippetKind::Reference => "reference",
                })
                .unwrap_or("snippet");
            let payload = json!({
                "title": item.title,
                "description": item.description,
                "code_snippet": item.code,
                "domain": domain,
                "kind": kind,
                "summary": summary,
            });
            let id = snippet_point_id(&item.title, &item.code);
            valid.push((summary, payload, id));
        }
        if valid.is_empty() {
            return Ok(0);
        }

        let summaries: Vec<String> = valid.iter().map(|(s, _, _)| s.clone()).collect();
        let vectors = self.embeddings.embed_many_strict(&summaries).await?;

        let points: Vec<Point> = valid
            .into_iter()
            .zip(vectors)
            .map(|((_, payload, id), vector)| Point {
                id,
                vector,
                payload,
            })
            .collect();
        let count = points.len();
        self.upsert_long(&points).await?;
        Ok(count)
    }

    /// Substring search over the long tier (titles, summaries, code).
    /// Lets lexical lookups find saved snippets without an embedding call.
    pub async fn keyword_search(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<crate::models::SearchHit>> {
        if !self.index.collection_exists().await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut offset = None;
        while out.len() < limit {
            let (points, next) = self.index.scroll(500, offset, None).await?;
            if points.is_empty() {
                break;
            }
            for payload in &points {
                if out.len() >= limit {
                    break;
                }
                let title = field(payload, "title");
                let code = field(payload, "code_snippet");
                let summary = field(payload, "summary");
                if title.to_lowercase().contains(&needle)
                    || code.to_lowercase().contains(&needle)
                    || summary.to_lowercase().contains(&needle)
                {
                    out.push(crate::models::SearchHit {
                        title: title.to_string(),
                        path: format!("memory/{}", field(payload, "domain")),
                        snippet: crate::models::truncate_chars(
                            if code.is_empty() { summary } else { code },
                            500,
                        ),
                        score: None,
                        version: String::new(),
                        language: String::new(),
                    });
                }
            }
            match next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    /// Semantic search over the long tier, optionally narrowed to a domain.
    pub async fn search_long(
        &self,
        query: &str,
        limit: usize,
        domain: Option<&str>,
    ) -> Result<Vec<(Value, f32)>> {
        if !self.index.collection_exists().await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let vector = self.embeddings.embed_one(query).await?;
        let filter = domain.map(domain_filter);
        let hits = self.index.search(&vector, limit, filter).await?;
        Ok(hits.into_iter().map(|h| (h.payload, h.score)).collect())
    }
}

fn read_pending(path: &std::path::Path) -> Vec<Value> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str::<Vec<Value>>(&raw).unwrap_or_default()
}

fn field<'v>(payload: &'v Value, key: &str) -> &'v str {
    payload.get(key).and_then(Value::as_str).unwrap_or("")
}

/// One-line journal summary of an event.
fn format_medium_summary(event: &Value) -> String {
    let ts = event.get("ts").and_then(Value::as_i64).unwrap_or(0);
    let query = field(event, "query");
    let topic = field(event, "topic_path");
    let mut desc = field(event, "description");
    if desc.is_empty() {
        desc = field(event, "response_snippet");
    }
    format!(
        "[{}] query: {}. topics: {}. detail: {}.",
        ts,
        query,
        topic,
        crate::models::truncate_chars(desc, 200)
    )
}

/// Text embedded for the long tier. Help lookups compress to title/query/
/// path; snippet saves compress to description plus leading code.
fn format_long_summary(payload: &Value) -> String {
    let title = field(payload, "title");
    let query = field(payload, "query");
    let topic = field(payload, "topic_path");
    if !title.is_empty() || !query.is_empty() || !topic.is_empty() {
        return format!("help: {} | {} | {}", title, query, topic);
    }
    if let Some(summary) = payload.get("summary").and_then(Value::as_str) {
        return summary.to_string();
    }
    let desc = field(payload, "description");
    let code = field(payload, "code_snippet");
    format!(
        "snippet: {} | {}",
        desc,
        crate::models::truncate_chars(code, 300)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;

    fn memory_config(dir: &std::path::Path) -> MemoryConfig {
        MemoryConfig {
            enabled: true,
            base_path: dir.to_path_buf(),
            short_limit: 3,
            medium_limit: 5,
            medium_ttl_days: 7,
        }
    }

    /// Backend `none` probes unavailable, so every event must defer.
    fn unavailable_store(dir: &std::path::Path) -> MemoryStore {
        let embedding = EmbeddingConfig {
            backend: "none".into(),
            model: String::new(),
            api_url: "http://localhost:1234/v1".into(),
            api_key: String::new(),
            dimension: None,
            batch_size: 8,
            workers: 1,
            force_batch: false,
            timeout_secs: 5,
            max_concurrent: 2,
            max_input_chars: 2000,
            max_retries: 1,
        };
        let service = Arc::new(EmbeddingService::new(&embedding).unwrap());
        let index = Arc::new(VectorIndex::new("http://localhost:1", "t_memory"));
        MemoryStore::new(memory_config(dir), service, index)
    }

    #[tokio::test]
    async fn short_ring_keeps_order_and_caps_length() {
        let tmp = tempfile::tempdir().unwrap();
        let store = unavailable_store(tmp.path());
        for i in 0..5 {
            store
                .record_event(
                    MemoryEventKind::TopicView,
                    json!({ "query": format!("q{}", i) }),
                    "sessions",
                )
                .await
                .unwrap();
        }
        let events = store.short_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["query"], "q2");
        assert_eq!(events[2]["query"], "q4");
    }

    #[tokio::test]
    async fn degraded_backend_defers_to_pending_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let store = unavailable_store(tmp.path());
        store
            .record_event(
                MemoryEventKind::SnippetSave,
                json!({ "title": "T", "code_snippet": "C" }),
                "snippets",
            )
            .await
            .unwrap();

        assert_eq!(store.pending_count(), 1);
        let raw = std::fs::read_to_string(tmp.path().join(PENDING_FILE)).unwrap();
        assert!(raw.contains("\"T\""));

        // Backend still down: drain is a no-op that keeps the queue.
        assert_eq!(store.drain_pending().await.unwrap(), 0);
        assert_eq!(store.pending_count(), 1);
    }

    #[tokio::test]
    async fn journal_appends_and_expires_by_ttl() {
        let tmp = tempfile::tempdir().unwrap();
        let store = unavailable_store(tmp.path());

        // Seed an expired line directly, then record a fresh event.
        let old = JournalEntry {
            ts: chrono::Utc::now().timestamp() - 30 * 86_400,
            summary: "ancient".into(),
        };
        std::fs::write(
            tmp.path().join(MEDIUM_FILE),
            format!("{}\n", serde_json::to_string(&old).unwrap()),
        )
        .unwrap();

        store
            .record_event(MemoryEventKind::Exchange, json!({ "query": "fresh" }), "sessions")
            .await
            .unwrap();

        let entries = store.medium_entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].summary.contains("fresh"));
    }

    #[tokio::test]
    async fn journal_respects_entry_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let store = unavailable_store(tmp.path());
        for i in 0..10 {
            store
                .record_event(
                    MemoryEventKind::Exchange,
                    json!({ "query": format!("q{}", i) }),
                    "sessions",
                )
                .await
                .unwrap();
        }
        let entries = store.medium_entries();
        assert_eq!(entries.len(), 5);
        assert!(entries.last().unwrap().summary.contains("q9"));
    }

    #[tokio::test]
    async fn disabled_memory_records_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = memory_config(tmp.path());
        config.enabled = false;
        let embedding = EmbeddingConfig {
            backend: "none".into(),
            model: String::new(),
            api_url: "http://localhost:1234/v1".into(),
            api_key: String::new(),
            dimension: None,
            batch_size: 8,
            workers: 1,
            force_batch: false,
            timeout_secs: 5,
            max_concurrent: 2,
            max_input_chars: 2000,
            max_retries: 1,
        };
        let service = Arc::new(EmbeddingService::new(&embedding).unwrap());
        let index = Arc::new(VectorIndex::new("http://localhost:1", "t_memory"));
        let store = MemoryStore::new(config, service, index);

        store
            .record_event(MemoryEventKind::TopicView, json!({"query": "q"}), "sessions")
            .await
            .unwrap();
        assert!(store.short_events().is_empty());
        assert_eq!(store.pending_count(), 0);
        assert!(store.medium_entries().is_empty());
    }

    #[test]
    fn long_summary_shapes() {
        let help = json!({ "title": "Format", "query": "date formatting", "topic_path": "a/b.md" });
        assert_eq!(
            format_long_summary(&help),
            "help: Format | date formatting | a/b.md"
        );

        let snippet = json!({ "description": "run a query", "code_snippet": "Query.Run()" });
        assert_eq!(
            format_long_summary(&snippet),
            "snippet: run a query | Query.Run()"
        );
    }
}

//! Vector store index writer and reader.
//!
//! Talks to Qdrant over its REST API. One [`VectorIndex`] instance is bound
//! to one collection; the help topics and the memory tier use sibling
//! collections against the same endpoint.
//!
//! Recreating a collection is the only destructive operation here and is
//! reached exclusively from first-ingest and explicit `--recreate` paths.

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::models::SearchHit;

/// Points per upsert request; large ingests stream through in chunks so no
/// single call blocks the store for long.
pub const DEFAULT_UPSERT_CHUNK: usize = 500;

/// One `(id, vector, payload)` point bound for the store.
#[derive(Debug, Clone, Serialize)]
pub struct Point {
    pub id: u64,
    pub vector: Vec<f32>,
    pub payload: Value,
}

/// A search result with its similarity score and payload.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub score: f32,
    pub payload: Value,
}

pub struct VectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
}

impl VectorIndex {
    pub fn new(base_url: &str, collection: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, self.collection, suffix)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("vector store {} failed: HTTP {}: {}", what, status, body);
        }
        response
            .json::<Value>()
            .await
            .with_context(|| format!("vector store {} returned invalid JSON", what))
    }

    pub async fn collection_exists(&self) -> Result<bool> {
        let response = self
            .client
            .get(self.url("/exists"))
            .send()
            .await
            .context("vector store unreachable")?;
        let body = Self::check(response, "exists check").await?;
        Ok(body
            .pointer("/result/exists")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    /// Vector dimension of the existing collection, if it exists.
    pub async fn collection_dimension(&self) -> Result<Option<usize>> {
        if !self.collection_exists().await? {
            return Ok(None);
        }
        let response = self.client.get(self.url("")).send().await?;
        let body = Self::check(response, "collection info").await?;
        Ok(body
            .pointer("/result/config/params/vectors/size")
            .and_then(Value::as_u64)
            .map(|v| v as usize))
    }

    pub async fn points_count(&self) -> Result<u64> {
        let response = self.client.get(self.url("")).send().await?;
        let body = Self::check(response, "collection info").await?;
        Ok(body
            .pointer("/result/points_count")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// Create the collection when missing; no-op when present.
    pub async fn ensure_collection(&self, dimension: usize) -> Result<()> {
        if self.collection_exists().await? {
            return Ok(());
        }
        self.create_collection(dimension).await
    }

    async fn create_collection(&self, dimension: usize) -> Result<()> {
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let response = self.client.put(self.url("")).json(&body).send().await?;
        Self::check(response, "collection create").await?;
        tracing::info!(
            collection = %self.collection,
            dimension,
            "created vector collection"
        );
        Ok(())
    }

    /// Drop and re-create the collection. Destructive; callers gate this
    /// behind first-ingest or `--recreate`.
    pub async fn recreate_collection(&self, dimension: usize) -> Result<()> {
        if self.collection_exists().await? {
            let response = self.client.delete(self.url("")).send().await?;
            Self::check(response, "collection delete").await?;
        }
        self.create_collection(dimension).await
    }

    /// Upsert points in bounded chunks, preserving order within the call.
    pub async fn upsert(&self, points: &[Point], chunk_size: usize) -> Result<()> {
        let chunk_size = chunk_size.max(1);
        for chunk in points.chunks(chunk_size) {
            let body = json!({ "points": chunk });
            let response = self
                .client
                .put(format!("{}?wait=true", self.url("/points")))
                .json(&body)
                .send()
                .await?;
            Self::check(response, "upsert").await?;
        }
        Ok(())
    }

    /// Vector similarity search, descending score.
    pub async fn search(
        &self,
        vector: &[f32],
        limit: usize,
        filter: Option<Value>,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": limit,
            "with_payload": true,
        });
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let response = self
            .client
            .post(self.url("/points/search"))
            .json(&body)
            .send()
            .await?;
        let body = Self::check(response, "search").await?;
        let hits = body
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("search response missing result array"))?;
        Ok(hits
            .iter()
            .map(|hit| ScoredPoint {
                score: hit.get("score").and_then(Value::as_f64).unwrap_or(0.0) as f32,
                payload: hit.get("payload").cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    /// One page of a payload scroll. Returns the payloads and the offset
    /// for the next page, when more data remains.
    pub async fn scroll(
        &self,
        limit: usize,
        offset: Option<Value>,
        filter: Option<Value>,
    ) -> Result<(Vec<Value>, Option<Value>)> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": false,
        });
        if let Some(offset) = offset {
            body["offset"] = offset;
        }
        if let Some(filter) = filter {
            body["filter"] = filter;
        }
        let response = self
            .client
            .post(self.url("/points/scroll"))
            .json(&body)
            .send()
            .await?;
        let body = Self::check(response, "scroll").await?;
        let points = body
            .pointer("/result/points")
            .and_then(Value::as_array)
            .map(|points| {
                points
                    .iter()
                    .map(|p| p.get("payload").cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .unwrap_or_default();
        let next = body
            .pointer("/result/next_page_offset")
            .filter(|v| !v.is_null())
            .cloned();
        Ok((points, next))
    }

    /// Create a collection snapshot; returns the snapshot name.
    pub async fn snapshot_create(&self) -> Result<String> {
        let response = self.client.post(self.url("/snapshots")).send().await?;
        let body = Self::check(response, "snapshot create").await?;
        body.pointer("/result/name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("snapshot response missing name"))
    }

    /// Restore the collection from a snapshot location (URL or server path).
    pub async fn snapshot_restore(&self, location: &str) -> Result<()> {
        let body = json!({ "location": location });
        let response = self
            .client
            .put(self.url("/snapshots/recover"))
            .json(&body)
            .send()
            .await?;
        Self::check(response, "snapshot restore").await?;
        Ok(())
    }

    // ── Retrieval built on scroll ────────────────────────────────────────

    /// Substring search over title and body, no embedding involved. Finds
    /// exact identifiers a semantic query would blur. Title hits rank above
    /// body hits; insertion order is otherwise preserved.
    pub async fn keyword_search(
        &self,
        query: &str,
        path_prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = path_prefix.map(|p| p.to_lowercase());

        let mut title_hits: Vec<SearchHit> = Vec::new();
        let mut body_hits: Vec<SearchHit> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut offset = None;

        loop {
            let (points, next) = self.scroll(500, offset, None).await?;
            if points.is_empty() {
                break;
            }
            for payload in &points {
                let path = payload_str(payload, "path");
                if path.is_empty() || !seen.insert(path.clone()) {
                    continue;
                }
                if let Some(ref prefix) = prefix {
                    if !path.to_lowercase().starts_with(prefix.as_str()) {
                        continue;
                    }
                }
                let title = payload_str(payload, "title");
                let text = payload_str(payload, "text");
                let in_title = title.to_lowercase().contains(&needle);
                let in_body = text.to_lowercase().contains(&needle);
                if !in_title && !in_body {
                    continue;
                }
                let hit = hit_from_payload(payload, None);
                if in_title {
                    title_hits.push(hit);
                } else {
                    body_hits.push(hit);
                }
            }
            if title_hits.len() >= limit {
                break;
            }
            match next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }

        title_hits.extend(body_hits);
        title_hits.truncate(limit);
        Ok(title_hits)
    }

    /// Paginated `(title, path)` listing with an optional path prefix.
    pub async fn list_titles(
        &self,
        path_prefix: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let prefix = path_prefix.map(|p| p.to_lowercase());
        let mut out = Vec::new();
        let mut offset = None;
        while out.len() < limit {
            let (points, next) = self.scroll(500, offset, None).await?;
            if points.is_empty() {
                break;
            }
            for payload in &points {
                if out.len() >= limit {
                    break;
                }
                let path = payload_str(payload, "path");
                if let Some(ref prefix) = prefix {
                    if !path.to_lowercase().starts_with(prefix.as_str()) {
                        continue;
                    }
                }
                out.push((payload_str(payload, "title"), path));
            }
            match next {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(out)
    }

    /// Full topic text by stored path. Tries the exact path and `.md` /
    /// `.html` variants via a payload filter, then falls back to a bounded
    /// suffix scan (covers version/language prefixes in the stored path).
    pub async fn topic_by_path(&self, topic_path: &str) -> Result<Option<Value>> {
        let topic_path = topic_path.trim_start_matches('/');
        let mut variants = vec![topic_path.to_string()];
        if !topic_path.ends_with(".md") && !topic_path.ends_with(".html") {
            variants.push(format!("{}.md", topic_path));
            variants.push(format!("{}.html", topic_path));
        }

        for variant in &variants {
            let filter = json!({
                "must": [{ "key": "path", "match": { "value": variant } }]
            });
            let (points, _) = self.scroll(1, None, Some(filter)).await?;
            if let Some(payload) = points.into_iter().next() {
                return Ok(Some(payload));
            }
        }

        // Suffix fallback over a bounded sample.
        let normalized = topic_path.replace('\\', "/");
        let (points, _) = self.scroll(200, None, None).await?;
        for payload in points {
            let path = payload_str(&payload, "path").replace('\\', "/");
            if path == normalized || path.ends_with(&format!("/{}", normalized)) {
                return Ok(Some(payload));
            }
        }
        Ok(None)
    }

    /// Distinct version and language tags, sampled from payloads.
    pub async fn sample_tags(&self, sample: usize) -> Result<(Vec<String>, Vec<String>)> {
        let mut versions = std::collections::BTreeSet::new();
        let mut languages = std::collections::BTreeSet::new();
        let (points, _) = self.scroll(sample, None, None).await?;
        for payload in points {
            let version = payload_str(&payload, "version");
            if !version.is_empty() {
                versions.insert(version);
            }
            let language = payload_str(&payload, "language");
            if !language.is_empty() {
                languages.insert(language);
            }
        }
        Ok((
            versions.into_iter().collect(),
            languages.into_iter().collect(),
        ))
    }
}

/// `must`-match filter on the `domain` payload field.
pub fn domain_filter(domain: &str) -> Value {
    json!({
        "must": [{ "key": "domain", "match": { "value": domain } }]
    })
}

fn payload_str(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

/// Build a [`SearchHit`] from a stored payload, bounding the excerpt.
pub fn hit_from_payload(payload: &Value, score: Option<f32>) -> SearchHit {
    let text = payload_str(payload, "text");
    SearchHit {
        title: payload_str(payload, "title"),
        path: payload_str(payload, "path"),
        snippet: crate::models::truncate_chars(&text, 500),
        score,
        version: payload_str(payload, "version"),
        language: payload_str(payload, "language"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_filter_shape() {
        let filter = domain_filter("snippets");
        assert_eq!(
            filter.pointer("/must/0/key").and_then(Value::as_str),
            Some("domain")
        );
        assert_eq!(
            filter.pointer("/must/0/match/value").and_then(Value::as_str),
            Some("snippets")
        );
    }

    #[test]
    fn hit_from_payload_bounds_snippet() {
        let payload = json!({
            "title": "Catalog",
            "path": "objects/catalog.md",
            "text": "x".repeat(2000),
            "version": "8.3",
            "language": "ru",
        });
        let hit = hit_from_payload(&payload, Some(0.7));
        assert_eq!(hit.title, "Catalog");
        assert_eq!(hit.snippet.chars().count(), 500);
        assert_eq!(hit.score, Some(0.7));
    }

    #[test]
    fn point_serializes_flat() {
        let point = Point {
            id: 42,
            vector: vec![0.5, -0.5],
            payload: json!({"title": "t"}),
        };
        let value = serde_json::to_value(&point).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["vector"][0], 0.5);
        assert_eq!(value["payload"]["title"], "t");
    }
}

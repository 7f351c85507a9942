//! Core data types flowing through the ingestion and retrieval pipeline.
//!
//! ```text
//! Archive ──extract──▶ Topic ──embed──▶ point (id, vector, payload)
//!                                            │
//!                                       search() ──▶ SearchHit
//! ```
//!
//! A [`Topic`] is the unit of indexed text: one converted document from one
//! archive. Its point id is a pure function of `(version, language, path)`
//! so re-ingesting the same source always lands on the same point.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// One archive discovered under a source root, tagged with the version label
/// (parent directory name) and the language parsed from its filename.
#[derive(Debug, Clone)]
pub struct ArchiveTask {
    pub path: PathBuf,
    pub version: String,
    pub language: String,
}

/// A unit of indexed text derived from one converted document.
#[derive(Debug, Clone)]
pub struct Topic {
    /// Stable point id: [`topic_point_id`] over `(version, language, path)`.
    pub id: u64,
    /// First heading of the document, else the filename stem.
    pub title: String,
    /// Markdown body, whitespace-normalized.
    pub body: String,
    /// Path relative to the archive's converted-docs root, `/`-separated.
    pub path: String,
    pub version: String,
    pub language: String,
}

/// Payload stored alongside each point in the vector store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicPayload {
    pub title: String,
    pub path: String,
    pub text: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub domain: String,
}

/// Body text cap in the stored payload. Embedding input is capped separately
/// (and far lower) by the dispatcher.
pub const MAX_PAYLOAD_TEXT_CHARS: usize = 50_000;

impl Topic {
    pub fn payload(&self) -> TopicPayload {
        TopicPayload {
            title: self.title.clone(),
            path: self.path.clone(),
            text: truncate_chars(&self.body, MAX_PAYLOAD_TEXT_CHARS),
            version: self.version.clone(),
            language: self.language.clone(),
            domain: "help".to_string(),
        }
    }
}

/// A ranked result from semantic or keyword search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub title: String,
    pub path: String,
    /// Leading excerpt of the stored text.
    pub snippet: String,
    /// Similarity score; `None` for keyword (scroll-based) matches.
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub language: String,
}

/// Kind of a recorded memory event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryEventKind {
    TopicView,
    SnippetSave,
    Exchange,
}

impl MemoryEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryEventKind::TopicView => "topic_view",
            MemoryEventKind::SnippetSave => "snippet_save",
            MemoryEventKind::Exchange => "exchange",
        }
    }
}

/// Classification of a curated item: executable code example vs prose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnippetKind {
    Snippet,
    Reference,
}

/// A curated code-plus-description record bound for the long memory tier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnippetItem {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "code_snippet")]
    pub code: String,
}

/// Stable point id for a topic key. First 14 hex digits of
/// `SHA-256("{version}|{language}|{path}")` parsed as u64 — 56 bits, so it
/// always fits the vector store's unsigned id space.
pub fn topic_point_id(version: &str, language: &str, path: &str) -> u64 {
    let key = format!("{}|{}|{}", version, language, path);
    derive_point_id(&key)
}

/// Content-addressed point id for a curated snippet: hash of title + code,
/// so re-ingesting the same snippet updates instead of duplicating.
pub fn snippet_point_id(title: &str, code: &str) -> u64 {
    let key = format!("{}\u{0}{}", title, code);
    derive_point_id(&key)
}

/// Generic stable point id from an arbitrary key string. Memory events use
/// this over their event uuid so a re-run drain upserts the same point.
pub fn point_id_from_key(key: &str) -> u64 {
    derive_point_id(key)
}

fn derive_point_id(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    // 7 bytes = 14 hex digits; big-endian to match the hex-prefix reading.
    let mut id: u64 = 0;
    for byte in &digest[..7] {
        id = (id << 8) | u64::from(*byte);
    }
    id
}

/// Truncate on a char boundary without splitting a code point.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_id_is_stable_and_key_sensitive() {
        let a = topic_point_id("8.3", "ru", "objects/catalog.md");
        let b = topic_point_id("8.3", "ru", "objects/catalog.md");
        assert_eq!(a, b);

        assert_ne!(a, topic_point_id("8.4", "ru", "objects/catalog.md"));
        assert_ne!(a, topic_point_id("8.3", "en", "objects/catalog.md"));
        assert_ne!(a, topic_point_id("8.3", "ru", "objects/other.md"));
    }

    #[test]
    fn point_id_fits_unsigned_63_bits() {
        for key in ["a", "b", "long/path/with/many/segments.md"] {
            let id = topic_point_id("v", "l", key);
            assert!(id < (1u64 << 56));
        }
    }

    #[test]
    fn snippet_id_content_addressed() {
        let a = snippet_point_id("Format dates", "Формат(Дата, \"ДФ=dd.MM.yyyy\")");
        let b = snippet_point_id("Format dates", "Формат(Дата, \"ДФ=dd.MM.yyyy\")");
        assert_eq!(a, b);
        assert_ne!(a, snippet_point_id("Format dates", "other code"));
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "приветмир";
        let t = truncate_chars(s, 6);
        assert_eq!(t, "привет");
    }
}

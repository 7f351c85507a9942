//! Environment-driven configuration.
//!
//! Every tunable comes from environment variables; unknown variables are
//! ignored. [`Config::from_env`] never fails on a missing optional value —
//! each section carries documented defaults — but [`Config::validate`]
//! rejects combinations that cannot work (unknown backend, non-HTTP
//! embedding endpoint, zero batch size).

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Hard ceiling on texts per embedding batch under `EMBEDDING_FORCE_BATCH`.
pub const MAX_EMBEDDING_BATCH_SIZE: usize = 256;
/// Hard ceiling on parallel embedding workers under `EMBEDDING_FORCE_BATCH`.
pub const MAX_EMBEDDING_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct Config {
    pub qdrant: QdrantConfig,
    pub sources: SourcesConfig,
    pub cache: CacheConfig,
    pub embedding: EmbeddingConfig,
    pub memory: MemoryConfig,
    pub ingest: IngestConfig,
    pub watcher: WatcherConfig,
    pub tools: ToolsConfig,
    pub mcp: McpConfig,
    /// `PRODUCTION=1` — error responses carry a stable kind and a short safe
    /// message; full error text goes to the log only.
    pub production: bool,
}

/// Vector store endpoint and collection naming.
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    /// Base URL of the Qdrant REST API (`QDRANT_URL`).
    pub url: String,
    /// Help-topic collection name (`QDRANT_COLLECTION`).
    pub collection: String,
}

impl QdrantConfig {
    /// Sibling collection holding memory events and curated snippets.
    pub fn memory_collection(&self) -> String {
        format!("{}_memory", self.collection)
    }
}

/// Help archive source tree and language filtering.
#[derive(Debug, Clone)]
pub struct SourcesConfig {
    /// Root directory whose immediate subdirectories are version labels
    /// (`HELP_SOURCE_BASE`, with `HELP_SOURCES_DIR` as a deprecated alias).
    pub base: Option<PathBuf>,
    /// Language whitelist from `HELP_LANGUAGES`; `None` means all languages.
    pub languages: Option<Vec<String>>,
    /// Scratch root for extraction (`HELP_INGEST_TEMP`).
    pub temp_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// SQLite file backing the ingest cache (`INGEST_CACHE_PATH`).
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Backend selector: `local`, `openai_api`, `deterministic`, or `none`.
    pub backend: String,
    /// Model identifier for local / API backends (`EMBEDDING_MODEL`).
    pub model: String,
    /// OpenAI-compatible endpoint base, e.g. `http://localhost:1234/v1`.
    pub api_url: String,
    /// Bearer token for the API backend; empty means no auth header.
    pub api_key: String,
    /// Fixed vector dimension (`EMBEDDING_DIMENSION`); `None` = probe.
    pub dimension: Option<usize>,
    /// Texts per API request (`EMBEDDING_BATCH_SIZE`).
    pub batch_size: usize,
    /// Parallel batch requests for the API backend (`EMBEDDING_WORKERS`).
    pub workers: usize,
    /// `EMBEDDING_FORCE_BATCH` — pin batch size and workers to the ceilings.
    pub force_batch: bool,
    /// Per-request timeout for single-item calls (`EMBEDDING_TIMEOUT`).
    pub timeout_secs: u64,
    /// Global concurrency semaphore size (`EMBEDDING_MAX_CONCURRENT`).
    pub max_concurrent: usize,
    /// Character cap applied to every input before embedding.
    pub max_input_chars: usize,
    /// Retry attempts for transient API failures.
    pub max_retries: u32,
}

impl EmbeddingConfig {
    /// Batch size after applying the force-batch override and ceiling.
    pub fn effective_batch_size(&self) -> usize {
        if self.force_batch {
            MAX_EMBEDDING_BATCH_SIZE
        } else {
            self.batch_size.clamp(1, MAX_EMBEDDING_BATCH_SIZE)
        }
    }

    /// Worker count after applying the force-batch override and ceiling.
    pub fn effective_workers(&self) -> usize {
        if self.force_batch {
            MAX_EMBEDDING_WORKERS
        } else {
            self.workers.clamp(1, MAX_EMBEDDING_WORKERS)
        }
    }

    pub fn single_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(5))
    }

    /// Batch timeout grows with batch length: `max(T_single, 30 + len/10)`.
    pub fn batch_timeout(&self, batch_len: usize) -> Duration {
        let scaled = 30 + (batch_len as u64) / 10;
        Duration::from_secs(self.timeout_secs.max(5).max(scaled))
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// `MEMORY_ENABLED` — when off, event recording is a no-op.
    pub enabled: bool,
    /// Directory holding the journal and pending file (`MEMORY_BASE_PATH`).
    pub base_path: PathBuf,
    /// Short-tier ring capacity (`MEMORY_SHORT_LIMIT`).
    pub short_limit: usize,
    /// Medium-tier max entries kept after trim (`MEMORY_MEDIUM_LIMIT`).
    pub medium_limit: usize,
    /// Medium-tier TTL in days (`MEMORY_MEDIUM_TTL_DAYS`).
    pub medium_ttl_days: u64,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Parallel per-archive workers (`INGEST_WORKERS`).
    pub workers: usize,
    /// Points per vector-store upsert request.
    pub index_batch_size: usize,
    /// Append-only JSONL of failed archives (`INGEST_FAILED_LOG`).
    pub failed_log: PathBuf,
    /// Atomically rewritten ingest status snapshot (`INGEST_STATUS_PATH`).
    pub status_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Seconds between archive rescans (`WATCHDOG_POLL_INTERVAL`, min 60).
    pub poll_interval_secs: u64,
    /// Seconds between pending-memory drains (`WATCHDOG_PENDING_INTERVAL`, min 60).
    pub pending_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    /// Token-bucket refill rate per operation (`TOOL_RATE_LIMIT_RPM`).
    pub rate_limit_rpm: u32,
    /// Byte cap on query/code inputs (`TOOL_INPUT_MAX_BYTES`).
    pub input_max_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct McpConfig {
    /// `stdio` or `http` (`MCP_TRANSPORT`).
    pub transport: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

fn env_str(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_str(name).and_then(|v| v.parse::<T>().ok()) {
        Some(v) => v,
        None => default,
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env_str(name).map(|v| v.to_lowercase()).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Base directory for persistent state: `~/.helpdex`, or `./.helpdex` when
/// no home directory is available.
fn state_dir() -> PathBuf {
    match env_str("HOME") {
        Some(home) => PathBuf::from(home).join(".helpdex"),
        None => PathBuf::from(".helpdex"),
    }
}

/// Parse `HELP_LANGUAGES`: `"ru"` → `["ru"]`, `"ru,en"` → `["ru","en"]`,
/// empty or `"all"` → `None` (all languages).
pub fn parse_languages(raw: Option<&str>) -> Option<Vec<String>> {
    let raw = raw?.trim().to_lowercase();
    if raw.is_empty() || raw == "all" {
        return None;
    }
    let langs: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if langs.is_empty() {
        None
    } else {
        Some(langs)
    }
}

impl Config {
    pub fn from_env() -> Self {
        let state = state_dir();

        let source_base = env_str("HELP_SOURCE_BASE").or_else(|| {
            let legacy = env_str("HELP_SOURCES_DIR");
            if legacy.is_some() {
                tracing::warn!("HELP_SOURCES_DIR is deprecated; use HELP_SOURCE_BASE");
            }
            legacy
        });

        let temp_root = env_str("HELP_INGEST_TEMP")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("helpdex_ingest"));

        let memory_base = env_str("MEMORY_BASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| state.clone());

        Config {
            qdrant: QdrantConfig {
                url: env_str("QDRANT_URL")
                    .unwrap_or_else(|| "http://localhost:6333".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                collection: env_str("QDRANT_COLLECTION").unwrap_or_else(|| "helpdex".to_string()),
            },
            sources: SourcesConfig {
                base: source_base.map(PathBuf::from),
                languages: parse_languages(env_str("HELP_LANGUAGES").as_deref()),
                temp_root,
            },
            cache: CacheConfig {
                path: env_str("INGEST_CACHE_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state.join("ingest_cache.db")),
            },
            embedding: EmbeddingConfig {
                backend: env_str("EMBEDDING_BACKEND")
                    .map(|v| v.to_lowercase())
                    .unwrap_or_else(|| "none".to_string()),
                model: env_str("EMBEDDING_MODEL")
                    .unwrap_or_else(|| "all-MiniLM-L6-v2".to_string()),
                api_url: env_str("EMBEDDING_API_URL")
                    .unwrap_or_else(|| "http://localhost:1234/v1".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                api_key: env_str("EMBEDDING_API_KEY").unwrap_or_default(),
                dimension: env_str("EMBEDDING_DIMENSION").and_then(|v| v.parse().ok()),
                batch_size: env_parse("EMBEDDING_BATCH_SIZE", 64),
                workers: env_parse("EMBEDDING_WORKERS", 4),
                force_batch: env_flag("EMBEDDING_FORCE_BATCH"),
                timeout_secs: env_parse("EMBEDDING_TIMEOUT", 60),
                max_concurrent: env_parse("EMBEDDING_MAX_CONCURRENT", 8),
                max_input_chars: env_parse("EMBEDDING_MAX_INPUT_CHARS", 2000),
                max_retries: env_parse("EMBEDDING_MAX_RETRIES", 3),
            },
            memory: MemoryConfig {
                enabled: env_flag("MEMORY_ENABLED"),
                base_path: memory_base,
                short_limit: env_parse("MEMORY_SHORT_LIMIT", 50),
                medium_limit: env_parse("MEMORY_MEDIUM_LIMIT", 500),
                medium_ttl_days: env_parse("MEMORY_MEDIUM_TTL_DAYS", 7),
            },
            ingest: IngestConfig {
                workers: env_parse("INGEST_WORKERS", 4),
                index_batch_size: env_parse("INGEST_INDEX_BATCH_SIZE", 500),
                failed_log: env_str("INGEST_FAILED_LOG")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state.join("ingest_failed.jsonl")),
                status_path: env_str("INGEST_STATUS_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| state.join("ingest_status.json")),
            },
            watcher: WatcherConfig {
                poll_interval_secs: env_parse::<u64>("WATCHDOG_POLL_INTERVAL", 600).max(60),
                pending_interval_secs: env_parse::<u64>("WATCHDOG_PENDING_INTERVAL", 600).max(60),
            },
            tools: ToolsConfig {
                rate_limit_rpm: env_parse("TOOL_RATE_LIMIT_RPM", 120),
                input_max_bytes: env_parse("TOOL_INPUT_MAX_BYTES", 64 * 1024),
            },
            mcp: McpConfig {
                transport: env_str("MCP_TRANSPORT").unwrap_or_else(|| "stdio".to_string()),
                host: env_str("MCP_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: env_parse("MCP_PORT", 5050),
                path: env_str("MCP_PATH").unwrap_or_else(|| "/mcp".to_string()),
            },
            production: env_flag("PRODUCTION"),
        }
    }

    /// Reject configurations that cannot work. Called once at startup by
    /// commands that need the affected section.
    pub fn validate(&self) -> Result<()> {
        match self.embedding.backend.as_str() {
            "local" | "openai_api" | "deterministic" | "none" => {}
            other => bail!(
                "Unknown embedding backend: '{}'. Must be local, openai_api, deterministic, or none.",
                other
            ),
        }

        if self.embedding.backend == "openai_api" {
            let url = &self.embedding.api_url;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                bail!(
                    "EMBEDDING_API_URL must use http:// or https:// (got '{}')",
                    url
                );
            }
        }

        if self.embedding.batch_size == 0 {
            bail!("EMBEDDING_BATCH_SIZE must be > 0");
        }
        if let Some(0) = self.embedding.dimension {
            bail!("EMBEDDING_DIMENSION must be > 0 when set");
        }
        if self.ingest.workers == 0 {
            bail!("INGEST_WORKERS must be > 0");
        }
        if self.tools.input_max_bytes == 0 {
            bail!("TOOL_INPUT_MAX_BYTES must be > 0");
        }

        match self.mcp.transport.as_str() {
            "stdio" | "http" => {}
            other => bail!("Unknown MCP transport: '{}'. Use stdio or http.", other),
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedding_defaults() -> EmbeddingConfig {
        EmbeddingConfig {
            backend: "openai_api".into(),
            model: String::new(),
            api_url: "http://localhost:1234/v1".into(),
            api_key: String::new(),
            dimension: None,
            batch_size: 64,
            workers: 4,
            force_batch: false,
            timeout_secs: 60,
            max_concurrent: 8,
            max_input_chars: 2000,
            max_retries: 3,
        }
    }

    #[test]
    fn languages_empty_and_all_mean_no_filter() {
        assert_eq!(parse_languages(None), None);
        assert_eq!(parse_languages(Some("")), None);
        assert_eq!(parse_languages(Some("all")), None);
        assert_eq!(parse_languages(Some("  ALL ")), None);
    }

    #[test]
    fn languages_split_and_lowercase() {
        assert_eq!(parse_languages(Some("ru")), Some(vec!["ru".to_string()]));
        assert_eq!(
            parse_languages(Some("RU, en")),
            Some(vec!["ru".to_string(), "en".to_string()])
        );
    }

    #[test]
    fn force_batch_pins_ceilings() {
        let mut cfg = embedding_defaults();
        cfg.force_batch = true;
        assert_eq!(cfg.effective_batch_size(), MAX_EMBEDDING_BATCH_SIZE);
        assert_eq!(cfg.effective_workers(), MAX_EMBEDDING_WORKERS);

        cfg.force_batch = false;
        cfg.batch_size = 1000;
        cfg.workers = 64;
        assert_eq!(cfg.effective_batch_size(), MAX_EMBEDDING_BATCH_SIZE);
        assert_eq!(cfg.effective_workers(), MAX_EMBEDDING_WORKERS);
    }

    #[test]
    fn batch_timeout_scales_with_len() {
        let cfg = embedding_defaults();
        // 30 + 64/10 = 36 < 60, so the single-call timeout dominates
        assert_eq!(cfg.batch_timeout(64), Duration::from_secs(60));
        // 30 + 1000/10 = 130 > 60
        assert_eq!(cfg.batch_timeout(1000), Duration::from_secs(130));
    }

    #[test]
    fn validate_rejects_bad_scheme() {
        let mut cfg = Config::from_env();
        cfg.embedding.backend = "openai_api".into();
        cfg.embedding.api_url = "ftp://models.example".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_unknown_backend() {
        let mut cfg = Config::from_env();
        cfg.embedding.backend = "cloud".into();
        assert!(cfg.validate().is_err());
    }
}

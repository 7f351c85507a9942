//! # Helpdex
//!
//! **Vendor help-archive ingestion, embedding, and MCP retrieval for AI tools.**
//!
//! Helpdex ingests vendor help bundles (`.hbk`), converts them to normalized
//! Markdown topics, indexes them in an external vector store, and exposes
//! precise lookup tools to AI agents over MCP (stdio and streamable HTTP).
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐   ┌────────────────┐   ┌──────────┐
//! │ .hbk tree │──▶│    Pipeline     │──▶│  Qdrant   │
//! │ (watcher) │   │ extract→md→embed│   │ topics +  │
//! └───────────┘   └────────────────┘   │  memory   │
//!                                      └────┬─────┘
//!                      ┌──────────────────┬─┘
//!                      ▼                  ▼
//!                 ┌──────────┐      ┌──────────┐
//!                 │   CLI    │      │   MCP    │
//!                 │(helpdex) │      │stdio/http│
//!                 └──────────┘      └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. The **watcher** ([`watcher`]) rescans the source tree and hands new or
//!    changed archives to the orchestrator.
//! 2. The **orchestrator** ([`ingest`]) consults the content-hash
//!    **cache** ([`cache`]) and drives the **pipeline** ([`pipeline`]) for
//!    archives not yet indexed.
//! 3. Topics stream through the **embedding dispatcher** ([`embedding`]) —
//!    batched, rate-limited, retried — into the **index writer**
//!    ([`index`]).
//! 4. The **tool façade** ([`tools`]) serves searches and snippet saves;
//!    the **memory subsystem** ([`memory`]) records events across its
//!    three tiers with a pending queue for degraded periods.
//! 5. The **MCP bridge** ([`mcp`]) exposes the façade over stdio and
//!    streamable HTTP with identical schemas.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Environment-variable configuration with validation |
//! | [`models`] | Core types: `Topic`, `SearchHit`, point-id derivation |
//! | [`archive`] | Archive discovery, language tags, unpack fallback chain |
//! | [`html2md`] | Pure HTML → Markdown conversion |
//! | [`pipeline`] | Archive → topics (extract, classify, convert) |
//! | [`cache`] | Content-hash ingest cache (SQLite) |
//! | [`embedding`] | Backend trait + dispatcher (batch, retry, semaphore) |
//! | [`index`] | Vector store writer/reader (Qdrant REST) |
//! | [`ingest`] | Ingest orchestration with bounded concurrency |
//! | [`status`] | Shared ingest status record + atomic status file |
//! | [`memory`] | Three-tier memory with pending-writes queue |
//! | [`snippets`] | Curated snippet loaders and the snippet classifier |
//! | [`tools`] | Tool façade: registry, rate limits, typed errors |
//! | [`mcp`] | MCP bridge and transports |
//! | [`watcher`] | Rescan + pending-drain loop |

pub mod archive;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod html2md;
pub mod index;
pub mod ingest;
pub mod mcp;
pub mod memory;
pub mod models;
pub mod pipeline;
pub mod snippets;
pub mod status;
pub mod tools;
pub mod watcher;

pub use config::Config;
pub use models::{SearchHit, SnippetItem, Topic};
pub use tools::{AppServices, Tool, ToolRegistry};

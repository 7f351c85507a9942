//! # Helpdex CLI
//!
//! The `helpdex` binary drives ingestion and serves the tool façade. All
//! tunables come from environment variables (see [`helpdex::config`]);
//! flags cover per-invocation choices only.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `helpdex ingest` | Ingest help archives: unpack, convert, embed, index |
//! | `helpdex unpack <archive> -o <dir>` | Extract one archive, nothing else |
//! | `helpdex status` | Show index contents and live ingest progress |
//! | `helpdex search "<query>"` | Search from the command line |
//! | `helpdex topic <path>` | Print one topic's Markdown |
//! | `helpdex load-snippets [path]` | Load curated snippets into memory |
//! | `helpdex load-standards [path]` | Load coding-standard docs into memory |
//! | `helpdex serve [--watch]` | Serve MCP (stdio or HTTP), optionally with the watcher |
//! | `helpdex watch` | Run the watcher alone (split mode) |

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use helpdex::config::{parse_languages, Config};
use helpdex::ingest::{run_ingest, IngestOptions};
use helpdex::mcp::{serve_http, serve_stdio, McpBridge};
use helpdex::models::SnippetKind;
use helpdex::tools::{AppServices, ToolRegistry};
use helpdex::{archive, snippets, status, watcher};

/// Helpdex — vendor help-archive ingestion and retrieval for AI tools.
#[derive(Parser)]
#[command(
    name = "helpdex",
    about = "Vendor help-archive ingestion, embedding, and MCP retrieval for AI tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest help archives from the configured source tree.
    ///
    /// Discovers `.hbk` archives under `HELP_SOURCE_BASE`, skips the ones
    /// whose content hash is already indexed, and pushes the rest through
    /// unpack → convert → embed → upsert.
    Ingest {
        /// Drop and rebuild the collection (required after a dimension or
        /// model change). Also forgets the ingest cache.
        #[arg(long)]
        recreate: bool,

        /// Ignore the ingest cache: re-extract and re-embed every archive.
        #[arg(long)]
        no_cache: bool,

        /// Report what would be processed without doing any work.
        #[arg(long)]
        dry_run: bool,

        /// Process only the first N archives.
        #[arg(long, short = 'n')]
        max_tasks: Option<usize>,

        /// Parallel archive workers (default: INGEST_WORKERS).
        #[arg(long, short = 'w')]
        workers: Option<usize>,

        /// Language filter, e.g. `ru` or `ru,en` (default: HELP_LANGUAGES).
        #[arg(long, short = 'l')]
        languages: Option<String>,
    },

    /// Extract one archive into a directory. No conversion, no indexing.
    Unpack {
        /// Path to the archive file.
        archive: PathBuf,

        /// Output directory.
        #[arg(long, short = 'o', default_value = "./unpacked")]
        output_dir: PathBuf,
    },

    /// Show index status: topic counts, versions, languages, backend,
    /// live ingest progress, pending memory.
    Status,

    /// Search indexed topics from the command line.
    Search {
        /// The query text.
        query: String,

        /// Substring match instead of semantic similarity.
        #[arg(long)]
        keyword: bool,

        /// Max results.
        #[arg(long, short = 'k', default_value_t = 10)]
        k: i64,
    },

    /// Print the full Markdown of one topic.
    Topic {
        /// Topic path as shown by search results.
        topic_path: String,
    },

    /// Load curated snippets (JSON, front-matter Markdown, raw code files)
    /// into the memory collection.
    LoadSnippets {
        /// Snippets file or directory (default: SNIPPETS_DIR).
        path: Option<PathBuf>,
    },

    /// Load coding-standard documents (Markdown folder) into the memory
    /// collection under the standards domain.
    LoadStandards {
        /// Standards directory (default: STANDARDS_DIR).
        path: Option<PathBuf>,
    },

    /// Serve the MCP tool façade (transport from MCP_TRANSPORT or flags).
    Serve {
        /// Transport: stdio or http.
        #[arg(long, short = 't')]
        transport: Option<String>,

        /// Also run the watcher in this process (single-process mode).
        #[arg(long)]
        watch: bool,
    },

    /// Run the watcher alone: rescan the source tree and drain pending
    /// memory on their configured intervals (split mode).
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("helpdex=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env();
    config.validate()?;

    match cli.command {
        Commands::Ingest {
            recreate,
            no_cache,
            dry_run,
            max_tasks,
            workers,
            languages,
        } => {
            if let Some(raw) = languages {
                config.sources.languages = parse_languages(Some(&raw));
            }
            let services = AppServices::from_config(config).await?;
            let options = IngestOptions {
                recreate,
                no_cache,
                dry_run,
                max_tasks,
                workers,
                only_paths: None,
            };
            let outcome = run_ingest(
                &services.config,
                services.embeddings.clone(),
                services.topics.clone(),
                &services.cache,
                services.status.clone(),
                &options,
            )
            .await?;
            if !dry_run {
                println!(
                    "Ingested {} topics from {} archive(s); {} skipped (cache), {} failed",
                    outcome.topics_indexed,
                    outcome.archives_done,
                    outcome.archives_skipped,
                    outcome.archives_failed
                );
            }
        }

        Commands::Unpack {
            archive: archive_path,
            output_dir,
        } => {
            archive::unpack_archive(&archive_path, &output_dir)?;
            println!("Unpacked to {}", output_dir.display());
        }

        Commands::Status => {
            let services = AppServices::from_config(config).await?;
            print_status(&services).await;
        }

        Commands::Search { query, keyword, k } => {
            let services = AppServices::from_config(config).await?;
            let registry = ToolRegistry::with_builtins(services.config.tools.rate_limit_rpm);
            let (tool, params) = if keyword {
                ("keyword_search", serde_json::json!({ "query": query, "k": k }))
            } else {
                ("semantic_search", serde_json::json!({ "query": query, "k": k }))
            };
            match registry.dispatch(tool, params, &services).await {
                Ok(result) => print_results(&result),
                Err(e) => bail!("{}", e),
            }
        }

        Commands::Topic { topic_path } => {
            let services = AppServices::from_config(config).await?;
            match services.topics.topic_by_path(&topic_path).await? {
                Some(payload) => {
                    println!(
                        "{}",
                        payload.get("text").and_then(|t| t.as_str()).unwrap_or("")
                    );
                }
                None => bail!("topic not found: {}", topic_path),
            }
        }

        Commands::LoadSnippets { path } => {
            let dir = path
                .or_else(|| std::env::var("SNIPPETS_DIR").ok().map(PathBuf::from))
                .filter(|p| !p.as_os_str().is_empty());
            let Some(dir) = dir else {
                bail!("no snippets source: pass a path or set SNIPPETS_DIR");
            };
            let items = if dir.is_file() {
                snippets::load_json_file(&dir)?
            } else if dir.is_dir() {
                snippets::collect_all(&dir)?
            } else {
                bail!("snippets path not found: {}", dir.display());
            };
            if items.is_empty() {
                println!("No snippets to load.");
                return Ok(());
            }
            let kinds = snippets::classify_items(&items);
            let services = AppServices::from_config(config).await?;

            // Split by classification so each record lands in its domain.
            let mut loaded = 0usize;
            for (kind, domain) in [
                (SnippetKind::Snippet, "snippets"),
                (SnippetKind::Reference, "community_help"),
            ] {
                let subset: Vec<_> = items
                    .iter()
                    .zip(&kinds)
                    .filter(|(_, k)| **k == kind)
                    .map(|(item, _)| item.clone())
                    .collect();
                if subset.is_empty() {
                    continue;
                }
                let subset_kinds: Vec<SnippetKind> = vec![kind; subset.len()];
                loaded += services
                    .memory
                    .upsert_curated(&subset, domain, Some(&subset_kinds))
                    .await?;
            }
            println!("Loaded {} of {} item(s) into memory", loaded, items.len());
        }

        Commands::LoadStandards { path } => {
            let dir = path
                .or_else(|| std::env::var("STANDARDS_DIR").ok().map(PathBuf::from))
                .filter(|p| !p.as_os_str().is_empty());
            let Some(dir) = dir else {
                bail!("no standards source: pass a path or set STANDARDS_DIR");
            };
            if !dir.is_dir() {
                bail!("standards path is not a directory: {}", dir.display());
            }
            let items = snippets::collect_standards(&dir);
            if items.is_empty() {
                println!("No standards documents in {}", dir.display());
                return Ok(());
            }
            let services = AppServices::from_config(config).await?;
            let loaded = services
                .memory
                .upsert_curated(&items, "standards", None)
                .await?;
            println!("Loaded {} standards document(s) into memory", loaded);
        }

        Commands::Serve { transport, watch } => {
            if let Some(t) = transport {
                config.mcp.transport = t;
            }
            config.validate()?;
            let services = AppServices::from_config(config).await?;
            let registry = Arc::new(ToolRegistry::with_builtins(
                services.config.tools.rate_limit_rpm,
            ));
            let bridge = McpBridge::new(services.clone(), registry);

            if watch {
                let watcher_services = services.clone();
                tokio::spawn(async move {
                    if let Err(e) = watcher::run_watcher(watcher_services).await {
                        tracing::error!(error = %e, "watcher exited");
                    }
                });
            }

            match services.config.mcp.transport.as_str() {
                "http" => {
                    let mcp = services.config.mcp.clone();
                    serve_http(bridge, &mcp.host, mcp.port, &mcp.path).await?;
                }
                _ => serve_stdio(bridge).await?,
            }
        }

        Commands::Watch => {
            let services = AppServices::from_config(config).await?;
            watcher::run_watcher(services).await?;
        }
    }

    Ok(())
}

/// Human-readable status output, mirroring what the `index_status` tool
/// reports.
async fn print_status(services: &Arc<AppServices>) {
    let exists = services.topics.collection_exists().await.unwrap_or(false);
    println!("Collection: {}", services.topics.collection());
    if exists {
        let points = services.topics.points_count().await.unwrap_or(0);
        println!("Topics indexed: {}", points);
        if let Ok((versions, languages)) = services.topics.sample_tags(500).await {
            if !versions.is_empty() {
                println!("Versions (sample): {}", versions.join(", "));
            }
            if !languages.is_empty() {
                println!("Languages (sample): {}", languages.join(", "));
            }
        }
    } else {
        println!("Index does not exist. Run: helpdex ingest");
    }
    println!("Embedding backend: {}", services.embeddings.backend_name());
    if services.embeddings.is_degraded() {
        println!("Embedding: DEGRADED (placeholder vectors in use)");
    }
    println!(
        "Cached archives: {}",
        services.cache.indexed_count().await
    );
    println!("Pending memory entries: {}", services.memory.pending_count());

    let ingest = match status::StatusBoard::read_file(&services.config.ingest.status_path) {
        Some(from_file) => from_file,
        None => services.status.snapshot(),
    };
    if ingest.status.is_empty() || ingest.status == "idle" {
        return;
    }
    println!("Ingest: {}", ingest.status);
    if ingest.is_running() {
        println!("  phase: {}", ingest.phase);
        if let Some(eta) = ingest.eta_sec {
            println!("  ETA: ~{} s", eta);
        }
    }
    if let Some(speed) = ingest.embedding_pts_per_sec {
        println!("  embedding speed: {} pts/sec", speed);
    }
    println!(
        "  archives: {} done, {} failed, {} skipped of {}",
        ingest.archives_done, ingest.archives_failed, ingest.archives_skipped, ingest.archives_total
    );
    for folder in &ingest.folders {
        println!(
            "  {}/{}  archives:{}  pts:{}  err:{}  {}",
            folder.version, folder.language, folder.archives, folder.points, folder.failed,
            folder.status
        );
    }
}

/// Numbered search-result listing.
fn print_results(result: &serde_json::Value) {
    let Some(hits) = result.get("results").and_then(|r| r.as_array()) else {
        println!("No results.");
        return;
    };
    if hits.is_empty() {
        println!("No results.");
        return;
    }
    if result.get("degraded").and_then(|d| d.as_bool()) == Some(true) {
        println!("(embedding degraded — keyword results)");
    }
    for (i, hit) in hits.iter().enumerate() {
        let title = hit.get("title").and_then(|v| v.as_str()).unwrap_or("");
        let path = hit.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let snippet = hit.get("snippet").and_then(|v| v.as_str()).unwrap_or("");
        match hit.get("score").and_then(|v| v.as_f64()) {
            Some(score) => println!("{}. [{:.3}] {} ({})", i + 1, score, title, path),
            None => println!("{}. {} ({})", i + 1, title, path),
        }
        let one_line = snippet.replace('\n', " ");
        let excerpt: String = one_line.chars().take(160).collect();
        println!("   {}", excerpt.trim());
    }
}

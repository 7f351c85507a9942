//! Ingest orchestration: discover → cache partition → extract → embed →
//! upsert → record.
//!
//! Archives run through a bounded-concurrency worker pool. A failing
//! archive is appended to the failure log and never marked indexed; the
//! run continues with the next archive. A changed embedding dimension
//! against the existing collection is the one fatal condition — it aborts
//! the run until the caller passes `--recreate`.

use anyhow::{bail, Context, Result};
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::archive;
use crate::cache::{IngestCache, STATUS_INDEXED};
use crate::config::Config;
use crate::embedding::EmbeddingService;
use crate::index::{Point, VectorIndex};
use crate::models::ArchiveTask;
use crate::pipeline;
use crate::status::{StatusBoard, PHASE_DISCOVER, PHASE_EMBED, PHASE_EXTRACT, PHASE_UPSERT};

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Drop and rebuild the collection (and forget the ingest cache).
    pub recreate: bool,
    /// Bypass cache lookups: re-extract and re-embed everything.
    pub no_cache: bool,
    /// Report what would be processed, then exit without side effects.
    pub dry_run: bool,
    /// Process only the first N archives.
    pub max_tasks: Option<usize>,
    /// Override `INGEST_WORKERS`.
    pub workers: Option<usize>,
    /// Restrict the run to these archive paths (watcher-targeted ingest).
    pub only_paths: Option<Vec<PathBuf>>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct IngestOutcome {
    pub topics_indexed: u64,
    pub archives_done: u64,
    pub archives_failed: u64,
    /// Cache hits skipped before extraction.
    pub archives_skipped: u64,
}

pub async fn run_ingest(
    config: &Config,
    embeddings: Arc<EmbeddingService>,
    index: Arc<VectorIndex>,
    cache: &IngestCache,
    status: Arc<StatusBoard>,
    options: &IngestOptions,
) -> Result<IngestOutcome> {
    let Some(base) = config.sources.base.as_ref() else {
        bail!("no source directories configured; set HELP_SOURCE_BASE");
    };
    if !base.is_dir() {
        bail!("HELP_SOURCE_BASE is not a directory: {}", base.display());
    }

    // Discovery.
    let roots = archive::discover_version_dirs(base);
    let mut tasks = archive::collect_archive_tasks(
        &roots,
        config.sources.languages.as_deref(),
    );
    if let Some(only) = options.only_paths.as_ref() {
        tasks.retain(|t| only.iter().any(|p| p == &t.path));
    }
    if let Some(max) = options.max_tasks {
        tasks.truncate(max);
    }
    if tasks.is_empty() {
        tracing::info!(base = %base.display(), "no archives to ingest");
        return Ok(IngestOutcome::default());
    }

    // Content hashes, then the cache partition.
    let mut work: Vec<(ArchiveTask, String)> = Vec::new();
    let mut skipped = 0u64;
    for task in tasks {
        let path = task.path.clone();
        let hash = tokio::task::spawn_blocking(move || archive::content_hash(&path))
            .await
            .context("hash task failed")??;
        let cached = if options.no_cache || options.recreate {
            None
        } else {
            cache.lookup(&hash).await
        };
        match cached {
            Some(record) if record.status == STATUS_INDEXED => {
                tracing::debug!(archive = %task.path.display(), "cache hit; skipping");
                skipped += 1;
            }
            _ => work.push((task, hash)),
        }
    }

    if options.dry_run {
        println!("ingest (dry-run)");
        println!("  archives found: {}", work.len() + skipped as usize);
        println!("  cached (would skip): {}", skipped);
        println!("  would process: {}", work.len());
        for (i, (task, _)) in work.iter().take(25).enumerate() {
            println!(
                "  {}. {}/{}  {}",
                i + 1,
                task.version,
                task.language,
                task.path.display()
            );
        }
        if work.len() > 25 {
            println!("  ... and {} more", work.len() - 25);
        }
        return Ok(IngestOutcome {
            archives_skipped: skipped,
            ..Default::default()
        });
    }

    // Collection setup. A dimension change against live data is fatal
    // without an explicit --recreate.
    let dimension = embeddings.dimension().await?;
    match index.collection_dimension().await? {
        Some(existing) if existing != dimension => {
            if options.recreate {
                index.recreate_collection(dimension).await?;
                cache.erase_all().await?;
            } else {
                bail!(
                    "embedding dimension mismatch: collection '{}' has {}, backend produces {}. \
                     Re-run with --recreate to rebuild the collection.",
                    index.collection(),
                    existing,
                    dimension
                );
            }
        }
        Some(_) if options.recreate => {
            index.recreate_collection(dimension).await?;
            cache.erase_all().await?;
        }
        Some(_) => {}
        None => index.ensure_collection(dimension).await?,
    }

    status.begin_run(
        embeddings.backend_name(),
        (work.len() + skipped as usize) as u64,
        skipped,
    );
    status.set_phase(PHASE_DISCOVER);
    tracing::info!(
        archives = work.len(),
        skipped,
        backend = embeddings.backend_name(),
        "ingest starting"
    );

    let workers = options.workers.unwrap_or(config.ingest.workers).max(1);

    let results: Vec<ArchiveResult> = stream::iter(work.into_iter())
        .map(|(task, hash)| {
            let embeddings = embeddings.clone();
            let index = index.clone();
            let status = status.clone();
            let config = config.clone();
            async move {
                let result =
                    process_archive(&config, &embeddings, &index, &status, &task).await;
                match result {
                    Ok(points) => {
                        status.set_degraded(embeddings.is_degraded());
                        status.archive_done(&task.version, &task.language, points.count, false);
                        ArchiveResult::Done {
                            task,
                            hash,
                            topic_count: points.count,
                            complete: points.complete,
                        }
                    }
                    Err(e) => {
                        status.archive_done(&task.version, &task.language, 0, true);
                        ArchiveResult::Failed {
                            task,
                            reason: format!("{:#}", e),
                            fatal: is_dimension_error(&e),
                        }
                    }
                }
            }
        })
        .buffer_unordered(workers)
        .collect()
        .await;

    let mut outcome = IngestOutcome {
        archives_skipped: skipped,
        ..Default::default()
    };
    let mut fatal: Option<String> = None;
    for result in results {
        match result {
            ArchiveResult::Done {
                task,
                hash,
                topic_count,
                complete,
            } => {
                outcome.archives_done += 1;
                outcome.topics_indexed += topic_count;
                if complete {
                    cache
                        .mark_indexed(
                            &hash,
                            topic_count as i64,
                            &task.version,
                            &task.language,
                            &task.path.display().to_string(),
                        )
                        .await?;
                } else {
                    tracing::warn!(
                        archive = %task.path.display(),
                        "partial conversion; archive left unmarked for re-ingest"
                    );
                }
            }
            ArchiveResult::Failed { task, reason, fatal: is_fatal } => {
                outcome.archives_failed += 1;
                append_failure(&config.ingest.failed_log, &task, &reason);
                tracing::warn!(
                    archive = %task.path.display(),
                    reason = %reason,
                    "archive ingest failed"
                );
                if is_fatal {
                    fatal = Some(reason);
                }
            }
        }
    }

    status.finish_run(fatal.is_none());
    if let Some(reason) = fatal {
        bail!("{}", reason);
    }
    tracing::info!(
        topics = outcome.topics_indexed,
        done = outcome.archives_done,
        failed = outcome.archives_failed,
        skipped = outcome.archives_skipped,
        "ingest finished"
    );
    Ok(outcome)
}

enum ArchiveResult {
    Done {
        task: ArchiveTask,
        hash: String,
        topic_count: u64,
        complete: bool,
    },
    Failed {
        task: ArchiveTask,
        reason: String,
        fatal: bool,
    },
}

struct ArchivePoints {
    count: u64,
    /// False when some candidate files failed to convert — the archive is
    /// then not marked indexed so the next run retries it.
    complete: bool,
}

fn is_dimension_error(e: &anyhow::Error) -> bool {
    e.to_string().contains("dimension")
}

/// One archive end to end: extract + convert, embed in dispatcher batches,
/// upsert in point chunks. Phase updates are best-effort — with several
/// workers the shared record reflects the most recent transition.
async fn process_archive(
    config: &Config,
    embeddings: &EmbeddingService,
    index: &VectorIndex,
    status: &StatusBoard,
    task: &ArchiveTask,
) -> Result<ArchivePoints> {
    status.set_phase(PHASE_EXTRACT);
    let temp_root = config.sources.temp_root.clone();
    let task_clone = task.clone();
    let output = tokio::task::spawn_blocking(move || {
        pipeline::build_topics(&task_clone, &temp_root)
    })
    .await
    .context("pipeline task failed")??;

    if output.topics.is_empty() {
        return Ok(ArchivePoints {
            count: 0,
            complete: output.file_errors == 0,
        });
    }

    status.set_phase(PHASE_EMBED);
    let texts: Vec<String> = output.topics.iter().map(|t| t.body.clone()).collect();
    let vectors = embeddings.embed_many(&texts).await?;

    let points: Vec<Point> = output
        .topics
        .iter()
        .zip(vectors)
        .map(|(topic, vector)| Point {
            id: topic.id,
            vector,
            payload: json!(topic.payload()),
        })
        .collect();

    status.set_phase(PHASE_UPSERT);
    index
        .upsert(&points, config.ingest.index_batch_size)
        .await
        .with_context(|| format!("upsert failed for {}", task.path.display()))?;

    Ok(ArchivePoints {
        count: points.len() as u64,
        complete: output.file_errors == 0,
    })
}

/// Append one failure record to the JSONL failure log.
fn append_failure(log_path: &Path, task: &ArchiveTask, reason: &str) {
    use std::io::Write;
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let record = json!({
        "path": task.path.display().to_string(),
        "version": task.version,
        "language": task.language,
        "reason": reason,
        "timestamp": chrono::Utc::now().timestamp(),
    });
    let appended = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .and_then(|mut f| writeln!(f, "{}", record));
    if let Err(e) = appended {
        tracing::warn!(path = %log_path.display(), error = %e, "failure log write failed");
    }
}

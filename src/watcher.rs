//! Source-tree watcher and pending-memory drain loop.
//!
//! Two independent cadences: archive rescans (new file or changed mtime →
//! targeted ingest of just the changed archives) and pending-memory drains.
//! A `trigger_reindex` tool call wakes the loop immediately for a full
//! scan. Ingest runs are awaited inline, so the watcher never overlaps two
//! runs in one process.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::archive;
use crate::ingest::{run_ingest, IngestOptions};
use crate::tools::AppServices;

pub async fn run_watcher(services: Arc<AppServices>) -> Result<()> {
    let Some(base) = services.config.sources.base.clone() else {
        anyhow::bail!("watcher needs HELP_SOURCE_BASE");
    };
    if !base.is_dir() {
        anyhow::bail!("HELP_SOURCE_BASE is not a directory: {}", base.display());
    }

    let poll_every = Duration::from_secs(services.config.watcher.poll_interval_secs);
    let drain_every = Duration::from_secs(services.config.watcher.pending_interval_secs);
    let mut poll = tokio::time::interval(poll_every);
    let mut drain = tokio::time::interval(drain_every);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    drain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        base = %base.display(),
        poll_secs = poll_every.as_secs(),
        drain_secs = drain_every.as_secs(),
        "watcher started"
    );

    let mut known: HashMap<PathBuf, i64> = HashMap::new();

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let current = scan_mtimes(&services);
                let changed: Vec<PathBuf> = current
                    .iter()
                    .filter(|(path, mtime)| known.get(*path) != Some(mtime))
                    .map(|(path, _)| path.clone())
                    .collect();
                known = current;
                if !changed.is_empty() {
                    tracing::info!(archives = changed.len(), "archive changes detected");
                    ingest_paths(&services, Some(changed)).await;
                }
            }
            _ = drain.tick() => {
                match services.memory.drain_pending().await {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(drained = n, "pending memory entries persisted"),
                    Err(e) => tracing::warn!(error = %e, "pending memory drain failed"),
                }
            }
            _ = services.reindex.notified() => {
                tracing::info!("reindex requested via tool call");
                ingest_paths(&services, None).await;
                known = scan_mtimes(&services);
            }
        }
    }
}

/// Current `path → mtime` map for every archive under the source base that
/// passes the language filter.
fn scan_mtimes(services: &AppServices) -> HashMap<PathBuf, i64> {
    let Some(base) = services.config.sources.base.as_ref() else {
        return HashMap::new();
    };
    let roots = archive::discover_version_dirs(base);
    let tasks = archive::collect_archive_tasks(&roots, services.config.sources.languages.as_deref());
    tasks
        .into_iter()
        .filter_map(|task| {
            let mtime = std::fs::metadata(&task.path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)?;
            Some((task.path, mtime))
        })
        .collect()
}

async fn ingest_paths(services: &Arc<AppServices>, only_paths: Option<Vec<PathBuf>>) {
    if services.status.snapshot().is_running() {
        tracing::debug!("ingest already running; skipping watcher trigger");
        return;
    }
    let options = IngestOptions {
        only_paths,
        ..Default::default()
    };
    let result = run_ingest(
        &services.config,
        services.embeddings.clone(),
        services.topics.clone(),
        &services.cache,
        services.status.clone(),
        &options,
    )
    .await;
    if let Err(e) = result {
        tracing::warn!(error = %e, "watcher-triggered ingest failed");
    }
}

//! Shared ingest status record.
//!
//! Single writer (the running ingest), many readers (the `index_status`
//! tool, the `status` CLI command, a second process in split mode). The
//! in-process view is a lock-protected snapshot; the on-disk view is a JSON
//! file rewritten by atomic rename. Both are best-effort: a failed file
//! write is logged and never blocks the pipeline.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Instant;

/// Current ingest phase, as shown to status readers.
pub const PHASE_DISCOVER: &str = "discover";
pub const PHASE_EXTRACT: &str = "extract";
pub const PHASE_EMBED: &str = "embed";
pub const PHASE_UPSERT: &str = "upsert";

/// Per-`(version, language)` folder counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FolderProgress {
    pub version: String,
    pub language: String,
    pub archives: u64,
    pub failed: u64,
    pub points: u64,
    pub status: String,
}

/// Snapshot of the current or last ingest run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestStatus {
    /// `idle`, `running`, `completed`, or `failed`.
    pub status: String,
    pub phase: String,
    /// Active embedding backend name (`none` and `deterministic` are
    /// reported distinctly).
    pub backend: String,
    pub degraded: bool,
    pub started_at: i64,
    pub finished_at: Option<i64>,
    pub archives_total: u64,
    pub archives_done: u64,
    pub archives_failed: u64,
    /// Cache hits: archives skipped without extraction.
    pub archives_skipped: u64,
    pub topics_indexed: u64,
    pub embedding_pts_per_sec: Option<f64>,
    pub eta_sec: Option<u64>,
    pub folders: Vec<FolderProgress>,
}

impl IngestStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Process-wide status board. Held by the root service object and handed to
/// the components that publish or read progress.
pub struct StatusBoard {
    inner: RwLock<IngestStatus>,
    path: PathBuf,
    run_started: RwLock<Option<Instant>>,
}

impl StatusBoard {
    pub fn new(path: &Path) -> Self {
        Self {
            inner: RwLock::new(IngestStatus {
                status: "idle".to_string(),
                ..Default::default()
            }),
            path: path.to_path_buf(),
            run_started: RwLock::new(None),
        }
    }

    /// Non-blocking read for status consumers.
    pub fn snapshot(&self) -> IngestStatus {
        self.inner
            .read()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn begin_run(&self, backend: &str, archives_total: u64, archives_skipped: u64) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = IngestStatus {
                status: "running".to_string(),
                phase: PHASE_DISCOVER.to_string(),
                backend: backend.to_string(),
                started_at: chrono::Utc::now().timestamp(),
                archives_total,
                archives_skipped,
                ..Default::default()
            };
        }
        if let Ok(mut started) = self.run_started.write() {
            *started = Some(Instant::now());
        }
        self.persist();
    }

    pub fn set_phase(&self, phase: &str) {
        if let Ok(mut guard) = self.inner.write() {
            guard.phase = phase.to_string();
        }
        self.persist();
    }

    /// Record one finished archive and refresh throughput/ETA.
    pub fn archive_done(&self, version: &str, language: &str, points: u64, failed: bool) {
        let elapsed = self
            .run_started
            .read()
            .ok()
            .and_then(|g| *g)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        if let Ok(mut guard) = self.inner.write() {
            guard.archives_done += 1;
            if failed {
                guard.archives_failed += 1;
            }
            guard.topics_indexed += points;

            let idx = match guard
                .folders
                .iter()
                .position(|f| f.version == version && f.language == language)
            {
                Some(idx) => idx,
                None => {
                    guard.folders.push(FolderProgress {
                        version: version.to_string(),
                        language: language.to_string(),
                        ..Default::default()
                    });
                    guard.folders.len() - 1
                }
            };
            let folder = &mut guard.folders[idx];
            folder.archives += 1;
            folder.points += points;
            if failed {
                folder.failed += 1;
                folder.status = "error".to_string();
            } else if folder.status.is_empty() {
                folder.status = "done".to_string();
            }

            if elapsed > 0.0 && guard.topics_indexed > 0 {
                guard.embedding_pts_per_sec =
                    Some((guard.topics_indexed as f64 / elapsed * 10.0).round() / 10.0);
            }
            let remaining = guard
                .archives_total
                .saturating_sub(guard.archives_done + guard.archives_skipped);
            if guard.archives_done > 0 && remaining > 0 && elapsed > 0.0 {
                let per_archive = elapsed / guard.archives_done as f64;
                guard.eta_sec = Some((per_archive * remaining as f64) as u64);
            } else {
                guard.eta_sec = None;
            }
        }
        self.persist();
    }

    pub fn set_degraded(&self, degraded: bool) {
        if let Ok(mut guard) = self.inner.write() {
            guard.degraded = degraded;
        }
    }

    pub fn finish_run(&self, ok: bool) {
        if let Ok(mut guard) = self.inner.write() {
            guard.status = if ok { "completed" } else { "failed" }.to_string();
            guard.phase.clear();
            guard.finished_at = Some(chrono::Utc::now().timestamp());
            guard.eta_sec = None;
        }
        self.persist();
    }

    /// Atomic-rename rewrite of the status file. Best effort by design.
    fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = write_json_atomic(&self.path, &snapshot) {
            tracing::warn!(path = %self.path.display(), error = %e, "status write failed");
        }
    }

    /// Read a status snapshot from disk (cross-process readers).
    pub fn read_file(path: &Path) -> Option<IngestStatus> {
        let raw = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&raw).ok()
    }
}

/// Write JSON to `path` via a temp file in the same directory plus rename,
/// so readers never observe a torn file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.flush()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lifecycle_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let board = StatusBoard::new(&tmp.path().join("status.json"));

        board.begin_run("deterministic", 3, 1);
        assert!(board.snapshot().is_running());
        assert_eq!(board.snapshot().archives_skipped, 1);

        board.set_phase(PHASE_EMBED);
        board.archive_done("8.3", "ru", 10, false);
        board.archive_done("8.3", "ru", 5, false);
        board.archive_done("8.3", "en", 0, true);

        let snapshot = board.snapshot();
        assert_eq!(snapshot.archives_done, 3);
        assert_eq!(snapshot.archives_failed, 1);
        assert_eq!(snapshot.topics_indexed, 15);
        assert_eq!(snapshot.folders.len(), 2);
        let ru = snapshot
            .folders
            .iter()
            .find(|f| f.language == "ru")
            .unwrap();
        assert_eq!(ru.points, 15);
        assert_eq!(ru.archives, 2);

        board.finish_run(true);
        let done = board.snapshot();
        assert_eq!(done.status, "completed");
        assert!(!done.is_running());
        assert!(done.finished_at.is_some());
    }

    #[test]
    fn status_file_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("status.json");
        let board = StatusBoard::new(&path);
        board.begin_run("none", 1, 0);
        board.archive_done("v1", "ru", 7, false);

        let from_disk = StatusBoard::read_file(&path).unwrap();
        assert_eq!(from_disk.status, "running");
        assert_eq!(from_disk.topics_indexed, 7);
        assert_eq!(from_disk.backend, "none");
    }

    #[test]
    fn atomic_write_replaces_previous_content() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("s.json");
        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"a": 2})).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"a\":2"));
    }
}

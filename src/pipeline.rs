//! Document pipeline: one archive in, a finite sequence of topics out.
//!
//! Extraction happens in a scratch directory under the configured temp root;
//! the scratch directory is removed on every exit path (drop-based cleanup).
//! Per-file conversion failures are counted but do not abort the archive —
//! topics that converted successfully are still emitted, and the caller
//! decides (via [`PipelineOutput::file_errors`]) whether the archive may be
//! marked indexed.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::archive;
use crate::html2md;
use crate::models::{topic_point_id, ArchiveTask, Topic};

/// Extensions treated as convertible help documents.
const CANDIDATE_EXTENSIONS: [&str; 5] = ["html", "htm", "xml", "xhtml", "st"];

/// Result of running one archive through the pipeline.
#[derive(Debug)]
pub struct PipelineOutput {
    pub topics: Vec<Topic>,
    /// Files that looked like candidates but failed to read or convert.
    pub file_errors: usize,
}

/// Extract, walk, classify, and convert one archive into topics.
///
/// Blocking (process spawning, file I/O, HTML parsing) — callers run it
/// inside `spawn_blocking`.
pub fn build_topics(task: &ArchiveTask, temp_root: &Path) -> Result<PipelineOutput> {
    std::fs::create_dir_all(temp_root)
        .with_context(|| format!("cannot create temp root {}", temp_root.display()))?;
    let scratch = TempDir::with_prefix_in("extract-", temp_root)
        .context("cannot create scratch directory")?;

    archive::unpack_archive(&task.path, scratch.path())?;

    let mut topics = Vec::new();
    let mut file_errors = 0usize;

    for entry in WalkDir::new(scratch.path())
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .flatten()
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let Some(kind) = classify(path) else {
            continue;
        };
        match convert_file(path, scratch.path(), kind, task) {
            Ok(Some(topic)) => topics.push(topic),
            Ok(None) => {}
            Err(e) => {
                file_errors += 1;
                tracing::warn!(
                    file = %path.display(),
                    error = %e,
                    "skipping unconvertible file"
                );
            }
        }
    }

    Ok(PipelineOutput {
        topics,
        file_errors,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Html,
    Markdown,
}

/// A file is a candidate when its extension is one of the known help
/// formats, it is already Markdown, or it has no extension but starts like
/// an HTML document.
fn classify(path: &Path) -> Option<FileKind> {
    match path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .as_deref()
    {
        Some("md") => Some(FileKind::Markdown),
        Some(ext) if CANDIDATE_EXTENSIONS.contains(&ext) => Some(FileKind::Html),
        Some(_) => None,
        None => {
            let prefix = read_prefix(path, 512)?;
            if html2md::looks_like_html_prefix(&prefix) {
                Some(FileKind::Html)
            } else {
                None
            }
        }
    }
}

fn read_prefix(path: &Path, max: usize) -> Option<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).ok()?;
    let mut buf = vec![0u8; max];
    let n = file.read(&mut buf).ok()?;
    buf.truncate(n);
    Some(String::from_utf8_lossy(&buf).into_owned())
}

fn convert_file(
    path: &Path,
    root: &Path,
    kind: FileKind,
    task: &ArchiveTask,
) -> Result<Option<Topic>> {
    let raw = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let text = String::from_utf8_lossy(&raw);

    let (body, title) = match kind {
        FileKind::Html => {
            let title = html2md::extract_title(&text);
            let body = html2md::html_to_markdown(&text);
            (body, title)
        }
        FileKind::Markdown => {
            let title = html2md::markdown_title(&text);
            (text.into_owned(), title)
        }
    };
    if body.trim().is_empty() {
        return Ok(None);
    }

    let rel = topic_rel_path(path, root);
    let title = title.unwrap_or_else(|| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| rel.clone())
    });

    Ok(Some(Topic {
        id: topic_point_id(&task.version, &task.language, &rel),
        title,
        body,
        path: rel,
        version: task.version.clone(),
        language: task.language.clone(),
    }))
}

/// Relative `/`-separated topic path with the converted extension (`.md`).
fn topic_rel_path(path: &Path, root: &Path) -> String {
    let rel: PathBuf = path.strip_prefix(root).unwrap_or(path).to_path_buf();
    let rel = rel.with_extension("md");
    rel.to_string_lossy().replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_archive(dir: &Path, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let archive = dir.join(name);
        let file = std::fs::File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (path, content) in files {
            writer.start_file(*path, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        archive
    }

    fn task(path: PathBuf) -> ArchiveTask {
        ArchiveTask {
            path,
            version: "8.3".into(),
            language: "ru".into(),
        }
    }

    #[test]
    fn archive_yields_topics_with_stable_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_archive(
            tmp.path(),
            "help_ru.hbk",
            &[
                (
                    "objects/catalog.html",
                    "<html><body><h1>Catalog manager</h1><p>Catalogs hold reference data.</p></body></html>",
                ),
                ("notes/readme.md", "# Notes\n\nPlain markdown body."),
                ("skip.bin", "\u{0}\u{1}binary"),
            ],
        );

        let out = build_topics(&task(archive.clone()), &tmp.path().join("scratch")).unwrap();
        assert_eq!(out.file_errors, 0);
        assert_eq!(out.topics.len(), 2);

        let catalog = out
            .topics
            .iter()
            .find(|t| t.path == "objects/catalog.md")
            .unwrap();
        assert_eq!(catalog.title, "Catalog manager");
        assert!(catalog.body.contains("# Catalog manager"));
        assert_eq!(catalog.version, "8.3");
        assert_eq!(catalog.language, "ru");

        // Same archive again: identical ids.
        let again = build_topics(&task(archive), &tmp.path().join("scratch")).unwrap();
        let catalog2 = again
            .topics
            .iter()
            .find(|t| t.path == "objects/catalog.md")
            .unwrap();
        assert_eq!(catalog.id, catalog2.id);
    }

    #[test]
    fn extensionless_html_detected_by_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_archive(
            tmp.path(),
            "ctx_ru.hbk",
            &[
                ("page", "<html><body><h2>Extensionless</h2><p>body</p></body></html>"),
                ("data", "not html at all"),
            ],
        );

        let out = build_topics(&task(archive), &tmp.path().join("scratch")).unwrap();
        assert_eq!(out.topics.len(), 1);
        assert_eq!(out.topics[0].title, "Extensionless");
        assert_eq!(out.topics[0].path, "page.md");
    }

    #[test]
    fn empty_documents_are_not_emitted() {
        let tmp = tempfile::tempdir().unwrap();
        let archive = make_archive(
            tmp.path(),
            "e_ru.hbk",
            &[("empty.html", "<html><body>   </body></html>")],
        );
        let out = build_topics(&task(archive), &tmp.path().join("scratch")).unwrap();
        assert!(out.topics.is_empty());
    }

    #[test]
    fn scratch_directory_removed_after_run() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch_root = tmp.path().join("scratch");
        let archive = make_archive(tmp.path(), "c_ru.hbk", &[("a.html", "<h1>A</h1>")]);
        build_topics(&task(archive), &scratch_root).unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&scratch_root).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unreadable_archive_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let bogus = tmp.path().join("bad_ru.hbk");
        std::fs::write(&bogus, b"not an archive").unwrap();
        assert!(build_topics(&task(bogus), &tmp.path().join("scratch")).is_err());
    }
}

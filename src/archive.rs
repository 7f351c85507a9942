//! Help-archive discovery and extraction.
//!
//! Discovery walks a source base directory whose immediate subdirectories
//! are version labels (`<base>/8.3.27/…/1cv8_ru.hbk`); the language tag is
//! encoded in the archive filename suffix (`*_ru.hbk` → `ru`). The language
//! filter applies here, before any extraction work.
//!
//! Extraction never mutates the source file and falls back across
//! strategies: the `7z` tool handles the vendor container in the common
//! case, the in-process `zip` reader covers plain ZIP payloads, and `unzip`
//! is the last resort on hosts without 7-Zip.

use anyhow::{bail, Context, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use walkdir::WalkDir;

use crate::models::ArchiveTask;

/// Archive filename extension handled by the pipeline.
pub const ARCHIVE_EXTENSION: &str = "hbk";

fn language_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)_([a-z]{2})\.hbk$").expect("static pattern"))
}

/// Language tag from an archive filename: `1cv8_ru.hbk` → `ru`.
/// Archives without a language suffix are not ingestable.
pub fn language_from_filename(name: &str) -> Option<String> {
    language_pattern()
        .captures(name)
        .map(|c| c[1].to_lowercase())
}

/// Enumerate `(version_dir, version_label)` pairs: every non-hidden
/// immediate subdirectory of the base is one version.
pub fn discover_version_dirs(base: &Path) -> Vec<(PathBuf, String)> {
    let mut out = Vec::new();
    let entries = match std::fs::read_dir(base) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(base = %base.display(), error = %e, "cannot read source base");
            return out;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !path.is_dir() {
            continue;
        }
        out.push((path, name));
    }
    out.sort_by(|a, b| a.1.cmp(&b.1));
    out
}

/// Recursively collect archives under each `(dir, version)` pair, applying
/// the language whitelist before any extraction happens.
pub fn collect_archive_tasks(
    roots: &[(PathBuf, String)],
    languages: Option<&[String]>,
) -> Vec<ArchiveTask> {
    let mut tasks = Vec::new();
    for (dir, version) in roots {
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !name.to_lowercase().ends_with(&format!(".{}", ARCHIVE_EXTENSION)) {
                continue;
            }
            let Some(lang) = language_from_filename(&name) else {
                continue;
            };
            if let Some(allowed) = languages {
                if !allowed.iter().any(|l| l == &lang) {
                    continue;
                }
            }
            tasks.push(ArchiveTask {
                path: entry.path().to_path_buf(),
                version: version.clone(),
                language: lang,
            });
        }
    }
    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    tasks
}

/// SHA-256 of the file bytes, hex-encoded. The ingest cache key.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)
        .with_context(|| format!("cannot open archive {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Extract an archive into `out_dir`, trying `7z`, then the in-process ZIP
/// reader, then `unzip`. The source file is only ever opened for reading.
pub fn unpack_archive(archive: &Path, out_dir: &Path) -> Result<()> {
    if !archive.is_file() {
        bail!("archive not found: {}", archive.display());
    }
    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("cannot create {}", out_dir.display()))?;

    let mut last_output = String::new();

    // 7z exits non-zero on warnings but may still have extracted everything.
    for args in [
        vec!["x".to_string(), archive.display().to_string()],
        vec!["x".to_string(), "-t*".to_string(), archive.display().to_string()],
    ] {
        match Command::new("7z")
            .args(&args)
            .arg(format!("-o{}", out_dir.display()))
            .arg("-y")
            .output()
        {
            Ok(output) => {
                if output.status.success() || dir_has_entries(out_dir) {
                    return Ok(());
                }
                last_output = String::from_utf8_lossy(&output.stderr).trim().to_string();
                if last_output.is_empty() {
                    last_output = String::from_utf8_lossy(&output.stdout).trim().to_string();
                }
            }
            Err(e) => {
                last_output = e.to_string();
            }
        }
    }

    if try_zip_crate(archive, out_dir).is_ok() && dir_has_entries(out_dir) {
        return Ok(());
    }

    if let Ok(output) = Command::new("unzip")
        .args(["-o", "-q"])
        .arg(archive)
        .arg("-d")
        .arg(out_dir)
        .output()
    {
        if output.status.success() {
            return Ok(());
        }
    }

    bail!(
        "all unpack methods failed for {} (tried 7z, zip, unzip): {}",
        archive.display(),
        last_output
    )
}

fn try_zip_crate(archive: &Path, out_dir: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(out_dir)?;
    Ok(())
}

fn dir_has_entries(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

//! Directory scanning for monitored paths.
//!
//! Walks a [`MonitoredPath`] recursively and returns every regular file
//! whose path relative to the root matches the path's glob pattern, with its
//! current size. Hidden files and common lock/temporary files are skipped.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::PathBuf;
use walkdir::WalkDir;

use cycler_harvest_core::models::MonitoredPath;

/// A file found under a monitored path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub size: u64,
}

const DEFAULT_EXCLUDES: &[&str] = &["**/.*", "**/.*/**", "**/~$*", "**/*.tmp", "**/*.lock"];

pub fn scan_monitored_path(monitored: &MonitoredPath) -> Result<Vec<ScannedFile>> {
    let root = PathBuf::from(&monitored.path);
    if !root.is_dir() {
        bail!("Monitored path is not a directory: {}", root.display());
    }

    let pattern = if monitored.pattern.trim().is_empty() {
        "*"
    } else {
        monitored.pattern.as_str()
    };
    let include_set = build_globset(&[pattern])?;
    let exclude_set = build_globset(DEFAULT_EXCLUDES)?;

    let mut files = Vec::new();

    for entry in WalkDir::new(&root) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log::warn!("skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match entry.metadata() {
            Ok(metadata) => files.push(ScannedFile {
                path: path.to_path_buf(),
                size: metadata.len(),
            }),
            Err(e) => log::warn!("cannot stat {}: {}", path.display(), e),
        }
    }

    // Sort for deterministic ordering
    files.sort_by(|a, b| a.path.cmp(&b.path));

    Ok(files)
}

fn build_globset(patterns: &[&str]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

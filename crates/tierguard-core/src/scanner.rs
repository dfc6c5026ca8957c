//! Read-only classification walk over a directory tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::error::{EngineError, Result};
use crate::level::{classify, ProtectionLevel};
use crate::policy::{class_for, PolicyClass};
use crate::settings::EngineSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub path: String,
    pub file_name: String,
    pub level: ProtectionLevel,
    pub policy_class: PolicyClass,
    pub matched_label: String,
    pub size_bytes: u64,
}

/// A file the walk could not inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSkip {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanTotals {
    pub total_files: usize,
    pub by_level: BTreeMap<u8, usize>,
    pub highly_protected_count: usize,
    pub unprotected_count: usize,
    pub skipped_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scanned_at_utc: DateTime<Utc>,
    pub root_directory: String,
    pub per_file_entries: Vec<ScanEntry>,
    pub skipped: Vec<ScanSkip>,
    pub totals: ScanTotals,
}

#[derive(Debug, Clone)]
pub struct DirectoryScanner {
    excluded_dirs: Vec<String>,
    follow_symlinks: bool,
}

impl DirectoryScanner {
    pub fn new(settings: &EngineSettings) -> Self {
        let mut excluded_dirs = settings.scan_exclude_dirs.clone();
        excluded_dirs.push(settings.backup_dir_name.clone());
        Self {
            excluded_dirs,
            follow_symlinks: settings.follow_symlinks,
        }
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        entry.depth() > 0
            && entry.file_type().is_dir()
            && self
                .excluded_dirs
                .iter()
                .any(|d| entry.file_name().to_string_lossy() == d.as_str())
    }

    pub fn scan(&self, root: &Path) -> Result<ScanReport> {
        let root = root.canonicalize().map_err(|e| EngineError::io(root, e))?;
        info!(root = %root.display(), follow_symlinks = self.follow_symlinks, "scanning");

        let mut entries = Vec::new();
        let mut skipped = Vec::new();

        // walkdir reports a symlink that re-enters an ancestor as a loop
        // error instead of descending, so cycles end up in `skipped`.
        let walker = WalkDir::new(&root)
            .follow_links(self.follow_symlinks)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));

        for item in walker {
            let entry = match item {
                Ok(e) => e,
                Err(e) => {
                    let path = e
                        .path()
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| root.display().to_string());
                    warn!(path = %path, error = %e, "scan entry skipped");
                    skipped.push(ScanSkip {
                        path,
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            // Only reached for symlinks when not following them.
            let size = if file_type.is_symlink() {
                match fs::metadata(entry.path()) {
                    Ok(m) if m.is_file() => m.len(),
                    Ok(_) => {
                        debug!(path = %entry.path().display(), "not following directory symlink");
                        continue;
                    }
                    Err(e) => {
                        skipped.push(skip(entry.path(), format!("broken symlink: {e}")));
                        continue;
                    }
                }
            } else {
                match entry.metadata() {
                    Ok(m) => m.len(),
                    Err(e) => {
                        skipped.push(skip(entry.path(), e.to_string()));
                        continue;
                    }
                }
            };

            let file_name = entry.file_name().to_string_lossy().into_owned();
            let classification = classify(&file_name);
            entries.push(ScanEntry {
                path: entry.path().display().to_string(),
                policy_class: class_for(classification.level),
                level: classification.level,
                matched_label: classification.matched_label,
                file_name,
                size_bytes: size,
            });
        }

        let totals = tally(&entries, skipped.len());
        info!(
            root = %root.display(),
            files = totals.total_files,
            highly_protected = totals.highly_protected_count,
            unprotected = totals.unprotected_count,
            skipped = totals.skipped_count,
            "scan complete"
        );
        Ok(ScanReport {
            scanned_at_utc: Utc::now(),
            root_directory: root.display().to_string(),
            per_file_entries: entries,
            skipped,
            totals,
        })
    }
}

fn skip(path: &Path, error: String) -> ScanSkip {
    warn!(path = %path.display(), error = %error, "scan entry skipped");
    ScanSkip {
        path: path.display().to_string(),
        error,
    }
}

fn tally(entries: &[ScanEntry], skipped: usize) -> ScanTotals {
    let mut by_level: BTreeMap<u8, usize> = ProtectionLevel::all().map(|l| (l.value(), 0)).collect();
    let mut totals = ScanTotals {
        total_files: entries.len(),
        skipped_count: skipped,
        ..ScanTotals::default()
    };
    for entry in entries {
        *by_level.entry(entry.level.value()).or_insert(0) += 1;
        if entry.level.is_highly_protected() {
            totals.highly_protected_count += 1;
        }
        if entry.level.is_unprotected() {
            totals.unprotected_count += 1;
        }
    }
    totals.by_level = by_level;
    totals
}

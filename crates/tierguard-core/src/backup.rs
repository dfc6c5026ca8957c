//! Point-in-time backups taken before risky mutations.
//!
//! Each backup lives in a hidden folder next to the original:
//!
//! ```text
//! dir/NOTES[重要L7].md
//! dir/.backups/NOTES[重要L7].md.20261019T101530.123456Z-1a2b3c4d.bak
//! dir/.backups/NOTES[重要L7].md.20261019T101530.123456Z-1a2b3c4d.bak.meta.json
//! ```
//!
//! Both artifacts are first written under `.staging` names and renamed into
//! place, copy first and sidecar last. A backup counts as complete only once
//! its sidecar exists; staging files left behind by a crashed backup are
//! removed once they are ten minutes old.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::fs::FileSystem;
use crate::level::{classify_path, ProtectionLevel};
use crate::settings::DEFAULT_BACKUP_DIR_NAME;

const BACKUP_EXT: &str = "bak";
const SIDECAR_SUFFIX: &str = ".meta.json";
/// Common NAME_MAX, in bytes.
const MAX_NAME_BYTES: usize = 255;
const STAGING_SUFFIX: &str = ".staging";
/// Staging files younger than this may belong to a backup still in flight
/// in another process.
const STALE_STAGING_SECS: i64 = 600;

/// Metadata written as the JSON sidecar of a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub original_path: String,
    pub backup_path: String,
    #[serde(rename = "timestamp")]
    pub timestamp_utc: DateTime<Utc>,
    pub reason: String,
    #[serde(rename = "fileSize")]
    pub original_size_bytes: u64,
    #[serde(rename = "originalModified")]
    pub original_modified_utc: DateTime<Utc>,
    /// BLAKE3 hex of the copied bytes.
    pub content_hash: String,
    pub level: ProtectionLevel,
}

impl BackupRecord {
    pub fn sidecar_path(&self) -> PathBuf {
        sidecar_for(Path::new(&self.backup_path))
    }
}

fn sidecar_for(backup_path: &Path) -> PathBuf {
    let mut name = backup_path.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Longest prefix of `name` within `max_bytes` that ends on a char boundary.
/// The sidecar keeps the full original path.
fn truncate_name(name: &str, max_bytes: usize) -> &str {
    if name.len() <= max_bytes {
        return name;
    }
    let mut end = max_bytes;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Compute the BLAKE3 hex digest of `data`.
pub fn blake3_hex(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

#[derive(Clone)]
pub struct BackupManager {
    fs: Arc<dyn FileSystem>,
    backup_dir_name: String,
}

impl BackupManager {
    pub fn new(fs: Arc<dyn FileSystem>, backup_dir_name: impl Into<String>) -> Self {
        Self {
            fs,
            backup_dir_name: backup_dir_name.into(),
        }
    }

    pub fn with_defaults(fs: Arc<dyn FileSystem>) -> Self {
        Self::new(fs, DEFAULT_BACKUP_DIR_NAME)
    }

    pub fn backup_dir_name(&self) -> &str {
        &self.backup_dir_name
    }

    /// Hidden backup folder for the directory containing `path`.
    pub fn backup_dir_for(&self, path: &Path) -> PathBuf {
        path.parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&self.backup_dir_name)
    }

    /// Absolute path of `path`, resolving through the parent when the file
    /// itself no longer exists.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf> {
        match self.fs.canonicalize(path) {
            Ok(p) => Ok(p),
            Err(EngineError::NotFound(_)) => {
                let parent = path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or_else(|| Path::new("."));
                let name = path
                    .file_name()
                    .ok_or_else(|| EngineError::NotFound(path.to_path_buf()))?;
                Ok(self.fs.canonicalize(parent)?.join(name))
            }
            Err(e) => Err(e),
        }
    }

    pub fn create_backup(&self, path: &Path, reason: &str) -> Result<BackupRecord> {
        let source = self.fs.canonicalize(path)?;
        if !self.fs.is_file(&source) {
            return Err(EngineError::NotFound(source));
        }
        self.write_backup(&source, reason)
            .map_err(|e| match e {
                EngineError::NotFound(p) if p == source => EngineError::NotFound(p),
                other => EngineError::BackupFailed {
                    path: source.clone(),
                    source: Box::new(other),
                },
            })
    }

    fn write_backup(&self, source: &Path, reason: &str) -> Result<BackupRecord> {
        let stat = self.fs.stat(source)?;
        let backup_dir = self.backup_dir_for(source);
        self.prepare_dir(&backup_dir)?;

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::NotFound(source.to_path_buf()))?;
        let timestamp = Utc::now();
        let id = Uuid::new_v4().simple().to_string();
        let suffix = format!(
            ".{}-{}.{}",
            timestamp.format("%Y%m%dT%H%M%S%.6fZ"),
            &id[..8],
            BACKUP_EXT
        );
        let budget = MAX_NAME_BYTES - suffix.len() - SIDECAR_SUFFIX.len();
        let backup_name = format!("{}{}", truncate_name(&file_name, budget), suffix);
        let backup_path = backup_dir.join(&backup_name);
        let sidecar_path = sidecar_for(&backup_path);
        let staged_copy = backup_dir.join(format!(".{id}.copy{STAGING_SUFFIX}"));
        let staged_meta = backup_dir.join(format!(".{id}.meta{STAGING_SUFFIX}"));

        let result = self.stage_and_commit(
            source,
            reason,
            stat.modified,
            timestamp,
            (&staged_copy, &staged_meta),
            (&backup_path, &sidecar_path),
        );
        if result.is_err() {
            for leftover in [&staged_copy, &staged_meta] {
                if self.fs.exists(leftover) {
                    let _ = self.fs.remove_file(leftover);
                }
            }
        }
        let record = result?;
        info!(
            path = %source.display(),
            backup = %record.backup_path,
            size = record.original_size_bytes,
            "backup created"
        );
        Ok(record)
    }

    fn stage_and_commit(
        &self,
        source: &Path,
        reason: &str,
        original_modified: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        (staged_copy, staged_meta): (&Path, &Path),
        (backup_path, sidecar_path): (&Path, &Path),
    ) -> Result<BackupRecord> {
        let copied = self.fs.copy(source, staged_copy)?;
        let staged_bytes = self.fs.read_bytes(staged_copy)?;
        if staged_bytes.len() as u64 != copied {
            return Err(EngineError::io(
                staged_copy,
                std::io::Error::new(std::io::ErrorKind::Other, "short backup copy"),
            ));
        }

        let record = BackupRecord {
            original_path: source.display().to_string(),
            backup_path: backup_path.display().to_string(),
            timestamp_utc: timestamp,
            reason: reason.to_string(),
            original_size_bytes: copied,
            original_modified_utc: original_modified,
            content_hash: blake3_hex(&staged_bytes),
            level: classify_path(source).level,
        };
        let json = serde_json::to_vec_pretty(&record)?;
        self.fs.write_bytes(staged_meta, &json)?;

        self.fs.rename(staged_copy, backup_path)?;
        if let Err(e) = self.fs.rename(staged_meta, sidecar_path) {
            let _ = self.fs.remove_file(backup_path);
            return Err(e);
        }
        Ok(record)
    }

    fn prepare_dir(&self, backup_dir: &Path) -> Result<()> {
        self.fs.create_dir_all(backup_dir)?;
        if let Ok(entries) = self.fs.list_dir(backup_dir) {
            for entry in entries {
                let is_staging = entry
                    .file_name()
                    .map(|n| n.to_string_lossy().ends_with(STAGING_SUFFIX))
                    .unwrap_or(false);
                if !is_staging {
                    continue;
                }
                let stale = self
                    .fs
                    .stat(&entry)
                    .map(|st| (Utc::now() - st.modified).num_seconds() >= STALE_STAGING_SECS)
                    .unwrap_or(false);
                if stale {
                    warn!(path = %entry.display(), "removing orphaned backup staging file");
                    let _ = self.fs.remove_file(&entry);
                }
            }
        }
        Ok(())
    }

    pub fn load_record(&self, sidecar: &Path) -> Result<BackupRecord> {
        let bytes = self.fs.read_bytes(sidecar)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Complete backups of `path`, newest first. The file itself need not
    /// exist any more.
    pub fn list_backups(&self, path: &Path) -> Result<Vec<BackupRecord>> {
        let target = self.resolve(path)?;
        let backup_dir = self.backup_dir_for(&target);
        if !self.fs.exists(&backup_dir) {
            return Ok(vec![]);
        }
        let target_str = target.display().to_string();
        let mut records = Vec::new();
        for entry in self.fs.list_dir(&backup_dir)? {
            let is_sidecar = entry
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(SIDECAR_SUFFIX))
                .unwrap_or(false);
            if !is_sidecar {
                continue;
            }
            match self.load_record(&entry) {
                Ok(record) if record.original_path == target_str => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %entry.display(), error = %e, "unreadable backup sidecar"),
            }
        }
        records.sort_by(|a, b| b.timestamp_utc.cmp(&a.timestamp_utc));
        Ok(records)
    }

    /// Re-hash the backup copy and compare it with the recorded hash.
    pub fn verify_backup(&self, record: &BackupRecord) -> Result<bool> {
        let data = self.fs.read_bytes(Path::new(&record.backup_path))?;
        Ok(data.len() as u64 == record.original_size_bytes
            && blake3_hex(&data) == record.content_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFileSystem, OsFileSystem};
    use std::collections::HashSet;
    use std::fs;
    use tempfile::tempdir;

    fn os_manager() -> BackupManager {
        BackupManager::with_defaults(Arc::new(OsFileSystem::new()))
    }

    #[test]
    fn backup_is_byte_identical_with_sidecar() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("NOTES[重要L7].md");
        let data: Vec<u8> = vec![0, 159, 146, 150, b'\r', b'\n', 255, b'x'];
        fs::write(&file, &data).unwrap();

        let manager = os_manager();
        let record = manager.create_backup(&file, "before cleanup").unwrap();

        assert_eq!(fs::read(&record.backup_path).unwrap(), data);
        assert_eq!(record.original_size_bytes, data.len() as u64);
        assert_eq!(record.reason, "before cleanup");
        assert_eq!(record.level.value(), 7);
        assert!(record.backup_path.contains(".backups"));
        assert!(record.backup_path.ends_with(".bak"));

        let sidecar: serde_json::Value =
            serde_json::from_slice(&fs::read(record.sidecar_path()).unwrap()).unwrap();
        for key in ["originalPath", "backupPath", "timestamp", "reason", "fileSize", "originalModified"] {
            assert!(sidecar.get(key).is_some(), "sidecar missing {key}");
        }
        assert_eq!(sidecar["fileSize"], data.len());
        assert!(manager.verify_backup(&record).unwrap());
    }

    #[test]
    fn rapid_backups_never_collide() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"same content").unwrap();
        let manager = os_manager();
        let mut names = HashSet::new();
        for _ in 0..25 {
            let record = manager.create_backup(&file, "burst").unwrap();
            assert!(names.insert(record.backup_path));
        }
        assert_eq!(manager.list_backups(&file).unwrap().len(), 25);
    }

    #[test]
    fn long_names_are_shortened_to_fit() {
        let dir = tempdir().unwrap();
        // 80 three-byte chars + label: 247 bytes, legal on its own
        let name = format!("{}[L8].md", "重".repeat(80));
        assert!(name.len() <= MAX_NAME_BYTES);
        let file = dir.path().join(&name);
        fs::write(&file, b"long").unwrap();

        let record = os_manager().create_backup(&file, "x").unwrap();
        let backup_name = Path::new(&record.backup_path)
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned();
        assert!(backup_name.len() + SIDECAR_SUFFIX.len() <= MAX_NAME_BYTES);
        assert!(backup_name.starts_with("重重重"));
        assert!(backup_name.ends_with(".bak"));
        assert_eq!(record.original_path, file.canonicalize().unwrap().display().to_string());
        assert_eq!(fs::read(&record.backup_path).unwrap(), b"long");
        assert!(record.sidecar_path().exists());
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_name("abc", 10), "abc");
        assert_eq!(truncate_name("重要", 4), "重");
        assert_eq!(truncate_name("重要", 6), "重要");
        assert_eq!(truncate_name("a重", 2), "a");
    }

    #[test]
    fn missing_source_is_not_found() {
        let dir = tempdir().unwrap();
        let err = os_manager()
            .create_backup(&dir.path().join("ghost.txt"), "x")
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
        assert!(!dir.path().join(".backups").exists());
    }

    #[test]
    fn failed_sidecar_leaves_no_complete_artifacts() {
        let mfs = MemoryFileSystem::new();
        mfs.insert("/w/a[重要L8].txt", b"payload".to_vec());
        mfs.fail_writes_containing(".meta.json");
        let manager = BackupManager::with_defaults(Arc::new(mfs.clone()));

        let err = manager.create_backup(Path::new("/w/a[重要L8].txt"), "x").unwrap_err();
        assert!(matches!(err, EngineError::BackupFailed { .. }));
        let leftovers: Vec<_> = mfs
            .files()
            .into_iter()
            .filter(|p| p.starts_with("/w/.backups"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {leftovers:?}");
    }

    #[test]
    fn failed_copy_is_backup_failure() {
        let mfs = MemoryFileSystem::new();
        mfs.insert("/w/b.txt", b"payload".to_vec());
        mfs.fail_writes_containing(".copy.staging");
        let manager = BackupManager::with_defaults(Arc::new(mfs.clone()));
        let err = manager.create_backup(Path::new("/w/b.txt"), "x").unwrap_err();
        assert_eq!(err.kind(), "backup_failed");
        assert_eq!(mfs.files(), vec![PathBuf::from("/w/b.txt")]);
    }

    #[test]
    fn orphaned_staging_files_are_cleaned() {
        let mfs = MemoryFileSystem::new();
        mfs.insert("/w/c.txt", b"c".to_vec());
        mfs.insert("/w/.backups/.dead.copy.staging", b"junk".to_vec());
        mfs.set_modified("/w/.backups/.dead.copy.staging", Utc::now() - chrono::Duration::hours(1));
        mfs.insert("/w/.backups/.live.copy.staging", b"in flight".to_vec());
        let manager = BackupManager::with_defaults(Arc::new(mfs.clone()));
        manager.create_backup(Path::new("/w/c.txt"), "x").unwrap();
        assert!(!mfs.exists(Path::new("/w/.backups/.dead.copy.staging")));
        assert!(mfs.exists(Path::new("/w/.backups/.live.copy.staging")));
        assert_eq!(manager.list_backups(Path::new("/w/c.txt")).unwrap().len(), 1);
    }

    #[test]
    fn backups_listed_after_original_is_deleted() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("gone.txt");
        fs::write(&file, b"v1").unwrap();
        let manager = os_manager();
        let first = manager.create_backup(&file, "one").unwrap();
        fs::write(&file, b"v2").unwrap();
        let second = manager.create_backup(&file, "two").unwrap();
        fs::remove_file(&file).unwrap();

        let listed = manager.list_backups(&file).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], second);
        assert_eq!(listed[1], first);
        assert_eq!(fs::read(&listed[1].backup_path).unwrap(), b"v1");
    }

    #[test]
    fn tampered_backup_fails_verification() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("v.txt");
        fs::write(&file, b"original").unwrap();
        let manager = os_manager();
        let record = manager.create_backup(&file, "x").unwrap();
        fs::write(&record.backup_path, b"0riginal").unwrap();
        assert!(!manager.verify_backup(&record).unwrap());
    }
}

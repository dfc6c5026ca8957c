//! Guarded delete / modify / backup.
//!
//! Each verb runs classify → evaluate → backup (when the tier calls for it)
//! → mutate while holding the per-path lock, so two callers cannot both pass
//! evaluation and then both perform the destructive step.
//!
//! Backup thresholds:
//! - delete backs up at level 7 and above
//! - modify backs up at level 4 and above
//!
//! A failed backup at level 7+ always aborts. At levels 4–6 a modify aborts
//! too unless `allow_unbacked_moderate_writes` is set, in which case it
//! proceeds with a logged warning.
//!
//! Paths are taken as given: only the parent directory is canonicalized, so
//! the name that is classified is the name that is acted on. A path that is
//! itself a symbolic link is refused with [`EngineError::SymlinkRefused`].

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::audit::AuditSink;
use crate::backup::{blake3_hex, BackupManager, BackupRecord};
use crate::error::{EngineError, Result};
use crate::evaluator::{
    OperationKind, PermissionContext, PermissionDecision, PermissionEvaluator, REQ_LOG_CHANGE,
};
use crate::fs::{FileSystem, OsFileSystem, PathLock};
use crate::level::{classify_path, ProtectionLevel};
use crate::settings::EngineSettings;

const DELETE_BACKUP_THRESHOLD: u8 = 7;
const MODIFY_BACKUP_THRESHOLD: u8 = 4;
const FAIL_CLOSED_THRESHOLD: u8 = 7;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub path: String,
    /// True when the filesystem was actually changed.
    pub performed: bool,
    pub decision: PermissionDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<BackupRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl OperationOutcome {
    fn denied(path: &Path, decision: PermissionDecision) -> Self {
        Self {
            path: path.display().to_string(),
            performed: false,
            decision,
            backup: None,
            notes: Vec::new(),
        }
    }
}

pub struct SafeOperations {
    fs: Arc<dyn FileSystem>,
    evaluator: PermissionEvaluator,
    backups: BackupManager,
    settings: EngineSettings,
}

impl SafeOperations {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        sink: Arc<dyn AuditSink>,
        settings: EngineSettings,
    ) -> Self {
        let backups = BackupManager::new(fs.clone(), settings.backup_dir_name.clone());
        Self {
            fs,
            evaluator: PermissionEvaluator::new(sink),
            backups,
            settings,
        }
    }

    /// Facade over the real filesystem.
    pub fn on_disk(sink: Arc<dyn AuditSink>, settings: EngineSettings) -> Self {
        Self::new(Arc::new(OsFileSystem::new()), sink, settings)
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Evaluate without touching the filesystem. The file need not exist.
    pub fn check(
        &self,
        path: &Path,
        operation: &OperationKind,
        ctx: &PermissionContext,
    ) -> PermissionDecision {
        let level = classify_path(path).level;
        self.evaluator.evaluate_for(path, level, operation, ctx)
    }

    pub fn safe_delete(&self, path: &Path, ctx: &PermissionContext) -> Result<OperationOutcome> {
        let (target, _lock) = self.lock_existing(path)?;
        let level = classify_path(&target).level;
        let decision = self
            .evaluator
            .evaluate_for(&target, level, &OperationKind::Delete, ctx);
        if !decision.allowed {
            return Ok(OperationOutcome::denied(&target, decision));
        }

        let mut outcome = OperationOutcome::denied(&target, decision);
        if level.value() >= DELETE_BACKUP_THRESHOLD {
            let reason = ctx.reason.clone().unwrap_or_else(|| "pre-delete".to_string());
            match self.backups.create_backup(&target, &reason) {
                Ok(record) => outcome.backup = Some(record),
                Err(e) => {
                    error!(path = %target.display(), %level, error = %e, "delete aborted: backup failed");
                    return Err(e);
                }
            }
        }

        self.fs.remove_file(&target)?;
        outcome.performed = true;
        log_completed(&target, level, &outcome.decision, "file deleted");
        Ok(outcome)
    }

    pub fn safe_modify(
        &self,
        path: &Path,
        new_content: &[u8],
        ctx: &PermissionContext,
    ) -> Result<OperationOutcome> {
        let (target, _lock) = self.lock_existing(path)?;
        let level = classify_path(&target).level;
        let decision = self
            .evaluator
            .evaluate_for(&target, level, &OperationKind::Modify, ctx);
        if !decision.allowed {
            return Ok(OperationOutcome::denied(&target, decision));
        }

        let mut outcome = OperationOutcome::denied(&target, decision);
        if level.value() >= MODIFY_BACKUP_THRESHOLD {
            let reason = ctx.reason.clone().unwrap_or_else(|| "pre-modify".to_string());
            match self.backups.create_backup(&target, &reason) {
                Ok(record) => outcome.backup = Some(record),
                Err(e) if level.value() >= FAIL_CLOSED_THRESHOLD => {
                    error!(path = %target.display(), %level, error = %e, "modify aborted: backup failed");
                    return Err(e);
                }
                Err(e) if self.settings.allow_unbacked_moderate_writes => {
                    warn!(
                        path = %target.display(),
                        %level,
                        error = %e,
                        "backup failed; modifying without a backup as configured"
                    );
                    outcome
                        .notes
                        .push(format!("proceeded without backup: {e}"));
                }
                Err(e) => {
                    warn!(path = %target.display(), %level, error = %e, "modify aborted: backup failed");
                    return Err(e);
                }
            }
        }

        self.replace_contents(&target, new_content)?;
        outcome.performed = true;
        log_completed(&target, level, &outcome.decision, "file modified");
        Ok(outcome)
    }

    /// Take a backup under the path lock.
    pub fn safe_backup(&self, path: &Path, reason: &str) -> Result<BackupRecord> {
        let (target, _lock) = self.lock_existing(path)?;
        self.backups.create_backup(&target, reason)
    }

    fn lock_existing(&self, path: &Path) -> Result<(PathBuf, PathLock)> {
        let target = self.absolute(path)?;
        self.ensure_regular_file(&target)?;
        let lock = self
            .fs
            .lock_path(&target, &self.lock_file_for(&target), self.settings.lock_timeout())?;
        // another holder may have removed or replaced it while we waited
        self.ensure_regular_file(&target)?;
        Ok((target, lock))
    }

    /// Canonical parent joined with the final component, which is never
    /// resolved.
    fn absolute(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .ok_or_else(|| EngineError::NotFound(path.to_path_buf()))?;
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        Ok(self.fs.canonicalize(parent)?.join(name))
    }

    fn ensure_regular_file(&self, target: &Path) -> Result<()> {
        if self.fs.is_symlink(target) {
            warn!(path = %target.display(), "refusing to act through a symbolic link");
            return Err(EngineError::SymlinkRefused(target.to_path_buf()));
        }
        if !self.fs.is_file(target) {
            return Err(EngineError::NotFound(target.to_path_buf()));
        }
        Ok(())
    }

    fn lock_file_for(&self, target: &Path) -> PathBuf {
        let digest = blake3_hex(target.to_string_lossy().as_bytes());
        self.backups
            .backup_dir_for(target)
            .join(".locks")
            .join(format!("{}.lock", &digest[..16]))
    }

    /// Write to a sibling temp file carrying the target's permissions, then
    /// rename over the target.
    fn replace_contents(&self, target: &Path, content: &[u8]) -> Result<()> {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = target.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()));
        let written = self
            .fs
            .write_bytes(&temp, content)
            .and_then(|_| self.fs.copy_permissions(target, &temp));
        if let Err(e) = written {
            let _ = self.fs.remove_file(&temp);
            return Err(e);
        }
        if let Err(e) = self.fs.rename(&temp, target) {
            let _ = self.fs.remove_file(&temp);
            return Err(e);
        }
        Ok(())
    }
}

fn log_completed(target: &Path, level: ProtectionLevel, decision: &PermissionDecision, msg: &str) {
    let logged = decision.requirements.iter().any(|r| r == REQ_LOG_CHANGE);
    info!(
        path = %target.display(),
        %level,
        class = %decision.policy_class,
        change_logged = logged,
        "{msg}"
    );
}

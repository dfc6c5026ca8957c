use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::paths::{default_audit_log_path, default_settings_path};

pub const DEFAULT_BACKUP_DIR_NAME: &str = ".backups";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Hidden folder created next to a file to hold its backups.
    pub backup_dir_name: String,
    pub audit_log_path: Option<PathBuf>,
    pub audit_log_max_bytes: u64,
    pub lock_timeout_ms: u64,
    /// Let a tier 4–6 modify proceed when its backup fails.
    pub allow_unbacked_moderate_writes: bool,
    pub scan_exclude_dirs: Vec<String>,
    pub follow_symlinks: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            backup_dir_name: DEFAULT_BACKUP_DIR_NAME.into(),
            audit_log_path: None,
            audit_log_max_bytes: 5 * 1024 * 1024,
            lock_timeout_ms: 5_000,
            allow_unbacked_moderate_writes: false,
            scan_exclude_dirs: vec![".git".into(), "node_modules".into()],
            follow_symlinks: false,
        }
    }
}

impl EngineSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn audit_log_path(&self) -> Result<PathBuf> {
        match &self.audit_log_path {
            Some(p) => Ok(p.clone()),
            None => default_audit_log_path(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        let settings: EngineSettings = serde_json::from_str(&json)
            .map_err(|e| EngineError::Settings(format!("{}: {e}", path.display())))?;
        settings.validate()?;
        debug!(path = %path.display(), "settings loaded");
        Ok(settings)
    }

    /// `explicit` if given, else the default settings file when present,
    /// else built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let default_path = default_settings_path()?;
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(|e| EngineError::io(path, e))
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.backup_dir_name.as_str();
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\') {
            return Err(EngineError::Settings(format!(
                "backup_dir_name must be a single directory name, got '{name}'"
            )));
        }
        if self.audit_log_max_bytes == 0 {
            return Err(EngineError::Settings("audit_log_max_bytes must be positive".into()));
        }
        Ok(())
    }
}

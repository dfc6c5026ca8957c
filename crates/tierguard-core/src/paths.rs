use directories::ProjectDirs;
use std::path::PathBuf;

use crate::error::{EngineError, Result};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "tierguard";

/// Overrides the platform data directory when set.
pub const DATA_DIR_ENV: &str = "TIERGUARD_DATA_DIR";

pub fn data_dir() -> Result<PathBuf> {
    if let Ok(override_path) = std::env::var(DATA_DIR_ENV) {
        if !override_path.is_empty() {
            return Ok(PathBuf::from(override_path));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| EngineError::Settings("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn log_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs"))
}

pub fn default_audit_log_path() -> Result<PathBuf> {
    Ok(log_dir()?.join("audit.log"))
}

pub fn default_settings_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("settings.json"))
}

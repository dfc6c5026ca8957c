//! Importance-tiered file protection.
//!
//! A file's protection level comes from a bracket label in its name
//! ([`level::classify`]). The level maps to a [`policy::PolicyClass`], the
//! [`evaluator`] decides whether an operation may proceed, and
//! [`facade::SafeOperations`] enforces the decision, taking a backup first
//! when the tier calls for one.

pub mod audit;
pub mod backup;
pub mod error;
pub mod evaluator;
pub mod facade;
pub mod fs;
pub mod level;
pub mod paths;
pub mod policy;
pub mod scanner;
pub mod settings;

pub use audit::{AuditRecord, AuditSink, JsonlAuditLog, MemoryAuditSink, TracingAuditSink};
pub use backup::{BackupManager, BackupRecord};
pub use error::{EngineError, Result};
pub use evaluator::{
    decide, OperationKind, PermissionContext, PermissionDecision, PermissionEvaluator,
};
pub use facade::{OperationOutcome, SafeOperations};
pub use fs::{FileSystem, MemoryFileSystem, OsFileSystem};
pub use level::{classify, classify_path, Classification, ProtectionLevel};
pub use policy::{class_for, policy_table, required_actions, ActionTag, PolicyClass};
pub use scanner::{DirectoryScanner, ScanReport};
pub use settings::EngineSettings;

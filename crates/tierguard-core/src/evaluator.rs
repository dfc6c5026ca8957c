//! Permission evaluation.
//!
//! [`decide`] is a pure function of (level, operation, context).
//! [`PermissionEvaluator`] wraps it and forwards every decision, allowed or
//! not, to an [`AuditSink`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;

use crate::audit::{AuditRecord, AuditSink};
use crate::level::ProtectionLevel;
use crate::policy::{class_for, PolicyClass};

pub const REQ_FORBIDDEN: &str = "operation_forbidden";
pub const REQ_USER_CONFIRMATION: &str = "user_confirmation_required";
pub const REQ_BACKUP: &str = "backup_required";
pub const REQ_REASON: &str = "reason_required";
pub const REQ_LOG_CHANGE: &str = "log_change";

/// Requested action against a file. Unrecognised names are kept as `Other`
/// so each class can apply its rule for unknown operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationKind {
    Read,
    Append,
    Modify,
    Overwrite,
    Delete,
    Other(String),
}

impl OperationKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Read => "read",
            Self::Append => "append",
            Self::Modify => "modify",
            Self::Overwrite => "overwrite",
            Self::Delete => "delete",
            Self::Other(name) => name,
        }
    }

    /// Read and append never destroy existing content.
    pub fn is_non_destructive(&self) -> bool {
        matches!(self, Self::Read | Self::Append)
    }

    pub fn is_destructive(&self) -> bool {
        matches!(self, Self::Modify | Self::Overwrite | Self::Delete)
    }
}

impl From<&str> for OperationKind {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Self::Read,
            "append" => Self::Append,
            "modify" | "edit" | "write" => Self::Modify,
            "overwrite" => Self::Overwrite,
            "delete" | "remove" => Self::Delete,
            _ => Self::Other(s.trim().to_string()),
        }
    }
}

impl From<String> for OperationKind {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

impl From<OperationKind> for String {
    fn from(op: OperationKind) -> String {
        op.as_str().to_string()
    }
}

impl FromStr for OperationKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Evidence supplied by the caller. The engine does not verify it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionContext {
    pub user_confirmed: bool,
    pub backup_created: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionContext {
    pub fn confirmed(mut self) -> Self {
        self.user_confirmed = true;
        self
    }

    pub fn with_backup(mut self) -> Self {
        self.backup_created = true;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// A reason counts only if it has non-whitespace content.
    pub fn reason_provided(&self) -> bool {
        self.reason
            .as_deref()
            .map(|r| !r.trim().is_empty())
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionDecision {
    pub allowed: bool,
    pub level: ProtectionLevel,
    pub policy_class: PolicyClass,
    pub operation: OperationKind,
    pub requirements: Vec<String>,
    pub warnings: Vec<String>,
}

impl PermissionDecision {
    fn new(level: ProtectionLevel, operation: &OperationKind) -> Self {
        Self {
            allowed: false,
            level,
            policy_class: class_for(level),
            operation: operation.clone(),
            requirements: Vec::new(),
            warnings: Vec::new(),
        }
    }

    fn allow(mut self) -> Self {
        self.allowed = true;
        self
    }

    fn require(mut self, requirement: &str) -> Self {
        self.requirements.push(requirement.to_string());
        self
    }

    fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

/// Decide whether `operation` may proceed on a file at `level`.
pub fn decide(
    level: ProtectionLevel,
    operation: &OperationKind,
    ctx: &PermissionContext,
) -> PermissionDecision {
    let decision = PermissionDecision::new(level, operation);
    match decision.policy_class {
        PolicyClass::Absolute => decide_absolute(decision, operation),
        PolicyClass::Strict => decide_strict(decision, operation, ctx),
        PolicyClass::Moderate => decide_moderate(decision, operation, ctx),
        PolicyClass::Minimal => decide_minimal(decision, operation),
        PolicyClass::None => decision.allow(),
    }
}

fn decide_absolute(decision: PermissionDecision, operation: &OperationKind) -> PermissionDecision {
    if operation.is_non_destructive() {
        return decision.allow();
    }
    let level = decision.level;
    decision
        .require(REQ_FORBIDDEN)
        .warn(format!(
            "{operation} is never permitted on {level} files; they are append-only"
        ))
}

fn decide_strict(
    decision: PermissionDecision,
    operation: &OperationKind,
    ctx: &PermissionContext,
) -> PermissionDecision {
    match operation {
        OperationKind::Read | OperationKind::Append => decision.allow(),
        OperationKind::Delete => {
            let mut decision = decision;
            if !ctx.user_confirmed {
                decision = decision.require(REQ_USER_CONFIRMATION);
            }
            if !ctx.backup_created {
                decision = decision.require(REQ_BACKUP);
            }
            if decision.requirements.is_empty() {
                decision.allow()
            } else {
                decision
            }
        }
        OperationKind::Modify | OperationKind::Overwrite => {
            if ctx.backup_created {
                decision.allow()
            } else {
                decision.require(REQ_BACKUP)
            }
        }
        OperationKind::Other(_) => decision
            .require(REQ_BACKUP)
            .warn(format!("unknown operation '{operation}' is denied; create a backup first")),
    }
}

fn decide_moderate(
    decision: PermissionDecision,
    operation: &OperationKind,
    ctx: &PermissionContext,
) -> PermissionDecision {
    if operation.is_non_destructive() || ctx.reason_provided() {
        return decision.allow();
    }
    decision.require(REQ_REASON)
}

fn decide_minimal(decision: PermissionDecision, operation: &OperationKind) -> PermissionDecision {
    let decision = decision.allow();
    if operation.is_destructive() {
        return decision
            .require(REQ_LOG_CHANGE)
            .warn(format!("{operation} will be recorded in the change log"));
    }
    decision
}

/// Stateless evaluator that reports every decision to an audit sink.
#[derive(Clone)]
pub struct PermissionEvaluator {
    sink: Arc<dyn AuditSink>,
}

impl PermissionEvaluator {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub fn evaluate(
        &self,
        level: ProtectionLevel,
        operation: &OperationKind,
        ctx: &PermissionContext,
    ) -> PermissionDecision {
        self.evaluate_inner(None, level, operation, ctx)
    }

    /// Same as [`Self::evaluate`], with the target path included in the
    /// audit record.
    pub fn evaluate_for(
        &self,
        target: &Path,
        level: ProtectionLevel,
        operation: &OperationKind,
        ctx: &PermissionContext,
    ) -> PermissionDecision {
        self.evaluate_inner(Some(target), level, operation, ctx)
    }

    fn evaluate_inner(
        &self,
        target: Option<&Path>,
        level: ProtectionLevel,
        operation: &OperationKind,
        ctx: &PermissionContext,
    ) -> PermissionDecision {
        let decision = decide(level, operation, ctx);
        if !decision.allowed {
            warn!(
                path = ?target.map(|p| p.display().to_string()),
                %level,
                %operation,
                requirements = ?decision.requirements,
                "operation denied"
            );
        }
        let record = AuditRecord {
            timestamp: Utc::now(),
            target: target.map(|p| p.display().to_string()),
            operation: operation.clone(),
            context: ctx.clone(),
            decision: decision.clone(),
        };
        if let Err(e) = self.sink.record(&record) {
            warn!(error = %e, "audit sink rejected decision record");
        }
        decision
    }
}

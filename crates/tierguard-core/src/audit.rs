//! Audit sinks for permission decisions.
//!
//! [`JsonlAuditLog`] appends one JSON line per decision and chains entries
//! with SHA-256 (`prev_hash` → `hash`) so a removed or edited line breaks the
//! chain. The file is rotated once it passes `max_bytes`.
//!
//! Each entry goes out in a single `write_all` on an append-mode handle.
//! Lines that do not parse (a crash mid-write) are skipped with a warning
//! and the chain resumes from the last good entry.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::evaluator::{OperationKind, PermissionContext, PermissionDecision};

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";

/// One evaluated request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub operation: OperationKind,
    pub context: PermissionContext,
    pub decision: PermissionDecision,
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> Result<()>;
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// Emits each record as a `tracing` event on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        info!(
            target: "audit",
            path = record.target.as_deref().unwrap_or("-"),
            operation = %record.operation,
            level = %record.decision.level,
            class = %record.decision.policy_class,
            allowed = record.decision.allowed,
            requirements = ?record.decision.requirements,
            "decision"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub record: AuditRecord,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
    /// The file does not end in a newline.
    torn_tail: bool,
}

pub struct JsonlAuditLog {
    path: PathBuf,
    inner: Mutex<ChainState>,
    max_bytes: u64,
}

impl JsonlAuditLog {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
            }
        }
        let state = Self::load_state(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(state),
            max_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load_state(path: &Path) -> Result<ChainState> {
        let mut state = ChainState {
            last_seq: 0,
            last_hash: CHAIN_START.to_string(),
            torn_tail: false,
        };
        if !path.exists() {
            return Ok(state);
        }
        for entry in Self::read_entries(path)? {
            state.last_seq = entry.seq;
            state.last_hash = entry.hash;
        }
        let bytes = fs::read(path).map_err(|e| EngineError::io(path, e))?;
        state.torn_tail = bytes.last().map_or(false, |b| *b != b'\n');
        Ok(state)
    }

    fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
        let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (index, line) in reader.split(b'\n').enumerate() {
            let line = line.map_err(|e| EngineError::io(path, e))?;
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<AuditEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    path = %path.display(),
                    line = index + 1,
                    error = %e,
                    "skipping unreadable audit line"
                ),
            }
        }
        Ok(entries)
    }

    fn compute_hash(seq: u64, prev_hash: &str, record: &AuditRecord) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(seq.to_le_bytes());
        hasher.update(prev_hash.as_bytes());
        hasher.update(serde_json::to_vec(record)?);
        Ok(hex::encode(hasher.finalize()))
    }

    pub fn append(&self, record: &AuditRecord) -> Result<AuditEntry> {
        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let prev_hash = state.last_hash.clone();
        let hash = Self::compute_hash(seq, &prev_hash, record)?;
        let entry = AuditEntry {
            seq,
            record: record.clone(),
            prev_hash,
            hash: hash.clone(),
        };
        self.write_entry(&entry, &mut state)?;
        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn write_entry(&self, entry: &AuditEntry, state: &mut ChainState) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::io(&self.path, e))?;
        let mut buf = Vec::with_capacity(512);
        if state.torn_tail {
            buf.push(b'\n');
        }
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
        file.write_all(&buf).map_err(|e| EngineError::io(&self.path, e))?;
        file.flush().map_err(|e| EngineError::io(&self.path, e))?;
        state.torn_tail = false;
        Ok(())
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> Result<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated).map_err(|e| EngineError::io(&rotated, e))?;
                } else {
                    let next = self.path_with_suffix(i + 1);
                    fs::rename(&rotated, &next).map_err(|e| EngineError::io(&rotated, e))?;
                }
            }
        }
        let first = self.path_with_suffix(1);
        fs::rename(&self.path, &first).map_err(|e| EngineError::io(&self.path, e))?;
        // new file starts a new chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        state.torn_tail = false;
        Ok(())
    }

    /// Most recent entries first, optionally filtered by timestamp.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let mut entries: Vec<AuditEntry> = Self::read_entries(&self.path)?
            .into_iter()
            .filter(|e| since.map_or(true, |ts| e.record.timestamp >= ts))
            .collect();
        entries.reverse();
        if let Some(lim) = limit {
            entries.truncate(lim);
        }
        Ok(entries)
    }

    /// Check the hash chain of the current file. Returns the sequence number
    /// of the first broken entry, if any.
    pub fn verify_chain(&self) -> Result<Option<u64>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let mut prev = CHAIN_START.to_string();
        for entry in Self::read_entries(&self.path)? {
            let expected = Self::compute_hash(entry.seq, &entry.prev_hash, &entry.record)?;
            if entry.prev_hash != prev || entry.hash != expected {
                return Ok(Some(entry.seq));
            }
            prev = entry.hash;
        }
        Ok(None)
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audit.log".to_string());
        self.path.with_file_name(format!("{}.{}", filename, index))
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, record: &AuditRecord) -> Result<()> {
        self.append(record).map(|_| ())
    }
}

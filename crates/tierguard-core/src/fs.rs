//! Filesystem capability used by the backup manager and the safe operation
//! facade.
//!
//! [`OsFileSystem`] is the real implementation. [`MemoryFileSystem`] keeps
//! everything in memory and can be told to fail writes, so the engine's
//! failure paths can be exercised without touching disk.
//!
//! Both implementations provide `lock_path`, which serializes the
//! evaluate → backup → mutate sequence for one target. The OS variant adds an
//! `fs2` advisory lock so separate processes are serialized too.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{EngineError, Result};

const LOCK_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub is_dir: bool,
}

pub trait FileSystem: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn is_file(&self, path: &Path) -> bool;
    /// True when `path` itself is a symbolic link; the link is not followed.
    fn is_symlink(&self, path: &Path) -> bool;
    /// Absolute form of an existing path; `NotFound` if it does not exist.
    fn canonicalize(&self, path: &Path) -> Result<PathBuf>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>>;
    /// Create or truncate `path` and write `data`, flushed to stable storage.
    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()>;
    /// Byte-for-byte copy. Returns the number of bytes copied.
    fn copy(&self, from: &Path, to: &Path) -> Result<u64>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    /// Give `to` the permission bits of `from`.
    fn copy_permissions(&self, from: &Path, to: &Path) -> Result<()>;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn create_dir_all(&self, path: &Path) -> Result<()>;
    /// Direct children of a directory, sorted.
    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;
    fn stat(&self, path: &Path) -> Result<FileStat>;
    /// Exclusive lock on `target`, held until the returned guard drops.
    /// `lock_file` is where implementations that need an on-disk lock put it.
    fn lock_path(&self, target: &Path, lock_file: &Path, timeout: Duration) -> Result<PathLock>;
}

/// Guard for an exclusive per-path lock.
pub struct PathLock {
    key: PathBuf,
    held: Arc<Mutex<HashSet<PathBuf>>>,
    file: Option<File>,
    /// Unlinked on release, while the lock is still held.
    lock_file: Option<PathBuf>,
}

impl PathLock {
    pub fn target(&self) -> &Path {
        &self.key
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        if let Some(lock_file) = self.lock_file.take() {
            let _ = fs::remove_file(lock_file);
        }
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
        self.held.lock().remove(&self.key);
    }
}

fn acquire_local(
    held: &Arc<Mutex<HashSet<PathBuf>>>,
    key: &Path,
    deadline: Instant,
) -> bool {
    loop {
        if held.lock().insert(key.to_path_buf()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(LOCK_POLL);
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether the locked handle is still the file named `lock_file`. A holder
/// unlinks the file on release, so a waiter may end up locking an orphaned
/// inode and has to start over.
#[cfg(unix)]
fn still_linked(file: &File, lock_file: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (file.metadata(), fs::metadata(lock_file)) {
        (Ok(held), Ok(named)) => held.dev() == named.dev() && held.ino() == named.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, _lock_file: &Path) -> bool {
    true
}

#[derive(Debug, Default, Clone)]
pub struct OsFileSystem {
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl OsFileSystem {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileSystem for OsFileSystem {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_symlink(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        path.canonicalize().map_err(|e| EngineError::io(path, e))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| EngineError::io(path, e))
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut file = File::create(path).map_err(|e| EngineError::io(path, e))?;
        file.write_all(data).map_err(|e| EngineError::io(path, e))?;
        file.sync_all().map_err(|e| EngineError::io(path, e))?;
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let copied = fs::copy(from, to).map_err(|e| EngineError::io(from, e))?;
        File::open(to)
            .and_then(|f| f.sync_all())
            .map_err(|e| EngineError::io(to, e))?;
        Ok(copied)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).map_err(|e| EngineError::io(from, e))
    }

    fn copy_permissions(&self, from: &Path, to: &Path) -> Result<()> {
        let permissions = fs::metadata(from)
            .map_err(|e| EngineError::io(from, e))?
            .permissions();
        fs::set_permissions(to, permissions).map_err(|e| EngineError::io(to, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| EngineError::io(path, e))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| EngineError::io(path, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| EngineError::io(path, e))? {
            let entry = entry.map_err(|e| EngineError::io(path, e))?;
            out.push(entry.path());
        }
        out.sort();
        Ok(out)
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path).map_err(|e| EngineError::io(path, e))?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|e| EngineError::io(path, e))?;
        Ok(FileStat {
            size: metadata.len(),
            modified,
            is_dir: metadata.is_dir(),
        })
    }

    fn lock_path(&self, target: &Path, lock_file: &Path, timeout: Duration) -> Result<PathLock> {
        let deadline = Instant::now() + timeout;
        let timed_out = || EngineError::LockTimeout {
            path: target.to_path_buf(),
            waited: timeout,
        };
        if !acquire_local(&self.held, target, deadline) {
            return Err(timed_out());
        }
        // From here on the guard releases the local lock on every exit path.
        let mut guard = PathLock {
            key: target.to_path_buf(),
            held: self.held.clone(),
            file: None,
            lock_file: None,
        };

        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
        }
        let file = loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(lock_file)
                .map_err(|e| EngineError::io(lock_file, e))?;
            match file.try_lock_exclusive() {
                Ok(()) if still_linked(&file, lock_file) => break file,
                Ok(()) => {
                    let _ = FileExt::unlock(&file);
                    continue;
                }
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(EngineError::io(lock_file, e)),
            }
            if Instant::now() >= deadline {
                return Err(timed_out());
            }
            std::thread::sleep(LOCK_POLL);
        };
        debug!(path = %target.display(), lock = %lock_file.display(), "path lock acquired");
        guard.file = Some(file);
        // Windows cannot unlink a file another handle has open.
        if cfg!(unix) {
            guard.lock_file = Some(lock_file.to_path_buf());
        }
        Ok(guard)
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct MemState {
    files: BTreeMap<PathBuf, MemFile>,
    dirs: BTreeSet<PathBuf>,
}

/// In-memory filesystem. Parent directories are implicit: any ancestor of a
/// stored file resolves.
#[derive(Debug, Default, Clone)]
pub struct MemoryFileSystem {
    state: Arc<Mutex<MemState>>,
    failing: Arc<Mutex<Vec<String>>>,
    held: Arc<Mutex<HashSet<PathBuf>>>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) {
        self.state.lock().files.insert(
            path.into(),
            MemFile {
                data: data.into(),
                modified: Utc::now(),
            },
        );
    }

    pub fn set_modified(&self, path: impl AsRef<Path>, modified: DateTime<Utc>) {
        if let Some(file) = self.state.lock().files.get_mut(path.as_ref()) {
            file.modified = modified;
        }
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.state.lock().files.keys().cloned().collect()
    }

    /// Make every write, copy or rename whose destination contains `fragment`
    /// fail with an I/O error.
    pub fn fail_writes_containing(&self, fragment: impl Into<String>) {
        self.failing.lock().push(fragment.into());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().clear();
    }

    fn check_writable(&self, dest: &Path) -> Result<()> {
        let dest_str = dest.to_string_lossy();
        if self.failing.lock().iter().any(|f| dest_str.contains(f.as_str())) {
            return Err(EngineError::io(
                dest,
                io::Error::new(io::ErrorKind::Other, "injected write failure"),
            ));
        }
        Ok(())
    }

    fn not_found(path: &Path) -> EngineError {
        EngineError::NotFound(path.to_path_buf())
    }
}

impl FileSystem for MemoryFileSystem {
    fn exists(&self, path: &Path) -> bool {
        let state = self.state.lock();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        self.state.lock().files.contains_key(path)
    }

    fn is_symlink(&self, _path: &Path) -> bool {
        false
    }

    fn canonicalize(&self, path: &Path) -> Result<PathBuf> {
        let state = self.state.lock();
        let known = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .any(|p| p.starts_with(path));
        if known {
            Ok(path.to_path_buf())
        } else {
            Err(Self::not_found(path))
        }
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>> {
        self.state
            .lock()
            .files
            .get(path)
            .map(|f| f.data.clone())
            .ok_or_else(|| Self::not_found(path))
    }

    fn write_bytes(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.check_writable(path)?;
        self.insert(path, data.to_vec());
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let data = self.read_bytes(from)?;
        self.check_writable(to)?;
        let len = data.len() as u64;
        self.insert(to, data);
        Ok(len)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.check_writable(to)?;
        let mut state = self.state.lock();
        let file = state.files.remove(from).ok_or_else(|| Self::not_found(from))?;
        state.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn copy_permissions(&self, from: &Path, to: &Path) -> Result<()> {
        let state = self.state.lock();
        if !state.files.contains_key(from) {
            return Err(Self::not_found(from));
        }
        if !state.files.contains_key(to) {
            return Err(Self::not_found(to));
        }
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.check_writable(path)?;
        self.state
            .lock()
            .files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(path))
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.state.lock().dirs.insert(path.to_path_buf());
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let state = self.state.lock();
        let mut out: BTreeSet<PathBuf> = BTreeSet::new();
        for candidate in state.files.keys().chain(state.dirs.iter()) {
            if candidate.parent() == Some(path) {
                out.insert(candidate.clone());
            }
        }
        if out.is_empty() && !state.dirs.contains(path) {
            return Err(Self::not_found(path));
        }
        Ok(out.into_iter().collect())
    }

    fn stat(&self, path: &Path) -> Result<FileStat> {
        let state = self.state.lock();
        if let Some(file) = state.files.get(path) {
            return Ok(FileStat {
                size: file.data.len() as u64,
                modified: file.modified,
                is_dir: false,
            });
        }
        if state.dirs.contains(path) {
            return Ok(FileStat {
                size: 0,
                modified: Utc::now(),
                is_dir: true,
            });
        }
        Err(Self::not_found(path))
    }

    fn lock_path(&self, target: &Path, _lock_file: &Path, timeout: Duration) -> Result<PathLock> {
        let deadline = Instant::now() + timeout;
        if !acquire_local(&self.held, target, deadline) {
            return Err(EngineError::LockTimeout {
                path: target.to_path_buf(),
                waited: timeout,
            });
        }
        Ok(PathLock {
            key: target.to_path_buf(),
            held: self.held.clone(),
            file: None,
            lock_file: None,
        })
    }
}

//! Project root discovery and the single-writer lock.
//!
//! An osgrep index lives under `<root>/.osgrep/`, where `<root>` is found
//! by walking upward from the current directory looking for a `.git`
//! entry (worktrees are resolved through `.git/commondir` back to the
//! main repository) or an already-existing `.osgrep` directory. Only one
//! process may hold the writer lock for a project at a time; readers
//! (search) are unrestricted.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{OsgrepError, OsgrepResult};

/// Name of the writer lock file under the project data directory.
const LOCK_FILE_NAME: &str = "LOCK";

/// Walk upward from `start` looking for a `.git` entry or an existing
/// `.osgrep` directory. Returns `start` itself if neither is found by the
/// filesystem root -- every path is a valid (if unrooted) project.
pub fn discover_root(start: &Path) -> OsgrepResult<PathBuf> {
    let start = start.canonicalize().unwrap_or_else(|_| start.to_path_buf());
    let mut current = start.as_path();

    loop {
        let git_path = current.join(".git");
        if git_path.exists() {
            return Ok(resolve_worktree_root(current, &git_path));
        }
        if current.join(".osgrep").is_dir() {
            return Ok(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return Ok(start),
        }
    }
}

/// If `.git` is a file (a worktree pointer: `gitdir: <path>`), resolve it
/// to the main repository's working tree root via `commondir`. If `.git`
/// is a directory, `current` is already the main repo root.
fn resolve_worktree_root(current: &Path, git_path: &Path) -> PathBuf {
    if git_path.is_dir() {
        return current.to_path_buf();
    }

    let Ok(contents) = std::fs::read_to_string(git_path) else {
        return current.to_path_buf();
    };
    let Some(gitdir) = contents.strip_prefix("gitdir:").map(str::trim) else {
        return current.to_path_buf();
    };
    let gitdir = PathBuf::from(gitdir);

    let commondir_path = gitdir.join("commondir");
    let Ok(commondir) = std::fs::read_to_string(&commondir_path) else {
        return current.to_path_buf();
    };
    let common = gitdir.join(commondir.trim());
    let Ok(common) = common.canonicalize() else {
        return current.to_path_buf();
    };

    // `common` points at `<main-repo>/.git`; the project root is its parent.
    common.parent().map(Path::to_path_buf).unwrap_or_else(|| current.to_path_buf())
}

/// Directories created under the project data directory on first use.
pub fn ensure_project_dirs(root: &Path) -> OsgrepResult<PathBuf> {
    let osgrep_dir = root.join(".osgrep");
    for sub in ["store", "meta", "logs"] {
        std::fs::create_dir_all(osgrep_dir.join(sub))?;
    }
    add_gitignore_entry(root)?;
    Ok(osgrep_dir)
}

/// Add a `.osgrep/` entry to the repo's `.gitignore` the first time, if a
/// `.gitignore` already exists or the root looks like a git repo.
fn add_gitignore_entry(root: &Path) -> OsgrepResult<()> {
    if !root.join(".git").exists() {
        return Ok(());
    }
    let gitignore_path = root.join(".gitignore");
    let existing = std::fs::read_to_string(&gitignore_path).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == ".osgrep/") {
        return Ok(());
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&gitignore_path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, ".osgrep/")?;
    Ok(())
}

/// Contents of the writer lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    start_time_monotonic: u64,
    host: String,
}

/// A held writer lock. Dropping it releases the lock by deleting the
/// file -- this is best-effort; a crash leaves a stale lock that the next
/// acquirer detects via PID/start-time mismatch.
pub struct WriterLock {
    path: PathBuf,
    released: bool,
}

impl WriterLock {
    /// Acquire the writer lock for the project whose data directory is
    /// `osgrep_dir`. Fails fast with `WriterLockHeld` if another live
    /// process on this host holds it.
    pub fn acquire(osgrep_dir: &Path) -> OsgrepResult<Self> {
        let path = osgrep_dir.join(LOCK_FILE_NAME);

        if let Some(existing) = read_lock(&path)? {
            if is_lock_alive(&existing) {
                return Err(OsgrepError::WriterLockHeld {
                    holder_pid: existing.pid,
                    details: format!("lock held by {} on {}", existing.pid, existing.host),
                });
            }
            tracing::warn!(pid = existing.pid, host = %existing.host, "breaking stale writer lock");
        }

        write_lock(&path)?;
        Ok(Self { path, released: false })
    }

    /// Release the lock early. Idempotent; also runs on `Drop`.
    pub fn release(mut self) -> OsgrepResult<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> OsgrepResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}

fn read_lock(path: &Path) -> OsgrepResult<Option<LockInfo>> {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(info) => Ok(Some(info)),
            Err(_) => {
                tracing::warn!(path = %path.display(), "writer lock file is malformed, treating as stale");
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_lock(path: &Path) -> OsgrepResult<()> {
    let info = LockInfo {
        pid: std::process::id(),
        start_time_monotonic: process_start_time_ms(),
        host: gethostname::gethostname().to_string_lossy().into_owned(),
    };
    let content = serde_json::to_string(&info).map_err(|e| OsgrepError::Serialization(e.to_string()))?;

    // Write to a temp file and rename, so a concurrent reader never sees a
    // half-written lock.
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// A coarse "start time" for this process -- real monotonic process start
/// time isn't portable without `/proc`, so we use the current wall-clock
/// time at lock-acquisition as a best-effort discriminator: a stale lock
/// from a previous run of this same PID (PID reuse) will almost always
/// have a different recorded start time than a currently-running process
/// would report if asked again.
fn process_start_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn is_lock_alive(info: &LockInfo) -> bool {
    let local_host = gethostname::gethostname().to_string_lossy().into_owned();
    if info.host != local_host {
        // Can't probe a remote host's process table; assume alive so we
        // never silently steal a lock held on another machine.
        return true;
    }
    // Signal 0 performs no-op error checking: ESRCH means no such process.
    let alive = unsafe { libc::kill(info.pid as libc::pid_t, 0) == 0 };
    alive
}

#[cfg(not(unix))]
fn is_lock_alive(info: &LockInfo) -> bool {
    let local_host = gethostname::gethostname().to_string_lossy().into_owned();
    info.host == local_host
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn discover_root_finds_git_directory() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let nested = dir.path().join("src").join("deep");
        std::fs::create_dir_all(&nested).unwrap();

        let root = discover_root(&nested).unwrap();
        assert_eq!(root.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn discover_root_falls_back_to_start_without_git() {
        let dir = tempdir().unwrap();
        let root = discover_root(dir.path()).unwrap();
        assert_eq!(root.canonicalize().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn ensure_project_dirs_creates_store_meta_logs() {
        let dir = tempdir().unwrap();
        let osgrep_dir = ensure_project_dirs(dir.path()).unwrap();
        assert!(osgrep_dir.join("store").is_dir());
        assert!(osgrep_dir.join("meta").is_dir());
        assert!(osgrep_dir.join("logs").is_dir());
    }

    #[test]
    fn writer_lock_round_trip_acquire_release() {
        let dir = tempdir().unwrap();
        let osgrep_dir = ensure_project_dirs(dir.path()).unwrap();

        let lock = WriterLock::acquire(&osgrep_dir).unwrap();
        assert!(osgrep_dir.join(LOCK_FILE_NAME).exists());
        lock.release().unwrap();
        assert!(!osgrep_dir.join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn writer_lock_rejects_second_acquire_while_held() {
        let dir = tempdir().unwrap();
        let osgrep_dir = ensure_project_dirs(dir.path()).unwrap();

        let _lock = WriterLock::acquire(&osgrep_dir).unwrap();
        let second = WriterLock::acquire(&osgrep_dir);
        assert!(matches!(second, Err(OsgrepError::WriterLockHeld { .. })));
    }

    #[test]
    fn writer_lock_breaks_stale_lock_from_dead_pid() {
        let dir = tempdir().unwrap();
        let osgrep_dir = ensure_project_dirs(dir.path()).unwrap();

        let stale = LockInfo {
            pid: 999_999, // exceedingly unlikely to be a live pid
            start_time_monotonic: 0,
            host: gethostname::gethostname().to_string_lossy().into_owned(),
        };
        let content = serde_json::to_string(&stale).unwrap();
        std::fs::write(osgrep_dir.join(LOCK_FILE_NAME), content).unwrap();

        let lock = WriterLock::acquire(&osgrep_dir);
        assert!(lock.is_ok());
    }
}

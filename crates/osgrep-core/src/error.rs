//! Error types for osgrep-core.
//!
//! Uses a hierarchical error enum so callers can pattern-match on the
//! subsystem that failed. Errors are grouped by what the caller can do
//! about them: some are per-item and recoverable, some degrade the
//! system to a reduced capability, some are fatal and require operator
//! intervention, and some are simply wrapped external errors.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for all osgrep-core operations.
#[derive(Debug, Error)]
pub enum OsgrepError {
    // ---- Recoverable (operation failed, system healthy) ----
    /// A single file failed to parse. The rest of the index is fine.
    #[error("parse error for {path}: {message}")]
    Parse {
        /// Path to the file that failed to parse.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// Embedding inference failed for a chunk. Keyword search still works.
    #[error("embedding error for chunk {chunk_id}: {message}")]
    Embed {
        /// Identifier of the chunk that failed to embed.
        chunk_id: String,
        /// Human-readable error description.
        message: String,
    },

    /// Requested file or symbol was not found in the index.
    #[error("not found: {entity}")]
    NotFound {
        /// Description of what was not found.
        entity: String,
    },

    // ---- Degraded (system works with reduced capability) ----
    /// Worker pool is unavailable. System falls back to keyword-only search.
    #[error("worker pool unavailable: {reason}")]
    PoolUnavailable {
        /// Why the pool couldn't be started or reached.
        reason: String,
    },

    /// Embedding model is unavailable locally and could not be downloaded.
    #[error("embedding model unavailable: {reason}")]
    ModelUnavailable {
        /// Why the model couldn't be loaded.
        reason: String,
    },

    // ---- Fatal (system cannot operate) ----
    /// Database corruption detected. Requires reindex.
    #[error("database corruption: {details}")]
    DatabaseCorruption {
        /// Diagnostic details.
        details: String,
    },

    /// Another writer already holds the project lock.
    #[error("project locked by pid {holder_pid}: {details}")]
    WriterLockHeld {
        /// PID recorded in the lock file.
        holder_pid: u32,
        /// Diagnostic details.
        details: String,
    },

    /// Not enough disk space to continue indexing.
    #[error("insufficient disk space: {available_mb}MB available, {required_mb}MB required")]
    InsufficientDisk {
        /// Available space in megabytes.
        available_mb: u64,
        /// Required space in megabytes.
        required_mb: u64,
    },

    /// Configuration is invalid or missing required fields.
    #[error("configuration error: {details}")]
    Config {
        /// What's wrong with the config.
        details: String,
    },

    /// The lock file exists but its holder is gone (stale PID or stale
    /// start time); safe to break and re-acquire.
    #[error("stale writer lock: {details}")]
    LockStale {
        /// Diagnostic details.
        details: String,
    },

    /// A file disappeared between directory walk and read.
    #[error("file vanished during sync: {path}")]
    FileVanished {
        /// Path that disappeared.
        path: PathBuf,
    },

    /// A file exceeded the configured size ceiling and was skipped.
    #[error("file too large to index: {path} ({size_bytes} bytes)")]
    FileTooLarge {
        /// Path that was skipped.
        path: PathBuf,
        /// Observed size in bytes.
        size_bytes: u64,
    },

    /// A file's content was detected as binary and was skipped.
    #[error("file appears to be binary, skipped: {path}")]
    FileBinary {
        /// Path that was skipped.
        path: PathBuf,
    },

    /// Structural parsing failed; the chunker fell back to fixed windows.
    #[error("parse fallback for {path}: {message}")]
    ParseFallback {
        /// Path that fell back to window chunking.
        path: PathBuf,
        /// Human-readable error description.
        message: String,
    },

    /// A worker process crashed or exceeded its RSS cap and was restarted.
    #[error("worker {worker_index} restarted: {reason}")]
    WorkerRestart {
        /// Index of the worker slot that was restarted.
        worker_index: usize,
        /// Why the worker was restarted.
        reason: String,
    },

    /// No worker process was available to serve a request within the
    /// configured startup/backoff window.
    #[error("no worker available: {reason}")]
    NoWorker {
        /// Why no worker could serve the request.
        reason: String,
    },

    /// A request to a worker process did not complete before its timeout.
    #[error("worker request timed out after {elapsed_ms}ms")]
    WorkerTimeout {
        /// How long the request waited before timing out.
        elapsed_ms: u64,
    },

    /// The on-disk store schema does not match what this binary expects.
    #[error("schema mismatch: {details}")]
    SchemaMismatch {
        /// Diagnostic details.
        details: String,
    },

    /// The operation was cancelled (shutdown requested mid-flight).
    #[error("operation cancelled")]
    Cancelled,

    // ---- Wrapped external errors ----
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience type alias for Results in osgrep-core.
pub type OsgrepResult<T> = Result<T, OsgrepError>;

impl OsgrepError {
    /// Whether this error leaves the system able to keep serving degraded
    /// (keyword-only) search rather than failing the whole operation.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            OsgrepError::PoolUnavailable { .. } | OsgrepError::ModelUnavailable { .. }
        )
    }

    /// Whether this error is fatal to the current process and should stop
    /// indexing rather than being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OsgrepError::DatabaseCorruption { .. }
                | OsgrepError::WriterLockHeld { .. }
                | OsgrepError::InsufficientDisk { .. }
                | OsgrepError::Config { .. }
                | OsgrepError::SchemaMismatch { .. }
        )
    }

    /// Whether this error is per-item recoverable: the rest of a batch or
    /// sync pass should continue rather than aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            OsgrepError::Parse { .. }
                | OsgrepError::Embed { .. }
                | OsgrepError::FileVanished { .. }
                | OsgrepError::FileTooLarge { .. }
                | OsgrepError::FileBinary { .. }
                | OsgrepError::ParseFallback { .. }
        )
    }
}

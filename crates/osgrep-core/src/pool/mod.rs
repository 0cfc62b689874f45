//! Process-isolated embedding worker pool.
//!
//! ONNX Runtime sessions are not safe to share across sibling threads in
//! this host process, and a segfault or OOM inside the runtime must not
//! take down the indexing run driving it. So every worker is a separate
//! OS process (`osgrep-worker`, see `src/bin/osgrep_worker.rs`), spoken to
//! over a length-prefixed bincode pipe (`protocol`). This module owns the
//! manager side: spawning, round-robin dispatch, timeouts, and the
//! crash-restart loop.
//!
//! ## Worker lifecycle
//!
//! ```text
//! SPAWNING -> READY -> BUSY -> READY -> ... -> DRAINING -> DEAD
//!                         \-----------------------------/
//!                          (crash, timeout, or RSS recycle)
//! ```
//!
//! A worker that crashes, times out, or exceeds `max_rss_mb` is killed and
//! replaced, subject to `restart_cooldown_ms` and
//! `max_consecutive_restarts` -- a slot that can't stay up gives up and
//! runs permanently degraded rather than hot-looping.

pub mod protocol;
pub mod worker;

use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::{EmbeddingConfig, IndexingConfig, PoolConfig};
use crate::error::{OsgrepError, OsgrepResult};
use crate::types::{Chunk, ColbertGrid, Language};
use protocol::{
    read_frame, write_frame, HybridEmbedding, QueryEncoding, WorkerRequest, WorkerRequestKind,
    WorkerResponseKind,
};

/// Where a worker slot is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Child process started, models not yet confirmed loaded.
    Spawning,
    /// Idle and able to take the next request.
    Ready,
    /// Currently processing one request.
    Busy,
    /// Told to shut down, waiting for the child to exit.
    Draining,
    /// Exited and not scheduled for restart (gave up after too many
    /// consecutive crashes within the cooldown window).
    Dead,
}

struct Job {
    kind: WorkerRequestKind,
    reply: oneshot::Sender<OsgrepResult<WorkerResponseKind>>,
}

/// One worker slot: the channel to its actor thread plus lifecycle state
/// shared between the dispatcher and the thread's crash-restart loop.
struct WorkerSlot {
    index: usize,
    job_tx: Mutex<Option<std::sync::mpsc::SyncSender<Job>>>,
    state: Mutex<WorkerState>,
    consecutive_restarts: Mutex<u32>,
    last_restart: Mutex<Option<Instant>>,
}

/// Manages a fixed-size pool of worker processes and dispatches RPCs to
/// them round-robin. Cloning is cheap -- internally reference-counted.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    slots: Vec<Arc<WorkerSlot>>,
    next: AtomicUsize,
    pool_config: PoolConfig,
    embedding_config: EmbeddingConfig,
    indexing_config: IndexingConfig,
    worker_binary: std::path::PathBuf,
}

impl WorkerPool {
    /// Spawn `pool_config.worker_count` worker processes (or exactly one,
    /// ignoring the configured count, if `OSGREP_SINGLE_WORKER` is set --
    /// useful for debugging and for CI sandboxes with a tight process
    /// ulimit).
    pub fn spawn(
        pool_config: PoolConfig,
        embedding_config: EmbeddingConfig,
        indexing_config: IndexingConfig,
    ) -> OsgrepResult<Self> {
        let worker_binary = locate_worker_binary()?;
        let worker_count = if pool_config.single_worker { 1 } else { pool_config.worker_count.max(1) };

        let mut slots = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let slot = Arc::new(WorkerSlot {
                index,
                job_tx: Mutex::new(None),
                state: Mutex::new(WorkerState::Spawning),
                consecutive_restarts: Mutex::new(0),
                last_restart: Mutex::new(None),
            });
            start_worker_thread(slot.clone(), worker_binary.clone(), pool_config.clone());
            slots.push(slot);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                next: AtomicUsize::new(0),
                pool_config,
                embedding_config,
                indexing_config,
                worker_binary,
            }),
        })
    }

    /// Number of worker slots, whether or not they're currently alive.
    pub fn worker_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Current lifecycle state of each slot, in slot order.
    pub fn states(&self) -> Vec<WorkerState> {
        self.inner.slots.iter().map(|s| *s.state.lock().unwrap_or_else(|e| e.into_inner())).collect()
    }

    /// Embed a batch of chunk texts with both encoders.
    pub async fn compute_hybrid(&self, texts: Vec<String>) -> OsgrepResult<Vec<Option<HybridEmbedding>>> {
        match self.dispatch(WorkerRequestKind::ComputeHybrid { texts }).await? {
            WorkerResponseKind::Hybrid(embs) => Ok(embs),
            other => Err(unexpected_response("ComputeHybrid", &other)),
        }
    }

    /// Encode a single search query.
    pub async fn encode_query(&self, text: String) -> OsgrepResult<QueryEncoding> {
        match self.dispatch(WorkerRequestKind::EncodeQuery { text }).await? {
            WorkerResponseKind::Query(enc) => Ok(enc),
            other => Err(unexpected_response("EncodeQuery", &other)),
        }
    }

    /// Score candidate grids against a query token matrix via MaxSim.
    pub async fn rerank(
        &self,
        query_matrix: Vec<Vec<f32>>,
        candidates: Vec<ColbertGrid>,
    ) -> OsgrepResult<Vec<f64>> {
        match self.dispatch(WorkerRequestKind::Rerank { query_matrix, candidates }).await? {
            WorkerResponseKind::RerankScores(scores) => Ok(scores),
            other => Err(unexpected_response("Rerank", &other)),
        }
    }

    /// Chunk and embed one file in a single round trip.
    pub async fn process_file(
        &self,
        path: String,
        content: String,
        hash: String,
        language: Language,
    ) -> OsgrepResult<Vec<Chunk>> {
        match self.dispatch(WorkerRequestKind::ProcessFile { path, content, hash, language }).await? {
            WorkerResponseKind::Chunks(chunks) => Ok(chunks),
            other => Err(unexpected_response("ProcessFile", &other)),
        }
    }

    /// Tell every live worker to shut down and wait briefly for them to
    /// exit. Best-effort: a worker that doesn't respond is just dropped,
    /// which kills its child process when the last handle goes away.
    pub async fn shutdown(&self) {
        let inner = self.inner.clone();
        let slots = inner.slots.clone();
        tokio::task::spawn_blocking(move || {
            for slot in &slots {
                let tx = slot.job_tx.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(tx) = tx {
                    let (reply, _rx) = oneshot::channel();
                    let _ = tx.send(Job { kind: WorkerRequestKind::Shutdown, reply });
                }
            }
        })
        .await
        .ok();
    }

    /// Dispatch one request to the next round-robin slot, with a retry
    /// against a different slot if the first pick is dead and cannot be
    /// restarted (the pool is never blocked on a single wedged worker).
    async fn dispatch(&self, kind: WorkerRequestKind) -> OsgrepResult<WorkerResponseKind> {
        let attempts = self.inner.slots.len().max(1);
        let mut last_err = OsgrepError::NoWorker { reason: "no worker slots configured".into() };

        for _ in 0..attempts {
            let i = self.inner.next.fetch_add(1, Ordering::Relaxed) % self.inner.slots.len();
            let slot = self.inner.slots[i].clone();

            if *slot.state.lock().unwrap_or_else(|e| e.into_inner()) == WorkerState::Dead {
                continue;
            }

            match self.dispatch_to_slot(&slot, kind.clone()).await {
                Ok(resp) => return Ok(resp),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn dispatch_to_slot(&self, slot: &Arc<WorkerSlot>, kind: WorkerRequestKind) -> OsgrepResult<WorkerResponseKind> {
        let tx = {
            let guard = slot.job_tx.lock().unwrap_or_else(|e| e.into_inner());
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(OsgrepError::NoWorker { reason: format!("worker {} has no channel yet", slot.index) });
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(Job { kind, reply: reply_tx }).is_err() {
            self.mark_dead_and_maybe_restart(slot);
            return Err(OsgrepError::NoWorker { reason: format!("worker {} channel closed", slot.index) });
        }

        // A slot still spawning hasn't loaded its models yet; bound the
        // wait by the (shorter) startup window rather than the per-task
        // timeout, so a caller fails fast with `NoWorker` instead of
        // waiting a full task timeout for a worker that never comes up.
        let is_spawning = *slot.state.lock().unwrap_or_else(|e| e.into_inner()) == WorkerState::Spawning;
        let timeout = if is_spawning {
            Duration::from_millis(self.inner.pool_config.startup_timeout_ms)
        } else {
            Duration::from_secs(self.inner.pool_config.task_timeout_secs)
        };
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.mark_dead_and_maybe_restart(slot);
                Err(OsgrepError::NoWorker { reason: format!("worker {} dropped the reply channel", slot.index) })
            }
            Err(_) if is_spawning => {
                tracing::warn!(worker = slot.index, startup_timeout_ms = self.inner.pool_config.startup_timeout_ms, "worker did not become ready in time");
                Err(OsgrepError::NoWorker { reason: format!("worker {} did not start within {}ms", slot.index, self.inner.pool_config.startup_timeout_ms) })
            }
            Err(_) => {
                tracing::warn!(worker = slot.index, timeout_secs = self.inner.pool_config.task_timeout_secs, "worker task timed out");
                self.mark_dead_and_maybe_restart(slot);
                Err(OsgrepError::WorkerTimeout { elapsed_ms: timeout.as_millis() as u64 })
            }
        }
    }

    fn mark_dead_and_maybe_restart(&self, slot: &Arc<WorkerSlot>) {
        *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Dead;
        *slot.job_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let cooldown = Duration::from_millis(self.inner.pool_config.restart_cooldown_ms);
        let now = Instant::now();
        {
            let mut last = slot.last_restart.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last {
                if now.duration_since(prev) < cooldown {
                    tracing::warn!(worker = slot.index, "worker crashed again before cooldown elapsed, not restarting yet");
                    return;
                }
            }
            *last = Some(now);
        }

        let mut restarts = slot.consecutive_restarts.lock().unwrap_or_else(|e| e.into_inner());
        if *restarts >= self.inner.pool_config.max_consecutive_restarts {
            tracing::error!(worker = slot.index, "worker exceeded max consecutive restarts, running degraded without this slot");
            return;
        }
        *restarts += 1;
        drop(restarts);

        tracing::info!(worker = slot.index, "restarting crashed worker");
        start_worker_thread(slot.clone(), self.inner.worker_binary.clone(), self.inner.pool_config.clone());
    }
}

fn unexpected_response(op: &str, got: &WorkerResponseKind) -> OsgrepError {
    match got {
        WorkerResponseKind::Error { message } => OsgrepError::ModelUnavailable { reason: message.clone() },
        other => OsgrepError::Internal(format!("worker returned an unexpected response for {op}: {other:?}")),
    }
}

/// Locate the `osgrep-worker` binary next to the current executable, the
/// convention a multi-binary crate's own tests and release tarball both
/// satisfy without needing `PATH` lookups.
fn locate_worker_binary() -> OsgrepResult<std::path::PathBuf> {
    let exe = std::env::current_exe().map_err(|e| OsgrepError::Internal(format!("cannot resolve current executable: {e}")))?;
    let dir = exe.parent().ok_or_else(|| OsgrepError::Internal("current executable has no parent directory".into()))?;
    let name = if cfg!(windows) { "osgrep-worker.exe" } else { "osgrep-worker" };
    let candidate = dir.join(name);
    if candidate.exists() {
        return Ok(candidate);
    }
    // Fall back to PATH resolution (cargo test/dev workflows, where the
    // worker binary lives in the same target/ dir as the test harness but
    // `current_exe` points at a deps/ subdirectory).
    Ok(std::path::PathBuf::from(name))
}

fn start_worker_thread(slot: Arc<WorkerSlot>, worker_binary: std::path::PathBuf, pool_config: PoolConfig) {
    let (job_tx, job_rx) = std::sync::mpsc::sync_channel::<Job>(1);
    *slot.job_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(job_tx);
    *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Spawning;

    std::thread::spawn(move || run_worker_actor(slot, worker_binary, pool_config, job_rx));
}

/// Body of the dedicated OS thread that owns one worker's child process
/// and serializes requests to it. Runs until the job channel closes (pool
/// dropped) or the child's stdout is closed (worker exited).
fn run_worker_actor(
    slot: Arc<WorkerSlot>,
    worker_binary: std::path::PathBuf,
    pool_config: PoolConfig,
    job_rx: std::sync::mpsc::Receiver<Job>,
) {
    let mut child = match std::process::Command::new(&worker_binary)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            tracing::error!(worker = slot.index, error = %e, "failed to spawn worker process");
            *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Dead;
            return;
        }
    };

    let mut stdin = match child.stdin.take() {
        Some(s) => s,
        None => {
            tracing::error!(worker = slot.index, "worker child has no stdin pipe");
            *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Dead;
            return;
        }
    };
    let mut stdout = match child.stdout.take() {
        Some(s) => std::io::BufReader::new(s),
        None => {
            tracing::error!(worker = slot.index, "worker child has no stdout pipe");
            *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Dead;
            return;
        }
    };

    *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Ready;

    for job in job_rx {
        *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Busy;

        let is_shutdown = matches!(job.kind, WorkerRequestKind::Shutdown);
        let request = WorkerRequest { id: uuid::Uuid::new_v4(), kind: job.kind };

        let result = write_frame(&mut stdin, &request)
            .map_err(|e| OsgrepError::Internal(format!("failed to write worker request: {e}")))
            .and_then(|()| {
                read_frame::<_, protocol::WorkerResponse>(&mut stdout)
                    .map_err(|e| OsgrepError::Internal(format!("failed to read worker response: {e}")))
            });

        let response = match result {
            Ok(Some(resp)) if resp.id == request.id => Ok(resp.kind),
            Ok(Some(_)) => Err(OsgrepError::Internal("worker response id mismatch".into())),
            Ok(None) => Err(OsgrepError::Internal("worker closed its stdout".into())),
            Err(e) => Err(e),
        };

        let worker_died = response.is_err();
        let _ = job.reply.send(response);

        if is_shutdown || worker_died {
            break;
        }

        if let Some(rss) = current_rss_mb(child.id()) {
            if rss > pool_config.max_rss_mb {
                tracing::info!(worker = slot.index, rss_mb = rss, "worker exceeded rss budget, recycling");
                break;
            }
        }

        *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Ready;
    }

    *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Draining;
    let _ = child.kill();
    let _ = child.wait();
    *slot.state.lock().unwrap_or_else(|e| e.into_inner()) = WorkerState::Dead;
    *slot.job_tx.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

/// Resident set size of `pid` in megabytes, read from `/proc` on Linux.
/// Returns `None` on any other platform or if the read fails -- callers
/// treat that as "RSS unknown, don't recycle on this signal."
#[cfg(target_os = "linux")]
fn current_rss_mb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn current_rss_mb(_pid: u32) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_worker_binary_falls_back_to_bare_name() {
        // current_exe() always resolves in a test binary, so this mostly
        // exercises the "candidate doesn't exist next to current_exe"
        // fallback path rather than failing outright.
        let result = locate_worker_binary();
        assert!(result.is_ok());
    }

    #[test]
    fn worker_state_equality() {
        assert_eq!(WorkerState::Ready, WorkerState::Ready);
        assert_ne!(WorkerState::Ready, WorkerState::Busy);
    }
}

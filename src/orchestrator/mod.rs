//! Orchestrator (spec C6): phase state machine, tick loop, concurrency cap,
//! retry/backoff, and cross-profile sequencing.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::audit::{AuditEvent, AuditLog};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::copyjob::{self, CopyOptions, CopyTool, Job};
use crate::model::chunk::{Chunk, ChunkStatus};

/// Phase state machine (spec §4.6). Terminal states: `Complete`, `Stopped`,
/// `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Planning,
    Replicating,
    Paused,
    Stopping,
    Stopped,
    Complete,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Stopped | Phase::Failed)
    }

    /// Legal transitions per spec §4.6. Kept explicit (rather than allowing
    /// any assignment) the same way the teacher's `QueueStore` rejects
    /// invalid status transitions instead of mutating blindly.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Planning)
                | (Planning, Replicating)
                | (Replicating, Paused)
                | (Paused, Replicating)
                | (Replicating, Stopping)
                | (Stopping, Stopped)
                | (Replicating, Complete)
                | (_, Failed)
        )
    }
}

#[derive(Debug, Clone)]
pub struct ErrorMessage {
    pub chunk_id: Option<u64>,
    pub message: String,
}

/// Default retry policy: exponential backoff, base 5s, capped at 300s
/// (spec §4.6).
pub fn backoff(retry_count: u32) -> Duration {
    let base = 5u64;
    let capped_exp = retry_count.saturating_sub(1).min(10);
    let secs = base.saturating_mul(1u64 << capped_exp);
    Duration::from_secs(secs.min(300))
}

pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
    pub max_chunk_retries: u32,
    pub stop_grace_period: Duration,
    pub checkpoint_every_completions: u64,
    pub checkpoint_every: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            max_concurrent_jobs: 4,
            max_chunk_retries: 3,
            stop_grace_period: Duration::from_secs(10),
            checkpoint_every_completions: 1,
            checkpoint_every: Duration::from_secs(30),
        }
    }
}

/// Live, per-run state (spec §3 `OrchestrationState`). `chunk_queue` and
/// `active_job_ids` are single-writer structures owned by the tick loop, so a
/// plain mutex is simplest; counters are atomics because reader tasks
/// increment them from outside the tick loop (spec §5).
pub struct OrchestrationState {
    pub phase: Phase,
    pub stop_requested: Arc<std::sync::atomic::AtomicBool>,
    pub pause_requested: Arc<std::sync::atomic::AtomicBool>,
    pub chunk_queue: Mutex<VecDeque<Chunk>>,
    /// Chunk IDs with a running job. The `Job` itself (which owns the
    /// spawned child process and is therefore tied to the async runtime)
    /// lives in the driver that calls `tick`; the orchestrator only needs to
    /// know how many are in flight and which chunk IDs they belong to.
    pub active_job_ids: Mutex<std::collections::HashSet<u64>>,
    pub completed_chunks: Mutex<Vec<Chunk>>,
    pub failed_chunks: Mutex<Vec<Chunk>>,
    error_tx: Sender<ErrorMessage>,
    pub error_rx: Receiver<ErrorMessage>,
    pub completed_count: Arc<AtomicU64>,
    pub completed_chunk_bytes: Arc<AtomicU64>,
    pub completed_chunk_files: Arc<AtomicU64>,
    pub total_chunks: u64,
    pub current_profile: String,
    pub profile_index: u32,
    pub start_time: Instant,
    stopping_since: Option<Instant>,
}

impl OrchestrationState {
    pub fn new() -> Self {
        let (error_tx, error_rx) = crossbeam::channel::unbounded();
        OrchestrationState {
            phase: Phase::Idle,
            stop_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            pause_requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            chunk_queue: Mutex::new(VecDeque::new()),
            active_job_ids: Mutex::new(std::collections::HashSet::new()),
            completed_chunks: Mutex::new(Vec::new()),
            failed_chunks: Mutex::new(Vec::new()),
            error_tx,
            error_rx,
            completed_count: Arc::new(AtomicU64::new(0)),
            completed_chunk_bytes: Arc::new(AtomicU64::new(0)),
            completed_chunk_files: Arc::new(AtomicU64::new(0)),
            total_chunks: 0,
            current_profile: String::new(),
            profile_index: 0,
            start_time: Instant::now(),
            stopping_since: None,
        }
    }

    fn push_error(&self, chunk_id: Option<u64>, message: String) {
        let _ = self.error_tx.send(ErrorMessage { chunk_id, message });
    }

    fn transition(&mut self, next: Phase) {
        if self.phase.can_transition_to(next) {
            self.phase = next;
        }
    }

    /// Starts a new run: enqueues `chunks` already filtered against any
    /// checkpoint's completed set (the caller does the filtering — the
    /// orchestrator never reconciles a superset on its own, per spec §9 OQ3).
    pub fn start_run(&mut self, profile_name: &str, profile_index: u32, chunks: Vec<Chunk>) {
        self.transition(Phase::Planning);
        self.current_profile = profile_name.to_string();
        self.profile_index = profile_index;
        self.total_chunks = chunks.len() as u64;
        *self.chunk_queue.lock() = chunks.into_iter().collect();
        self.transition(Phase::Replicating);
    }

    /// Clears per-profile counters/queues but preserves phase and start
    /// time, per spec §4.6 cross-profile sequencing.
    pub fn reset_for_new_profile(&mut self) {
        self.chunk_queue.lock().clear();
        self.active_job_ids.lock().clear();
        self.completed_chunks.lock().clear();
        self.failed_chunks.lock().clear();
        self.completed_count.store(0, Ordering::SeqCst);
        self.completed_chunk_bytes.store(0, Ordering::SeqCst);
        self.completed_chunk_files.store(0, Ordering::SeqCst);
        self.total_chunks = 0;
        self.stopping_since = None;
        self.phase = Phase::Planning;
    }

    fn now_epoch_secs() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Observes `stop_requested`/`pause_requested` and transitions if
    /// needed — tick step 2.
    pub fn observe_flags(&mut self) {
        if self.phase.is_terminal() {
            return;
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            if matches!(self.phase, Phase::Replicating | Phase::Paused) {
                self.transition(Phase::Stopping);
                self.stopping_since = Some(Instant::now());
            }
            return;
        }
        match self.phase {
            Phase::Replicating if self.pause_requested.load(Ordering::SeqCst) => {
                self.transition(Phase::Paused);
            }
            Phase::Paused if !self.pause_requested.load(Ordering::SeqCst) => {
                self.transition(Phase::Replicating);
            }
            _ => {}
        }
    }

    /// Requeues a failed-but-retryable chunk with exponential backoff, or
    /// buries it in `failed_chunks` at retry exhaustion or when
    /// `should_retry` is false — spec §4.6.
    pub fn handle_chunk_failure(&mut self, mut chunk: Chunk, should_retry: bool, max_retries: u32, message: String) {
        self.push_error(Some(chunk.chunk_id), message.clone());
        if should_retry && chunk.retry_count < max_retries {
            chunk.retry_count += 1;
            chunk.retry_after = Some(Self::now_epoch_secs() + backoff(chunk.retry_count).as_secs());
            chunk.status = ChunkStatus::Pending;
            self.chunk_queue.lock().push_back(chunk);
        } else {
            chunk.status = ChunkStatus::Failed;
            self.failed_chunks.lock().push(chunk);
        }
    }

    pub fn handle_chunk_success(&mut self, mut chunk: Chunk, bytes: u64, files: u64) {
        chunk.status = ChunkStatus::Completed;
        self.completed_count.fetch_add(1, Ordering::SeqCst);
        self.completed_chunk_bytes.fetch_add(bytes, Ordering::SeqCst);
        self.completed_chunk_files.fetch_add(files, Ordering::SeqCst);
        self.completed_chunks.lock().push(chunk);
    }

    /// Admission step (tick step 4): pops the next eligible chunk if phase is
    /// `Replicating`, the concurrency cap allows it, and the chunk's
    /// `RetryAfter` (if any) has passed. The caller (the driver that owns the
    /// actual `Job`/child process) must call `note_job_reaped` once it
    /// observes the corresponding process exit.
    pub fn try_admit(&mut self, max_concurrent_jobs: usize) -> Option<Chunk> {
        if self.phase != Phase::Replicating {
            return None;
        }
        if self.active_job_ids.lock().len() >= max_concurrent_jobs {
            return None;
        }
        let mut queue = self.chunk_queue.lock();
        let now = Self::now_epoch_secs();
        let idx = queue.iter().position(|c| c.retry_after.map(|t| t <= now).unwrap_or(true))?;
        let chunk = queue.remove(idx)?;
        drop(queue);
        self.active_job_ids.lock().insert(chunk.chunk_id);
        Some(chunk)
    }

    /// Marks a chunk's job as reaped, freeing a concurrency slot. Must be
    /// called exactly once per chunk returned by `try_admit`.
    pub fn note_job_reaped(&mut self, chunk_id: u64) {
        self.active_job_ids.lock().remove(&chunk_id);
    }

    /// Returns true once the chunk queue and active jobs have both drained —
    /// the `Complete` condition of spec §4.6 (also used, during `Stopping`,
    /// to detect the drain that allows `Stopped`).
    pub fn is_drained(&self) -> bool {
        self.chunk_queue.lock().is_empty() && self.active_job_ids.lock().is_empty()
    }

    /// Tick step 1/5/6 glue: call after reap+admit to advance to a terminal
    /// phase when appropriate.
    pub fn maybe_finish(&mut self) {
        match self.phase {
            Phase::Replicating if self.is_drained() => {
                self.transition(Phase::Complete);
            }
            Phase::Stopping if self.active_job_ids.lock().is_empty() => {
                self.transition(Phase::Stopped);
            }
            _ => {}
        }
    }

    /// Whether the grace period for a `Stopping` phase has elapsed, meaning
    /// in-flight jobs should now be forcibly killed rather than awaited.
    pub fn grace_period_elapsed(&self, grace: Duration) -> bool {
        match self.stopping_since {
            Some(since) => since.elapsed() >= grace,
            None => false,
        }
    }

    /// Parses `job`'s log, classifies its exit, and routes it to
    /// success/failure bookkeeping — the reap half of tick step 3.
    async fn reap_job(&mut self, audit: Option<&AuditLog>, job: Job, exit_code: i32, max_chunk_retries: u32) {
        let chunk_id = job.chunk.chunk_id;
        let log_contents = tokio::fs::read_to_string(&job.log_path).await.unwrap_or_default();
        let stats = copyjob::parse_log(&log_contents);
        let class = copyjob::classify_exit(exit_code, &stats);

        self.note_job_reaped(chunk_id);

        match class.severity {
            copyjob::Severity::Success | copyjob::Severity::Warning => {
                if let Some(audit) = audit {
                    audit.write_audit(AuditEvent::ChunkComplete {
                        chunk_id,
                        bytes: stats.bytes_copied,
                        files: stats.files_copied,
                    });
                }
                self.handle_chunk_success(job.chunk, stats.bytes_copied, stats.files_copied);
            }
            copyjob::Severity::Error | copyjob::Severity::Fatal => {
                if let Some(audit) = audit {
                    audit.write_audit(AuditEvent::ChunkFailed {
                        chunk_id,
                        message: class.message.clone(),
                    });
                }
                self.handle_chunk_failure(job.chunk, class.should_retry, max_chunk_retries, class.message);
            }
        }
    }

    /// Folds current counters into `checkpoint` and persists it, logging
    /// (never propagating) a write failure — tick step 6.
    fn save_checkpoint(&self, store: &CheckpointStore, checkpoint: &mut Checkpoint, audit: Option<&AuditLog>) {
        // Union with the paths already on `checkpoint` rather than replacing
        // them outright: that set may carry completions from earlier,
        // already-finished sessions (resumed via `completed_set` at
        // `execute_profile` start), and `self.completed_chunks` only ever
        // holds this session's own completions.
        let mut paths: std::collections::HashSet<String> =
            checkpoint.completed_chunk_paths.iter().cloned().collect();
        paths.extend(self.completed_chunks.lock().iter().map(|c| c.source_path.as_str().to_string()));
        checkpoint.completed_chunk_paths = paths.into_iter().collect();
        checkpoint.completed_count = checkpoint.completed_chunk_paths.len() as u64;
        checkpoint.failed_count = self.failed_chunks.lock().len() as u64;

        if let Err(e) = store.save(checkpoint) {
            tracing::warn!(profile = %checkpoint.current_profile_name, "failed to save checkpoint: {e}");
        } else if let Some(audit) = audit {
            audit.write_audit(AuditEvent::CheckpointSaved {
                profile: checkpoint.current_profile_name.clone(),
            });
        }
    }

    /// Runs one full tick (spec §4.6's six steps: observe flags, reap
    /// finished jobs, kill on grace-period expiry, admit new jobs, advance
    /// to a terminal phase if drained, save a checkpoint if due) and returns
    /// a summary of what happened. The driver (the CLI's run loop, or a
    /// test harness) owns the sleep between ticks and the loop-until-
    /// terminal condition; `tick` itself never sleeps or loops, so both can
    /// call the exact same function instead of maintaining parallel copies
    /// of this logic.
    pub async fn tick(&mut self, ctx: &mut TickContext<'_>) -> TickOutcome {
        if self.phase.is_terminal() {
            return TickOutcome::default();
        }

        self.observe_flags();

        let mut reaped = 0usize;
        let active_ids: Vec<u64> = ctx.jobs.keys().copied().collect();
        for chunk_id in active_ids {
            let exited = {
                let job = ctx.jobs.get_mut(&chunk_id).expect("chunk_id came from jobs.keys()");
                job.try_wait().await
            };
            match exited {
                Ok(Some(status)) => {
                    let job = ctx.jobs.remove(&chunk_id).expect("chunk_id came from jobs.keys()");
                    self.reap_job(ctx.audit, job, status.code().unwrap_or(-1), ctx.max_chunk_retries).await;
                    reaped += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(chunk_id, "error polling copy job: {e}");
                }
            }
        }

        if matches!(self.phase, Phase::Stopping) && self.grace_period_elapsed(ctx.stop_grace_period) {
            for job in ctx.jobs.values_mut() {
                let _ = job.kill().await;
            }
        }

        let mut admitted = 0usize;
        while let Some(chunk) = self.try_admit(ctx.max_concurrent_jobs) {
            let log_path = (ctx.log_path_for)(chunk.chunk_id);
            if let Some(audit) = ctx.audit {
                audit.write_audit(AuditEvent::ChunkStart {
                    chunk_id: chunk.chunk_id,
                    source_path: chunk.source_path.as_str().to_string(),
                });
            }
            let chunk_id = chunk.chunk_id;
            match copyjob::start_job(ctx.copy_tool, chunk.clone(), log_path, ctx.copy_options).await {
                Ok(job) => {
                    ctx.jobs.insert(chunk_id, job);
                    admitted += 1;
                }
                Err(e) => {
                    self.note_job_reaped(chunk_id);
                    self.handle_chunk_failure(chunk, e.should_retry(), ctx.max_chunk_retries, e.to_string());
                }
            }
        }

        self.maybe_finish();

        let completed_count = self.completed_count.load(Ordering::SeqCst);
        let due_by_count =
            completed_count.saturating_sub(*ctx.last_checkpoint_count) >= ctx.checkpoint_every_completions;
        let due_by_time = ctx.last_checkpoint_at.elapsed() >= ctx.checkpoint_every;
        let checkpoint_saved = (due_by_count || due_by_time) && completed_count != *ctx.last_checkpoint_count;
        if checkpoint_saved {
            self.save_checkpoint(ctx.checkpoint_store, ctx.checkpoint, ctx.audit);
            *ctx.last_checkpoint_count = completed_count;
            *ctx.last_checkpoint_at = Instant::now();
        }

        TickOutcome {
            admitted,
            reaped,
            checkpoint_saved,
        }
    }

    /// Persists a final checkpoint (or deletes it, if the run finished
    /// clean with nothing failed) — called once after the tick loop exits,
    /// not part of `tick` itself since it only runs at most once per run.
    pub fn finalize_checkpoint(&self, store: &CheckpointStore, checkpoint: &mut Checkpoint, audit: Option<&AuditLog>) -> usize {
        let failed_chunks = self.failed_chunks.lock().len();
        if self.phase == Phase::Complete && failed_chunks == 0 {
            let _ = store.delete(&checkpoint.current_profile_name);
        } else {
            self.save_checkpoint(store, checkpoint, audit);
        }
        failed_chunks
    }
}

/// Summary of what a single `tick` call did, for callers that want to
/// assert tick-level behavior directly instead of polling state (spec
/// §4.6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub admitted: usize,
    pub reaped: usize,
    pub checkpoint_saved: bool,
}

/// Everything a single `tick` call needs that the driver (CLI or test
/// harness) owns rather than `OrchestrationState` itself: the live job
/// table, the copy-tool capability, and checkpoint bookkeeping.
pub struct TickContext<'a> {
    pub jobs: &'a mut HashMap<u64, Job>,
    pub copy_tool: &'a dyn CopyTool,
    pub copy_options: &'a CopyOptions,
    pub max_concurrent_jobs: usize,
    pub max_chunk_retries: u32,
    pub stop_grace_period: Duration,
    pub checkpoint_store: &'a CheckpointStore,
    pub checkpoint: &'a mut Checkpoint,
    pub checkpoint_every_completions: u64,
    pub checkpoint_every: Duration,
    pub last_checkpoint_count: &'a mut u64,
    pub last_checkpoint_at: &'a mut Instant,
    pub audit: Option<&'a AuditLog>,
    pub log_path_for: &'a dyn Fn(u64) -> PathBuf,
}

impl Default for OrchestrationState {
    fn default() -> Self {
        Self::new()
    }
}

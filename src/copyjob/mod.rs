//! Copy-job runner (spec C5): launches one external copy process for one
//! chunk, surfaces progress, parses final stats, and classifies the exit.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use crossbeam::channel::{Receiver, Sender};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

use crate::error::RobocurseError;
use crate::model::chunk::Chunk;

/// Options threaded down to the copy tool's command line (spec §6).
#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    pub thread_count: u32,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    pub retry_count: u32,
    pub retry_wait_secs: u32,
}

/// Capability interface over the external copy tool (spec §9: "polymorphism
/// over copy-tool ... keep the orchestrator generic over them to enable test
/// doubles").
pub trait CopyTool: Send + Sync {
    fn spawn(
        &self,
        chunk: &Chunk,
        log_path: &Path,
        options: &CopyOptions,
    ) -> std::io::Result<Child>;
}

/// Default implementation shelling out to the external copy tool named by
/// `program` (e.g. the path to a robocopy-compatible binary).
pub struct ExternalCopyTool {
    pub program: String,
}

impl CopyTool for ExternalCopyTool {
    fn spawn(
        &self,
        chunk: &Chunk,
        log_path: &Path,
        options: &CopyOptions,
    ) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(chunk.source_path.as_str());
        cmd.arg(chunk.destination_path.as_str());
        if chunk.is_files_only {
            cmd.arg("/LEV:1");
        }
        cmd.arg(format!("/MT:{}", options.thread_count.max(1)));
        for pattern in &options.exclude_patterns {
            cmd.arg("/XF").arg(pattern);
        }
        for pattern in &options.include_patterns {
            cmd.arg("/IF").arg(pattern);
        }
        cmd.arg(format!("/R:{}", options.retry_count));
        cmd.arg(format!("/W:{}", options.retry_wait_secs));
        cmd.arg(format!("/LOG:{}", log_path.display()));
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.spawn()
    }
}

/// Owns the spawned child process and logs any abnormal exit the tick loop
/// never got around to reaping — analogous to how the teacher's
/// `HistoryStore` ties lock release to `Drop` on its lock file, but here the
/// `Drop` impl observes and reports rather than silently releasing.
struct JobGuard {
    child: Child,
    chunk_id: u64,
    reaped: bool,
}

impl JobGuard {
    fn new(child: Child, chunk_id: u64) -> Self {
        JobGuard {
            child,
            chunk_id,
            reaped: false,
        }
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        match self.child.try_wait() {
            Ok(Some(status)) if !status.success() => {
                tracing::warn!(
                    chunk_id = self.chunk_id,
                    ?status,
                    "copy job exited abnormally and was never reaped by the tick loop"
                );
            }
            Ok(None) => {
                tracing::warn!(
                    chunk_id = self.chunk_id,
                    "copy job dropped while still running; killing unreaped process"
                );
                let _ = self.child.start_kill();
            }
            _ => {}
        }
    }
}

/// A started copy job. `progress_rx` yields the copy tool's stdout lines as
/// they arrive (best-effort live updates); final stats come from the log
/// after the process exits, never from this buffer.
pub struct Job {
    pub chunk: Chunk,
    pub start_time: Instant,
    pub log_path: PathBuf,
    pub progress_rx: Receiver<String>,
    guard: JobGuard,
}

impl Job {
    /// Polls whether the underlying process has exited, without blocking.
    pub async fn try_wait(&mut self) -> std::io::Result<Option<std::process::ExitStatus>> {
        let result = self.guard.child.try_wait();
        if matches!(result, Ok(Some(_))) {
            self.guard.reaped = true;
        }
        result
    }

    /// Forcibly terminates the process. The orchestrator calls this after
    /// `StopGracePeriod` elapses without the process exiting on its own;
    /// there is no portable graceful-stop signal available without an extra
    /// process-signaling dependency, so cancellation here is kill-only.
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.guard.child.kill().await?;
        self.guard.reaped = true;
        Ok(())
    }
}

const PROGRESS_BUFFER_CAPACITY: usize = 256;

/// Launches `chunk` via `tool`, returning a `Job` whose stdout is streamed
/// into a bounded channel by a background reader task.
pub async fn start_job(
    tool: &dyn CopyTool,
    chunk: Chunk,
    log_path: PathBuf,
    options: &CopyOptions,
) -> Result<Job, RobocurseError> {
    let mut child = tool
        .spawn(&chunk, &log_path, options)
        .map_err(|e| RobocurseError::CopyTransient {
            chunk_id: chunk.chunk_id,
            message: e.to_string(),
        })?;

    let stdout = child.stdout.take();
    let (tx, rx): (Sender<String>, Receiver<String>) =
        crossbeam::channel::bounded(PROGRESS_BUFFER_CAPACITY);

    if let Some(stdout) = stdout {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                // Bounded channel: if the reader falls behind, drop the
                // oldest-pending line rather than block the copy process.
                if tx.try_send(line).is_err() {
                    let _ = tx.try_recv();
                }
            }
        });
    }

    let chunk_id = chunk.chunk_id;
    Ok(Job {
        chunk,
        start_time: Instant::now(),
        log_path,
        progress_rx: rx,
        guard: JobGuard::new(child, chunk_id),
    })
}

/// Final counts parsed from the copy tool's statistics table (spec §6).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub dirs_total: u64,
    pub dirs_copied: u64,
    pub files_total: u64,
    pub files_copied: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub bytes_total: u64,
    pub bytes_copied: u64,
    pub error_lines: Vec<String>,
    pub parse_success: bool,
}

/// Resilient to locale-variant whitespace; never throws, returns
/// `parse_success = false` on unrecognized logs (spec §6).
pub fn parse_log(contents: &str) -> LogStats {
    let mut stats = LogStats::default();
    let mut rows: HashMap<&str, Vec<u64>> = HashMap::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        for (key, field) in [("Dirs", "dirs"), ("Files", "files"), ("Bytes", "bytes")] {
            if trimmed.starts_with(key) {
                let numbers: Vec<u64> = trimmed
                    .split_whitespace()
                    .skip(1)
                    .filter_map(|tok| tok.replace(',', "").parse::<u64>().ok())
                    .collect();
                if !numbers.is_empty() {
                    rows.insert(field, numbers);
                }
            }
        }
        if trimmed.to_uppercase().contains("ERROR") {
            stats.error_lines.push(trimmed.to_string());
        }
    }

    if let Some(dirs) = rows.get("dirs") {
        stats.dirs_total = dirs.first().copied().unwrap_or(0);
        stats.dirs_copied = dirs.get(1).copied().unwrap_or(0);
    }
    if let Some(files) = rows.get("files") {
        stats.files_total = files.first().copied().unwrap_or(0);
        stats.files_copied = files.get(1).copied().unwrap_or(0);
        stats.files_skipped = files.get(2).copied().unwrap_or(0);
        stats.files_failed = files.get(4).copied().unwrap_or(0);
    }
    if let Some(bytes) = rows.get("bytes") {
        stats.bytes_total = bytes.first().copied().unwrap_or(0);
        stats.bytes_copied = bytes.get(1).copied().unwrap_or(0);
    }

    stats.parse_success = !rows.is_empty();
    stats
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Warning,
    Error,
    Fatal,
}

#[derive(Debug, Clone)]
pub struct ExitClass {
    pub severity: Severity,
    pub message: String,
    pub should_retry: bool,
    pub fatal: bool,
}

const BIT_FILES_COPIED: i32 = 0x01;
const BIT_EXTRAS: i32 = 0x02;
const BIT_MISMATCH: i32 = 0x04;
const BIT_COPY_ERRORS: i32 = 0x08;
const BIT_FATAL: i32 = 0x10;

/// Implements spec §6's bit-flag classification table, with the log's error
/// lines (not the exit code alone) used to detect the non-retryable
/// permission-error carve-out.
pub fn classify_exit(code: i32, log: &LogStats) -> ExitClass {
    let is_permission_error = log
        .error_lines
        .iter()
        .any(|line| line.to_lowercase().contains("access is denied") || line.to_lowercase().contains("permission denied"));

    let severity = if code & BIT_FATAL != 0 {
        Severity::Fatal
    } else if code & BIT_COPY_ERRORS != 0 {
        Severity::Error
    } else if code & (BIT_EXTRAS | BIT_MISMATCH) != 0 {
        Severity::Warning
    } else if code & !BIT_FILES_COPIED == 0 {
        Severity::Success
    } else {
        Severity::Warning
    };

    let should_retry = matches!(severity, Severity::Fatal | Severity::Error) && !is_permission_error;

    let message = match severity {
        Severity::Success => "copy completed".to_string(),
        Severity::Warning => "copy completed with extras or mismatches".to_string(),
        Severity::Error if is_permission_error => "permission denied".to_string(),
        Severity::Error => "copy reported errors".to_string(),
        Severity::Fatal => "fatal copy error".to_string(),
    };

    ExitClass {
        severity,
        message,
        should_retry,
        fatal: matches!(severity, Severity::Fatal),
    }
}

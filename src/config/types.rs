use serde::{Deserialize, Serialize};

use crate::model::chunk::ScanMode;

/// Verbosity level controlling tracing output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Suppress all output except errors
    Quiet,
    /// Normal output (info level)
    Normal,
    /// Verbose output (debug level)
    Verbose,
    /// Maximum output (trace level)
    Trace,
}

impl From<(bool, u8)> for Verbosity {
    /// Convert from (quiet_flag, verbose_count) to Verbosity.
    ///
    /// - quiet=true -> Quiet (regardless of verbose count)
    /// - verbose=0  -> Normal
    /// - verbose=1  -> Verbose
    /// - verbose=2+ -> Trace
    fn from((quiet, verbose_count): (bool, u8)) -> Self {
        if quiet {
            Verbosity::Quiet
        } else {
            match verbose_count {
                0 => Verbosity::Normal,
                1 => Verbosity::Verbose,
                _ => Verbosity::Trace,
            }
        }
    }
}

impl Verbosity {
    /// Return the tracing filter string for this verbosity level.
    pub fn as_tracing_filter(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "error",
            Verbosity::Normal => "info",
            Verbosity::Verbose => "debug",
            Verbosity::Trace => "trace",
        }
    }
}

/// One profile entry from the TOML config file (spec §3 `Profile`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConfig {
    pub name: String,
    pub source: String,
    pub destination: String,
    #[serde(default = "default_scan_mode")]
    pub scan_mode: ScanMode,
    #[serde(default = "default_chunk_max_size_bytes")]
    pub chunk_max_size_bytes: u64,
    #[serde(default = "default_chunk_max_files")]
    pub chunk_max_files: u64,
    #[serde(default = "default_chunk_max_depth")]
    pub chunk_max_depth: u32,
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,
    #[serde(default)]
    pub use_snapshot: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub include_patterns: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

fn default_scan_mode() -> ScanMode {
    ScanMode::Smart
}
fn default_chunk_max_size_bytes() -> u64 {
    crate::model::chunk::MIN_CHUNK_MAX_SIZE_BYTES * 100
}
fn default_chunk_max_files() -> u64 {
    50_000
}
fn default_chunk_max_depth() -> u32 {
    5
}
fn default_min_size_bytes() -> u64 {
    1024
}
fn default_enabled() -> bool {
    true
}

/// Run-wide settings from the TOML config file's `[settings]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    pub log_root: Option<String>,
    #[serde(default = "default_checkpoint_interval_completions")]
    pub checkpoint_interval_completions: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_max_chunk_retries")]
    pub max_chunk_retries: u32,
    #[serde(default = "default_stop_grace_period_secs")]
    pub stop_grace_period_secs: u64,
    #[serde(default = "default_compress_after_days")]
    pub compress_after_days: i64,
    #[serde(default = "default_delete_after_days")]
    pub delete_after_days: i64,
    #[serde(default = "default_drive_letter_candidates")]
    pub drive_letter_candidates: Vec<char>,
    /// Path (or bare name, resolved via `PATH`) of the external copy tool
    /// the job runner shells out to (spec §6). Defaults to a
    /// robocopy-compatible binary name; any tool meeting the §6 contract
    /// may be substituted.
    #[serde(default = "default_copy_tool_program")]
    pub copy_tool_program: String,
    #[serde(default = "default_copy_thread_count")]
    pub copy_thread_count: u32,
    #[serde(default = "default_copy_retry_count")]
    pub copy_retry_count: u32,
    #[serde(default = "default_copy_retry_wait_secs")]
    pub copy_retry_wait_secs: u32,
}

fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_checkpoint_interval_completions() -> u64 {
    1
}
fn default_checkpoint_interval_secs() -> u64 {
    30
}
fn default_max_chunk_retries() -> u32 {
    3
}
fn default_stop_grace_period_secs() -> u64 {
    10
}
fn default_compress_after_days() -> i64 {
    30
}
fn default_delete_after_days() -> i64 {
    90
}
fn default_drive_letter_candidates() -> Vec<char> {
    ('D'..='Z').rev().collect()
}
fn default_copy_tool_program() -> String {
    "robocopy".to_string()
}
fn default_copy_thread_count() -> u32 {
    8
}
fn default_copy_retry_count() -> u32 {
    1
}
fn default_copy_retry_wait_secs() -> u32 {
    1
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            log_root: None,
            checkpoint_interval_completions: default_checkpoint_interval_completions(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            max_chunk_retries: default_max_chunk_retries(),
            stop_grace_period_secs: default_stop_grace_period_secs(),
            compress_after_days: default_compress_after_days(),
            delete_after_days: default_delete_after_days(),
            drive_letter_candidates: default_drive_letter_candidates(),
            copy_tool_program: default_copy_tool_program(),
            copy_thread_count: default_copy_thread_count(),
            copy_retry_count: default_copy_retry_count(),
            copy_retry_wait_secs: default_copy_retry_wait_secs(),
        }
    }
}

/// Top-level parsed config file: profiles plus the `[settings]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RobocurseConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, rename = "profile")]
    pub profiles: Vec<ProfileConfig>,
}

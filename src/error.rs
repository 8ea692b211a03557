use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RobocurseError {
    #[error("Invalid configuration: {field}: {reason}")]
    ConfigInvalid { field: String, reason: String },

    #[error("Source unavailable: {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("Failed to enumerate subtree {}: {reason}", path.display())]
    SubtreeEnumFailed { path: PathBuf, reason: String },

    #[error("Transient copy failure for chunk {chunk_id}: {message}")]
    CopyTransient { chunk_id: u64, message: String },

    #[error("Copy failed for chunk {chunk_id}: {message}")]
    CopyPermanent { chunk_id: u64, message: String },

    #[error("Checkpoint unreadable for profile '{profile}': {reason}")]
    CheckpointUnreadable { profile: String, reason: String },

    #[error("Failed to write checkpoint for profile '{profile}': {reason}")]
    CheckpointWriteFailed { profile: String, reason: String },

    #[error("Snapshot unavailable for {}: {reason}", path.display())]
    SnapshotUnavailable { path: PathBuf, reason: String },

    #[error("Path {} is not under base {}", child.display(), base.display())]
    PathNotUnderBase { base: PathBuf, child: PathBuf },

    #[error("No drive letter available from candidate set {candidates:?}")]
    DriveLetterExhausted { candidates: Vec<char> },

    #[error("Failed to write log: {0}")]
    LogWriteFailed(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RobocurseError {
    /// Returns a user-friendly suggestion for how to fix the error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            RobocurseError::ConfigInvalid { .. } => {
                Some("Check the named field in your profile configuration.")
            }
            RobocurseError::SourceUnavailable { .. } => {
                Some("Check the source path exists and is reachable.")
            }
            RobocurseError::SubtreeEnumFailed { .. } => {
                Some("Check permissions on the named subdirectory; the run will continue without it.")
            }
            RobocurseError::CopyTransient { .. } => {
                Some("This chunk will be retried automatically with backoff.")
            }
            RobocurseError::CopyPermanent { .. } => {
                Some("Check the copy tool's log for this chunk for the underlying cause.")
            }
            RobocurseError::CheckpointUnreadable { .. } => {
                Some("The run will proceed from scratch for this profile.")
            }
            RobocurseError::CheckpointWriteFailed { .. } => {
                Some("Check disk space and permissions on the log root; the next checkpoint will retry.")
            }
            RobocurseError::SnapshotUnavailable { .. } => {
                Some("Configure a snapshot provider, or disable UseSnapshot for this profile.")
            }
            RobocurseError::PathNotUnderBase { .. } => {
                Some("This indicates a mismatched source/destination root; check profile configuration.")
            }
            RobocurseError::DriveLetterExhausted { .. } => {
                Some("Free a mounted drive letter or widen the candidate set in configuration.")
            }
            RobocurseError::LogWriteFailed(_) => None,
            RobocurseError::Io { .. } => None,
        }
    }

    /// Kinds from spec §7 that the orchestrator should retry with backoff.
    pub fn should_retry(&self) -> bool {
        matches!(self, RobocurseError::CopyTransient { .. })
    }
}

impl From<globset::Error> for RobocurseError {
    fn from(err: globset::Error) -> Self {
        RobocurseError::ConfigInvalid {
            field: "include/exclude pattern".to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<walkdir::Error> for RobocurseError {
    fn from(err: walkdir::Error) -> Self {
        let path = err.path().map(|p| p.to_path_buf()).unwrap_or_default();
        let reason = err
            .io_error()
            .map(|e| e.to_string())
            .unwrap_or_else(|| err.to_string());
        RobocurseError::SubtreeEnumFailed { path, reason }
    }
}

impl From<serde_json::Error> for RobocurseError {
    fn from(err: serde_json::Error) -> Self {
        RobocurseError::CheckpointUnreadable {
            profile: String::new(),
            reason: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for RobocurseError {
    fn from(err: toml::de::Error) -> Self {
        RobocurseError::ConfigInvalid {
            field: "config file".to_string(),
            reason: err.to_string(),
        }
    }
}

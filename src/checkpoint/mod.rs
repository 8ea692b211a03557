//! Checkpoint store (spec C4): atomic, versioned load/save/delete of
//! per-profile completion records.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RobocurseError;

pub const CURRENT_CHECKPOINT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: String,
    pub session_id: String,
    pub profile_index: u32,
    pub current_profile_name: String,
    pub completed_chunk_paths: Vec<String>,
    pub completed_count: u64,
    pub failed_count: u64,
    pub saved_at: String,
}

impl Checkpoint {
    pub fn new(
        session_id: impl Into<String>,
        profile_index: u32,
        current_profile_name: impl Into<String>,
    ) -> Self {
        Checkpoint {
            version: CURRENT_CHECKPOINT_VERSION.to_string(),
            session_id: session_id.into(),
            profile_index,
            current_profile_name: current_profile_name.into(),
            completed_chunk_paths: Vec::new(),
            completed_count: 0,
            failed_count: 0,
            saved_at: now_iso8601(),
        }
    }

    /// Builds a hash set of completed paths for O(1) membership tests,
    /// case-folded the same way `model::path` compares paths, so resume
    /// works across case-varying re-scans on case-insensitive filesystems.
    pub fn completed_set(&self) -> CompletedSet {
        CompletedSet(
            self.completed_chunk_paths
                .iter()
                .map(|p| p.to_lowercase())
                .collect(),
        )
    }
}

fn now_iso8601() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// O(1) membership test over a checkpoint's completed chunk source paths.
pub struct CompletedSet(HashSet<String>);

impl CompletedSet {
    pub fn empty() -> Self {
        CompletedSet(HashSet::new())
    }

    pub fn contains(&self, source_path: &str) -> bool {
        self.0.contains(&source_path.to_lowercase())
    }
}

pub struct CheckpointStore {
    log_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(log_root: impl Into<PathBuf>) -> Self {
        CheckpointStore {
            log_root: log_root.into(),
        }
    }

    pub fn path_for(&self, profile_name: &str) -> PathBuf {
        self.log_root.join(format!("checkpoint-{}.json", profile_name))
    }

    /// Atomic, durable save built on [`atomic_write`]: write `<path>.tmp`,
    /// fsync it, back up any existing `<path>` to `<path>.bak`, rename
    /// `.tmp` into place, fsync the containing directory, delete `.bak`. On
    /// any failure between those steps `<path>` is left either fully old or
    /// fully new, never partial — spec §4.4.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<(), RobocurseError> {
        let path = self.path_for(&checkpoint.current_profile_name);

        let mut to_save = checkpoint.clone();
        to_save.saved_at = now_iso8601();
        let body = serde_json::to_vec_pretty(&to_save).map_err(|e| RobocurseError::CheckpointWriteFailed {
            profile: checkpoint.current_profile_name.clone(),
            reason: e.to_string(),
        })?;

        atomic_write(&path, &body).map_err(|e| RobocurseError::CheckpointWriteFailed {
            profile: checkpoint.current_profile_name.clone(),
            reason: e.to_string(),
        })
    }

    /// Never returns `Err`: any missing file, I/O error, invalid UTF-8,
    /// truncated/malformed JSON, or version mismatch is treated as "no
    /// checkpoint" per spec §4.4/§8 property 4.
    pub fn load(&self, profile_name: &str) -> Option<Checkpoint> {
        let path = self.path_for(profile_name);
        let bytes = fs::read(&path).ok()?;
        if bytes.is_empty() {
            return None;
        }
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes).ok()?;
        if checkpoint.version != CURRENT_CHECKPOINT_VERSION {
            return None;
        }
        Some(checkpoint)
    }

    /// Removes the checkpoint file; succeeds (returning `false`) when it was
    /// already absent.
    pub fn delete(&self, profile_name: &str) -> Result<bool, RobocurseError> {
        let path = self.path_for(profile_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(RobocurseError::CheckpointWriteFailed {
                profile: profile_name.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Shared atomic-write primitive (grounded in the pack's `groblegark-oddjobs`
/// `Checkpointer`: write-tmp, fsync, atomic rename): write `<path>.tmp`,
/// `fsync` it, back up any existing `<path>` to `<path>.bak`, rename `.tmp`
/// into place, `fsync` the containing directory where the platform allows
/// it, then delete `<path>.bak`. Used by [`CheckpointStore::save`] and by the
/// snapshot coordinator's orphan-tracking file, for the same
/// tolerate-a-crash-mid-write guarantee.
pub(crate) fn atomic_write(path: &Path, body: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension(tmp_extension(path));
    let bak_path = path.with_extension(bak_extension(path));

    let write_result = (|| -> std::io::Result<()> {
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(body)?;
            file.sync_all()?;
        }
        if path.exists() {
            fs::rename(path, &bak_path)?;
        }
        fs::rename(&tmp_path, path)?;
        sync_parent_dir(path)?;
        if bak_path.exists() {
            fs::remove_file(&bak_path)?;
        }
        Ok(())
    })();

    if write_result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    write_result
}

fn tmp_extension(path: &Path) -> std::ffi::OsString {
    let mut ext = path.extension().unwrap_or_default().to_os_string();
    ext.push(".tmp");
    ext
}

fn bak_extension(path: &Path) -> std::ffi::OsString {
    let mut ext = path.extension().unwrap_or_default().to_os_string();
    ext.push(".bak");
    ext
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            File::open(parent)?.sync_all()?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    // No portable directory-fsync API on this platform; the rename itself
    // is still atomic there.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_checkpoint() -> Checkpoint {
        let mut c = Checkpoint::new("test", 2, "TestProfile");
        c.completed_chunk_paths = vec![
            "/data/one.txt".to_string(),
            "/Data/TWO.txt".to_string(),
            "//share/caf\u{e9}.bin".to_string(),
        ];
        c.completed_count = 3;
        c
    }

    // S3 — checkpoint round-trip.
    #[test]
    fn s3_round_trip_modulo_saved_at() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = sample_checkpoint();

        store.save(&checkpoint).unwrap();
        let loaded = store.load("TestProfile").unwrap();

        assert_eq!(loaded.session_id, checkpoint.session_id);
        assert_eq!(loaded.profile_index, checkpoint.profile_index);
        assert_eq!(loaded.current_profile_name, checkpoint.current_profile_name);
        assert_eq!(loaded.completed_chunk_paths, checkpoint.completed_chunk_paths);
        assert_eq!(loaded.completed_count, 3);

        let saved = chrono::DateTime::parse_from_rfc3339(&loaded.saved_at).unwrap();
        let now = Utc::now();
        assert!((now.timestamp() - saved.timestamp()).abs() <= 1);
    }

    // S4 — corrupt checkpoint.
    #[test]
    fn s4_corrupt_checkpoint_returns_none_and_recovers() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let path = store.path_for("Broken");
        fs::write(&path, b"{ invalid json").unwrap();

        assert!(store.load("Broken").is_none());

        let checkpoint = Checkpoint::new("s", 0, "Broken");
        store.save(&checkpoint).unwrap();
        assert!(store.load("Broken").is_some());
    }

    #[test]
    fn robustness_matrix() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());

        // missing file
        assert!(store.load("NoSuchProfile").is_none());

        let cases: &[(&str, &[u8])] = &[
            ("empty", b""),
            ("truncated", b"{\"version\":\"1.0\",\"session_i"),
            ("invalid_json", b"not json at all"),
            ("binary_garbage", &[0xff, 0x00, 0xfe, 0x12, 0x34]),
        ];
        for (name, bytes) in cases {
            let path = store.path_for(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, bytes).unwrap();
            assert!(store.load(name).is_none(), "case {} should yield no checkpoint", name);
        }

        // version mismatch
        let mut wrong_version = Checkpoint::new("s", 0, "WrongVersion");
        wrong_version.version = "2.0".to_string();
        let path = store.path_for("WrongVersion");
        fs::write(&path, serde_json::to_vec(&wrong_version).unwrap()).unwrap();
        assert!(store.load("WrongVersion").is_none());
    }

    #[test]
    fn delete_reports_prior_existence() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        assert_eq!(store.delete("Nonexistent").unwrap(), false);

        let checkpoint = Checkpoint::new("s", 0, "ToDelete");
        store.save(&checkpoint).unwrap();
        assert_eq!(store.delete("ToDelete").unwrap(), true);
        assert!(store.load("ToDelete").is_none());
    }

    #[test]
    fn completed_set_membership_is_case_insensitive() {
        let checkpoint = sample_checkpoint();
        let set = checkpoint.completed_set();
        assert!(set.contains("/data/one.txt"));
        assert!(set.contains("/DATA/ONE.TXT"));
        assert!(!set.contains("/data/three.txt"));
    }

    #[test]
    fn save_leaves_no_tmp_file_behind_on_success() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let checkpoint = Checkpoint::new("s", 0, "Clean");
        store.save(&checkpoint).unwrap();

        let tmp_path = store.path_for("Clean").with_extension("json.tmp");
        let bak_path = store.path_for("Clean").with_extension("json.bak");
        assert!(!tmp_path.exists());
        assert!(!bak_path.exists());
    }

    // S5-adjacent (spec §8 property 5) — a save that fails partway through
    // must leave the prior checkpoint intact, never a half-written file.
    // Fault injected by making the checkpoint directory unwritable so the
    // tmp-file creation step fails, rather than a mock trait seam: `save`
    // has no injectable dependency other than the filesystem itself.
    #[test]
    #[cfg(unix)]
    fn failed_save_leaves_prior_checkpoint_intact() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        let first = Checkpoint::new("s", 0, "Locked");
        store.save(&first).unwrap();

        let original_mode = fs::metadata(dir.path()).unwrap().permissions().mode();
        let mut perms = fs::metadata(dir.path()).unwrap().permissions();
        perms.set_mode(0o500);
        fs::set_permissions(dir.path(), perms).unwrap();

        let mut second = first.clone();
        second.completed_count = 99;
        let result = store.save(&second);

        let mut restore = fs::metadata(dir.path()).unwrap().permissions();
        restore.set_mode(original_mode);
        fs::set_permissions(dir.path(), restore).unwrap();

        if result.is_ok() {
            // Running as root (e.g. in a container) defeats the permission
            // fault injection; skip rather than assert a false failure.
            return;
        }
        let loaded = store.load("Locked").unwrap();
        assert_eq!(loaded.completed_count, 0);
    }

    #[test]
    fn repeated_saves_always_produce_a_readable_file() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(dir.path());
        for i in 0..5 {
            let mut checkpoint = Checkpoint::new("s", i, "Repeated");
            checkpoint.completed_count = i as u64;
            store.save(&checkpoint).unwrap();
            let loaded = store.load("Repeated").unwrap();
            assert_eq!(loaded.completed_count, i as u64);
        }
    }
}

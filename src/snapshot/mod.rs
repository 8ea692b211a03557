//! Snapshot coordinator (spec C7): scoped snapshot acquire/release, orphan
//! reclamation, access-path exposure.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::RobocurseError;
use crate::model::path::CanonicalPath;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub snapshot_id: String,
    pub original_path: String,
    pub access_path: String,
    pub created_at: String,
}

/// Capability interface over the external snapshot provider (spec §4.7,
/// §9). Any implementation satisfying this may be plugged in; absence of a
/// provider means `UseSnapshot` profiles fail at planning time with
/// `SnapshotUnavailable`.
pub trait SnapshotProvider: Send + Sync {
    fn create(&self, source: &CanonicalPath) -> Result<SnapshotHandle, RobocurseError>;
    fn release(&self, snapshot_id: &str) -> Result<(), RobocurseError>;
    fn translate_path(&self, original: &CanonicalPath, handle: &SnapshotHandle) -> Result<CanonicalPath, RobocurseError>;
}

/// Used when no provider is configured. Any `create` call fails immediately
/// so `UseSnapshot=true` profiles surface `SnapshotUnavailable` at planning
/// time rather than at copy time, per spec §4.7.
pub struct NoSnapshotProvider;

impl SnapshotProvider for NoSnapshotProvider {
    fn create(&self, source: &CanonicalPath) -> Result<SnapshotHandle, RobocurseError> {
        Err(RobocurseError::SnapshotUnavailable {
            path: source.as_path().to_path_buf(),
            reason: "no snapshot provider configured".to_string(),
        })
    }

    fn release(&self, _snapshot_id: &str) -> Result<(), RobocurseError> {
        Ok(())
    }

    fn translate_path(&self, original: &CanonicalPath, _handle: &SnapshotHandle) -> Result<CanonicalPath, RobocurseError> {
        Ok(original.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrphanEntry {
    snapshot_id: String,
    owner_pid: u32,
    created_at: String,
}

pub struct SnapshotCoordinator<P: SnapshotProvider> {
    provider: P,
    tracking_path: PathBuf,
    /// In-process half of the tracking-file lock; an `fs2` advisory lock on
    /// `tracking_path`'s `.lock` sibling covers the cross-process half, the
    /// same split `ProfileLock` uses (spec §5: the tracking record is a
    /// single file rewritten under a named mutex on the same path prefix).
    tracking_lock: Mutex<()>,
}

impl<P: SnapshotProvider> SnapshotCoordinator<P> {
    pub fn new(provider: P, tracking_path: impl Into<PathBuf>) -> Self {
        SnapshotCoordinator {
            provider,
            tracking_path: tracking_path.into(),
            tracking_lock: Mutex::new(()),
        }
    }

    /// Creates a snapshot, translates its access path, invokes `f`, and
    /// releases the snapshot on every exit path — including when `f`
    /// returns `Err` or panics. Spec §8 property 9: exactly one `release`
    /// call is observed per `with_snapshot` invocation.
    ///
    /// `f` is async because the work done under a live snapshot (building
    /// the tree, chunking, and running the tick loop to completion) spans
    /// the orchestrator's suspension points (spec §5); the scope has to
    /// cover that whole await chain, not just a synchronous path lookup.
    pub async fn with_snapshot<T, Fut>(
        &self,
        source: &CanonicalPath,
        f: impl FnOnce(CanonicalPath) -> Fut,
    ) -> Result<T, RobocurseError>
    where
        Fut: std::future::Future<Output = Result<T, RobocurseError>>,
    {
        let handle = self.provider.create(source)?;
        self.record_tracking_entry(&handle);

        struct ReleaseGuard<'a, P: SnapshotProvider> {
            provider: &'a P,
            snapshot_id: String,
            released: bool,
        }
        impl<'a, P: SnapshotProvider> Drop for ReleaseGuard<'a, P> {
            fn drop(&mut self) {
                if !self.released {
                    let _ = self.provider.release(&self.snapshot_id);
                }
            }
        }

        let mut guard = ReleaseGuard {
            provider: &self.provider,
            snapshot_id: handle.snapshot_id.clone(),
            released: false,
        };

        let access_path = self.provider.translate_path(source, &handle)?;
        let result = f(access_path).await;

        // Mark released before the guard drops so its Drop impl is a no-op
        // here; the explicit release below is the one call whose result we
        // actually propagate to the caller. This also covers `f` panicking:
        // unwinding drops `guard` before this line runs, so the guard's own
        // release fires exactly once in that case instead.
        guard.released = true;
        drop(guard);
        self.provider.release(&handle.snapshot_id)?;
        self.remove_tracking_entry(&handle.snapshot_id);

        result
    }

    fn record_tracking_entry(&self, handle: &SnapshotHandle) {
        self.with_tracking_lock(|| {
            let mut entries = self.read_tracking_entries();
            entries.insert(
                handle.snapshot_id.clone(),
                OrphanEntry {
                    snapshot_id: handle.snapshot_id.clone(),
                    owner_pid: std::process::id(),
                    created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                },
            );
            let _ = self.write_tracking_entries(&entries);
        });
    }

    fn remove_tracking_entry(&self, snapshot_id: &str) {
        self.with_tracking_lock(|| {
            let mut entries = self.read_tracking_entries();
            entries.remove(snapshot_id);
            let _ = self.write_tracking_entries(&entries);
        });
    }

    /// Holds the in-process mutex plus an `fs2` advisory lock on the
    /// tracking path's `.lock` sibling for the duration of `f`, so the
    /// read-modify-write inside never races another thread or process doing
    /// the same (spec §5).
    fn with_tracking_lock<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.tracking_lock.lock();

        let lock_path = self.tracking_path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        let file = OpenOptions::new().create(true).write(true).open(&lock_path).ok();
        if let Some(file) = &file {
            let _ = file.lock_exclusive();
        }

        let result = f();

        if let Some(file) = &file {
            let _ = FileExt::unlock(file);
        }
        result
    }

    fn read_tracking_entries(&self) -> HashMap<String, OrphanEntry> {
        fs::read(&self.tracking_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    /// Reuses `checkpoint::atomic_write` (write-tmp, fsync, backup-swap,
    /// rename, fsync-dir) — the same atomic-save shape as the checkpoint
    /// store, since a torn tracking file is exactly the kind of crash
    /// `reclaim_orphans` has to be robust against.
    fn write_tracking_entries(&self, entries: &HashMap<String, OrphanEntry>) -> std::io::Result<()> {
        let body = serde_json::to_vec_pretty(entries).unwrap_or_default();
        crate::checkpoint::atomic_write(&self.tracking_path, &body)
    }

    /// At process start, reads the tracking file left by a prior process and
    /// releases any entry whose owning process is no longer running — the
    /// same "reconcile breadcrumbs left by a dead process" pattern used for
    /// daemon lifecycle recovery elsewhere in this codebase's lineage.
    pub fn reclaim_orphans(&self) -> Vec<String> {
        self.with_tracking_lock(|| {
            let entries = self.read_tracking_entries();
            let mut reclaimed = Vec::new();
            let mut remaining = entries.clone();
            for (id, entry) in entries {
                if !is_process_alive(entry.owner_pid) {
                    if self.provider.release(&id).is_ok() {
                        remaining.remove(&id);
                        reclaimed.push(id);
                    }
                }
            }
            let _ = self.write_tracking_entries(&remaining);
            reclaimed
        })
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    // Conservative default off unix: assume alive so we never release a
    // snapshot still owned by a running process.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct FakeProvider {
        release_calls: Arc<AtomicUsize>,
        fail_create: bool,
    }

    impl SnapshotProvider for FakeProvider {
        fn create(&self, source: &CanonicalPath) -> Result<SnapshotHandle, RobocurseError> {
            if self.fail_create {
                return Err(RobocurseError::SnapshotUnavailable {
                    path: source.as_path().to_path_buf(),
                    reason: "forced failure".to_string(),
                });
            }
            Ok(SnapshotHandle {
                snapshot_id: "snap-1".to_string(),
                original_path: source.as_str().to_string(),
                access_path: source.as_str().to_string(),
                created_at: "2024-01-01T00:00:00.000Z".to_string(),
            })
        }

        fn release(&self, _snapshot_id: &str) -> Result<(), RobocurseError> {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn translate_path(&self, original: &CanonicalPath, _handle: &SnapshotHandle) -> Result<CanonicalPath, RobocurseError> {
            Ok(original.clone())
        }
    }

    #[tokio::test]
    async fn releases_exactly_once_on_success() {
        let dir = tempdir().unwrap();
        let release_calls = Arc::new(AtomicUsize::new(0));
        let provider = FakeProvider {
            release_calls: release_calls.clone(),
            fail_create: false,
        };
        let coordinator = SnapshotCoordinator::new(provider, dir.path().join("tracking.json"));
        let source = CanonicalPath::new(Path::new("/data/source")).unwrap();

        let result = coordinator
            .with_snapshot(&source, |p| async move { Ok(p.as_str().to_string()) })
            .await;
        assert!(result.is_ok());
        assert_eq!(release_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releases_exactly_once_when_fn_errors() {
        let dir = tempdir().unwrap();
        let release_calls = Arc::new(AtomicUsize::new(0));
        let provider = FakeProvider {
            release_calls: release_calls.clone(),
            fail_create: false,
        };
        let coordinator = SnapshotCoordinator::new(provider, dir.path().join("tracking.json"));
        let source = CanonicalPath::new(Path::new("/data/source")).unwrap();

        let result: Result<(), RobocurseError> = coordinator
            .with_snapshot(&source, |_| async move {
                Err(RobocurseError::ConfigInvalid {
                    field: "x".to_string(),
                    reason: "y".to_string(),
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(release_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn no_provider_fails_at_planning_time() {
        let source = CanonicalPath::new(Path::new("/data/source")).unwrap();
        let err = NoSnapshotProvider.create(&source).unwrap_err();
        matches!(err, RobocurseError::SnapshotUnavailable { .. });
    }

    #[test]
    fn reclaims_orphans_owned_by_dead_processes() {
        let dir = tempdir().unwrap();
        let release_calls = Arc::new(AtomicUsize::new(0));
        let provider = FakeProvider {
            release_calls: release_calls.clone(),
            fail_create: false,
        };
        let tracking_path = dir.path().join("tracking.json");
        let coordinator = SnapshotCoordinator::new(provider, tracking_path.clone());

        // A PID astronomically unlikely to exist.
        let dead_pid: u32 = 2_000_000_000;
        let mut entries = HashMap::new();
        entries.insert(
            "snap-dead".to_string(),
            OrphanEntry {
                snapshot_id: "snap-dead".to_string(),
                owner_pid: dead_pid,
                created_at: "2024-01-01T00:00:00.000Z".to_string(),
            },
        );
        coordinator.write_tracking_entries(&entries).unwrap();

        let reclaimed = coordinator.reclaim_orphans();
        assert_eq!(reclaimed, vec!["snap-dead".to_string()]);
        assert_eq!(release_calls.load(Ordering::SeqCst), 1);
    }
}

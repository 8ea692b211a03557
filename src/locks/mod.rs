//! Cross-process locks (spec C8): per-profile single-instance enforcement
//! and drive-letter allocation serialization.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::RobocurseError;

/// Per-profile single-instance enforcement, generalizing the teacher's
/// `HistoryStore` exclusive-lock-on-a-file pattern from "one lock for the
/// whole data dir" to "one lock per profile name." The underlying `fs2`
/// advisory lock is released automatically when every handle referencing it
/// closes — including when the owning process dies without calling
/// `unregister` — which is how an abandoned lock is recovered (spec §8
/// property 8) without a separate PID-liveness check.
pub struct ProfileLock {
    _file: File,
}

fn lock_file_path(lock_dir: &Path, profile_name: &str) -> PathBuf {
    lock_dir.join(format!(".lock-{}", profile_name))
}

/// Reads whatever pid the previous holder stamped into the lock file, if
/// any. Used only to decide whether to log an abandoned-lock recovery; a
/// missing or unparseable value just means no prior holder is known.
fn read_stamped_pid(file: &mut File) -> Option<u32> {
    let mut buf = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut buf).ok()?;
    buf.trim().parse().ok()
}

fn stamp_pid(file: &mut File) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()
}

#[cfg(unix)]
fn pid_is_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{}", pid)).exists()
}

#[cfg(not(unix))]
fn pid_is_alive(_pid: u32) -> bool {
    true
}

impl ProfileLock {
    /// Attempts to acquire the lock for `profile_name`. Returns `Some` (the
    /// held lock, released on drop or by `unregister`) iff this process now
    /// owns it; `None` if another process already holds it.
    pub fn register(lock_dir: &Path, profile_name: &str) -> Result<Option<ProfileLock>, RobocurseError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_file_path(lock_dir, profile_name);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        let previous_pid = read_stamped_pid(&mut file);
        match file.try_lock_exclusive() {
            Ok(()) => {
                // spec §7 `MutexAbandoned`: "acquired successfully,
                // informational log only" — no dedicated error variant,
                // since this is never a failure to propagate.
                if let Some(pid) = previous_pid {
                    if pid != std::process::id() && !pid_is_alive(pid) {
                        tracing::info!(profile = profile_name, pid, "acquired profile lock abandoned by a dead process");
                    }
                }
                let _ = stamp_pid(&mut file);
                Ok(Some(ProfileLock { _file: file }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(RobocurseError::Io { source: e }),
        }
    }

    /// Explicit release, separate from `Drop`, so tests and callers can
    /// observe the release as an ordered event rather than an implicit
    /// scope exit (spec §8 scenario S8 wants "A calls Unregister" to be a
    /// distinct, orderable step).
    pub fn unregister(self) {
        drop(self);
    }

    /// Non-acquiring check: true iff the lock currently appears available.
    /// Never holds the lock itself.
    pub fn test(lock_dir: &Path, profile_name: &str) -> Result<bool, RobocurseError> {
        let path = lock_file_path(lock_dir, profile_name);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.unlock()?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(RobocurseError::Io { source: e }),
        }
    }
}

/// Fixed well-known lock file name for serializing drive-letter allocation
/// across processes (spec §4.8: "a system-wide mutex whose name is fixed").
pub const DRIVE_LETTER_MUTEX_NAME: &str = "RobocurseDriveLetterAllocation.lock";

/// Capability interface over the OS's mount-mapping facility (spec §9:
/// "polymorphism over ... OS mapping"). No file in the retrieved example
/// corpus calls a Windows mount-mapping or named-mutex API directly — this
/// interface is designed fresh from the capability-interface pattern the
/// rest of this codebase already uses for copy-tool/snapshot-provider
/// backends (see DESIGN.md).
pub trait OsMountMap: Send + Sync {
    /// Letters currently mapped by the OS (actively mounted).
    fn mapped_letters(&self) -> Result<Vec<char>, RobocurseError>;
    /// Letters with a remembered mount from a prior session but not
    /// currently mounted.
    fn remembered_letters(&self) -> Result<Vec<char>, RobocurseError>;
    fn mount(&self, letter: char, unc_path: &str) -> Result<(), RobocurseError>;
    /// "Mapping does not exist" is treated as success.
    fn unmount(&self, letter: char) -> Result<(), RobocurseError>;
}

/// Default non-Windows implementation: nothing is ever reported mapped, so
/// allocation is governed purely by the in-process `ReservedSet` and the
/// mutex serializing concurrent allocators.
pub struct NullMountMap;

impl OsMountMap for NullMountMap {
    fn mapped_letters(&self) -> Result<Vec<char>, RobocurseError> {
        Ok(Vec::new())
    }
    fn remembered_letters(&self) -> Result<Vec<char>, RobocurseError> {
        Ok(Vec::new())
    }
    fn mount(&self, _letter: char, _unc_path: &str) -> Result<(), RobocurseError> {
        Ok(())
    }
    fn unmount(&self, _letter: char) -> Result<(), RobocurseError> {
        Ok(())
    }
}

/// In-memory set of letters claimed by concurrent in-process allocations
/// that have not yet mounted their target (spec glossary: "Reserved set").
pub struct DriveLetterAllocator<M: OsMountMap> {
    mount_map: M,
    lock_dir: PathBuf,
    reserved: std::sync::Mutex<std::collections::HashSet<char>>,
}

impl<M: OsMountMap> DriveLetterAllocator<M> {
    pub fn new(mount_map: M, lock_dir: impl Into<PathBuf>) -> Self {
        DriveLetterAllocator {
            mount_map,
            lock_dir: lock_dir.into(),
            reserved: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Selects an unused letter from `candidates` (in order), excluding OS-
    /// mapped, remembered-but-unmounted, and in-process reserved letters,
    /// while holding the fixed-name system-wide mutex (spec §4.8).
    pub fn allocate(&self, candidates: &[char]) -> Result<char, RobocurseError> {
        fs::create_dir_all(&self.lock_dir)?;
        let lock_path = self.lock_dir.join(DRIVE_LETTER_MUTEX_NAME);
        let file = OpenOptions::new().create(true).write(true).open(&lock_path)?;
        file.lock_exclusive()?;

        let result = (|| {
            let mapped = self.mount_map.mapped_letters()?;
            let remembered = self.mount_map.remembered_letters()?;
            let reserved = self.reserved.lock().unwrap();

            for &candidate in candidates {
                if mapped.contains(&candidate) || remembered.contains(&candidate) || reserved.contains(&candidate) {
                    continue;
                }
                drop(reserved);
                self.reserved.lock().unwrap().insert(candidate);
                return Ok(candidate);
            }
            Err(RobocurseError::DriveLetterExhausted {
                candidates: candidates.to_vec(),
            })
        })();

        file.unlock()?;
        result
    }

    pub fn release(&self, letter: char) -> Result<(), RobocurseError> {
        self.reserved.lock().unwrap().remove(&letter);
        self.mount_map.unmount(letter)
    }
}

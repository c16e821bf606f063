//! Distributed mutex built on atomic hard-link creation.
//!
//! Advisory byte-range locking is unreliable across nodes on Lustre, but
//! `link(2)` fails atomically when the target exists, so a lock file can
//! serve as a cluster-wide mutex:
//!
//! 1. Write a uniquely named stamp file next to the lock path (same
//!    directory, same filesystem) carrying a diagnostic holder payload.
//! 2. Attempt to hard-link the stamp to the lock path. Success means the
//!    lock is held; the stamp is unlinked either way.
//! 3. On contention, break the lock if its mtime is older than the stale
//!    timeout (the holder crashed), otherwise back off with jitter and
//!    retry.
//!
//! Release unlinks the lock path and never fails; a release that loses a
//! race against a stale-lock reclaimer is indistinguishable from success.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::Serialize;
use tira_core::errors::{ErrorInfo, TiraError};
use tira_core::provenance::local_hostname;
use tracing::{debug, warn};

/// Age after which a held lock is assumed abandoned.
pub const DEFAULT_STALE_LOCK_TIMEOUT: Duration = Duration::from_secs(600);

const BASE_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_secs(1);

/// Diagnostic payload written into the stamp file. Correctness never
/// depends on it; it exists so an operator can see who wedged a lock.
#[derive(Debug, Serialize)]
struct HolderStamp {
    hostname: String,
    pid: u32,
    timestamp_ms: u64,
}

impl HolderStamp {
    fn current() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            hostname: local_hostname(),
            pid: process::id(),
            timestamp_ms: now,
        }
    }
}

/// Named mutex identified by a lock-file path.
#[derive(Debug, Clone)]
pub struct HardLinkMutex {
    lock_path: PathBuf,
    stale_timeout: Duration,
}

impl HardLinkMutex {
    /// Creates a mutex on the given lock path.
    pub fn new(lock_path: impl Into<PathBuf>, stale_timeout: Duration) -> Self {
        Self {
            lock_path: lock_path.into(),
            stale_timeout,
        }
    }

    /// The lock-file path this mutex contends on.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Acquires the mutex, blocking with exponential backoff and jitter.
    ///
    /// A `deadline` bounds the whole acquisition; on expiry the call fails
    /// with `LockUnavailable`. Without a deadline the call blocks until the
    /// lock is obtained. Lock-file I/O errors are retried like contention.
    pub fn acquire(&self, deadline: Option<Duration>) -> Result<LockGuard, TiraError> {
        let expiry = deadline.map(|limit| Instant::now() + limit);
        let mut delay = BASE_DELAY;
        let mut last_io: Option<TiraError> = None;
        loop {
            match self.try_link() {
                Ok(Some(guard)) => {
                    debug!(lock = %self.lock_path.display(), "lock acquired");
                    return Ok(guard);
                }
                Ok(None) => {
                    if self.break_if_stale() {
                        // Lock vanished or was reclaimed: retry without sleeping.
                        continue;
                    }
                }
                // Lock-file I/O trouble is retried like contention, bounded
                // by the same deadline.
                Err(err) => last_io = Some(err),
            }
            if let Some(expiry) = expiry {
                if Instant::now() >= expiry {
                    let mut info =
                        ErrorInfo::new("tira_store.lock_deadline", "lock acquisition timed out")
                            .with("lock_path", self.lock_path.display().to_string())
                            .with("deadline_ms", format!("{}", deadline_ms(deadline)));
                    if let Some(err) = last_io {
                        info = info.hint(err.to_string());
                    }
                    return Err(TiraError::LockUnavailable(info));
                }
            }
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            thread::sleep(delay.mul_f64(jitter).min(MAX_DELAY));
            delay = (delay * 2).min(MAX_DELAY);
        }
    }

    /// One link attempt. `Ok(None)` means the lock is held by someone else;
    /// `Err` means the stamp file could not even be written (the caller
    /// retries both cases, bounded by its deadline).
    fn try_link(&self) -> Result<Option<LockGuard>, TiraError> {
        let stamp_path = self.stamp_path();
        let stamp = HolderStamp::current();
        let payload = serde_json::to_vec(&stamp).unwrap_or_default();
        fs::write(&stamp_path, payload).map_err(|err| {
            TiraError::Io(
                ErrorInfo::new("tira_store.lock_stamp", "failed to write lock stamp file")
                    .with("path", stamp_path.display().to_string())
                    .hint(err.to_string()),
            )
        })?;
        let outcome = fs::hard_link(&stamp_path, &self.lock_path);
        let _ = fs::remove_file(&stamp_path);
        match outcome {
            Ok(()) => Ok(Some(LockGuard {
                lock_path: self.lock_path.clone(),
                released: false,
            })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(TiraError::Io(
                ErrorInfo::new("tira_store.lock_link", "failed to link lock file")
                    .with("path", self.lock_path.display().to_string())
                    .hint(err.to_string()),
            )),
        }
    }

    /// Unlinks the lock file when it is older than the stale timeout.
    ///
    /// Returns `true` when the next link attempt should happen immediately:
    /// the lock was reclaimed here, or it disappeared on its own.
    fn break_if_stale(&self) -> bool {
        let meta = match fs::metadata(&self.lock_path) {
            Ok(meta) => meta,
            Err(err) => return err.kind() == ErrorKind::NotFound,
        };
        let Some(age) = lock_age(&meta) else {
            return false;
        };
        if age <= self.stale_timeout {
            return false;
        }
        warn!(
            lock = %self.lock_path.display(),
            age_secs = age.as_secs(),
            "breaking stale lock file (holder assumed crashed)"
        );
        match fs::remove_file(&self.lock_path) {
            Ok(()) => true,
            Err(err) => err.kind() == ErrorKind::NotFound,
        }
    }

    /// Unique sibling name: `<lock>.<host>.<pid>.<ns>.<rand>`. Sharing the
    /// lock directory guarantees `link(2)` stays within one filesystem.
    fn stamp_path(&self) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let entropy: u32 = rand::thread_rng().gen();
        let mut name = self
            .lock_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| "lock".into());
        name.push(format!(
            ".{}.{}.{}.{:08x}",
            local_hostname(),
            process::id(),
            nanos,
            entropy
        ));
        self.lock_path.with_file_name(name)
    }
}

fn lock_age(meta: &fs::Metadata) -> Option<Duration> {
    if let Ok(mtime) = meta.modified() {
        return SystemTime::now().duration_since(mtime).ok();
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let ctime = meta.ctime();
        if ctime > 0 {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            return Some(Duration::from_secs(now.saturating_sub(ctime).max(0) as u64));
        }
    }
    None
}

fn deadline_ms(deadline: Option<Duration>) -> u128 {
    deadline.map(|limit| limit.as_millis()).unwrap_or(0)
}

/// Held lock; unlinks the lock file on drop.
///
/// Release is infallible by design: every error is swallowed, because a
/// failed unlink simply leaves a lock file that the next contender will
/// reclaim as stale.
#[derive(Debug)]
pub struct LockGuard {
    lock_path: PathBuf,
    released: bool,
}

impl LockGuard {
    /// Releases the lock eagerly instead of waiting for drop.
    pub fn release(mut self) {
        self.unlink();
    }

    fn unlink(&mut self) {
        if !self.released {
            let _ = fs::remove_file(&self.lock_path);
            self.released = true;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.unlink();
    }
}

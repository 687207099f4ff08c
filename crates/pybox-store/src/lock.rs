//! Advisory cross-process lock on a cache resource.
//!
//! The lock is optimistic rather than a strict mutex: a holder owns `<resource>.lock` by
//! creating it exclusively and keeps it fresh from a heartbeat thread. Waiters back off and
//! retry; a lock whose mtime is older than the staleness window is presumed abandoned and
//! reclaimed. Reclamation runs under an `fs4` guard so two waiters cannot both reclaim.
//! The guard file (`<resource>.lock.guard`) outlives individual locks; it is deleted with
//! [`remove_guard`] when the resource itself is removed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use filetime::{set_file_mtime, FileTime};
use fs4::FileExt;
use pybox_domain::ProvisionError;
use rand::Rng;
use tracing::{debug, warn};

const LOCK_SUFFIX: &str = ".lock";
const GUARD_SUFFIX: &str = ".guard";
const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// Retry budget, backoff bounds, and staleness window for a [`CacheLock`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockPolicy {
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub stale_after: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 60,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            stale_after: Duration::from_secs(30),
        }
    }
}

impl LockPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.min_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_after / 2).max(MIN_HEARTBEAT)
    }
}

/// Path of the lock file guarding `resource`.
#[must_use]
pub fn lock_path(resource: &Path) -> PathBuf {
    let mut name = resource.as_os_str().to_owned();
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// Delete the reclaim guard left next to `resource`'s lock. Call only while holding that lock.
///
/// # Errors
/// Fails when the guard exists but cannot be removed.
pub fn remove_guard(resource: &Path) -> Result<()> {
    let path = guard_path(&lock_path(resource));
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to remove lock guard {}", path.display())),
    }
}

fn guard_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_owned();
    name.push(GUARD_SUFFIX);
    PathBuf::from(name)
}

/// A held lock; released when dropped.
#[derive(Debug)]
pub struct CacheLock {
    path: PathBuf,
    token: String,
    heartbeat: Option<Heartbeat>,
}

impl CacheLock {
    /// Acquire the lock on `resource`, waiting according to `policy`.
    ///
    /// # Errors
    /// Fails with [`ProvisionError::LockTimeout`] once the retry budget is spent, or with an
    /// I/O error when the lock file cannot be created or inspected.
    pub fn acquire(resource: &Path, policy: &LockPolicy) -> Result<Self> {
        let path = lock_path(resource);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
        let token = new_token();
        let mut attempt = 0u32;
        loop {
            if try_create(&path, &token)? {
                debug!(lock = %path.display(), attempt, "acquired cache lock");
                let heartbeat = Heartbeat::start(path.clone(), policy.heartbeat_interval())?;
                return Ok(Self {
                    path,
                    token,
                    heartbeat: Some(heartbeat),
                });
            }
            if reclaim_if_stale(&path, policy.stale_after)? {
                continue;
            }
            if attempt >= policy.retries {
                return Err(ProvisionError::LockTimeout {
                    path: resource.to_path_buf(),
                    attempts: attempt + 1,
                }
                .into());
            }
            let delay = policy.backoff(attempt);
            debug!(lock = %path.display(), attempt, ?delay, "cache lock busy; backing off");
            thread::sleep(delay);
            attempt += 1;
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn release(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents == self.token => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(lock = %self.path.display(), %err, "failed to remove cache lock");
                } else {
                    debug!(lock = %self.path.display(), "released cache lock");
                }
            }
            Ok(_) => warn!(
                lock = %self.path.display(),
                "cache lock was reclaimed by another holder"
            ),
            Err(err) if err.kind() == ErrorKind::NotFound => warn!(
                lock = %self.path.display(),
                "cache lock vanished before release"
            ),
            Err(err) => warn!(lock = %self.path.display(), %err, "failed to read cache lock"),
        }
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn new_token() -> String {
    let nonce: u64 = rand::thread_rng().gen();
    format!("{}:{nonce:016x}", std::process::id())
}

fn try_create(path: &Path, token: &str) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        // Windows reports a pending delete as access denied.
        #[cfg(windows)]
        Err(err) if err.kind() == ErrorKind::PermissionDenied => return Ok(false),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to create lock {}", path.display()))
        }
    };
    file.write_all(token.as_bytes())
        .with_context(|| format!("failed to write lock {}", path.display()))?;
    Ok(true)
}

/// Remove `lock` when its holder stopped refreshing it. Returns true when the caller should
/// retry immediately (lock reclaimed or already gone).
fn reclaim_if_stale(lock: &Path, stale_after: Duration) -> Result<bool> {
    let guard_path = guard_path(lock);
    let guard = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&guard_path)
        .with_context(|| format!("failed to open lock guard {}", guard_path.display()))?;
    guard
        .lock_exclusive()
        .with_context(|| format!("failed to lock {}", guard_path.display()))?;
    let outcome = reclaim_locked(lock, stale_after);
    let _ = FileExt::unlock(&guard);
    outcome
}

fn reclaim_locked(lock: &Path, stale_after: Duration) -> Result<bool> {
    let modified = match fs::metadata(lock).and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(true),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to inspect lock {}", lock.display()))
        }
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age <= stale_after {
        return Ok(false);
    }
    warn!(lock = %lock.display(), ?age, "reclaiming stale cache lock");
    match fs::remove_file(lock) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(true),
        Err(err) => Err(err).with_context(|| format!("failed to reclaim lock {}", lock.display())),
    }
}

#[derive(Debug)]
struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Heartbeat {
    fn start(path: PathBuf, interval: Duration) -> Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("pybox-lock-heartbeat".into())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if let Err(err) = set_file_mtime(&path, FileTime::now()) {
                            warn!(lock = %path.display(), %err, "failed to refresh cache lock");
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("failed to start lock heartbeat")?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.handle.join();
    }
}

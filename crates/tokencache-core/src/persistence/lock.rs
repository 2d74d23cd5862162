//! Advisory cross-process lock built on a sibling lock file.
//!
//! Whoever creates the lock file (create-new semantics) holds the lock. The
//! file carries the holder's pid and a random nonce so a holder only ever
//! removes its own lock. While held, the file's modification time is refreshed
//! so a live holder is never mistaken for a crashed one.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{PersistenceError, Result};

/// First retry delay when the lock is held by someone else.
const DEFAULT_INITIAL_DELAY_MS: u64 = 10;

/// Backoff doubles up to this ceiling.
const DEFAULT_MAX_DELAY_MS: u64 = 500;

/// Give up after this long and report `LockTimeout`.
const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// A lock file untouched for this long was left behind by a crashed process.
const DEFAULT_STALE_AFTER_MS: u64 = 60_000;

/// A held lock is touched this many times per `stale_after` period.
const REFRESHES_PER_STALE_PERIOD: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockOptions {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
    pub stale_after_ms: u64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
        }
    }
}

impl LockOptions {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms.max(1))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.initial_delay_ms).max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }

    /// How often a holder touches its lock file. `None` when the stale
    /// period is too short to refresh within.
    pub fn refresh_interval(&self) -> Option<Duration> {
        let interval = self.stale_after() / REFRESHES_PER_STALE_PERIOD;
        (interval >= Duration::from_millis(1)).then_some(interval)
    }
}

#[derive(Debug, Clone)]
pub struct CrossProcessLock {
    path: PathBuf,
    options: LockOptions,
}

/// Lock file contents and age as seen by a waiter.
#[derive(Debug)]
struct Observed {
    contents: Vec<u8>,
    age: Duration,
}

impl CrossProcessLock {
    pub fn new(path: impl Into<PathBuf>, options: LockOptions) -> Self {
        Self {
            path: path.into(),
            options,
        }
    }

    /// Lock file next to `target`, named `<target><suffix>`.
    pub fn for_target(target: &Path, suffix: &str, options: LockOptions) -> Self {
        Self::new(with_suffix(target, suffix), options)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Acquire the lock, retrying with exponential backoff until the timeout.
    pub async fn acquire(&self) -> Result<LockGuard> {
        let started = Instant::now();
        let timeout = self.options.timeout();
        let mut delay = self.options.initial_delay();
        let token = format!("{} {:016x}", std::process::id(), rand::random::<u64>());
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match create_lock_file(&self.path, &token).await {
                Ok(()) => {
                    debug!(lock = %self.path.display(), attempts, "Lock acquired");
                    let refresh = self
                        .options
                        .refresh_interval()
                        .map(|interval| spawn_refresh(self.path.clone(), token.clone(), interval));
                    return Ok(LockGuard {
                        path: self.path.clone(),
                        token,
                        refresh,
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(PersistenceError::from_io(&self.path, e)),
            }

            if self.break_if_stale().await? {
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                warn!(
                    lock = %self.path.display(),
                    attempts,
                    waited_ms = waited.as_millis() as u64,
                    "Gave up waiting for lock"
                );
                return Err(PersistenceError::LockTimeout {
                    path: self.path.clone(),
                    waited,
                });
            }

            tokio::time::sleep(delay.min(timeout - waited)).await;
            delay = (delay * 2).min(self.options.max_delay());
        }
    }

    /// Remove a lock file whose holder has evidently died. Returns true when
    /// the caller should retry immediately.
    async fn break_if_stale(&self) -> Result<bool> {
        let observed = match self.observe().await? {
            Some(observed) => observed,
            // Released between our create attempt and now
            None => return Ok(true),
        };
        if observed.age < self.options.stale_after() {
            return Ok(false);
        }
        self.break_observed(&observed).await
    }

    async fn observe(&self) -> Result<Option<Observed>> {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta
                .modified()
                .map_err(|e| PersistenceError::from_io(&self.path, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::from_io(&self.path, e)),
        };
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(PersistenceError::from_io(&self.path, e)),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(Some(Observed { contents, age }))
    }

    /// Move the lock file aside and delete it, but only if it is still the
    /// one observed stale. Another waiter may have broken it and taken the
    /// lock in the meantime; that live lock is put back.
    async fn break_observed(&self, observed: &Observed) -> Result<bool> {
        let parked = with_suffix(
            &self.path,
            &format!(".{:016x}.stale", rand::random::<u64>()),
        );
        match tokio::fs::rename(&self.path, &parked).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(PersistenceError::from_io(&self.path, e)),
        }

        let parked_contents = match tokio::fs::read(&parked).await {
            Ok(contents) => contents,
            Err(e) => {
                let _ = tokio::fs::remove_file(&parked).await;
                return Err(PersistenceError::from_io(&parked, e));
            }
        };

        if parked_contents != observed.contents {
            debug!(lock = %self.path.display(), "Lock changed hands while breaking it, restoring");
            let restored = tokio::fs::hard_link(&parked, &self.path).await;
            let _ = tokio::fs::remove_file(&parked).await;
            return match restored {
                Ok(()) => Ok(false),
                // Someone created a fresh lock meanwhile; it stands
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
                Err(e) => Err(PersistenceError::from_io(&self.path, e)),
            };
        }

        warn!(
            lock = %self.path.display(),
            age_ms = observed.age.as_millis() as u64,
            "Breaking stale lock"
        );
        match tokio::fs::remove_file(&parked).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(PersistenceError::from_io(&parked, e)),
        }
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

async fn create_lock_file(path: &Path, token: &str) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    remove_on_failure(path, async move {
        file.write_all(token.as_bytes()).await?;
        file.flush().await
    })
    .await
}

/// A lock file without its token can never be released by its creator, so
/// a failed write must not leave it behind.
async fn remove_on_failure<F>(path: &Path, write: F) -> io::Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let written = write.await;
    if written.is_err() {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(lock = %path.display(), error = %e, "Failed to remove half-written lock");
        }
    }
    written
}

fn spawn_refresh(path: PathBuf, token: String, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match touch_if_owned(&path, &token).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(lock = %path.display(), "Lock no longer ours, stopping refresh");
                    return;
                }
                Err(e) => warn!(lock = %path.display(), error = %e, "Failed to refresh lock"),
            }
        }
    })
}

async fn touch_if_owned(path: &Path, token: &str) -> io::Result<bool> {
    match tokio::fs::read(path).await {
        Ok(contents) if contents == token.as_bytes() => {}
        Ok(_) => return Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    }
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await?
        .into_std()
        .await;
    tokio::task::spawn_blocking(move || file.set_modified(SystemTime::now()))
        .await
        .map_err(io::Error::other)??;
    Ok(true)
}

/// Held lock. Released by [`LockGuard::release`] or, failing that, on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    token: String,
    refresh: Option<JoinHandle<()>>,
    released: bool,
}

impl LockGuard {
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(PersistenceError::from_io(&self.path, e)),
        };
        if contents != self.token.as_bytes() {
            warn!(lock = %self.path.display(), "Lock was taken over by another process, leaving it");
            return Ok(());
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(lock = %self.path.display(), "Lock released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PersistenceError::from_io(&self.path, e)),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
        if self.released {
            return;
        }
        // No async drop: a short blocking remove is the only option on unwind
        if std::fs::read(&self.path).is_ok_and(|contents| contents == self.token.as_bytes()) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(lock = %self.path.display(), error = %e, "Failed to release lock on drop");
            }
        }
    }
}

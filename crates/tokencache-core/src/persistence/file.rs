use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::lock::{CrossProcessLock, LockOptions};
use super::{validation_location, CacheBlob, Persistence, PersistenceIdentity};
use crate::error::{IdentityError, PersistenceError, Result};
use crate::logging::{Logger, LoggerOptions};

/// Suffix of the sibling lock file serializing writers.
pub const WRITE_LOCK_SUFFIX: &str = ".lock";

/// Steps tried in turn to push a new modification time past the previous one.
/// Filesystems that store whole seconds (HFS+, ext3) or even seconds (FAT)
/// truncate the smaller steps back to the previous time.
const MTIME_STEPS: [Duration; 3] = [
    Duration::from_millis(1),
    Duration::from_secs(1),
    Duration::from_secs(2),
];

/// Stores one blob at one path.
///
/// Writes go to a temporary file in the same directory and are renamed over
/// the target, so readers never need a lock. Writers (save, delete) take the
/// `<path>.lock` cross-process lock.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    lock: CrossProcessLock,
    logger: Logger,
}

impl FilePersistence {
    /// Create the containing directory if needed and check it is writable.
    pub async fn create(
        path: impl Into<PathBuf>,
        logger_options: LoggerOptions,
        lock_options: LockOptions,
    ) -> Result<Self> {
        let path = path.into();
        if path.file_name().is_none() {
            return Err(PersistenceError::unclassified(IdentityError::NoFileName(path)));
        }

        let logger = Logger::new(logger_options, "file", &path);
        let dir = parent_dir(&path);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistenceError::from_io(&dir, e))?;

        match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(PersistenceError::FileAccess {
                    path,
                    source: io::Error::other("cache location is a directory"),
                });
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PersistenceError::from_io(&path, e)),
        }

        probe_writable(&dir)
            .await
            .map_err(|e| PersistenceError::from_io(&dir, e))?;

        logger.verbose("File persistence ready");
        let lock = CrossProcessLock::for_target(&path, WRITE_LOCK_SUFFIX, lock_options);
        Ok(Self { path, lock, logger })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_options(&self) -> &LockOptions {
        self.lock.options()
    }

    fn temp_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        parent_dir(&self.path).join(temp_name(&stem))
    }

    async fn write_atomically(&self, contents: &[u8]) -> Result<()> {
        let previous = modified_time(&self.path).await?;
        let temp = self.temp_path();

        let outcome = match stage(&temp, contents, previous).await {
            Ok(()) => fs::rename(&temp, &self.path).await,
            Err(e) => Err(e),
        };
        if outcome.is_err() {
            let _ = fs::remove_file(&temp).await;
        }
        outcome.map_err(|e| PersistenceError::from_io(&self.path, e))
    }

    async fn create_if_absent(&self, initial: &[u8]) -> Result<Option<CacheBlob>> {
        let temp = self.temp_path();
        if let Err(e) = stage(&temp, initial, None).await {
            let _ = fs::remove_file(&temp).await;
            return Err(PersistenceError::from_io(&self.path, e));
        }

        // Linking fails if the target exists, which makes create-if-absent a
        // single atomic step even against writers that ignore the lock.
        let outcome = match fs::hard_link(&temp, &self.path).await {
            Ok(()) => Ok(None),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                fs::read(&self.path).await.map(Some)
            }
            Err(e) => {
                debug!(
                    path = %self.path.display(),
                    error = %e,
                    "Hard link unsupported, falling back to rename"
                );
                match fs::try_exists(&self.path).await {
                    Ok(true) => fs::read(&self.path).await.map(Some),
                    Ok(false) => fs::rename(&temp, &self.path).await.map(|()| None),
                    Err(e) => Err(e),
                }
            }
        };
        let _ = fs::remove_file(&temp).await;
        outcome.map_err(|e| PersistenceError::from_io(&self.path, e))
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn save(&self, contents: &[u8]) -> Result<()> {
        let guard = self.lock.acquire().await?;
        let written = self.write_atomically(contents).await;
        let released = guard.release().await;
        written.and(released)?;

        self.logger.verbose(&format!("Saved {} bytes", contents.len()));
        Ok(())
    }

    async fn load(&self) -> Result<Option<CacheBlob>> {
        match fs::read(&self.path).await {
            Ok(contents) => {
                self.logger.trace(&format!("Loaded {} bytes", contents.len()));
                Ok(Some(contents))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.logger.trace("Nothing persisted yet");
                Ok(None)
            }
            Err(e) => Err(PersistenceError::from_io(&self.path, e)),
        }
    }

    async fn delete(&self) -> Result<bool> {
        let dir = parent_dir(&self.path);
        let dir_exists = fs::try_exists(&dir)
            .await
            .map_err(|e| PersistenceError::from_io(&dir, e))?;
        if !dir_exists {
            return Ok(false);
        }

        let guard = self.lock.acquire().await?;
        let removed = match fs::remove_file(&self.path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(PersistenceError::from_io(&self.path, e)),
        };
        let released = guard.release().await;
        let removed = removed?;
        released?;

        if removed {
            self.logger.verbose("Deleted persisted cache");
        }
        Ok(removed)
    }

    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(modified_time(&self.path).await?.map(DateTime::<Utc>::from))
    }

    async fn load_or_init(&self, initial: &[u8]) -> Result<Option<CacheBlob>> {
        if let Some(existing) = self.load().await? {
            return Ok(Some(existing));
        }

        let guard = self.lock.acquire().await?;
        let outcome = self.create_if_absent(initial).await;
        let released = guard.release().await;
        let outcome = outcome?;
        released?;

        if outcome.is_none() {
            self.logger.verbose("Initialized persisted cache");
        }
        Ok(outcome)
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn identity(&self) -> PersistenceIdentity {
        PersistenceIdentity {
            location: self.path.clone(),
            service: None,
            account: None,
        }
    }

    fn logger(&self) -> &Logger {
        &self.logger
    }

    async fn validation_instance(&self) -> Result<Box<dyn Persistence>> {
        let probe = FilePersistence::create(
            validation_location(&self.path),
            self.logger.options().clone(),
            self.lock.options().clone(),
        )
        .await?;
        Ok(Box::new(probe))
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn temp_name(stem: &str) -> String {
    format!(
        ".{}.{}.{:08x}.tmp",
        stem,
        std::process::id(),
        rand::random::<u32>()
    )
}

async fn modified_time(path: &Path) -> Result<Option<SystemTime>> {
    match fs::metadata(path).await {
        Ok(meta) => meta
            .modified()
            .map(Some)
            .map_err(|e| PersistenceError::from_io(path, e)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(PersistenceError::from_io(path, e)),
    }
}

/// Write `contents` to a fresh temp file and make sure its modification time
/// is strictly newer than `previous`, even on coarse-grained filesystems.
async fn stage(temp: &Path, contents: &[u8], previous: Option<SystemTime>) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .await?;
    file.write_all(contents).await?;
    file.sync_all().await?;

    if let Some(previous) = previous {
        let file = file.into_std().await;
        tokio::task::spawn_blocking(move || {
            advance_mtime(
                previous,
                || file.metadata()?.modified(),
                |bumped| file.set_modified(bumped),
            )
        })
        .await
        .map_err(io::Error::other)??;
    }
    Ok(())
}

/// Bump the modification time reported by `modified` until it is strictly
/// newer than `previous`, re-reading after each step since the filesystem
/// may round what was set.
fn advance_mtime(
    previous: SystemTime,
    modified: impl Fn() -> io::Result<SystemTime>,
    mut set_modified: impl FnMut(SystemTime) -> io::Result<()>,
) -> io::Result<()> {
    for step in MTIME_STEPS {
        if modified()? > previous {
            return Ok(());
        }
        set_modified(previous + step)?;
    }
    if modified()? > previous {
        Ok(())
    } else {
        Err(io::Error::other(
            "filesystem did not advance the modification time",
        ))
    }
}

async fn probe_writable(dir: &Path) -> io::Result<()> {
    let probe = dir.join(temp_name("write-probe"));
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&probe)
        .await?;
    fs::remove_file(&probe).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceErrorKind;
    use std::cell::Cell;
    use std::sync::Arc;
    use std::time::UNIX_EPOCH;
    use tempfile::tempdir;

    async fn create(path: &Path) -> FilePersistence {
        FilePersistence::create(path, LoggerOptions::default(), LockOptions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        persistence.save(br#"{"a":1}"#).await.unwrap();
        assert_eq!(persistence.load().await.unwrap().unwrap(), br#"{"a":1}"#);

        persistence.save(b"").await.unwrap();
        assert_eq!(persistence.load().await.unwrap().unwrap(), b"");
    }

    #[tokio::test]
    async fn test_load_before_save_is_absent() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        assert!(persistence.load().await.unwrap().is_none());
        assert!(persistence.last_modified().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_makes_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("deeper").join("cache.json");
        let persistence = create(&path).await;

        assert!(path.parent().unwrap().is_dir());
        // Construction must not create the cache file itself
        assert!(!path.exists());
        assert_eq!(persistence.location(), path.as_path());
    }

    #[tokio::test]
    async fn test_create_rejects_directory_location() {
        let dir = tempdir().unwrap();
        let err = FilePersistence::create(dir.path(), LoggerOptions::default(), LockOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::FileAccess);
    }

    #[tokio::test]
    async fn test_create_rejects_path_without_file_name() {
        let err = FilePersistence::create("/", LoggerOptions::default(), LockOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::Unclassified);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        persistence.save(b"blob").await.unwrap();
        assert!(persistence.delete().await.unwrap());
        assert!(!persistence.delete().await.unwrap());
        assert!(persistence.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_after_directory_removed() {
        let dir = tempdir().unwrap();
        let sub = dir.path().join("sub");
        let persistence = create(&sub.join("cache.json")).await;
        std::fs::remove_dir_all(&sub).unwrap();

        assert!(!persistence.delete().await.unwrap());
    }

    #[tokio::test]
    async fn test_reload_necessary_tracks_mtime() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        // Nothing persisted: never newer than anything
        assert!(!persistence
            .reload_necessary(DateTime::<Utc>::MIN_UTC)
            .await
            .unwrap());

        persistence.save(b"one").await.unwrap();
        let first = persistence.last_modified().await.unwrap().unwrap();
        assert!(!persistence.reload_necessary(first).await.unwrap());
        assert!(persistence
            .reload_necessary(first - chrono::Duration::milliseconds(1))
            .await
            .unwrap());

        persistence.save(b"two").await.unwrap();
        let second = persistence.last_modified().await.unwrap().unwrap();
        assert!(second > first);
        assert!(persistence.reload_necessary(first).await.unwrap());
        assert!(!persistence.reload_necessary(second).await.unwrap());
    }

    #[tokio::test]
    async fn test_rapid_saves_strictly_advance_mtime() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        let mut last = None;
        for i in 0..20 {
            persistence.save(format!("{i}").as_bytes()).await.unwrap();
            let modified = persistence.last_modified().await.unwrap().unwrap();
            if let Some(previous) = last {
                assert!(modified > previous, "save {i} did not advance mtime");
            }
            last = Some(modified);
        }
    }

    #[tokio::test]
    async fn test_no_temp_or_lock_files_left_behind() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        persistence.save(b"one").await.unwrap();
        persistence.save(b"two").await.unwrap();
        persistence.load_or_init(b"three").await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cache.json".to_string()]);
    }

    #[tokio::test]
    async fn test_load_or_init() {
        let dir = tempdir().unwrap();
        let persistence = create(&dir.path().join("cache.json")).await;

        assert!(persistence.load_or_init(b"initial").await.unwrap().is_none());
        assert_eq!(persistence.load().await.unwrap().unwrap(), b"initial");

        let existing = persistence.load_or_init(b"other").await.unwrap();
        assert_eq!(existing.unwrap(), b"initial");
    }

    #[tokio::test]
    async fn test_save_fails_with_lock_timeout_when_lock_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let lock_options = LockOptions {
            initial_delay_ms: 5,
            max_delay_ms: 10,
            timeout_ms: 50,
            stale_after_ms: 60_000,
        };
        let persistence = FilePersistence::create(&path, LoggerOptions::default(), lock_options)
            .await
            .unwrap();
        std::fs::write(dir.path().join("cache.json.lock"), "1 other-process").unwrap();

        let err = persistence.save(b"blob").await.unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::LockTimeout);
        assert!(persistence.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_save_and_delete_release_write_lock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let persistence = create(&path).await;
        persistence.save(b"blob").await.unwrap();

        // Replace the cache with a non-empty directory so the rename and
        // remove fail after the lock is taken
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), b"x").unwrap();

        let err = persistence.save(b"new").await.unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::FileAccess);
        assert!(!dir.path().join("cache.json.lock").exists());

        let err = persistence.delete().await.unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::FileAccess);
        assert!(!dir.path().join("cache.json.lock").exists());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["cache.json".to_string()]);
    }

    fn truncated(time: SystemTime, granularity_secs: u64) -> SystemTime {
        let secs = time.duration_since(UNIX_EPOCH).unwrap().as_secs();
        UNIX_EPOCH + Duration::from_secs(secs - secs % granularity_secs)
    }

    /// Run `advance_mtime` against a filesystem storing `granularity_secs`
    /// resolution (0 for exact), returning the stored time.
    fn advance_on(granularity_secs: u64, previous: SystemTime, written: SystemTime) -> SystemTime {
        let stored = Cell::new(written);
        advance_mtime(
            previous,
            || Ok(stored.get()),
            |time| {
                let time = if granularity_secs == 0 {
                    time
                } else {
                    truncated(time, granularity_secs)
                };
                stored.set(time);
                Ok(())
            },
        )
        .unwrap();
        stored.get()
    }

    #[test]
    fn test_mtime_advances_on_coarse_filesystems() {
        let previous = UNIX_EPOCH + Duration::from_secs(10);

        assert_eq!(
            advance_on(0, previous, previous),
            previous + Duration::from_millis(1)
        );
        // Whole-second timestamps (HFS+, ext3)
        assert_eq!(
            advance_on(1, previous, previous),
            UNIX_EPOCH + Duration::from_secs(11)
        );
        // Two-second timestamps (FAT)
        assert_eq!(
            advance_on(2, previous, previous),
            UNIX_EPOCH + Duration::from_secs(12)
        );
        // Already newer: left alone
        let later = previous + Duration::from_secs(5);
        assert_eq!(advance_on(2, previous, later), later);
    }

    #[test]
    fn test_mtime_that_cannot_advance_is_an_error() {
        let previous = UNIX_EPOCH + Duration::from_secs(10);
        let result = advance_mtime(previous, || Ok(previous), |_| Ok(()));
        assert!(result.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_load_never_sees_torn_write() {
        let dir = tempdir().unwrap();
        let persistence = Arc::new(create(&dir.path().join("cache.json")).await);
        let old = vec![b'a'; 256 * 1024];
        let new = vec![b'b'; 256 * 1024];
        persistence.save(&old).await.unwrap();

        let writer = {
            let persistence = Arc::clone(&persistence);
            let (old, new) = (old.clone(), new.clone());
            tokio::spawn(async move {
                for i in 0..20 {
                    let blob = if i % 2 == 0 { &new } else { &old };
                    persistence.save(blob).await.unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let persistence = Arc::clone(&persistence);
                let (old, new) = (old.clone(), new.clone());
                tokio::spawn(async move {
                    for _ in 0..50 {
                        let loaded = persistence.load().await.unwrap().unwrap();
                        assert!(loaded == old || loaded == new, "observed a torn write");
                    }
                })
            })
            .collect();

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_validation_instance_is_isolated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let persistence = create(&path).await;
        persistence.save(b"real").await.unwrap();
        let before = persistence.last_modified().await.unwrap();

        let probe = persistence.validation_instance().await.unwrap();
        assert_eq!(probe.location(), dir.path().join("validation.cache").as_path());
        probe.save(b"probe").await.unwrap();
        probe.delete().await.unwrap();

        assert_eq!(persistence.load().await.unwrap().unwrap(), b"real");
        assert_eq!(persistence.last_modified().await.unwrap(), before);
    }
}

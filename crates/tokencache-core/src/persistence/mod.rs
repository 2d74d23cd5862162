//! Persistence backends for an opaque token cache blob.
//!
//! Every backend implements [`Persistence`]:
//! - [`FilePersistence`]: atomic write-temp-then-rename to one file, guarded
//!   by a [`CrossProcessLock`] for writers
//! - [`KeyringPersistence`]: the blob lives in the OS secret store; a shadow
//!   file's modification time carries change detection

pub mod file;
pub mod keyring_store;
pub mod lock;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::logging::Logger;

pub use file::FilePersistence;
pub use keyring_store::KeyringPersistence;
pub use lock::{CrossProcessLock, LockGuard, LockOptions};

/// Opaque serialized cache content. Never inspected here.
pub type CacheBlob = Vec<u8>;

/// File name of the probe instance created next to the real cache.
pub const VALIDATION_FILE_NAME: &str = "validation.cache";

/// Which physical resources a backend instance addresses. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceIdentity {
    pub location: PathBuf,
    pub service: Option<String>,
    pub account: Option<String>,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Persist `contents`, replacing whatever was there. Readers in other
    /// processes see either the old blob or the new one, never a mix.
    async fn save(&self, contents: &[u8]) -> Result<()>;

    /// The most recently saved blob, or `None` if nothing has been saved.
    async fn load(&self) -> Result<Option<CacheBlob>>;

    /// Remove persisted state. Returns whether anything was removed.
    async fn delete(&self) -> Result<bool>;

    /// Modification time of the backing resource, `None` if it does not exist.
    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>>;

    /// True iff the backing resource changed strictly after `last_sync`.
    async fn reload_necessary(&self, last_sync: DateTime<Utc>) -> Result<bool> {
        Ok(self
            .last_modified()
            .await?
            .is_some_and(|modified| modified > last_sync))
    }

    /// Return the existing blob, or persist `initial` and return `None` if
    /// nothing was persisted yet.
    async fn load_or_init(&self, initial: &[u8]) -> Result<Option<CacheBlob>> {
        if let Some(existing) = self.load().await? {
            return Ok(Some(existing));
        }
        self.save(initial).await?;
        Ok(None)
    }

    /// Filesystem path backing this instance.
    fn location(&self) -> &Path;

    fn identity(&self) -> PersistenceIdentity;

    fn logger(&self) -> &Logger;

    /// A throwaway instance of the same backend at a reserved probe identity
    /// next to this one. Never addresses this instance's identity.
    async fn validation_instance(&self) -> Result<Box<dyn Persistence>>;
}

/// Sibling probe path in the same directory as `location`.
pub(crate) fn validation_location(location: &Path) -> PathBuf {
    let probe = location
        .parent()
        .map(|dir| dir.join(VALIDATION_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(VALIDATION_FILE_NAME));
    if probe == location {
        return probe.with_file_name(format!("{}.probe", VALIDATION_FILE_NAME));
    }
    probe
}

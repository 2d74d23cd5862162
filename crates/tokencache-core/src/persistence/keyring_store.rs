//! Secret-store persistence.
//!
//! The blob is stored in the OS secret store (Keychain, Credential Manager,
//! Secret Service or the kernel keyring) under `(service, account)`. A shadow
//! [`FilePersistence`] next to the configured location carries no secret; its
//! only job is to get a fresh modification time on every save so other
//! processes can detect the change through `reload_necessary`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyring::Entry;

use super::file::FilePersistence;
use super::lock::LockOptions;
use super::{validation_location, CacheBlob, Persistence, PersistenceIdentity};
use crate::error::{IdentityError, PersistenceError, Result};
use crate::logging::{Logger, LoggerOptions};

/// Service name of the validation probe entry.
pub const VALIDATION_SERVICE_NAME: &str = "tokencache-validation-service";

/// Account name of the validation probe entry.
pub const VALIDATION_ACCOUNT_NAME: &str = "tokencache-validation-account";

/// Content of the shadow file. Only its modification time matters.
const SHADOW_PLACEHOLDER: &[u8] = b"{}";

pub struct KeyringPersistence {
    entry: Arc<Entry>,
    shadow: FilePersistence,
    service: String,
    account: String,
}

impl std::fmt::Debug for KeyringPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyringPersistence")
            .field("service", &self.service)
            .field("account", &self.account)
            .field("shadow", &self.shadow.path())
            .finish()
    }
}

impl KeyringPersistence {
    /// Build the shadow file backend at `shadow_path` and a secret store entry
    /// handle for `(service, account)`. The entry is owned by this instance.
    pub async fn create(
        shadow_path: impl Into<PathBuf>,
        service: impl Into<String>,
        account: impl Into<String>,
        logger_options: LoggerOptions,
        lock_options: LockOptions,
    ) -> Result<Self> {
        let service = service.into();
        let account = account.into();
        if service.is_empty() {
            return Err(PersistenceError::unclassified(IdentityError::Missing("service name")));
        }
        if account.is_empty() {
            return Err(PersistenceError::unclassified(IdentityError::Missing("account name")));
        }

        let shadow = FilePersistence::create(shadow_path, logger_options, lock_options).await?;
        let entry = Entry::new(&service, &account).map_err(PersistenceError::from_keyring)?;

        shadow.logger().info_pii(&format!(
            "Secret store persistence ready for service '{}', account '{}'",
            service, account
        ));
        Ok(Self {
            entry: Arc::new(entry),
            shadow,
            service,
            account,
        })
    }

    /// Run a blocking secret store call off the async executor.
    async fn with_entry<T, F>(&self, op: F) -> Result<keyring::Result<T>>
    where
        F: FnOnce(&Entry) -> keyring::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let entry = Arc::clone(&self.entry);
        tokio::task::spawn_blocking(move || op(&entry))
            .await
            .map_err(PersistenceError::unclassified)
    }

    async fn delete_secret(&self) -> Result<bool> {
        match self.with_entry(|entry| entry.delete_credential()).await? {
            Ok(()) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(PersistenceError::from_keyring(e)),
        }
    }
}

#[async_trait]
impl Persistence for KeyringPersistence {
    async fn save(&self, contents: &[u8]) -> Result<()> {
        let secret = contents.to_vec();
        self.with_entry(move |entry| entry.set_secret(&secret))
            .await?
            .map_err(PersistenceError::from_keyring)?;

        // A failed shadow write would hide this save from other processes
        if let Err(e) = self.shadow.save(SHADOW_PLACEHOLDER).await {
            self.logger()
                .error(&format!("Secret saved but shadow file update failed: {}", e));
            return Err(e);
        }
        self.logger()
            .verbose(&format!("Saved {} bytes to secret store", contents.len()));
        Ok(())
    }

    async fn load(&self) -> Result<Option<CacheBlob>> {
        match self.with_entry(|entry| entry.get_secret()).await? {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => {
                self.logger().trace("No secret store entry yet");
                Ok(None)
            }
            Err(e) => Err(PersistenceError::from_keyring(e)),
        }
    }

    async fn delete(&self) -> Result<bool> {
        let (shadow, secret) = futures::future::join(self.shadow.delete(), self.delete_secret()).await;

        match (shadow, secret) {
            (Ok(shadow_removed), Ok(secret_removed)) => Ok(shadow_removed || secret_removed),
            (Err(e), Ok(secret_removed)) => {
                self.logger().error(&format!(
                    "Partial delete: secret removed={}, shadow file failed: {}",
                    secret_removed, e
                ));
                Err(e)
            }
            (Ok(shadow_removed), Err(e)) => {
                self.logger().error(&format!(
                    "Partial delete: shadow removed={}, secret store failed: {}",
                    shadow_removed, e
                ));
                Err(e)
            }
            (Err(shadow_err), Err(e)) => {
                self.logger()
                    .error(&format!("Delete failed for shadow file too: {}", shadow_err));
                Err(e)
            }
        }
    }

    async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
        self.shadow.last_modified().await
    }

    async fn reload_necessary(&self, last_sync: DateTime<Utc>) -> Result<bool> {
        self.shadow.reload_necessary(last_sync).await
    }

    fn location(&self) -> &Path {
        self.shadow.path()
    }

    fn identity(&self) -> PersistenceIdentity {
        PersistenceIdentity {
            location: self.shadow.path().to_path_buf(),
            service: Some(self.service.clone()),
            account: Some(self.account.clone()),
        }
    }

    fn logger(&self) -> &Logger {
        self.shadow.logger()
    }

    async fn validation_instance(&self) -> Result<Box<dyn Persistence>> {
        let probe = KeyringPersistence::create(
            validation_location(self.shadow.path()),
            VALIDATION_SERVICE_NAME,
            VALIDATION_ACCOUNT_NAME,
            self.logger().options().clone(),
            self.shadow.lock_options().clone(),
        )
        .await?;
        Ok(Box::new(probe))
    }
}

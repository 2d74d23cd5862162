//! Builds the configured backend, optionally verifying it first.

use std::sync::Arc;

use tracing::warn;

use crate::config::{BackendKind, PersistenceConfig};
use crate::error::{IdentityError, PersistenceError, Result};
use crate::persistence::{FilePersistence, KeyringPersistence, Persistence};
use crate::validation::verify_persistence;

pub async fn create_persistence(config: &PersistenceConfig) -> Result<Arc<dyn Persistence>> {
    let persistence: Arc<dyn Persistence> = match config.backend {
        BackendKind::File => Arc::new(create_file(config).await?),
        BackendKind::SecretStore => {
            let service = config
                .service_name
                .as_deref()
                .ok_or_else(|| PersistenceError::unclassified(IdentityError::Missing("service name")))?;
            let account = config
                .account_name
                .as_deref()
                .ok_or_else(|| PersistenceError::unclassified(IdentityError::Missing("account name")))?;
            Arc::new(
                KeyringPersistence::create(
                    &config.cache_path,
                    service,
                    account,
                    config.logging.clone(),
                    config.lock.clone(),
                )
                .await?,
            )
        }
    };

    if !config.verify {
        return Ok(persistence);
    }

    match verify_persistence(persistence.as_ref()).await {
        Ok(()) => Ok(persistence),
        Err(e) if should_fall_back(config) => {
            warn!(path = %config.cache_path.display(), error = %e, "Secret store failed verification, using plaintext file");
            persistence
                .logger()
                .warning(&format!("Falling back to plaintext file persistence: {}", e));
            Ok(Arc::new(create_file(config).await?))
        }
        Err(e) => Err(e),
    }
}

async fn create_file(config: &PersistenceConfig) -> Result<FilePersistence> {
    FilePersistence::create(
        &config.cache_path,
        config.logging.clone(),
        config.lock.clone(),
    )
    .await
}

fn should_fall_back(config: &PersistenceConfig) -> bool {
    config.backend == BackendKind::SecretStore
        && config.use_plaintext_file_on_linux
        && cfg!(target_os = "linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceErrorKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_creates_file_backend() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let persistence = create_persistence(&PersistenceConfig::file(&path).with_verify(true))
            .await
            .unwrap();

        assert_eq!(persistence.location(), path.as_path());
        assert!(persistence.identity().service.is_none());
    }

    #[tokio::test]
    async fn test_creates_secret_store_backend() {
        crate::persistence::keyring_store::tests::use_mock_store();
        let dir = tempdir().unwrap();
        let config = PersistenceConfig::secret_store(dir.path().join("cache.json"), "cache-svc", "user-1")
            .with_verify(true);
        let persistence = create_persistence(&config).await.unwrap();

        let identity = persistence.identity();
        assert_eq!(identity.service.as_deref(), Some("cache-svc"));
        assert_eq!(identity.account.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn test_secret_store_requires_identity() {
        let dir = tempdir().unwrap();
        let mut config = PersistenceConfig::file(dir.path().join("cache.json"));
        config.backend = BackendKind::SecretStore;

        let err = create_persistence(&config).await.err().unwrap();
        assert_eq!(err.kind(), PersistenceErrorKind::Unclassified);
        assert!(err.to_string().contains("service name"));
    }

    #[test]
    fn test_fallback_only_for_secret_store() {
        let file = PersistenceConfig::file("/tmp/cache.json").with_plaintext_fallback(true);
        assert!(!should_fall_back(&file));

        let store = PersistenceConfig::secret_store("/tmp/cache.json", "s", "a");
        assert!(!should_fall_back(&store));
        assert_eq!(
            should_fall_back(&store.with_plaintext_fallback(true)),
            cfg!(target_os = "linux")
        );
    }
}

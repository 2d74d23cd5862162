//! Startup self-test for a persistence backend.
//!
//! Runs save / load / delete against the backend's validation instance so a
//! missing permission or an unreachable secret store shows up before the real
//! cache is trusted to it.

use crate::error::{PersistenceError, Result, ValidationStage};
use crate::persistence::Persistence;

/// Prefix of the random probe value written during validation.
const PROBE_PREFIX: &str = "tokencache-validation";

pub async fn verify_persistence(persistence: &dyn Persistence) -> Result<()> {
    let probe = persistence
        .validation_instance()
        .await
        .map_err(|e| PersistenceError::validation(ValidationStage::Create, e))?;
    let logger = persistence.logger();
    logger.verbose(&format!(
        "Verifying persistence with probe at {}",
        probe.location().display()
    ));

    let expected = format!("{}-{:016x}", PROBE_PREFIX, rand::random::<u64>());

    probe
        .save(expected.as_bytes())
        .await
        .map_err(|e| PersistenceError::validation(ValidationStage::Save, e))?;

    let loaded = probe
        .load()
        .await
        .map_err(|e| PersistenceError::validation(ValidationStage::Load, e))?;

    if loaded.as_deref() != Some(expected.as_bytes()) {
        // Best effort; the mismatch is the error worth reporting
        let _ = probe.delete().await;
        logger.error("Persistence probe read back different contents");
        return Err(PersistenceError::ValidationFailure {
            stage: ValidationStage::Mismatch,
            message: format!(
                "expected {} bytes, read back {}",
                expected.len(),
                loaded
                    .map(|blob| blob.len().to_string())
                    .unwrap_or_else(|| "nothing".to_string())
            ),
            source: None,
        });
    }

    probe
        .delete()
        .await
        .map_err(|e| PersistenceError::validation(ValidationStage::Delete, e))?;

    logger.info("Persistence verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistenceErrorKind;
    use crate::logging::{Logger, LoggerOptions};
    use crate::persistence::{
        CacheBlob, FilePersistence, KeyringPersistence, LockOptions, PersistenceIdentity,
    };
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_backend_verifies() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::create(
            dir.path().join("cache.json"),
            LoggerOptions::default(),
            LockOptions::default(),
        )
        .await
        .unwrap();
        persistence.save(b"real").await.unwrap();

        verify_persistence(&persistence).await.unwrap();

        assert_eq!(persistence.load().await.unwrap().unwrap(), b"real");
        assert!(!dir.path().join("validation.cache").exists());
    }

    #[tokio::test]
    async fn test_keyring_backend_verifies() {
        crate::persistence::keyring_store::tests::use_mock_store();
        let dir = tempdir().unwrap();
        let persistence = KeyringPersistence::create(
            dir.path().join("cache.json"),
            "cache-svc",
            "user-1",
            LoggerOptions::default(),
            LockOptions::default(),
        )
        .await
        .unwrap();

        verify_persistence(&persistence).await.unwrap();
        assert!(persistence.load().await.unwrap().is_none());
    }

    /// Probe that silently drops writes.
    struct Forgetful {
        location: PathBuf,
        logger: Logger,
    }

    #[async_trait]
    impl Persistence for Forgetful {
        async fn save(&self, _contents: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn load(&self) -> Result<Option<CacheBlob>> {
            Ok(None)
        }
        async fn delete(&self) -> Result<bool> {
            Ok(false)
        }
        async fn last_modified(&self) -> Result<Option<DateTime<Utc>>> {
            Ok(None)
        }
        fn location(&self) -> &Path {
            &self.location
        }
        fn identity(&self) -> PersistenceIdentity {
            PersistenceIdentity {
                location: self.location.clone(),
                service: None,
                account: None,
            }
        }
        fn logger(&self) -> &Logger {
            &self.logger
        }
        async fn validation_instance(&self) -> Result<Box<dyn Persistence>> {
            Ok(Box::new(Forgetful {
                location: self.location.clone(),
                logger: self.logger.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_mismatch_is_validation_failure() {
        let location = PathBuf::from("/nonexistent/cache.json");
        let persistence = Forgetful {
            logger: Logger::new(LoggerOptions::default(), "test", &location),
            location,
        };

        match verify_persistence(&persistence).await.unwrap_err() {
            PersistenceError::ValidationFailure { stage, .. } => {
                assert_eq!(stage, ValidationStage::Mismatch)
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_probe_failure_is_validation_failure() {
        let dir = tempdir().unwrap();
        let persistence = FilePersistence::create(
            dir.path().join("cache.json"),
            LoggerOptions::default(),
            LockOptions {
                initial_delay_ms: 5,
                max_delay_ms: 10,
                timeout_ms: 30,
                stale_after_ms: 60_000,
            },
        )
        .await
        .unwrap();
        // Someone else holds the probe's write lock
        std::fs::write(dir.path().join("validation.cache.lock"), "1 other").unwrap();

        let err = verify_persistence(&persistence).await.unwrap_err();
        assert_eq!(err.kind(), PersistenceErrorKind::ValidationFailure);
        match err {
            PersistenceError::ValidationFailure { stage, source, .. } => {
                assert_eq!(stage, ValidationStage::Save);
                assert_eq!(source.unwrap().kind(), PersistenceErrorKind::LockTimeout);
            }
            _ => unreachable!(),
        }
    }
}

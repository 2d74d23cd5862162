//! Cache plugin hooks for a host auth library.
//!
//! The host calls [`CachePlugin::before_cache_access`] and
//! [`CachePlugin::after_cache_access`] around every operation that touches its
//! in-memory token cache. [`PersistenceCachePlugin`] keeps that cache in sync
//! with a [`Persistence`] backend shared by several processes:
//! - before: take the cross-process plugin lock, reload if another process
//!   saved since our last sync (or seed the store if it is empty)
//! - after: save if the cache changed, then release the lock

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{BoxError, PersistenceError, Result};
use crate::persistence::{CrossProcessLock, LockGuard, LockOptions, Persistence};

/// Suffix of the lock file held from before-access to after-access.
pub const PLUGIN_LOCK_SUFFIX: &str = ".lockfile";

/// The host's in-memory cache. Its serialization format is the host's business.
pub trait TokenCache: Send + Sync {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(&self, blob: &[u8]) -> std::result::Result<(), BoxError>;
}

pub struct TokenCacheContext<'a> {
    cache: &'a dyn TokenCache,
    cache_has_changed: bool,
}

impl<'a> TokenCacheContext<'a> {
    pub fn new(cache: &'a dyn TokenCache, cache_has_changed: bool) -> Self {
        Self {
            cache,
            cache_has_changed,
        }
    }

    pub fn cache(&self) -> &dyn TokenCache {
        self.cache
    }

    pub fn cache_has_changed(&self) -> bool {
        self.cache_has_changed
    }
}

#[async_trait]
pub trait CachePlugin: Send + Sync {
    async fn before_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()>;
    async fn after_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()>;
}

#[derive(Default)]
struct SyncState {
    last_sync: Option<DateTime<Utc>>,
    guard: Option<LockGuard>,
}

pub struct PersistenceCachePlugin {
    persistence: Arc<dyn Persistence>,
    lock: CrossProcessLock,
    state: Mutex<SyncState>,
}

impl PersistenceCachePlugin {
    pub fn new(persistence: Arc<dyn Persistence>, lock_options: LockOptions) -> Self {
        let lock = CrossProcessLock::for_target(persistence.location(), PLUGIN_LOCK_SUFFIX, lock_options);
        Self {
            persistence,
            lock,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Modification time observed at the last load or save, if any.
    pub async fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.last_sync
    }

    async fn sync_from_persistence(
        &self,
        last_sync: &mut Option<DateTime<Utc>>,
        cache: &dyn TokenCache,
    ) -> Result<()> {
        if let Some(previous) = *last_sync {
            if !self.persistence.reload_necessary(previous).await? {
                debug!(path = %self.persistence.location().display(), "Persisted cache unchanged, skipping reload");
                return Ok(());
            }
        }

        match self.persistence.load_or_init(&cache.serialize()).await? {
            Some(blob) => {
                cache.deserialize(&blob).map_err(PersistenceError::Unclassified)?;
                self.persistence.logger().verbose("Reloaded cache from persistence");
            }
            None => self
                .persistence
                .logger()
                .verbose("Seeded persistence with in-memory cache"),
        }

        *last_sync = self.persistence.last_modified().await?;
        Ok(())
    }
}

#[async_trait]
impl CachePlugin for PersistenceCachePlugin {
    async fn before_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.guard.is_none() {
            state.guard = Some(self.lock.acquire().await?);
        }

        let synced = self
            .sync_from_persistence(&mut state.last_sync, context.cache())
            .await;
        if synced.is_err() {
            // The host will not call after-access for a failed before-access
            if let Some(guard) = state.guard.take() {
                let _ = guard.release().await;
            }
        }
        synced
    }

    async fn after_cache_access(&self, context: &TokenCacheContext<'_>) -> Result<()> {
        let mut state = self.state.lock().await;

        let saved = if context.cache_has_changed() {
            match self.persistence.save(&context.cache().serialize()).await {
                Ok(()) => self
                    .persistence
                    .last_modified()
                    .await
                    .map(|modified| state.last_sync = modified),
                Err(e) => Err(e),
            }
        } else {
            Ok(())
        };

        let released = match state.guard.take() {
            Some(guard) => guard.release().await,
            None => Ok(()),
        };
        saved.and(released)
    }
}

//! Persistence for an authentication token cache.
//!
//! A caller holds one [`Persistence`] instance and uses it to keep its
//! serialized token cache across process restarts:
//! - [`FilePersistence`]: atomic writes to a file, cross-process writer lock,
//!   modification-time change detection
//! - [`KeyringPersistence`]: the blob lives in the OS secret store; a shadow
//!   file next to the configured path carries change detection
//!
//! [`create_persistence`] builds either from a [`PersistenceConfig`],
//! [`verify_persistence`] probes a backend before it is trusted, and
//! [`PersistenceCachePlugin`] adapts a backend to a host auth library's
//! before/after cache access hooks.

pub mod config;
pub mod creator;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod plugin;
pub mod validation;

pub use config::{BackendKind, PersistenceConfig};
pub use creator::create_persistence;
pub use error::{
    Classification, PersistenceError, PersistenceErrorKind, Result, SecretStoreFailure,
    ValidationStage,
};
pub use logging::{LogLevel, Logger, LoggerOptions};
pub use persistence::{
    CacheBlob, CrossProcessLock, FilePersistence, KeyringPersistence, LockOptions, Persistence,
    PersistenceIdentity,
};
pub use plugin::{CachePlugin, PersistenceCachePlugin, TokenCache, TokenCacheContext};
pub use validation::verify_persistence;

//! Persistence configuration.
//!
//! A [`PersistenceConfig`] selects the backend and carries the identity,
//! lock tuning and logger options the backend is constructed with. The
//! default cache location is `~/.cache/tokencache/token-cache.json` (or the
//! platform equivalent).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logging::LoggerOptions;
use crate::persistence::LockOptions;

/// Application name used for the default cache directory
pub const APP_NAME: &str = "tokencache";

/// Default cache file name
const CACHE_FILE: &str = "token-cache.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    File,
    SecretStore,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::File => write!(f, "file"),
            BackendKind::SecretStore => write!(f, "secret-store"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(BackendKind::File),
            "secret-store" | "keyring" | "keychain" => Ok(BackendKind::SecretStore),
            other => Err(format!("unknown backend '{}', expected 'file' or 'secret-store'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: BackendKind,
    /// Cache file for the file backend, shadow file for the secret store backend.
    pub cache_path: PathBuf,
    pub service_name: Option<String>,
    pub account_name: Option<String>,
    /// Run the validation probe before handing out the backend.
    pub verify: bool,
    /// On Linux, fall back to a plaintext file when the secret store fails verification.
    pub use_plaintext_file_on_linux: bool,
    pub lock: LockOptions,
    pub logging: LoggerOptions,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            cache_path: default_cache_path(),
            service_name: None,
            account_name: None,
            verify: false,
            use_plaintext_file_on_linux: false,
            lock: LockOptions::default(),
            logging: LoggerOptions::default(),
        }
    }
}

impl PersistenceConfig {
    pub fn file(cache_path: impl Into<PathBuf>) -> Self {
        Self {
            backend: BackendKind::File,
            cache_path: cache_path.into(),
            ..Self::default()
        }
    }

    pub fn secret_store(
        shadow_path: impl Into<PathBuf>,
        service_name: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            backend: BackendKind::SecretStore,
            cache_path: shadow_path.into(),
            service_name: Some(service_name.into()),
            account_name: Some(account_name.into()),
            ..Self::default()
        }
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_plaintext_fallback(mut self, fallback: bool) -> Self {
        self.use_plaintext_file_on_linux = fallback;
        self
    }

    pub fn with_logging(mut self, logging: LoggerOptions) -> Self {
        self.logging = logging;
        self
    }

    pub fn with_lock(mut self, lock: LockOptions) -> Self {
        self.lock = lock;
        self
    }
}

pub fn default_cache_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("./cache"))
        .join(APP_NAME)
        .join(CACHE_FILE)
}

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Boxed error carried through unchanged when a failure has no recognizable
/// environment signature.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("File access error at {}: {source}", .path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {}ms waiting for lock {}", .waited.as_millis(), .path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Secret store error ({reason}): {message}")]
    SecretStore {
        reason: SecretStoreFailure,
        message: String,
    },

    #[error("Persistence validation failed during {stage}: {message}")]
    ValidationFailure {
        stage: ValidationStage,
        message: String,
        #[source]
        source: Option<Box<PersistenceError>>,
    },

    #[error(transparent)]
    Unclassified(BoxError),
}

pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Coarse category of a [`PersistenceError`], for callers that only branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PersistenceErrorKind {
    FileAccess,
    LockTimeout,
    SecretStore,
    ValidationFailure,
    Unclassified,
}

/// Environment-reported reason a secret store call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretStoreFailure {
    AccessDenied,
    EntryNotFound,
    Unavailable,
}

impl fmt::Display for SecretStoreFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretStoreFailure::AccessDenied => write!(f, "access denied"),
            SecretStoreFailure::EntryNotFound => write!(f, "entry not found"),
            SecretStoreFailure::Unavailable => write!(f, "secret service unavailable"),
        }
    }
}

/// Step of the validation probe that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationStage {
    Create,
    Save,
    Load,
    Mismatch,
    Delete,
}

impl fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationStage::Create => write!(f, "create"),
            ValidationStage::Save => write!(f, "save"),
            ValidationStage::Load => write!(f, "load"),
            ValidationStage::Mismatch => write!(f, "read-back comparison"),
            ValidationStage::Delete => write!(f, "delete"),
        }
    }
}

/// Result of classifying a raw backend failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    FileAccess,
    SecretStore(SecretStoreFailure),
    Unclassified,
}

/// Classify an I/O failure.
///
/// Anything the OS reported (a raw errno / Win32 code) or that maps onto a
/// filesystem condition is an environment failure. Errors synthesized by
/// library code without an OS code, e.g. `InvalidInput`, are left unclassified.
pub fn classify_io(err: &io::Error) -> Classification {
    if err.raw_os_error().is_some() {
        return Classification::FileAccess;
    }
    match err.kind() {
        io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::AlreadyExists
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WriteZero
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::OutOfMemory
        | io::ErrorKind::Unsupported => Classification::FileAccess,
        _ => Classification::Unclassified,
    }
}

/// Classify a secret store failure.
///
/// Only platform-reported conditions are classified. Encoding, length and
/// identity-shape errors come from the caller's input and stay unclassified.
pub fn classify_keyring(err: &keyring::Error) -> Classification {
    match err {
        keyring::Error::NoStorageAccess(_) => {
            Classification::SecretStore(SecretStoreFailure::AccessDenied)
        }
        keyring::Error::PlatformFailure(_) => {
            Classification::SecretStore(SecretStoreFailure::Unavailable)
        }
        keyring::Error::NoEntry => Classification::SecretStore(SecretStoreFailure::EntryNotFound),
        _ => Classification::Unclassified,
    }
}

impl PersistenceError {
    pub fn kind(&self) -> PersistenceErrorKind {
        match self {
            PersistenceError::FileAccess { .. } => PersistenceErrorKind::FileAccess,
            PersistenceError::LockTimeout { .. } => PersistenceErrorKind::LockTimeout,
            PersistenceError::SecretStore { .. } => PersistenceErrorKind::SecretStore,
            PersistenceError::ValidationFailure { .. } => PersistenceErrorKind::ValidationFailure,
            PersistenceError::Unclassified(_) => PersistenceErrorKind::Unclassified,
        }
    }

    /// Wrap an I/O failure on `path`, classifying it first.
    pub fn from_io(path: impl AsRef<Path>, err: io::Error) -> Self {
        match classify_io(&err) {
            Classification::Unclassified => PersistenceError::Unclassified(Box::new(err)),
            _ => PersistenceError::FileAccess {
                path: path.as_ref().to_path_buf(),
                source: err,
            },
        }
    }

    /// Wrap a secret store failure, classifying it first.
    pub fn from_keyring(err: keyring::Error) -> Self {
        match classify_keyring(&err) {
            Classification::SecretStore(reason) => PersistenceError::SecretStore {
                reason,
                message: err.to_string(),
            },
            _ => PersistenceError::Unclassified(Box::new(err)),
        }
    }

    pub fn validation(stage: ValidationStage, cause: PersistenceError) -> Self {
        PersistenceError::ValidationFailure {
            stage,
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn unclassified(err: impl Into<BoxError>) -> Self {
        PersistenceError::Unclassified(err.into())
    }
}

/// Identity fields missing or malformed at construction. Always unclassified.
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Secret store backend requires a {0}")]
    Missing(&'static str),

    #[error("Cache location has no file name: {}", .0.display())]
    NoFileName(PathBuf),
}

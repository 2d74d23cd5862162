//! Diagnostic sink handed to every persistence instance.
//!
//! A [`Logger`] is built from [`LoggerOptions`] at construction and filters by
//! level and PII before emitting. Without a callback, messages become `tracing`
//! events inside a span carrying the instance's component and location, so the
//! host's subscriber decides format and destination.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Span;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    #[default]
    Info,
    Verbose,
    Trace,
}

/// Receives `(level, message, contains_pii)` for every message that passes the filter.
pub type LoggerCallback = Arc<dyn Fn(LogLevel, &str, bool) + Send + Sync>;

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerOptions {
    pub level: LogLevel,
    pub pii_logging_enabled: bool,
    #[serde(skip)]
    pub callback: Option<LoggerCallback>,
}

impl fmt::Debug for LoggerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerOptions")
            .field("level", &self.level)
            .field("pii_logging_enabled", &self.pii_logging_enabled)
            .field("callback", &self.callback.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl LoggerOptions {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_callback(mut self, callback: LoggerCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

#[derive(Clone)]
pub struct Logger {
    options: LoggerOptions,
    span: Span,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("options", &self.options).finish()
    }
}

impl Logger {
    pub fn new(options: LoggerOptions, component: &'static str, location: &Path) -> Self {
        let span = tracing::debug_span!("persistence", component, location = %location.display());
        Self { options, span }
    }

    pub fn options(&self) -> &LoggerOptions {
        &self.options
    }

    pub fn is_enabled(&self, level: LogLevel, contains_pii: bool) -> bool {
        level <= self.options.level && (!contains_pii || self.options.pii_logging_enabled)
    }

    pub fn log(&self, level: LogLevel, message: &str, contains_pii: bool) {
        if !self.is_enabled(level, contains_pii) {
            return;
        }

        if let Some(ref callback) = self.options.callback {
            callback(level, message, contains_pii);
            return;
        }

        let _entered = self.span.enter();
        match level {
            LogLevel::Error => tracing::error!(pii = contains_pii, "{}", message),
            LogLevel::Warning => tracing::warn!(pii = contains_pii, "{}", message),
            LogLevel::Info => tracing::info!(pii = contains_pii, "{}", message),
            LogLevel::Verbose => tracing::debug!(pii = contains_pii, "{}", message),
            LogLevel::Trace => tracing::trace!(pii = contains_pii, "{}", message),
        }
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, false);
    }

    pub fn warning(&self, message: &str) {
        self.log(LogLevel::Warning, message, false);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, false);
    }

    /// Messages that may name accounts or paths under a user's home directory.
    pub fn info_pii(&self, message: &str) {
        self.log(LogLevel::Info, message, true);
    }

    pub fn verbose(&self, message: &str) {
        self.log(LogLevel::Verbose, message, false);
    }

    pub fn trace(&self, message: &str) {
        self.log(LogLevel::Trace, message, false);
    }
}

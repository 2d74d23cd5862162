//! Command-line arguments.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use tokencache_core::{BackendKind, PersistenceConfig};

/// Inspect and manage a persisted token cache
#[derive(Parser, Debug)]
#[command(name = "tokencache", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[command(flatten)]
    pub overrides: Overrides,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Persist FILE (or stdin) as the token cache
    Save {
        input: Option<PathBuf>,
    },
    /// Write the persisted token cache to stdout
    Load,
    /// Remove the persisted token cache
    Delete,
    /// Show backend, location and last modification
    Status {
        /// Also report whether a cache synced at this RFC 3339 time needs a reload
        #[arg(long, value_parser = parse_timestamp)]
        since: Option<DateTime<Utc>>,
    },
    /// Probe the backend with a throwaway identity
    Verify,
    /// Write the effective configuration to the config file
    InitConfig,
}

/// Command-line values that take precedence over the config file and environment.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    /// Persistence backend: file or secret-store
    #[arg(long, global = true)]
    pub backend: Option<BackendKind>,

    /// Cache file (file backend) or shadow file (secret store)
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    /// Secret store service name
    #[arg(long, global = true)]
    pub service: Option<String>,

    /// Secret store account name
    #[arg(long, global = true)]
    pub account: Option<String>,

    /// Verify the backend before using it
    #[arg(long, global = true)]
    pub verify: bool,
}

impl Overrides {
    pub fn apply(&self, config: &mut PersistenceConfig) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(ref path) = self.path {
            config.cache_path = path.clone();
        }
        if let Some(ref service) = self.service {
            config.service_name = Some(service.clone());
        }
        if let Some(ref account) = self.account {
            config.account_name = Some(account.clone());
        }
        if self.verify {
            config.verify = true;
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|parsed| parsed.with_timezone(&Utc))
}

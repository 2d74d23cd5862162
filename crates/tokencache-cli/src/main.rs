//! tokencache - inspect and manage a persisted token cache.
//!
//! This binary is a thin caller of `tokencache-core`: it resolves the
//! persistence configuration (config file, `.env`, environment, flags), builds
//! the backend and runs one command against it.

mod cli;
mod config;

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::{Cli, Command};
use config::Config;
use tokencache_core::{create_persistence, verify_persistence, Persistence};

// ============================================================================
// Constants
// ============================================================================

/// Log file name inside the configured log directory
const LOG_FILE: &str = "tokencache.log";

// ============================================================================
// Logging
// ============================================================================

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    config.apply_env()?;
    cli.overrides.apply(&mut config.persistence);

    let _log_guard = init_tracing(config.log_dir.as_deref());
    info!(
        backend = %config.persistence.backend,
        path = %config.persistence.cache_path.display(),
        "tokencache starting"
    );

    run(cli.command, &config).await
}

// ============================================================================
// Commands
// ============================================================================

async fn run(command: Command, config: &Config) -> Result<()> {
    if command == Command::InitConfig {
        let path = config.save()?;
        eprintln!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    let persistence = create_persistence(&config.persistence)
        .await
        .with_context(|| format!("Failed to open {} persistence", config.persistence.backend))?;

    match command {
        Command::Save { input } => {
            let blob = read_input(input).await?;
            persistence.save(&blob).await.context("Failed to save cache")?;
            eprintln!(
                "Saved {} bytes to {}",
                blob.len(),
                describe(persistence.as_ref())
            );
        }
        Command::Load => match persistence.load().await.context("Failed to load cache")? {
            Some(blob) => {
                let mut stdout = tokio::io::stdout();
                stdout.write_all(&blob).await?;
                stdout.flush().await?;
            }
            None => eprintln!("No cache persisted at {}", describe(persistence.as_ref())),
        },
        Command::Delete => {
            if persistence.delete().await.context("Failed to delete cache")? {
                eprintln!("Deleted cache at {}", describe(persistence.as_ref()));
            } else {
                eprintln!("Nothing to delete at {}", describe(persistence.as_ref()));
            }
        }
        Command::Status { since } => {
            let identity = persistence.identity();
            println!("backend:       {}", config.persistence.backend);
            println!("location:      {}", identity.location.display());
            if let (Some(service), Some(account)) = (identity.service, identity.account) {
                println!("secret entry:  {} / {}", service, account);
            }
            let modified = persistence.last_modified().await?;
            println!(
                "last modified: {}",
                modified
                    .map(|m| m.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
            if let Some(since) = since {
                let reload = persistence.reload_necessary(since).await?;
                println!("reload needed: {}", if reload { "yes" } else { "no" });
            }
        }
        Command::Verify => {
            verify_persistence(persistence.as_ref())
                .await
                .context("Persistence verification failed")?;
            eprintln!("Persistence verified for {}", describe(persistence.as_ref()));
        }
        Command::InitConfig => {}
    }

    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

async fn read_input(input: Option<PathBuf>) -> Result<Vec<u8>> {
    match input {
        Some(path) => tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut blob = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut blob)
                .await
                .context("Failed to read stdin")?;
            Ok(blob)
        }
    }
}

fn describe(persistence: &dyn Persistence) -> String {
    let identity = persistence.identity();
    match (identity.service, identity.account) {
        (Some(service), Some(account)) => format!(
            "secret store entry {}/{} (shadow {})",
            service,
            account,
            identity.location.display()
        ),
        _ => identity.location.display().to_string(),
    }
}

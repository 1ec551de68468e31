//! Structured logging setup.
//!
//! Console output goes through `tracing_subscriber::fmt`; when a JSONL
//! directory is configured, every event is also appended to
//! `<dir>/raw/<date>_<instance>.jsonl`, one file per peer instance.
//!
//! ```bash
//! # Everything one peer logged about slow-tier persistence
//! jq 'select(.instance == "alice" and .fields.tier == "slow")' logs/raw/*.jsonl
//! ```

mod entry;
mod layer;

pub use entry::{read_entries, JsonLogEntry};
pub use layer::JsonlLayer;

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::SyncError;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `config.filter`. Returns the JSONL file
/// path when the JSONL layer is enabled.
///
/// # Errors
///
/// `SyncError::Config` for an invalid filter or when a global subscriber is
/// already installed; `SyncError::Io` when the log file cannot be opened.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<std::path::PathBuf>, SyncError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) if !env.trim().is_empty() => EnvFilter::try_new(env),
        _ => EnvFilter::try_new(&config.filter),
    }
    .map_err(|e| SyncError::Config(format!("invalid log filter: {e}")))?;

    let jsonl = match &config.jsonl_dir {
        Some(dir) => Some(JsonlLayer::new(dir, &config.instance)?),
        None => None,
    };
    let path = jsonl.as_ref().map(|layer| layer.log_path().to_path_buf());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(jsonl)
        .try_init()
        .map_err(|e| SyncError::Config(format!("logging already initialised: {e}")))?;

    Ok(path)
}

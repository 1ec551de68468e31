//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! router_url = "wss://router.example.net"
//! compaction_threshold = 32
//! flush_debounce = "250ms"
//!
//! [retry]
//! initial_backoff = "200ms"
//! max_backoff = "30s"
//! multiplier = 2.0
//!
//! [logging]
//! filter = "autodoc_core=info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Tunables for peers and their documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the router; peers connect to `<router_url>/connect/as/<identity>`
    pub router_url: String,

    /// Incremental chunks kept in the fast tier before they are compacted into a snapshot
    pub compaction_threshold: usize,

    /// Delay used to coalesce bursts of changes into one slow-tier write
    #[serde(with = "humantime_serde")]
    pub flush_debounce: Duration,

    /// Attempts at reading the slow tier while opening a document with an empty fast tier
    pub slow_load_attempts: u32,

    /// Capacity of the sync event broadcast channel
    pub event_capacity: usize,

    /// Backoff for slow-tier retries
    pub retry: RetryPolicy,

    /// Logging setup
    pub logging: LoggingConfig,
}

/// Exponential backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives used when `RUST_LOG` is unset
    pub filter: String,

    /// Directory for JSONL logs; `None` disables the JSONL layer
    pub jsonl_dir: Option<PathBuf>,

    /// Instance name written into every JSONL entry and its file name
    pub instance: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            router_url: "wss://router.autodoc.local".to_string(),
            compaction_threshold: 32,
            flush_debounce: Duration::from_millis(250),
            slow_load_attempts: 3,
            event_capacity: 256,
            retry: RetryPolicy::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "autodoc_core=info,autodoc=info".to_string(),
            jsonl_dir: None,
            instance: "autodoc".to_string(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), capped at `max_backoff`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs)
    }
}

impl EngineConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(s: &str) -> Result<Self, SyncError> {
        let config: Self =
            toml::from_str(s).map_err(|e| SyncError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// Serialize to TOML text
    pub fn to_toml_string(&self) -> Result<String, SyncError> {
        toml::to_string_pretty(self).map_err(|e| SyncError::Serialization(e.to_string()))
    }

    /// Check invariants between fields
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.router_url.trim().is_empty() {
            return Err(SyncError::Config("router_url must not be empty".into()));
        }
        if self.compaction_threshold == 0 {
            return Err(SyncError::Config("compaction_threshold must be at least 1".into()));
        }
        if self.slow_load_attempts == 0 {
            return Err(SyncError::Config("slow_load_attempts must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncError::Config("event_capacity must be at least 1".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(SyncError::Config(format!(
                "retry.multiplier must be >= 1, got {}",
                self.retry.multiplier
            )));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(SyncError::Config(
                "retry.max_backoff must not be shorter than retry.initial_backoff".into(),
            ));
        }
        Ok(())
    }

    /// Settings for tests: no debounce and millisecond backoff
    pub fn for_tests() -> Self {
        Self {
            flush_debounce: Duration::ZERO,
            retry: RetryPolicy {
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(50),
                multiplier: 2.0,
            },
            ..Self::default()
        }
    }
}

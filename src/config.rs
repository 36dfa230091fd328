//! Engine configuration
//!
//! Fixed at construction. Loaded from code (builder methods), from defaults,
//! or from a TOML file:
//!
//! ```toml
//! threshold = 3
//! skip_frames = 1
//! reentrancy = "reject"
//! internal_prefixes = ["nplusone::", "std::", "myapp::db::"]
//!
//! [aggregation]
//! mode = "queued"
//! capacity = 4096
//! ```

use crate::error::{FinderError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default repetition count at which a fingerprint becomes a finding
pub const DEFAULT_THRESHOLD: usize = 2;

/// Frames captured by the stack source itself before the walk starts
pub const DEFAULT_SKIP_FRAMES: usize = 1;

/// Default capacity of the hand-off channel in queued mode
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Qualified-name prefixes treated as "not the application"
///
/// Covers this crate, the stack walker, the Rust runtime, the tracing
/// pipeline (used by the capture layer), and the common SQL drivers/ORMs.
pub fn default_internal_prefixes() -> Vec<String> {
    [
        "nplusone::",
        "backtrace::",
        "std::",
        "core::",
        "alloc::",
        "__rust",
        "rust_begin_unwind",
        "_Unwind",
        "tracing::",
        "tracing_core::",
        "tracing_subscriber::",
        "sqlx::",
        "sqlx_core::",
        "sqlx_postgres::",
        "sqlx_mysql::",
        "sqlx_sqlite::",
        "sea_orm::",
        "rusqlite::",
        "diesel::",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// What `begin()` does when a unit of work is already open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReentrancyPolicy {
    /// Discard the stale context unreported, log a warning, start fresh
    #[default]
    Reset,
    /// Keep the open context and return `FinderError::ReentrantBegin`
    Reject,
}

/// How observations reach the aggregation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AggregationMode {
    /// Caller thread updates the map under a lock
    #[default]
    Direct,
    /// Caller thread hands off to one consumer over a bounded channel.
    /// A full channel blocks the caller; nothing is dropped.
    Queued {
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
    },
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Configuration for a [`Finder`](crate::finder::Finder)
///
/// # Example
/// ```
/// use nplusone::config::FinderConfig;
///
/// let config = FinderConfig::default();
/// assert_eq!(config.threshold, 2);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FinderConfig {
    /// A fingerprint seen at least this many times in one unit of work is reported
    pub threshold: usize,

    /// Frames whose qualified name starts with any of these are skipped
    /// during call-site resolution
    pub internal_prefixes: Vec<String>,

    /// Innermost frames dropped unconditionally before prefix filtering
    pub skip_frames: usize,

    pub reentrancy: ReentrancyPolicy,

    pub aggregation: AggregationMode,
}

impl Default for FinderConfig {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
            internal_prefixes: default_internal_prefixes(),
            skip_frames: DEFAULT_SKIP_FRAMES,
            reentrancy: ReentrancyPolicy::Reset,
            aggregation: AggregationMode::Direct,
        }
    }
}

impl FinderConfig {
    /// Reject nested units of work instead of silently resetting
    pub fn strict() -> Self {
        Self {
            reentrancy: ReentrancyPolicy::Reject,
            ..Self::default()
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Add one prefix on top of the current list
    pub fn with_internal_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.internal_prefixes.push(prefix.into());
        self
    }

    /// Replace the prefix list entirely
    pub fn with_internal_prefixes<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.internal_prefixes = prefixes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_skip_frames(mut self, skip: usize) -> Self {
        self.skip_frames = skip;
        self
    }

    pub fn with_reentrancy(mut self, policy: ReentrancyPolicy) -> Self {
        self.reentrancy = policy;
        self
    }

    pub fn with_aggregation(mut self, mode: AggregationMode) -> Self {
        self.aggregation = mode;
        self
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(FinderError::InvalidConfig(
                "threshold must be >= 1, got 0".to_string(),
            ));
        }

        if let Some(pos) = self.internal_prefixes.iter().position(|p| p.is_empty()) {
            // An empty prefix matches every frame and no call site could ever resolve
            return Err(FinderError::InvalidConfig(format!(
                "internal_prefixes[{}] is empty",
                pos
            )));
        }

        if let AggregationMode::Queued { capacity: 0 } = self.aggregation {
            return Err(FinderError::InvalidConfig(
                "queue capacity must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

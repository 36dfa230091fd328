//! Error type for the detection engine
//!
//! Nothing in here is fatal to the instrumented process. Errors surface at
//! construction (bad configuration) or are swallowed and logged on the
//! request path (sink failures, re-entrant begin under the reset policy).

use thiserror::Error;

/// Errors produced by the engine and its collaborators
#[derive(Error, Debug)]
pub enum FinderError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Unit of work '{requested}' started while '{active}' is still open")]
    ReentrantBegin { active: String, requested: String },

    /// Failure reported by a [`FindingSink`](crate::report::FindingSink)
    /// whose backend is not a plain writer (log collector, channel, ...).
    /// The built-in writer sinks surface `Io`/`Json` instead.
    #[error("Finding sink failed: {0}")]
    Sink(String),

    #[error("Aggregation queue disconnected")]
    QueueDisconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FinderError>;

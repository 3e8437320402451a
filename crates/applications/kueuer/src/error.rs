//! Error types for the tracker, launcher and benchmark runner

use thiserror::Error;

use kueuer_core::SourceError;

/// Kueuer result type
pub type Result<T> = std::result::Result<T, KueuerError>;

/// Errors that can occur outside the tracker sessions
#[derive(Error, Debug)]
pub enum KueuerError {
    /// List/watch failure from the event source
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML template parse error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// CSV results error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Node name pattern did not compile
    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    /// Resource quantity could not be parsed
    #[error("Quantity error: {0}")]
    Quantity(String),

    /// Job template could not be rendered
    #[error("Template error: {0}")]
    Template(String),

    /// Job submission or deletion error
    #[error("Launch error: {0}")]
    Launch(String),

    /// A spawned tracking task panicked or was cancelled
    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl KueuerError {
    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a launch error
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a quantity error
    pub fn quantity(msg: impl Into<String>) -> Self {
        Self::Quantity(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Convert into the event source taxonomy.
    ///
    /// Transport failures become `Connectivity`, body decoding failures
    /// become `Decode`; source errors pass through unchanged.
    pub fn into_source(self) -> SourceError {
        match self {
            Self::Source(err) => err,
            Self::Http(err) if err.is_decode() => SourceError::decode(err.to_string()),
            Self::Http(err) => SourceError::connectivity(err.to_string()),
            Self::Json(err) => SourceError::decode(err.to_string()),
            other => SourceError::connectivity(other.to_string()),
        }
    }
}

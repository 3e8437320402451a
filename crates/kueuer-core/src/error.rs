//! Error types for Kueuer event sources

use thiserror::Error;

use crate::types::Revision;

/// Errors raised while listing or watching cluster resources
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The watch cannot resume from this revision; re-snapshot and restart
    #[error("Revision {revision} is too old to resume from")]
    StaleRevision { revision: Revision },

    /// No events arrived before the watch timeout
    #[error("Watch stream timed out")]
    StreamTimeout,

    /// The API server could not be reached
    #[error("Connectivity error: {0}")]
    Connectivity(String),

    /// The API server answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A response or watch frame could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A condition message did not carry the expected reference
    #[error("Malformed condition: {0}")]
    MalformedCondition(String),
}

impl SourceError {
    /// Create a stale revision error
    pub fn stale(revision: impl Into<Revision>) -> Self {
        Self::StaleRevision {
            revision: revision.into(),
        }
    }

    /// Create a connectivity error
    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Whether the caller must re-snapshot before watching again
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::StaleRevision { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_revision_display() {
        let err = SourceError::stale("1234");
        assert!(err.is_stale());
        assert_eq!(err.to_string(), "Revision 1234 is too old to resume from");
    }

    #[test]
    fn test_api_error_display() {
        let err = SourceError::Api {
            status: 403,
            message: "forbidden".to_string(),
        };
        assert!(!err.is_stale());
        assert_eq!(err.to_string(), "API error (403): forbidden");
    }
}

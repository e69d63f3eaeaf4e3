//! Common error types for FieldSync.

use thiserror::Error;

/// Top-level error type for FieldSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Durable store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Remote service could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// Remote service rejected an action.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Sync coordination failed.
    #[error("Sync error: {0}")]
    Sync(String),
}

impl Error {
    /// Whether this error came from the durable store rather than the remote side.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_) | Error::Serialization(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_classification() {
        assert!(Error::Storage("disk full".to_string()).is_persistence());
        assert!(Error::Serialization("bad json".to_string()).is_persistence());
        assert!(!Error::Network("timeout".to_string()).is_persistence());
        assert!(!Error::Remote("409".to_string()).is_persistence());
    }

    #[test]
    fn test_json_conversion() {
        let json = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err: Error = json.into();
        assert!(matches!(err, Error::Serialization(_)));
        assert!(err.is_persistence());
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("denied"));
    }
}

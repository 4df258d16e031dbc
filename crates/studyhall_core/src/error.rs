use serde::Serialize;
use thiserror::Error;

/// Unified error type for studyhall operations.
///
/// Errors are `Clone` so that every caller waiting on a shared operation
/// (for example a single-flight provider initialization) can receive the
/// same outcome.
#[derive(Debug, Clone, Error)]
pub enum StudyError {
    // Caller errors
    /// Missing or inconsistent settings.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A write was attempted on the snapshot backend.
    #[error("Backend is read-only: cannot {operation}")]
    ReadOnlyViolation {
        /// The refused operation.
        operation: String,
    },

    /// The current identity may not do this.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Arguments were rejected.
    #[error("Invalid input: {0}")]
    Validation(String),

    // Resource errors
    /// The named entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A concurrent writer updated the document first.
    #[error("Revision conflict on '{0}'")]
    Conflict(String),

    /// A fetched resource did not match its recorded hash.
    #[error("Integrity check failed for '{location}': expected sha256 {expected}, found {actual}")]
    Integrity {
        /// Resource location.
        location: String,
        /// Hash recorded in the manifest.
        expected: String,
        /// Hash of the bytes received.
        actual: String,
    },

    // Backend errors
    /// The backend could not be reached or failed.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A record did not (de)serialize.
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Export errors
    /// Packing a bundle failed at one resource.
    #[error("Export failed at {resource}: {cause}")]
    Export {
        /// Resource being written, or `"manifest"`.
        resource: String,
        /// Underlying failure.
        cause: Box<StudyError>,
    },

    /// The caller's cancellation token fired.
    #[error("Operation cancelled")]
    Cancelled,
}

/// Result type alias for studyhall operations
pub type Result<T> = std::result::Result<T, StudyError>;

impl StudyError {
    /// Shorthand for a [`StudyError::ReadOnlyViolation`] naming the refused operation.
    pub fn read_only(operation: impl Into<String>) -> Self {
        StudyError::ReadOnlyViolation {
            operation: operation.into(),
        }
    }

    /// Wrap this error as the cause of a failed export of `resource`.
    pub fn in_export(self, resource: impl Into<String>) -> Self {
        StudyError::Export {
            resource: resource.into(),
            cause: Box::new(self),
        }
    }

    /// Whether the caller may retry the operation that produced this error.
    ///
    /// Only transient backend failures and stale-revision conflicts qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            StudyError::BackendUnavailable(_) | StudyError::Conflict(_) => true,
            StudyError::Export { cause, .. } => cause.is_retryable(),
            _ => false,
        }
    }

    /// Stable variant name, used for IPC and health reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            StudyError::Configuration(_) => "Configuration",
            StudyError::ReadOnlyViolation { .. } => "ReadOnlyViolation",
            StudyError::PermissionDenied(_) => "PermissionDenied",
            StudyError::Validation(_) => "Validation",
            StudyError::NotFound(_) => "NotFound",
            StudyError::Conflict(_) => "Conflict",
            StudyError::Integrity { .. } => "Integrity",
            StudyError::BackendUnavailable(_) => "BackendUnavailable",
            StudyError::Serialization(_) => "Serialization",
            StudyError::Export { .. } => "Export",
            StudyError::Cancelled => "Cancelled",
        }
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

impl From<std::io::Error> for StudyError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StudyError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => StudyError::PermissionDenied(err.to_string()),
            _ => StudyError::BackendUnavailable(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StudyError {
    fn from(err: serde_json::Error) -> Self {
        StudyError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StudyError {
    fn from(err: toml::de::Error) -> Self {
        StudyError::Configuration(err.to_string())
    }
}

impl From<toml::ser::Error> for StudyError {
    fn from(err: toml::ser::Error) -> Self {
        StudyError::Serialization(err.to_string())
    }
}

/// A serializable representation of StudyError for IPC
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Resource the error is attached to (if applicable)
    pub resource: Option<String>,
    /// Whether the caller may retry
    pub retryable: bool,
}

impl From<&StudyError> for SerializableError {
    fn from(err: &StudyError) -> Self {
        let resource = match err {
            StudyError::Export { resource, .. } => Some(resource.clone()),
            StudyError::Integrity { location, .. } => Some(location.clone()),
            StudyError::Conflict(id) => Some(id.clone()),
            _ => None,
        };

        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
            resource,
            retryable: err.is_retryable(),
        }
    }
}

impl From<StudyError> for SerializableError {
    fn from(err: StudyError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(StudyError::BackendUnavailable("timeout".into()).is_retryable());
        assert!(StudyError::Conflict("c-1".into()).is_retryable());
        assert!(!StudyError::read_only("add card").is_retryable());
        assert!(!StudyError::PermissionDenied("nope".into()).is_retryable());
        assert!(!StudyError::NotFound("c-1".into()).is_retryable());
    }

    #[test]
    fn test_export_error_keeps_cause() {
        let err = StudyError::BackendUnavailable("disk full".into()).in_export("card c-1");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("card c-1"));
        assert!(err.to_string().contains("disk full"));

        let serializable = err.to_serializable();
        assert_eq!(serializable.kind, "Export");
        assert_eq!(serializable.resource.as_deref(), Some("card c-1"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert!(matches!(StudyError::from(io), StudyError::NotFound(_)));
    }
}

//! Unified error handling for the taxi-proximity library.
//!
//! Errors fall into three groups that drive how a run reacts:
//! - input-data problems (`InvalidInput`) are skipped by callers and never abort a run
//! - storage and artifact failures abort the current run but leave completed chunks valid
//! - configuration and internal errors are reported before any work starts

use std::fmt;

/// Unified error type for taxi-proximity operations.
#[derive(Debug, Clone)]
pub enum ProximityError {
    /// A trip or point row is malformed or missing fields
    InvalidInput { trip_id: String, message: String },
    /// Query or connection failure in the trip/point store
    Storage { message: String },
    /// Reading or writing a chunk, combined or summary artifact failed
    Artifact { path: String, message: String },
    /// Configuration error
    Config { message: String },
    /// Generic internal error
    Internal { message: String },
}

impl ProximityError {
    /// Whether re-running the same command can be expected to make progress.
    ///
    /// Storage and artifact failures are transient from the run's point of view:
    /// completed chunks survive and are skipped on the next invocation.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ProximityError::Storage { .. } | ProximityError::Artifact { .. }
        )
    }

    pub(crate) fn artifact(path: impl AsRef<std::path::Path>, err: impl fmt::Display) -> Self {
        ProximityError::Artifact {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ProximityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProximityError::InvalidInput { trip_id, message } => {
                write!(f, "Trip '{}' has invalid data: {}", trip_id, message)
            }
            ProximityError::Storage { message } => {
                write!(f, "Storage error: {}", message)
            }
            ProximityError::Artifact { path, message } => {
                write!(f, "Artifact error ({}): {}", path, message)
            }
            ProximityError::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }
            ProximityError::Internal { message } => {
                write!(f, "Internal error: {}", message)
            }
        }
    }
}

impl std::error::Error for ProximityError {}

impl From<rusqlite::Error> for ProximityError {
    fn from(err: rusqlite::Error) -> Self {
        ProximityError::Storage {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ProximityError {
    fn from(err: std::io::Error) -> Self {
        ProximityError::Artifact {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<csv::Error> for ProximityError {
    fn from(err: csv::Error) -> Self {
        ProximityError::Artifact {
            path: String::new(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ProximityError {
    fn from(err: serde_json::Error) -> Self {
        ProximityError::Config {
            message: err.to_string(),
        }
    }
}

/// Result type alias for taxi-proximity operations.
pub type Result<T> = std::result::Result<T, ProximityError>;

/// Extension trait for converting Option to ProximityError.
pub trait OptionExt<T> {
    /// Convert Option to Result with an invalid-input error for a trip.
    fn ok_or_invalid_input(self, trip_id: &str, message: &str) -> Result<T>;

    /// Convert Option to Result with generic internal error.
    fn ok_or_internal(self, message: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_invalid_input(self, trip_id: &str, message: &str) -> Result<T> {
        self.ok_or_else(|| ProximityError::InvalidInput {
            trip_id: trip_id.to_string(),
            message: message.to_string(),
        })
    }

    fn ok_or_internal(self, message: &str) -> Result<T> {
        self.ok_or_else(|| ProximityError::Internal {
            message: message.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProximityError::InvalidInput {
            trip_id: "T1".to_string(),
            message: "missing timestamp".to_string(),
        };
        assert!(err.to_string().contains("T1"));
        assert!(err.to_string().contains("missing timestamp"));
    }

    #[test]
    fn test_option_ext() {
        let none: Option<i32> = None;
        let result = none.ok_or_invalid_input("T1", "no points");
        assert!(matches!(result, Err(ProximityError::InvalidInput { .. })));
    }

    #[test]
    fn test_retriable_classification() {
        let storage = ProximityError::Storage {
            message: "connection lost".to_string(),
        };
        let config = ProximityError::Config {
            message: "chunk_size must be > 0".to_string(),
        };
        assert!(storage.is_retriable());
        assert!(!config.is_retriable());
    }

    #[test]
    fn test_sqlite_error_maps_to_storage() {
        let err: ProximityError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, ProximityError::Storage { .. }));
    }
}

//! Error types for Strata

use std::fmt;

/// Unified error type for platform-level operations
#[derive(Debug)]
pub enum StrataError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error
    Protocol(String),

    /// Security error (authentication, authorization, etc.)
    Security(String),

    /// A resource lock could not be obtained in time
    LockTimeout(String),

    /// Entry with the same name already exists
    Duplicate(String),

    /// Not implemented
    NotImplemented(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for StrataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrataError::Io(e) => write!(f, "IO error: {}", e),
            StrataError::Config(msg) => write!(f, "Configuration error: {}", msg),
            StrataError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            StrataError::Security(msg) => write!(f, "Security error: {}", msg),
            StrataError::LockTimeout(what) => write!(f, "Timed out acquiring lock: {}", what),
            StrataError::Duplicate(name) => write!(f, "Duplicate entry: {}", name),
            StrataError::NotImplemented(msg) => write!(f, "Not implemented: {}", msg),
            StrataError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for StrataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StrataError::Io(e) => Some(e),
            StrataError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StrataError {
    fn from(err: std::io::Error) -> Self {
        StrataError::Io(err)
    }
}

/// Result type for Strata platform operations
pub type StrataResult<T> = Result<T, StrataError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StrataError::Config("Invalid configuration".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Invalid configuration"
        );

        let err = StrataError::LockTimeout("sadb".to_string());
        assert_eq!(err.to_string(), "Timed out acquiring lock: sadb");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StrataError = io_err.into();
        assert!(matches!(err, StrataError::Io(_)));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_result_type() {
        fn example() -> StrataResult<i32> {
            Ok(42)
        }

        assert_eq!(example().unwrap(), 42);
    }
}

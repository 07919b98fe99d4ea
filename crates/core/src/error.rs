//! Error types for keyflux change streams.

/// Result type alias for keyflux operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors carried by change streams and raised by operator construction.
///
/// Errors travel downstream as terminal notifications and may be delivered to
/// several observers, so the type is cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A required argument was missing or out of range.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },
    /// A fallible user callback reported a failure.
    #[error("Callback failed in {operator}: {message}")]
    Callback {
        operator: &'static str,
        message: String,
    },
    /// One or more items failed to release their resources.
    #[error("Disposal failed for {} item(s): {}", .failures.len(), .failures.join("; "))]
    Disposal { failures: Vec<String> },
    /// An operator needed an async runtime that was not available.
    #[error("Runtime unavailable: {message}")]
    Runtime { message: String },
    /// A producer terminated its stream with an error.
    #[error("Upstream error: {message}")]
    Upstream { message: String },
}

impl Error {
    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a callback failure error.
    pub fn callback(operator: &'static str, message: impl Into<String>) -> Self {
        Error::Callback {
            operator,
            message: message.into(),
        }
    }

    /// Creates an aggregated disposal error.
    pub fn disposal(failures: Vec<String>) -> Self {
        Error::Disposal { failures }
    }

    /// Creates a runtime unavailable error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
        }
    }

    /// Creates an upstream error.
    pub fn upstream(message: impl Into<String>) -> Self {
        Error::Upstream {
            message: message.into(),
        }
    }

    /// Returns true if this error aggregates disposal failures.
    #[inline]
    pub fn is_disposal(&self) -> bool {
        matches!(self, Error::Disposal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_argument("reset threshold must be positive");
        assert!(err.to_string().contains("reset threshold"));

        let err = Error::callback("transform_many_async", "lookup failed");
        assert!(err.to_string().contains("transform_many_async"));
        assert!(err.to_string().contains("lookup failed"));

        let err = Error::upstream("socket closed");
        assert!(err.to_string().contains("socket closed"));
    }

    #[test]
    fn test_disposal_error_aggregates() {
        let err = Error::disposal(vec!["a".into(), "b".into()]);
        assert!(err.is_disposal());
        assert!(err.to_string().contains("2 item(s)"));
        assert!(err.to_string().contains("a; b"));
    }

    #[test]
    fn test_error_constructors() {
        match Error::runtime("no tokio runtime") {
            Error::Runtime { message } => assert_eq!(message, "no tokio runtime"),
            _ => panic!("Wrong error type"),
        }
    }
}

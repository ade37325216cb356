//! Error types for channels, iterators and concurrent operators.

use std::sync::Arc;

/// The four kinds of failure a pipeline caller can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Programmer error: misuse of an accessor or a terminal method
    Usage,
    /// Failure reported by a producer, processor or expansion function
    Failure,
    /// A single pull was cancelled or timed out
    Cancellation,
    /// The stream was disposed by its consumer
    Disposal,
}

/// The main error type for the pipeline primitives.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An API was called in a state where it is not allowed
    #[error("usage error: {0}")]
    Usage(String),

    /// `complete` or `fail` was called on a channel that was already completed
    #[error("channel was already completed{}", call_site_suffix(.site))]
    AlreadyCompleted { site: Option<String> },

    /// A pull was cancelled through its cancellation token
    #[error("operation was cancelled")]
    Cancelled,

    /// A pull timed out
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The stream was disposed before the operation could finish
    #[error("pipeline was disposed")]
    Disposed,

    /// Every sender was dropped without completing the channel
    #[error("all senders were dropped without completing the channel")]
    SenderDropped,

    /// A producer failed to generate an item
    #[error("producer error: {0}")]
    Producer(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A processor failed to transform an item
    #[error("processor error: {0}")]
    Processor(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),
}

fn call_site_suffix(site: &Option<String>) -> String {
    match site {
        Some(site) => format!(" (first completed at {})", site),
        None => String::new(),
    }
}

// Convenience constructors
impl Error {
    /// Create a producer error from any error type
    pub fn producer<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Producer(Arc::new(error))
    }

    /// Create a processor error from any error type
    pub fn processor<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::Processor(Arc::new(error))
    }

    /// Create a usage error with a message
    pub fn usage<S: Into<String>>(message: S) -> Self {
        Error::Usage(message.into())
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        Error::Timeout { duration_ms }
    }

    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Usage(_) | Error::AlreadyCompleted { .. } => ErrorKind::Usage,
            Error::Cancelled | Error::Timeout { .. } => ErrorKind::Cancellation,
            Error::Disposed => ErrorKind::Disposal,
            Error::SenderDropped
            | Error::Producer(_)
            | Error::Processor(_)
            | Error::Custom(_) => ErrorKind::Failure,
        }
    }

    /// True for errors raised because the stream was disposed.
    pub fn is_disposed(&self) -> bool {
        self.kind() == ErrorKind::Disposal
    }

    /// True for errors that only affect the cancelled call.
    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_kinds() {
        assert_eq!(Error::usage("x").kind(), ErrorKind::Usage);
        assert_eq!(
            Error::AlreadyCompleted { site: None }.kind(),
            ErrorKind::Usage
        );
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancellation);
        assert_eq!(Error::timeout(5).kind(), ErrorKind::Cancellation);
        assert_eq!(Error::Disposed.kind(), ErrorKind::Disposal);
        assert_eq!(Error::producer(Boom).kind(), ErrorKind::Failure);
    }

    #[test]
    fn test_already_completed_message_carries_site() {
        let err = Error::AlreadyCompleted {
            site: Some("src/lib.rs:10:5".to_string()),
        };
        assert_eq!(
            err.to_string(),
            "channel was already completed (first completed at src/lib.rs:10:5)"
        );
        let err = Error::AlreadyCompleted { site: None };
        assert_eq!(err.to_string(), "channel was already completed");
    }

    #[test]
    fn test_source_is_exposed() {
        use std::error::Error as _;
        let err = Error::producer(Boom);
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".into()));
    }
}

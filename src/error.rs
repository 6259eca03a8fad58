//! Error types for Threadline
//!
//! This module defines the error kinds surfaced by the generation pipeline,
//! the store and the HTTP layer, using `thiserror` for ergonomic error
//! handling. Fallible functions return [`Result`], an `anyhow` alias, and
//! callers that need the kind downcast to [`ThreadlineError`].

use thiserror::Error;

/// Main error type for Threadline operations
///
/// The first group of variants are the kinds a caller of the public
/// operations can observe (`generate`, `stop`, live reads). The interruption
/// variants are produced by fragment sources and are never surfaced to an
/// HTTP caller: the orchestrator turns them into a finalized partial answer.
#[derive(Error, Debug)]
pub enum ThreadlineError {
    /// Conversation or message does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Requester lacks access to the conversation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Missing or malformed required input
    #[error("Validation error: {0}")]
    Validation(String),

    /// No requester identity was supplied by the authentication layer
    #[error("Unauthorized")]
    Unauthorized,

    /// A generation is already running for the conversation or message
    #[error("Generation already in progress: {0}")]
    GenerationInProgress(String),

    /// Store operation failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Fragment source failed outside of cancellation
    #[error("Generation error: {0}")]
    Generation(String),

    /// Fragment source gave up after its own upper time bound
    #[error("Generation timed out: {0}")]
    GenerationTimeout(String),

    /// Fragment source observed the cancellation signal
    #[error("Generation cancelled")]
    Cancelled,

    /// Chunk append attempted after the message was finalized
    #[error("Message {0} is already final")]
    MessageFinalized(i64),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type alias for Threadline operations
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;

/// Returns true when `err` is a cancellation-like condition
///
/// Explicit cancellation and a source-enforced timeout both end a generation
/// the same way: the partial text is kept and the message is finalized.
///
/// # Examples
///
/// ```
/// use threadline::error::{is_interruption, ThreadlineError};
///
/// let err = anyhow::Error::new(ThreadlineError::Cancelled);
/// assert!(is_interruption(&err));
///
/// let err = anyhow::Error::new(ThreadlineError::Generation("boom".into()));
/// assert!(!is_interruption(&err));
/// ```
pub fn is_interruption(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        if let Some(e) = cause.downcast_ref::<ThreadlineError>() {
            return match e {
                ThreadlineError::Cancelled | ThreadlineError::GenerationTimeout(_) => true,
                ThreadlineError::Http(http) => http.is_timeout(),
                _ => false,
            };
        }
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_timeout)
    })
}

/// Returns true when `err` is a timeout rather than an explicit stop
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ThreadlineError>(),
            Some(ThreadlineError::GenerationTimeout(_))
        ) || cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(reqwest::Error::is_timeout)
    })
}

/// Finds the first [`ThreadlineError`] in an error chain
pub fn kind_of(err: &anyhow::Error) -> Option<&ThreadlineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ThreadlineError>())
}

/// Maps a rusqlite failure into a persistence error with context
pub(crate) fn persistence(context: &'static str) -> impl Fn(rusqlite::Error) -> ThreadlineError {
    move |e| ThreadlineError::Persistence(format!("{}: {}", context, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_not_found_error_display() {
        let error = ThreadlineError::NotFound("conversation abc".to_string());
        assert_eq!(error.to_string(), "Not found: conversation abc");
    }

    #[test]
    fn test_permission_denied_error_display() {
        let error = ThreadlineError::PermissionDenied("read-only conversation".to_string());
        assert_eq!(
            error.to_string(),
            "Permission denied: read-only conversation"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let error = ThreadlineError::Validation("missing 'message'".to_string());
        assert_eq!(error.to_string(), "Validation error: missing 'message'");
    }

    #[test]
    fn test_message_finalized_display() {
        let error = ThreadlineError::MessageFinalized(42);
        assert_eq!(error.to_string(), "Message 42 is already final");
    }

    #[test]
    fn test_cancelled_is_interruption() {
        let err = anyhow::Error::new(ThreadlineError::Cancelled);
        assert!(is_interruption(&err));
        assert!(!is_timeout(&err));
    }

    #[test]
    fn test_timeout_is_interruption() {
        let err = anyhow::Error::new(ThreadlineError::GenerationTimeout("120s".into()));
        assert!(is_interruption(&err));
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_interruption_found_through_context() {
        let err: Result<()> = Err(ThreadlineError::Cancelled).context("reading fragment");
        assert!(is_interruption(&err.unwrap_err()));
    }

    #[test]
    fn test_generation_error_is_not_interruption() {
        let err = anyhow::Error::new(ThreadlineError::Generation("bad gateway".into()));
        assert!(!is_interruption(&err));
    }

    #[test]
    fn test_kind_of_finds_domain_error() {
        let err: Result<()> =
            Err(ThreadlineError::NotFound("message 7".into())).context("stopping stream");
        let err = err.unwrap_err();
        assert!(matches!(kind_of(&err), Some(ThreadlineError::NotFound(_))));
    }

    #[test]
    fn test_kind_of_plain_anyhow() {
        let err = anyhow::anyhow!("plain");
        assert!(kind_of(&err).is_none());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: ThreadlineError = io_error.into();
        assert!(matches!(error, ThreadlineError::Io(_)));
    }

    #[test]
    fn test_yaml_error_conversion() {
        let yaml_error = serde_yaml::from_str::<serde_yaml::Value>("invalid: : yaml").unwrap_err();
        let error: ThreadlineError = yaml_error.into();
        assert!(matches!(error, ThreadlineError::Yaml(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ThreadlineError>();
    }
}

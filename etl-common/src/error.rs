use std::fmt;

use serde::Serialize;

/// Classification of per-record failures.
///
/// Drives the retry decision in `retry::RetryPolicy` and is written verbatim
/// into dead-letter entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Malformed input; never retried.
    Schema,
    /// Reference key absent; retried up to a bound, then dead-lettered.
    LookupMiss,
    /// Throttling, timeout or connectivity failure; retried with backoff.
    TransientStore,
    /// Authorization or validation failure; never retried.
    PermanentStore,
    /// Reference blob unreadable or invalid; previous snapshot retained.
    Refresh,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::LookupMiss | ErrorKind::TransientStore)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Schema => write!(f, "Schema"),
            ErrorKind::LookupMiss => write!(f, "LookupMiss"),
            ErrorKind::TransientStore => write!(f, "TransientStore"),
            ErrorKind::PermanentStore => write!(f, "PermanentStore"),
            ErrorKind::Refresh => write!(f, "Refresh"),
        }
    }
}

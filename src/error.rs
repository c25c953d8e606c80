use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;

/// Failure reported by a [`RemoteService`](crate::traits::RemoteService) call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or service-level hiccup. Worth another try.
    #[error("transient remote failure: {0}")]
    Transient(String),

    /// The service understood the request and refused it. Retrying won't change the answer.
    #[error("remote service rejected the request: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn transient<S: ToString>(msg: S) -> Self {
        Self::Transient(msg.to_string())
    }

    pub fn rejected<S: ToString>(msg: S) -> Self {
        Self::Rejected(msg.to_string())
    }

    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Error of a durable-tier backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable store is unavailable: {0}")]
    Unavailable(String),

    #[error("durable store transaction failed: {0}")]
    Transaction(String),

    #[error("cannot encode durable entry: {0}")]
    Encode(String),

    #[error("cannot decode durable entry: {0}")]
    Decode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<heed::Error> for StoreError {
    fn from(err: heed::Error) -> Self {
        StoreError::Transaction(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum DataLayerError {
    #[error("remote operation rejected after {attempts} attempt(s): {source}")]
    RemoteRejected { attempts: u32, source: RemoteError },

    #[error("remote operation failed after {attempts} attempt(s): {source}")]
    RetriesExhausted { attempts: u32, source: RemoteError },

    #[error("persistent store unavailable: {0}")]
    PersistentStoreUnavailable(#[from] StoreError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("middleware failed: {0}")]
    Middleware(String),

    #[error("subscriber for '{slot}' failed: {message}")]
    Subscriber { slot: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("write queue is closed")]
    QueueClosed,

    #[error("write panicked: {0}")]
    WritePanicked(String),

    #[cfg(feature = "tracing")]
    #[error("cannot initialize tracing: {0}")]
    Tracing(String),
}

impl DataLayerError {
    pub fn validation<S: ToString>(msg: S) -> Self {
        Self::Validation(msg.to_string())
    }

    /// Stable string code handed over to an [`ErrorSink`](crate::traits::ErrorSink).
    pub fn code(&self) -> &'static str {
        match self {
            Self::RemoteRejected { .. } => "REMOTE_REJECTED",
            Self::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            Self::PersistentStoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Validation(_) => "VALIDATION",
            Self::Middleware(_) => "MIDDLEWARE",
            Self::Subscriber { .. } => "SUBSCRIBER",
            Self::Serialization(_) => "SERIALIZATION",
            Self::QueueClosed => "QUEUE_CLOSED",
            Self::WritePanicked(_) => "WRITE_PANICKED",
            #[cfg(feature = "tracing")]
            Self::Tracing(_) => "TRACING",
        }
    }

    /// The remote error behind this failure, if there is one.
    pub fn remote(&self) -> Option<&RemoteError> {
        match self {
            Self::RemoteRejected { source, .. } | Self::RetriesExhausted { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::RemoteRejected { attempts, .. } | Self::RetriesExhausted { attempts, .. } => *attempts,
            _ => 0,
        }
    }
}

/// What an [`ErrorSink`](crate::traits::ErrorSink) receives: a code, a human readable message and where it happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub code:    String,
    pub message: String,
    pub context: String,
}

impl ErrorReport {
    pub fn new<C: Display>(error: &DataLayerError, context: C) -> Self {
        Self {
            code:    error.code().to_string(),
            message: error.to_string(),
            context: context.to_string(),
        }
    }
}

pub type Result<T, E = DataLayerError> = std::result::Result<T, E>;

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    }
    else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    }
    else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(RemoteError::transient("timeout").is_retryable());
        assert!(!RemoteError::rejected("bad record").is_retryable());
    }

    #[test]
    fn report_carries_code_and_message() {
        let err = DataLayerError::RetriesExhausted {
            attempts: 3,
            source:   RemoteError::transient("connection reset"),
        };
        let report = ErrorReport::new(&err, "query(items)");
        assert_eq!(report.code, "RETRIES_EXHAUSTED");
        assert_eq!(report.context, "query(items)");
        assert!(report.message.contains("3 attempt(s)"));
        assert!(report.message.contains("connection reset"));
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.remote(), Some(&RemoteError::transient("connection reset")));
    }

    #[test]
    fn store_failures_report_as_unavailable() {
        let err = DataLayerError::from(StoreError::Unavailable("quota exceeded".into()));
        assert_eq!(err.code(), "STORE_UNAVAILABLE");
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(err.remote(), None);
    }
}

use thiserror::Error;

use crate::domain::{OrderStatus, SessionState};

/// Main error type for the session engine
#[derive(Error, Debug)]
pub enum FixflowError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Venue-side rejects
    #[error("Protocol reject: {0}")]
    ProtocolReject(String),

    // Correlation errors
    #[error("Correlation error: {0}")]
    Correlation(#[from] CorrelationError),

    #[error("Unknown reference: {0}")]
    UnknownReference(String),

    // Session errors
    #[error("Session not available (state {state})")]
    SessionUnavailable { state: SessionState },

    #[error("Session disconnected: {0}")]
    SessionDisconnect(String),

    #[error("Protocol engine error: {0}")]
    Engine(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid order transition for {cl_ord_id}: {from} -> {to}")]
    InvalidOrderTransition {
        cl_ord_id: String,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("Startup failed at {step}: {source}")]
    Startup {
        step: String,
        #[source]
        source: Box<FixflowError>,
    },

    // Strategy errors
    #[error("Strategy error: {0}")]
    Strategy(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FixflowError {
    pub fn startup(step: impl Into<String>, source: FixflowError) -> Self {
        FixflowError::Startup {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// True for conditions that end the run instead of being resolved locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FixflowError::Startup { .. }
                | FixflowError::SessionDisconnect(_)
                | FixflowError::Correlation(CorrelationError::Timeout { .. })
                | FixflowError::Engine(_)
        )
    }
}

/// Result type alias for FixflowError
pub type Result<T> = std::result::Result<T, FixflowError>;

/// Failure modes of an outstanding request/response correlation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CorrelationError {
    #[error("request {request_id} timed out after {elapsed_ms}ms")]
    Timeout { request_id: String, elapsed_ms: u64 },

    #[error("session closing, request {request_id} abandoned")]
    SessionClosing { request_id: String },

    #[error("request {request_id} rejected: {reason}")]
    Rejected { request_id: String, reason: String },

    #[error("request id {request_id} already outstanding")]
    Duplicate { request_id: String },
}

impl CorrelationError {
    pub fn request_id(&self) -> &str {
        match self {
            CorrelationError::Timeout { request_id, .. }
            | CorrelationError::SessionClosing { request_id }
            | CorrelationError::Rejected { request_id, .. }
            | CorrelationError::Duplicate { request_id } => request_id,
        }
    }

    pub fn is_session_closing(&self) -> bool {
        matches!(self, CorrelationError::SessionClosing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_error_wraps_cause() {
        let cause = FixflowError::Correlation(CorrelationError::Timeout {
            request_id: "sl-1".into(),
            elapsed_ms: 5000,
        });
        let err = FixflowError::startup("reference data", cause);

        assert!(err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("reference data"));
        assert!(msg.contains("sl-1"));
    }

    #[test]
    fn test_reject_is_not_fatal() {
        let err = FixflowError::ProtocolReject("unknown symbol".into());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_correlation_request_id() {
        let err = CorrelationError::SessionClosing {
            request_id: "pos-3".into(),
        };
        assert_eq!(err.request_id(), "pos-3");
        assert!(err.is_session_closing());
    }
}

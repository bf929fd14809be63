//! OCPI Error Types

use std::time::Duration;

use thiserror::Error;

use crate::types::{CredentialsVerb, FailureKind, OcpiStatusCode};

#[derive(Error, Debug)]
pub enum OcpiError {
    #[error("Request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("No compatible version: {0}")]
    NoCompatibleVersion(String),

    #[error("Version detail unavailable: {0}")]
    VersionDetailUnavailable(String),

    #[error("Credentials endpoint missing for version {0}")]
    CredentialsEndpointMissing(String),

    #[error("Credentials rejected: {0}")]
    CredentialsRejected(String),

    #[error("Outcome of {verb} credentials is unknown, reconcile before retrying: {reason}")]
    OutcomeUnknown {
        verb: CredentialsVerb,
        reason: String,
    },

    #[error("Peer not registered: {0}")]
    NotRegistered(String),

    #[error("Peer already registered, rotate with PUT instead: {0}")]
    AlreadyRegistered(String),

    #[error("Registration attempt aborted")]
    Aborted,

    #[error("Observer failed during {call}: {message}")]
    Observer { call: String, message: String },

    #[error("Invalid transition: cannot {action} from {state}")]
    InvalidTransition { action: String, state: String },

    #[error("Server error ({1:?}): {0}")]
    Server(String, OcpiStatusCode),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OcpiError {
    /// Whether a caller may retry the same step unchanged.
    ///
    /// Only plain timeouts and transport-level failures of read-only calls
    /// qualify. Capability mismatches need a peer-side fix, rejections need
    /// new credentials, and unknown outcomes need reconciliation first.
    pub fn is_retriable(&self) -> bool {
        match self {
            OcpiError::Timeout(_) => true,
            OcpiError::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// The terminal failure this error drives a registration attempt into.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OcpiError::Timeout(_) => FailureKind::Timeout,
            OcpiError::Http(e) if e.is_timeout() => FailureKind::Timeout,
            OcpiError::NoCompatibleVersion(_) => FailureKind::NoCompatibleVersion,
            OcpiError::VersionDetailUnavailable(_) => FailureKind::VersionDetailUnavailable,
            OcpiError::CredentialsEndpointMissing(_) => FailureKind::CredentialsEndpointMissing,
            OcpiError::CredentialsRejected(_) => FailureKind::CredentialsRejected,
            OcpiError::OutcomeUnknown { .. } => FailureKind::Unknown,
            OcpiError::NotRegistered(_) => FailureKind::NotRegistered,
            OcpiError::AlreadyRegistered(_) => FailureKind::AlreadyRegistered,
            OcpiError::Aborted => FailureKind::Aborted,
            _ => FailureKind::Transport,
        }
    }
}

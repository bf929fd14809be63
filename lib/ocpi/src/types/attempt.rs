//! Registration attempt state

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{CorrelationId, Credentials, VersionDetail, VersionId, VersionInformation};

/// Why an attempt ended in [`RegistrationState::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    NoCompatibleVersion,
    VersionDetailUnavailable,
    CredentialsEndpointMissing,
    CredentialsRejected,
    Unknown,
    NotRegistered,
    AlreadyRegistered,
    Aborted,
    Transport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "kind")]
pub enum RegistrationState {
    Idle,
    VersionsRequested,
    VersionSelected,
    DetailsRequested,
    CredentialsExchangePending,
    Registered,
    Deregistered,
    Failed(FailureKind),
}

impl RegistrationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RegistrationState::Registered
                | RegistrationState::Deregistered
                | RegistrationState::Failed(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationState::Idle => "Idle",
            RegistrationState::VersionsRequested => "VersionsRequested",
            RegistrationState::VersionSelected => "VersionSelected",
            RegistrationState::DetailsRequested => "DetailsRequested",
            RegistrationState::CredentialsExchangePending => "CredentialsExchangePending",
            RegistrationState::Registered => "Registered",
            RegistrationState::Deregistered => "Deregistered",
            RegistrationState::Failed(_) => "Failed",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistrationState::Failed(kind) => write!(f, "Failed({:?})", kind),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Coarse terminal result of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Registered,
    Deregistered,
    Rejected,
    TimedOut,
    /// The peer could not be reached or failed on its side.
    Unreachable,
    Aborted,
    Unknown,
}

impl AttemptOutcome {
    pub fn from_state(state: RegistrationState) -> Option<Self> {
        match state {
            RegistrationState::Registered => Some(AttemptOutcome::Registered),
            RegistrationState::Deregistered => Some(AttemptOutcome::Deregistered),
            RegistrationState::Failed(kind) => Some(match kind {
                FailureKind::Timeout => AttemptOutcome::TimedOut,
                FailureKind::Aborted => AttemptOutcome::Aborted,
                FailureKind::Unknown => AttemptOutcome::Unknown,
                FailureKind::Transport => AttemptOutcome::Unreachable,
                FailureKind::NoCompatibleVersion
                | FailureKind::VersionDetailUnavailable
                | FailureKind::CredentialsEndpointMissing
                | FailureKind::CredentialsRejected
                | FailureKind::NotRegistered
                | FailureKind::AlreadyRegistered => AttemptOutcome::Rejected,
            }),
            _ => None,
        }
    }
}

/// Everything learned during one registration attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationAttempt {
    pub correlation_id: CorrelationId,
    pub peer_id: String,
    pub state: RegistrationState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// As received, never re-sorted.
    pub versions: Vec<VersionInformation>,
    pub selected: Option<VersionInformation>,
    pub detail: Option<VersionDetail>,
    pub credentials_url: Option<String>,
    pub local: Option<Credentials>,
    pub remote: Option<Credentials>,
}

impl RegistrationAttempt {
    pub fn new(peer_id: impl Into<String>, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            peer_id: peer_id.into(),
            state: RegistrationState::Idle,
            started_at: Utc::now(),
            finished_at: None,
            versions: Vec::new(),
            selected: None,
            detail: None,
            credentials_url: None,
            local: None,
            remote: None,
        }
    }

    pub fn version(&self) -> Option<&VersionId> {
        self.selected.as_ref().map(|v| &v.version)
    }

    pub fn outcome(&self) -> Option<AttemptOutcome> {
        AttemptOutcome::from_state(self.state)
    }
}

//! Outbound request envelope

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{CorrelationId, RequestId, VersionId};

/// The calling party, as `country_code` + `party_id` (e.g. `NL*EXA`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyId {
    pub country_code: String,
    pub party_id: String,
}

impl PartyId {
    pub fn new(country_code: impl Into<String>, party_id: impl Into<String>) -> Self {
        Self {
            country_code: country_code.into(),
            party_id: party_id.into(),
        }
    }
}

impl fmt::Display for PartyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}*{}", self.country_code, self.party_id)
    }
}

/// The four operations on a credentials endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CredentialsVerb {
    Get,
    Post,
    Put,
    Delete,
}

impl CredentialsVerb {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialsVerb::Get => "GET",
            CredentialsVerb::Post => "POST",
            CredentialsVerb::Put => "PUT",
            CredentialsVerb::Delete => "DELETE",
        }
    }

    /// Whether the peer changes its state when it accepts this call.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, CredentialsVerb::Get)
    }

    /// Whether the request carries our credentials record.
    pub fn sends_payload(&self) -> bool {
        matches!(self, CredentialsVerb::Post | CredentialsVerb::Put)
    }
}

impl fmt::Display for CredentialsVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which protocol step a call belongs to. One before/after notification pair
/// is emitted per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    GetVersions,
    GetVersionDetails,
    Credentials(CredentialsVerb),
    Register,
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::GetVersions => f.write_str("get_versions"),
            CallKind::GetVersionDetails => f.write_str("get_version_details"),
            CallKind::Credentials(verb) => write!(f, "credentials_{}", verb.as_str().to_lowercase()),
            CallKind::Register => f.write_str("register"),
        }
    }
}

/// Metadata every outbound call carries.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub request_id: RequestId,
    pub correlation_id: Option<CorrelationId>,
    /// Set for version-scoped calls.
    pub version: Option<VersionId>,
    pub timeout: Duration,
    pub sender: PartyId,
    /// Token presented to the peer, if any.
    pub authorization: Option<String>,
}

impl RequestEnvelope {
    pub fn new(sender: PartyId, timeout: Duration) -> Self {
        Self {
            request_id: RequestId::new(),
            correlation_id: None,
            version: None,
            timeout,
            sender,
            authorization: None,
        }
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_version(mut self, version: VersionId) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_authorization(mut self, token: Option<String>) -> Self {
        self.authorization = token;
        self
    }
}

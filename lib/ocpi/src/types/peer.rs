//! Persisted peer relationship

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Credentials, VersionId};

/// An established, mutually authenticated relationship with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub version: VersionId,
    pub credentials_url: String,
    /// What we handed the peer; the peer presents `local.token` when calling us.
    pub local: Credentials,
    /// What the peer handed us; we present `remote.token` when calling the peer.
    pub remote: Credentials,
    pub registered_at: DateTime<Utc>,
}

/// Everything persisted for one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub peer_id: String,
    /// Preferred version for future sessions, kept across deregistration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_version: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<Relationship>,
}

impl PeerRecord {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            default_version: None,
            relationship: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.relationship.is_some()
    }

    /// Token to present to the peer, once registered.
    pub fn peer_token(&self) -> Option<&str> {
        self.relationship.as_ref().map(|r| r.remote.token.as_str())
    }
}

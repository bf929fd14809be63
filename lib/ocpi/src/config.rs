//! Registrar configuration

use std::time::Duration;

use crate::catalog::VersionCatalog;
use crate::error::OcpiError;
use crate::types::{
    BusinessDetails, Credentials, CredentialsRole, PartyId, Role, VersionId, VersionInformation,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Versions this client negotiates when nothing else is configured.
pub const DEFAULT_VERSIONS: &[&str] = &["2.1.1", "2.2", "2.2.1"];

/// How the local party identifies and presents itself.
#[derive(Debug, Clone)]
pub struct LocalParty {
    pub party: PartyId,
    /// Our own versions endpoint, handed to peers in our credentials.
    pub versions_url: String,
    pub business_details: BusinessDetails,
    pub roles: Vec<Role>,
    /// Token handed to every peer. Generated anew per attempt when unset.
    pub token: Option<String>,
}

impl LocalParty {
    /// The local credentials record offered to a peer.
    pub fn fresh_credentials(&self) -> Credentials {
        Credentials {
            token: self
                .token
                .clone()
                .unwrap_or_else(Credentials::generate_token),
            url: self.versions_url.clone(),
            business_details: self.business_details.clone(),
            roles: self
                .roles
                .iter()
                .map(|role| CredentialsRole {
                    role: *role,
                    country_code: self.party.country_code.clone(),
                    party_id: self.party.party_id.clone(),
                })
                .collect(),
        }
    }
}

/// Registrar configuration
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    pub local: LocalParty,
    /// Per-call timeout, independent of any deadline on a whole attempt.
    pub request_timeout: Duration,
    /// Negotiate exactly this version instead of the highest mutual one.
    pub pinned_version: Option<VersionId>,
    pub catalog: VersionCatalog,
    /// Persist the selected version as the peer's default, whatever the
    /// attempt's outcome.
    pub set_as_default_version: bool,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            local: LocalParty {
                party: PartyId::new("NL", "XXX"),
                versions_url: "http://localhost:8080/ocpi/versions".to_string(),
                business_details: BusinessDetails::named("OCPI Client"),
                roles: vec![Role::Emsp],
                token: None,
            },
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            pinned_version: None,
            catalog: default_catalog("http://localhost:8080/ocpi/versions"),
            set_as_default_version: true,
        }
    }
}

fn default_catalog(versions_url: &str) -> VersionCatalog {
    let base = versions_url.trim_end_matches('/').trim_end_matches("/versions");
    let mut catalog = VersionCatalog::new();
    for version in DEFAULT_VERSIONS {
        catalog = catalog.with_version(
            VersionInformation::new(*version, format!("{}/{}", base, version)),
            Vec::new(),
        );
    }
    catalog
}

impl RegistrarConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, OcpiError> {
        let country_code =
            std::env::var("OCPI_COUNTRY_CODE").unwrap_or_else(|_| "NL".to_string());
        let party_id = std::env::var("OCPI_PARTY_ID").unwrap_or_else(|_| "XXX".to_string());
        if country_code.len() != 2 {
            return Err(OcpiError::Config(format!(
                "OCPI_COUNTRY_CODE must be two letters, got {:?}",
                country_code
            )));
        }
        if party_id.is_empty() || party_id.len() > 3 {
            return Err(OcpiError::Config(format!(
                "OCPI_PARTY_ID must be 1-3 characters, got {:?}",
                party_id
            )));
        }

        let versions_url = std::env::var("OCPI_VERSIONS_URL")
            .unwrap_or_else(|_| "http://localhost:8080/ocpi/versions".to_string());

        let business_name =
            std::env::var("OCPI_BUSINESS_NAME").unwrap_or_else(|_| "OCPI Client".to_string());

        let roles = match std::env::var("OCPI_ROLES") {
            Ok(s) => s
                .split(',')
                .map(|r| r.trim().parse::<Role>().map_err(OcpiError::Config))
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => vec![Role::Emsp],
        };

        let request_timeout = match std::env::var("OCPI_REQUEST_TIMEOUT_MS") {
            Ok(s) => Duration::from_millis(s.parse().map_err(|e| {
                OcpiError::Config(format!("Invalid OCPI_REQUEST_TIMEOUT_MS: {}", e))
            })?),
            Err(_) => DEFAULT_REQUEST_TIMEOUT,
        };

        let pinned_version = std::env::var("OCPI_PINNED_VERSION")
            .ok()
            .filter(|s| !s.is_empty())
            .map(VersionId::new);

        let set_as_default_version = std::env::var("OCPI_SET_AS_DEFAULT_VERSION")
            .map(|s| s != "false" && s != "0")
            .unwrap_or(true);

        Ok(Self {
            local: LocalParty {
                party: PartyId::new(country_code, party_id),
                versions_url: versions_url.clone(),
                business_details: BusinessDetails::named(business_name),
                roles,
                token: std::env::var("OCPI_LOCAL_TOKEN").ok().filter(|s| !s.is_empty()),
            },
            request_timeout,
            pinned_version,
            catalog: default_catalog(&versions_url),
            set_as_default_version,
        })
    }
}

/// Where to reach a peer and how to authenticate the first contact.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub peer_id: String,
    pub versions_url: String,
    /// Token handed over out of band, used until the peer issues its own.
    pub bootstrap_token: Option<String>,
}

impl PeerConfig {
    pub fn new(peer_id: impl Into<String>, versions_url: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            versions_url: versions_url.into(),
            bootstrap_token: None,
        }
    }

    pub fn with_bootstrap_token(mut self, token: impl Into<String>) -> Self {
        self.bootstrap_token = Some(token.into());
        self
    }
}

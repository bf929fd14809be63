//! Versions and version details

use std::fmt;

use serde::{Deserialize, Serialize};

use super::VersionId;

/// One entry of a peer's versions endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInformation {
    pub version: VersionId,
    /// Where this version's detail can be fetched.
    pub url: String,
}

impl VersionInformation {
    pub fn new(version: impl Into<VersionId>, url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            url: url.into(),
        }
    }
}

/// Module identifier advertised in a version detail.
///
/// Unrecognised identifiers are preserved as [`ModuleId::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModuleId {
    Cdrs,
    ChargingProfiles,
    Commands,
    Credentials,
    HubClientInfo,
    Locations,
    Sessions,
    Tariffs,
    Tokens,
    Custom(String),
}

impl ModuleId {
    pub fn as_str(&self) -> &str {
        match self {
            ModuleId::Cdrs => "cdrs",
            ModuleId::ChargingProfiles => "chargingprofiles",
            ModuleId::Commands => "commands",
            ModuleId::Credentials => "credentials",
            ModuleId::HubClientInfo => "hubclientinfo",
            ModuleId::Locations => "locations",
            ModuleId::Sessions => "sessions",
            ModuleId::Tariffs => "tariffs",
            ModuleId::Tokens => "tokens",
            ModuleId::Custom(s) => s,
        }
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for ModuleId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        if s.is_empty() {
            return Err("module identifier cannot be empty".to_string());
        }
        Ok(match s.to_lowercase().as_str() {
            "cdrs" => ModuleId::Cdrs,
            "chargingprofiles" => ModuleId::ChargingProfiles,
            "commands" => ModuleId::Commands,
            "credentials" => ModuleId::Credentials,
            "hubclientinfo" => ModuleId::HubClientInfo,
            "locations" => ModuleId::Locations,
            "sessions" => ModuleId::Sessions,
            "tariffs" => ModuleId::Tariffs,
            "tokens" => ModuleId::Tokens,
            _ => ModuleId::Custom(s),
        })
    }
}

impl From<ModuleId> for String {
    fn from(id: ModuleId) -> Self {
        id.as_str().to_string()
    }
}

/// Which side of a module interface an endpoint implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InterfaceRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub identifier: ModuleId,
    /// Absent in OCPI 2.1.1 details, where every module is symmetric.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<InterfaceRole>,
    pub url: String,
}

/// The modules a peer exposes under one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDetail {
    pub version: VersionId,
    pub endpoints: Vec<Endpoint>,
}

impl VersionDetail {
    /// First endpoint advertised for `module`, in listing order.
    pub fn endpoint(&self, module: &ModuleId) -> Option<&Endpoint> {
        self.endpoints.iter().find(|e| &e.identifier == module)
    }

    pub fn credentials_url(&self) -> Option<&str> {
        self.endpoint(&ModuleId::Credentials)
            .map(|e| e.url.as_str())
    }
}

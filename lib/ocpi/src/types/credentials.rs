//! Credentials records exchanged between peers

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Cpo,
    Emsp,
    Hub,
    Nap,
    Nsp,
    Other,
    Scsp,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Cpo => "CPO",
            Role::Emsp => "EMSP",
            Role::Hub => "HUB",
            Role::Nap => "NAP",
            Role::Nsp => "NSP",
            Role::Other => "OTHER",
            Role::Scsp => "SCSP",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "CPO" => Ok(Role::Cpo),
            "EMSP" => Ok(Role::Emsp),
            "HUB" => Ok(Role::Hub),
            "NAP" => Ok(Role::Nap),
            "NSP" => Ok(Role::Nsp),
            "OTHER" => Ok(Role::Other),
            "SCSP" => Ok(Role::Scsp),
            _ => Err(format!("Unknown role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    pub category: String,
    #[serde(rename = "type")]
    pub image_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// Opaque to the handshake; carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusinessDetails {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logo: Option<Image>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl BusinessDetails {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logo: None,
            website: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialsRole {
    pub role: Role,
    pub country_code: String,
    pub party_id: String,
}

/// The trust payload one party hands to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Token the receiver must present when calling the issuer.
    pub token: String,
    /// The issuer's versions endpoint.
    pub url: String,
    pub business_details: BusinessDetails,
    #[serde(default)]
    pub roles: Vec<CredentialsRole>,
}

impl Credentials {
    /// 32 random bytes, URL-safe base64 without padding.
    pub fn generate_token() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.roles.iter().any(|r| r.role == role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!(Role::from_str("cpo").unwrap(), Role::Cpo);
        assert_eq!(Role::from_str("EMSP").unwrap(), Role::Emsp);
        assert!(Role::from_str("driver").is_err());
        assert_eq!(serde_json::to_string(&Role::Emsp).unwrap(), "\"EMSP\"");
    }

    #[test]
    fn test_generated_tokens_differ() {
        let a = Credentials::generate_token();
        let b = Credentials::generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 43);
        assert!(!a.contains('='));
    }

    #[test]
    fn test_credentials_wire_format() {
        let json = r#"{
            "token": "ebf3b399-779f-4497-9b9d-ac6ad3cc44d2",
            "url": "https://example.com/ocpi/versions/",
            "business_details": {"name": "Example Operator", "website": "https://example.com"},
            "roles": [{"role": "CPO", "country_code": "NL", "party_id": "EXA"}]
        }"#;
        let creds: Credentials = serde_json::from_str(json).unwrap();
        assert_eq!(creds.business_details.name, "Example Operator");
        assert!(creds.business_details.logo.is_none());
        assert!(creds.has_role(Role::Cpo));
        assert!(!creds.has_role(Role::Emsp));

        let out = serde_json::to_value(&creds).unwrap();
        assert!(out["business_details"].get("logo").is_none());
        assert_eq!(out["roles"][0]["party_id"], "EXA");
    }
}

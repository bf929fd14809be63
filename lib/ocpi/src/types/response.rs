//! OCPI response envelope

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `status_code` of an OCPI response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OcpiStatusCode(pub u32);

impl OcpiStatusCode {
    pub const SUCCESS: Self = Self(1000);
    pub const CLIENT_ERROR: Self = Self(2000);
    pub const INVALID_PARAMETERS: Self = Self(2001);
    pub const NOT_ENOUGH_INFORMATION: Self = Self(2002);
    pub const SERVER_ERROR: Self = Self(3000);
    pub const UNABLE_TO_USE_CLIENT_API: Self = Self(3001);
    pub const UNSUPPORTED_VERSION: Self = Self(3002);
    pub const NO_MATCHING_ENDPOINTS: Self = Self(3003);

    pub fn is_success(&self) -> bool {
        (1000..2000).contains(&self.0)
    }

    pub fn is_client_error(&self) -> bool {
        (2000..3000).contains(&self.0)
    }

    pub fn is_server_error(&self) -> bool {
        (3000..4000).contains(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcpiResponse<T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    pub status_code: OcpiStatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl<T> OcpiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            data: Some(data),
            status_code: OcpiStatusCode::SUCCESS,
            status_message: Some("Success".to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self {
            data: None,
            status_code: OcpiStatusCode::SUCCESS,
            status_message: Some("Success".to_string()),
            timestamp: Utc::now(),
        }
    }

    pub fn error(status_code: OcpiStatusCode, message: impl Into<String>) -> Self {
        Self {
            data: None,
            status_code,
            status_message: Some(message.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn message(&self) -> &str {
        self.status_message.as_deref().unwrap_or("")
    }
}

//! OCPI HTTP transport

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::OcpiError;
use crate::transport::OcpiTransport;
use crate::types::{
    Credentials, CredentialsVerb, OcpiResponse, OcpiStatusCode, RequestEnvelope, VersionDetail,
    VersionInformation,
};

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";
pub const FROM_COUNTRY_CODE_HEADER: &str = "OCPI-from-country-code";
pub const FROM_PARTY_ID_HEADER: &str = "OCPI-from-party-id";

/// Speaks the OCPI JSON envelope over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// `timeout` is the connection-wide ceiling; each request additionally
    /// carries its envelope timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn request(&self, method: Method, url: &str, envelope: &RequestEnvelope) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .timeout(envelope.timeout)
            .header(REQUEST_ID_HEADER, envelope.request_id.to_string())
            .header(FROM_COUNTRY_CODE_HEADER, &envelope.sender.country_code)
            .header(FROM_PARTY_ID_HEADER, &envelope.sender.party_id);

        if let Some(correlation_id) = envelope.correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, correlation_id.to_string());
        }
        if let Some(token) = &envelope.authorization {
            builder = builder.header(reqwest::header::AUTHORIZATION, format!("Token {}", token));
        }
        builder
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        envelope: &RequestEnvelope,
    ) -> Result<reqwest::Response, OcpiError> {
        builder.send().await.map_err(|e| map_send_error(e, envelope))
    }
}

fn map_send_error(e: reqwest::Error, envelope: &RequestEnvelope) -> OcpiError {
    if e.is_timeout() {
        OcpiError::Timeout(envelope.timeout)
    } else {
        OcpiError::Http(e)
    }
}

/// A response body read off the wire: HTTP status plus the OCPI envelope, if
/// the body was one.
struct Reply<T> {
    status: StatusCode,
    body: Option<OcpiResponse<T>>,
    raw: String,
    decode_error: Option<serde_json::Error>,
}

impl<T> Reply<T> {
    fn message(&self) -> String {
        match &self.body {
            Some(body) if !body.message().is_empty() => body.message().to_string(),
            _ if !self.raw.is_empty() => self.raw.clone(),
            _ => self.status.to_string(),
        }
    }

    fn ocpi_code(&self) -> OcpiStatusCode {
        self.body
            .as_ref()
            .map(|b| b.status_code)
            .unwrap_or(OcpiStatusCode::SERVER_ERROR)
    }

    fn is_success(&self) -> bool {
        self.status.is_success()
            && self
                .body
                .as_ref()
                .map(|b| b.status_code.is_success())
                .unwrap_or(false)
    }

    fn is_refusal(&self) -> bool {
        matches!(
            self.status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::METHOD_NOT_ALLOWED
        ) || (self.status.is_success()
            && self
                .body
                .as_ref()
                .map(|b| !b.status_code.is_success())
                .unwrap_or(false))
    }

    fn into_data(self) -> Option<T> {
        self.body.and_then(|b| b.data)
    }
}

async fn read_reply<T: DeserializeOwned>(
    resp: reqwest::Response,
    envelope: &RequestEnvelope,
) -> Result<Reply<T>, OcpiError> {
    let status = resp.status();
    let raw = resp.text().await.map_err(|e| map_send_error(e, envelope))?;
    let (body, decode_error) = match serde_json::from_str::<OcpiResponse<T>>(&raw) {
        Ok(body) => (Some(body), None),
        Err(e) => (None, Some(e)),
    };
    debug!(
        request_id = %envelope.request_id,
        http_status = status.as_u16(),
        ocpi_status = ?body.as_ref().map(|b| b.status_code.0),
        "OCPI reply received"
    );
    Ok(Reply {
        status,
        body,
        raw,
        decode_error,
    })
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl OcpiTransport for HttpTransport {
    async fn get_versions(
        &self,
        envelope: &RequestEnvelope,
        versions_url: &str,
    ) -> Result<Vec<VersionInformation>, OcpiError> {
        let resp = self
            .send(self.request(Method::GET, versions_url, envelope), envelope)
            .await?;
        let reply = read_reply::<Vec<VersionInformation>>(resp, envelope).await?;

        if reply.is_success() {
            Ok(reply.into_data().unwrap_or_default())
        } else if matches!(
            reply.status,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            Err(OcpiError::CredentialsRejected(reply.message()))
        } else {
            Err(OcpiError::Server(reply.message(), reply.ocpi_code()))
        }
    }

    async fn get_version_details(
        &self,
        envelope: &RequestEnvelope,
        version: &VersionInformation,
    ) -> Result<VersionDetail, OcpiError> {
        let resp = self
            .send(self.request(Method::GET, &version.url, envelope), envelope)
            .await?;
        let reply = read_reply::<VersionDetail>(resp, envelope).await?;

        if !reply.is_success() {
            return Err(OcpiError::VersionDetailUnavailable(format!(
                "{} ({})",
                reply.message(),
                version.version
            )));
        }

        reply.into_data().ok_or_else(|| {
            OcpiError::VersionDetailUnavailable(format!(
                "peer returned no detail for {}",
                version.version
            ))
        })
    }

    async fn exchange_credentials(
        &self,
        envelope: &RequestEnvelope,
        verb: CredentialsVerb,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<Credentials>, OcpiError> {
        let method = match verb {
            CredentialsVerb::Get => Method::GET,
            CredentialsVerb::Post => Method::POST,
            CredentialsVerb::Put => Method::PUT,
            CredentialsVerb::Delete => Method::DELETE,
        };

        let mut builder = self.request(method, endpoint, envelope);
        if verb.sends_payload() {
            let payload = credentials.ok_or_else(|| {
                OcpiError::Config(format!("{} credentials requires a payload", verb))
            })?;
            builder = builder.json(payload);
        }

        let resp = self.send(builder, envelope).await?;
        let mut reply = read_reply::<Credentials>(resp, envelope).await?;

        // The peer accepted the request at the HTTP level; an unreadable
        // body means its answer is lost, not that it refused.
        if reply.status.is_success() {
            if verb == CredentialsVerb::Delete && reply.raw.trim().is_empty() {
                return Ok(None);
            }
            if let Some(e) = reply.decode_error.take() {
                return Err(OcpiError::Json(e));
            }
        }

        if reply.is_success() {
            return match verb {
                CredentialsVerb::Delete => Ok(None),
                _ => reply.into_data().map(Some).ok_or_else(|| {
                    OcpiError::Json(serde::de::Error::custom(format!(
                        "peer returned no credentials for {}",
                        verb
                    )))
                }),
            };
        }

        if reply.is_refusal() || reply.ocpi_code().is_client_error() {
            Err(OcpiError::CredentialsRejected(reply.message()))
        } else {
            Err(OcpiError::Server(reply.message(), reply.ocpi_code()))
        }
    }
}

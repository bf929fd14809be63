//! Transport seam for the versions and credentials modules

use async_trait::async_trait;

use crate::error::OcpiError;
use crate::types::{
    Credentials, CredentialsVerb, RequestEnvelope, VersionDetail, VersionInformation,
};

/// The network operations a registration attempt needs from its peer.
///
/// Implementations map peer refusals to [`OcpiError::CredentialsRejected`]
/// and detail failures to [`OcpiError::VersionDetailUnavailable`]. Timeouts
/// are enforced by the caller around each future, so implementations do not
/// need to honour `envelope.timeout` themselves.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait OcpiTransport: Send + Sync {
    /// Fetch the peer's versions list from `versions_url`, in listing order.
    async fn get_versions(
        &self,
        envelope: &RequestEnvelope,
        versions_url: &str,
    ) -> Result<Vec<VersionInformation>, OcpiError>;

    async fn get_version_details(
        &self,
        envelope: &RequestEnvelope,
        version: &VersionInformation,
    ) -> Result<VersionDetail, OcpiError>;

    /// One call against the peer's credentials endpoint.
    ///
    /// `credentials` is present for POST and PUT. The peer's record comes back
    /// for GET, POST and PUT; DELETE returns `None`.
    async fn exchange_credentials(
        &self,
        envelope: &RequestEnvelope,
        verb: CredentialsVerb,
        endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<Credentials>, OcpiError>;
}

//! OCPI client library
//!
//! Version discovery, version negotiation and the credentials handshake a
//! party runs to register with an OCPI peer.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod notify;
pub mod registrar;
pub mod registration;
pub mod store;
pub mod transport;
pub mod types;

pub use catalog::VersionCatalog;
pub use client::HttpTransport;
pub use config::{LocalParty, PeerConfig, RegistrarConfig};
pub use error::OcpiError;
pub use notify::{
    AfterCall, BeforeCall, CallObserver, CallResult, NotificationBus, ObserverError,
    TracingObserver,
};
pub use registrar::{AttemptReport, Registrar};
pub use registration::Registration;
pub use store::{FilePeerStore, MemoryPeerStore, PeerStore};
pub use transport::OcpiTransport;
pub use types::{
    AttemptOutcome, BusinessDetails, CallKind, CorrelationId, Credentials, CredentialsRole,
    CredentialsVerb, Endpoint, FailureKind, Image, InterfaceRole, ModuleId, OcpiResponse,
    OcpiStatusCode, PartyId, PeerRecord, RegistrationAttempt, RegistrationState, Relationship,
    RequestEnvelope, RequestId, Role, VersionDetail, VersionId, VersionInformation,
};

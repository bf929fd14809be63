//! Registrar - entry point for registering with OCPI peers
//!
//! Owns the collaborators shared by every attempt (transport, notification
//! bus, peer store, configuration) and hands out [`Registration`]s. The
//! composite operations drive a registration from `Idle` to a terminal state
//! in one call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{PeerConfig, RegistrarConfig};
use crate::error::OcpiError;
use crate::notify::{AfterCall, BeforeCall, CallResult, NotificationBus, ObserverError};
use crate::registration::{Context, Registration, tolerate_observer};
use crate::store::PeerStore;
use crate::transport::OcpiTransport;
use crate::types::{
    AttemptOutcome, CallKind, CorrelationId, Credentials, CredentialsVerb, PeerRecord,
    RegistrationAttempt, RequestEnvelope, VersionId,
};

/// What a completed composite operation leaves behind.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub attempt: RegistrationAttempt,
    /// The peer's credentials: as stored after POST/PUT, as read by GET.
    pub credentials: Option<Credentials>,
    /// Observer failures that did not stop the attempt.
    pub observer_errors: Vec<ObserverError>,
}

impl AttemptReport {
    pub fn outcome(&self) -> Option<AttemptOutcome> {
        self.attempt.outcome()
    }
}

pub struct Registrar {
    ctx: Arc<Context>,
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    shutdown: CancellationToken,
}

impl Registrar {
    pub fn new(
        transport: Arc<dyn OcpiTransport>,
        store: Arc<dyn PeerStore>,
        config: RegistrarConfig,
    ) -> Self {
        Self::with_bus(transport, store, config, NotificationBus::new())
    }

    pub fn with_bus(
        transport: Arc<dyn OcpiTransport>,
        store: Arc<dyn PeerStore>,
        config: RegistrarConfig,
        bus: NotificationBus,
    ) -> Self {
        Self {
            ctx: Arc::new(Context {
                transport,
                bus,
                store,
                config,
            }),
            locks: std::sync::Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.ctx.bus
    }

    pub fn config(&self) -> &RegistrarConfig {
        &self.ctx.config
    }

    /// Start a new attempt with a fresh correlation id.
    pub fn begin(&self, peer: &PeerConfig) -> Registration {
        self.resume(peer, CorrelationId::new())
    }

    /// Start an attempt that continues an earlier one's correlation id, so a
    /// retry after a timeout can be traced back to the first try.
    pub fn resume(&self, peer: &PeerConfig, correlation_id: CorrelationId) -> Registration {
        Registration::new(
            self.ctx.clone(),
            peer.clone(),
            self.peer_lock(&peer.peer_id),
            self.shutdown.child_token(),
            correlation_id,
        )
    }

    /// Cancel every attempt handed out by this registrar.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn peer_record(&self, peer_id: &str) -> Result<Option<PeerRecord>, OcpiError> {
        self.ctx.store.load(peer_id).await
    }

    pub async fn peers(&self) -> Result<Vec<String>, OcpiError> {
        self.ctx.store.list().await
    }

    /// Register with a peer, or rotate credentials if already registered.
    ///
    /// Emits one `register` notification pair around the whole attempt, in
    /// addition to the pairs of each individual call.
    pub async fn register(
        &self,
        peer: &PeerConfig,
        version: Option<VersionId>,
    ) -> Result<AttemptReport, OcpiError> {
        let mut registration = self.begin(peer);
        if let Some(version) = version {
            registration = registration.pin_version(version);
        }

        let envelope = RequestEnvelope::new(
            self.ctx.config.local.party.clone(),
            self.ctx.config.request_timeout,
        )
        .with_correlation(registration.correlation_id());
        let before = BeforeCall::new(CallKind::Register, &envelope);
        let mut observer_errors = self.ctx.bus.emit_before(&before);
        let started = Instant::now();

        let result = async {
            tolerate_observer(registration.negotiate().await)?;
            tolerate_observer(registration.commit().await)?;
            Ok::<_, OcpiError>(registration.attempt().remote.clone())
        }
        .await;

        let settled = match &result {
            Ok(Some(creds)) => CallResult::Credentials(creds.clone()),
            Ok(None) => CallResult::Empty,
            Err(e) => CallResult::Failed(e.to_string()),
        };
        observer_errors.extend(self.ctx.bus.emit_after(&AfterCall::settle(
            &before,
            settled,
            started.elapsed(),
        )));

        let credentials = result?;
        Ok(report(registration, credentials, observer_errors))
    }

    /// Replace the credentials of an existing relationship.
    pub async fn rotate(&self, peer: &PeerConfig) -> Result<AttemptReport, OcpiError> {
        self.run(peer, CredentialsVerb::Put).await
    }

    /// End the relationship with a peer.
    pub async fn unregister(&self, peer: &PeerConfig) -> Result<AttemptReport, OcpiError> {
        self.run(peer, CredentialsVerb::Delete).await
    }

    /// Read the peer's view of our credentials. Stores nothing.
    pub async fn fetch_credentials(&self, peer: &PeerConfig) -> Result<AttemptReport, OcpiError> {
        self.run(peer, CredentialsVerb::Get).await
    }

    async fn run(
        &self,
        peer: &PeerConfig,
        verb: CredentialsVerb,
    ) -> Result<AttemptReport, OcpiError> {
        let mut registration = self.begin(peer);
        tolerate_observer(registration.negotiate().await)?;
        tolerate_observer(registration.exchange(verb).await)?;

        let credentials = match verb {
            CredentialsVerb::Get => registration.last_fetched().cloned(),
            _ => registration.attempt().remote.clone(),
        };
        info!(
            peer_id = %peer.peer_id,
            verb = %verb,
            state = %registration.state(),
            "Credentials call completed"
        );
        Ok(report(registration, credentials, Vec::new()))
    }

    /// Locks nobody else holds are dropped on the way, so the map only
    /// tracks peers with a live attempt.
    fn peer_lock(&self, peer_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(peer_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn report(
    registration: Registration,
    credentials: Option<Credentials>,
    mut extra: Vec<ObserverError>,
) -> AttemptReport {
    let mut observer_errors = registration.observer_errors().to_vec();
    observer_errors.append(&mut extra);
    AttemptReport {
        attempt: registration.into_attempt(),
        credentials,
        observer_errors,
    }
}

//! Registration state machine.
//!
//! One [`Registration`] drives one attempt against one peer:
//!
//! ```text
//! Idle -> VersionsRequested -> VersionSelected -> DetailsRequested
//!      -> CredentialsExchangePending -> Registered | Deregistered
//! ```
//!
//! Every non-terminal state can exit to `Failed(kind)`. Steps run strictly in
//! order and a step called out of order is refused without touching the
//! attempt. Nothing is persisted until the peer has accepted a mutating
//! credentials call, so a failed attempt leaves the stored record as it was.
//!
//! Observer failures never interrupt a step. The step applies its transition
//! and then returns [`OcpiError::Observer`]; the attempt can carry on from the
//! new state.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{PeerConfig, RegistrarConfig};
use crate::error::OcpiError;
use crate::notify::{AfterCall, BeforeCall, CallResult, NotificationBus, ObserverError};
use crate::store::PeerStore;
use crate::transport::OcpiTransport;
use crate::types::{
    CallKind, CorrelationId, Credentials, CredentialsVerb, PeerRecord, RegistrationAttempt,
    RegistrationState, Relationship, RequestEnvelope, VersionDetail, VersionId,
    VersionInformation,
};

/// Collaborators shared by every attempt of one registrar.
pub(crate) struct Context {
    pub(crate) transport: Arc<dyn OcpiTransport>,
    pub(crate) bus: NotificationBus,
    pub(crate) store: Arc<dyn PeerStore>,
    pub(crate) config: RegistrarConfig,
}

/// A single registration attempt against one peer.
pub struct Registration {
    ctx: Arc<Context>,
    peer: PeerConfig,
    peer_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    attempt: RegistrationAttempt,
    pinned: Option<VersionId>,
    /// Observer errors raised by the step in progress.
    pending: Vec<ObserverError>,
    observer_errors: Vec<ObserverError>,
    last_fetched: Option<Credentials>,
}

impl Registration {
    pub(crate) fn new(
        ctx: Arc<Context>,
        peer: PeerConfig,
        peer_lock: Arc<Mutex<()>>,
        cancel: CancellationToken,
        correlation_id: CorrelationId,
    ) -> Self {
        let attempt = RegistrationAttempt::new(peer.peer_id.clone(), correlation_id);
        let pinned = ctx.config.pinned_version.clone();
        Self {
            ctx,
            peer,
            peer_lock,
            cancel,
            attempt,
            pinned,
            pending: Vec::new(),
            observer_errors: Vec::new(),
            last_fetched: None,
        }
    }

    /// Negotiate exactly this version for this attempt, overriding configuration.
    pub fn pin_version(mut self, version: VersionId) -> Self {
        self.pinned = Some(version);
        self
    }

    pub fn attempt(&self) -> &RegistrationAttempt {
        &self.attempt
    }

    pub fn into_attempt(self) -> RegistrationAttempt {
        self.attempt
    }

    pub fn state(&self) -> RegistrationState {
        self.attempt.state
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.attempt.correlation_id
    }

    pub fn peer(&self) -> &PeerConfig {
        &self.peer
    }

    /// Cancelling stops further steps; a call already in flight settles and
    /// its result is discarded.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Every observer error raised so far, in order.
    pub fn observer_errors(&self) -> &[ObserverError] {
        &self.observer_errors
    }

    /// Peer credentials returned by the most recent GET.
    pub fn last_fetched(&self) -> Option<&Credentials> {
        self.last_fetched.as_ref()
    }

    pub fn versions(&self) -> &[VersionInformation] {
        &self.attempt.versions
    }

    pub fn selected(&self) -> Option<&VersionInformation> {
        self.attempt.selected.as_ref()
    }

    pub fn detail(&self) -> Option<&VersionDetail> {
        self.attempt.detail.as_ref()
    }

    /// Idle -> VersionsRequested: fetch the peer's versions list.
    pub async fn request_versions(&mut self) -> Result<(), OcpiError> {
        self.expect(RegistrationState::Idle, "request versions")?;
        self.ensure_not_cancelled()?;
        self.transition(RegistrationState::VersionsRequested);

        let authorization = match self.presented_token().await {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e)),
        };
        let envelope = self.envelope(None, authorization);
        let transport = self.ctx.transport.clone();
        let url = self.peer.versions_url.clone();

        let result = self
            .dispatch(
                CallKind::GetVersions,
                &envelope,
                transport.get_versions(&envelope, &url),
                |versions| CallResult::Versions(versions.clone()),
            )
            .await;
        self.ensure_not_cancelled()?;

        let versions = result.map_err(|e| self.fail(e))?;
        debug!(
            peer_id = %self.peer.peer_id,
            count = versions.len(),
            "Received versions list"
        );
        self.attempt.versions = versions;
        self.surface(CallKind::GetVersions)
    }

    /// VersionsRequested -> VersionSelected.
    ///
    /// A pinned version wins. Otherwise a default version
    /// stored for this peer is reused while the peer still offers it, and
    /// failing that the highest mutually supported version is chosen.
    pub async fn select_version(&mut self) -> Result<VersionInformation, OcpiError> {
        self.expect(RegistrationState::VersionsRequested, "select version")?;
        self.ensure_not_cancelled()?;

        let ctx = self.ctx.clone();
        let catalog = &ctx.config.catalog;
        let offered = self.attempt.versions.clone();

        let selection = match &self.pinned {
            Some(pin) => catalog.select(&offered, Some(pin)),
            None => {
                let preferred = match ctx.store.load(&self.peer.peer_id).await {
                    Ok(record) => record.and_then(|r| r.default_version),
                    Err(e) => return Err(self.fail(e)),
                };
                match preferred.and_then(|v| catalog.select(&offered, Some(&v)).ok()) {
                    Some(info) => Ok(info),
                    None => catalog.select(&offered, None),
                }
            }
        };

        let selected = selection.map_err(|e| self.fail(e))?;
        info!(
            peer_id = %self.peer.peer_id,
            correlation_id = %self.attempt.correlation_id,
            version = %selected.version,
            "Selected version"
        );
        self.attempt.selected = Some(selected.clone());
        self.transition(RegistrationState::VersionSelected);
        Ok(selected)
    }

    /// VersionSelected -> DetailsRequested: fetch the selected version's modules.
    pub async fn request_details(&mut self) -> Result<(), OcpiError> {
        self.expect(RegistrationState::VersionSelected, "request version details")?;
        self.ensure_not_cancelled()?;

        let selected = self.selected_version()?;
        let ctx = self.ctx.clone();
        if ctx.config.set_as_default_version {
            let peer_lock = self.peer_lock.clone();
            let saved = {
                let _guard = peer_lock.lock().await;
                ctx.store
                    .save_default_version(&self.peer.peer_id, &selected.version)
                    .await
            };
            if let Err(e) = saved {
                return Err(self.fail(e));
            }
        }
        self.transition(RegistrationState::DetailsRequested);

        let authorization = match self.presented_token().await {
            Ok(token) => token,
            Err(e) => return Err(self.fail(e)),
        };
        let envelope = self.envelope(Some(selected.version.clone()), authorization);
        let transport = self.ctx.transport.clone();

        let result = self
            .dispatch(
                CallKind::GetVersionDetails,
                &envelope,
                transport.get_version_details(&envelope, &selected),
                |detail| CallResult::VersionDetail(detail.clone()),
            )
            .await;
        self.ensure_not_cancelled()?;

        let detail = match result {
            Ok(detail) if detail.version == selected.version => detail,
            Ok(detail) => {
                return Err(self.fail(OcpiError::VersionDetailUnavailable(format!(
                    "asked for {} but peer described {}",
                    selected.version, detail.version
                ))));
            }
            Err(e @ (OcpiError::Timeout(_) | OcpiError::VersionDetailUnavailable(_))) => {
                return Err(self.fail(e));
            }
            Err(e) => {
                return Err(self.fail(OcpiError::VersionDetailUnavailable(format!(
                    "{} ({})",
                    e, selected.version
                ))));
            }
        };

        self.attempt.detail = Some(detail);
        self.surface(CallKind::GetVersionDetails)
    }

    /// DetailsRequested -> CredentialsExchangePending: find the peer's
    /// credentials endpoint for the selected version.
    pub fn locate_credentials(&mut self) -> Result<String, OcpiError> {
        self.expect(RegistrationState::DetailsRequested, "locate credentials endpoint")?;
        self.ensure_not_cancelled()?;

        let located = self
            .attempt
            .detail
            .as_ref()
            .and_then(|d| d.credentials_url())
            .map(str::to_string);

        let Some(url) = located else {
            let version = self
                .attempt
                .version()
                .map(|v| v.to_string())
                .unwrap_or_default();
            return Err(self.fail(OcpiError::CredentialsEndpointMissing(version)));
        };

        self.attempt.credentials_url = Some(url.clone());
        self.transition(RegistrationState::CredentialsExchangePending);
        Ok(url)
    }

    /// Run discovery up to the credentials exchange, tolerating observer
    /// failures along the way.
    pub async fn negotiate(&mut self) -> Result<(), OcpiError> {
        tolerate_observer(self.request_versions().await)?;
        self.select_version().await?;
        tolerate_observer(self.request_details().await)?;
        self.locate_credentials()?;
        Ok(())
    }

    /// CredentialsExchangePending -> Registered | Deregistered, or a GET that
    /// stays in CredentialsExchangePending.
    ///
    /// The peer's stored record is locked for the whole exchange, so two
    /// attempts against the same peer never interleave their credentials calls.
    pub async fn exchange(
        &mut self,
        verb: CredentialsVerb,
    ) -> Result<Option<Credentials>, OcpiError> {
        self.expect(
            RegistrationState::CredentialsExchangePending,
            &format!("{} credentials", verb),
        )?;
        self.exchange_with(|_| verb).await
    }

    /// POST when no relationship is stored yet, PUT otherwise. The choice is
    /// made under the peer lock.
    pub async fn commit(&mut self) -> Result<Option<Credentials>, OcpiError> {
        self.expect(
            RegistrationState::CredentialsExchangePending,
            "register credentials",
        )?;
        self.exchange_with(|record| {
            if record.is_registered() {
                CredentialsVerb::Put
            } else {
                CredentialsVerb::Post
            }
        })
        .await
    }

    async fn exchange_with(
        &mut self,
        choose: impl FnOnce(&PeerRecord) -> CredentialsVerb,
    ) -> Result<Option<Credentials>, OcpiError> {
        self.ensure_not_cancelled()?;

        let selected = self.selected_version()?;
        let endpoint = self.attempt.credentials_url.clone().ok_or_else(|| {
            OcpiError::CredentialsEndpointMissing(selected.version.to_string())
        })?;

        let peer_lock = self.peer_lock.clone();
        let _guard = peer_lock.lock().await;
        self.ensure_not_cancelled()?;

        let ctx = self.ctx.clone();
        let peer_id = self.peer.peer_id.clone();
        let mut record = match ctx.store.load(&peer_id).await {
            Ok(record) => record.unwrap_or_else(|| PeerRecord::new(peer_id.clone())),
            Err(e) => return Err(self.fail(e)),
        };
        let verb = choose(&record);

        match verb {
            CredentialsVerb::Post if record.is_registered() => {
                return Err(self.fail(OcpiError::AlreadyRegistered(peer_id)));
            }
            CredentialsVerb::Put | CredentialsVerb::Delete if !record.is_registered() => {
                return Err(self.fail(OcpiError::NotRegistered(peer_id)));
            }
            _ => {}
        }

        let bootstrap = self.peer.bootstrap_token.clone();
        let authorization = match verb {
            CredentialsVerb::Post => bootstrap,
            CredentialsVerb::Get => record.peer_token().map(str::to_string).or(bootstrap),
            CredentialsVerb::Put | CredentialsVerb::Delete => {
                record.peer_token().map(str::to_string)
            }
        };
        let local = verb
            .sends_payload()
            .then(|| ctx.config.local.fresh_credentials());

        let kind = CallKind::Credentials(verb);
        let envelope = self.envelope(Some(selected.version.clone()), authorization);
        let transport = ctx.transport.clone();

        let result = self
            .dispatch(
                kind,
                &envelope,
                transport.exchange_credentials(&envelope, verb, &endpoint, local.as_ref()),
                |response| match response {
                    Some(creds) => CallResult::Credentials(creds.clone()),
                    None => CallResult::Empty,
                },
            )
            .await;

        if self.cancel.is_cancelled() {
            debug!(
                peer_id = %peer_id,
                verb = %verb,
                "Discarding credentials response of cancelled attempt"
            );
            return Err(self.fail(OcpiError::Aborted));
        }

        let response = match result {
            Ok(response) => response,
            Err(e) if verb.is_mutating() && response_lost(&e) => {
                return Err(self.fail(OcpiError::OutcomeUnknown {
                    verb,
                    reason: e.to_string(),
                }));
            }
            Err(e) => return Err(self.fail(e)),
        };

        match verb {
            CredentialsVerb::Get => {
                let Some(remote) = response else {
                    return Err(self.fail(OcpiError::CredentialsRejected(
                        "peer returned no credentials".to_string(),
                    )));
                };
                self.last_fetched = Some(remote.clone());
                self.surface(kind)?;
                Ok(Some(remote))
            }
            CredentialsVerb::Post | CredentialsVerb::Put => {
                let (Some(local), Some(remote)) = (local, response) else {
                    return Err(self.fail(OcpiError::OutcomeUnknown {
                        verb,
                        reason: "peer accepted but returned no credentials".to_string(),
                    }));
                };

                record.relationship = Some(Relationship {
                    version: selected.version.clone(),
                    credentials_url: endpoint,
                    local: local.clone(),
                    remote: remote.clone(),
                    registered_at: Utc::now(),
                });
                if let Err(e) = ctx.store.save(&record).await {
                    return Err(self.fail(OcpiError::OutcomeUnknown {
                        verb,
                        reason: format!("peer accepted but record was not saved: {}", e),
                    }));
                }

                self.attempt.local = Some(local);
                self.attempt.remote = Some(remote.clone());
                self.transition(RegistrationState::Registered);
                info!(
                    peer_id = %peer_id,
                    correlation_id = %self.attempt.correlation_id,
                    version = %selected.version,
                    verb = %verb,
                    "Peer registered"
                );
                self.surface(kind)?;
                Ok(Some(remote))
            }
            CredentialsVerb::Delete => {
                record.relationship = None;
                let persisted = if record.default_version.is_some() {
                    ctx.store.save(&record).await
                } else {
                    ctx.store.delete(&peer_id).await
                };
                if let Err(e) = persisted {
                    return Err(self.fail(OcpiError::OutcomeUnknown {
                        verb,
                        reason: format!("peer accepted but record was not purged: {}", e),
                    }));
                }

                self.transition(RegistrationState::Deregistered);
                info!(
                    peer_id = %peer_id,
                    correlation_id = %self.attempt.correlation_id,
                    "Peer deregistered"
                );
                self.surface(kind)?;
                Ok(None)
            }
        }
    }

    fn expect(&self, expected: RegistrationState, action: &str) -> Result<(), OcpiError> {
        if self.attempt.state == expected {
            Ok(())
        } else {
            Err(OcpiError::InvalidTransition {
                action: action.to_string(),
                state: self.attempt.state.to_string(),
            })
        }
    }

    fn selected_version(&self) -> Result<VersionInformation, OcpiError> {
        self.attempt
            .selected
            .clone()
            .ok_or_else(|| OcpiError::InvalidTransition {
                action: "use selected version".to_string(),
                state: self.attempt.state.to_string(),
            })
    }

    fn ensure_not_cancelled(&mut self) -> Result<(), OcpiError> {
        if self.cancel.is_cancelled() {
            return Err(self.fail(OcpiError::Aborted));
        }
        Ok(())
    }

    fn transition(&mut self, next: RegistrationState) {
        debug!(
            peer_id = %self.peer.peer_id,
            correlation_id = %self.attempt.correlation_id,
            from = %self.attempt.state,
            to = %next,
            "Registration state changed"
        );
        self.attempt.state = next;
        if next.is_terminal() {
            self.attempt.finished_at = Some(Utc::now());
        }
    }

    /// Move to Failed, keeping the error for the caller.
    fn fail(&mut self, err: OcpiError) -> OcpiError {
        if !self.attempt.state.is_terminal() {
            warn!(
                peer_id = %self.peer.peer_id,
                correlation_id = %self.attempt.correlation_id,
                state = %self.attempt.state,
                error = %err,
                "Registration attempt failed"
            );
            self.transition(RegistrationState::Failed(err.failure_kind()));
        }
        for observer_error in self.pending.drain(..) {
            warn!(error = %observer_error, "Observer failed during failed step");
            self.observer_errors.push(observer_error);
        }
        err
    }

    /// Report observer errors raised during the step that just completed.
    fn surface(&mut self, kind: CallKind) -> Result<(), OcpiError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let message = self
            .pending
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        self.observer_errors.append(&mut self.pending);
        Err(OcpiError::Observer {
            call: kind.to_string(),
            message,
        })
    }

    /// Token to present: the peer-issued one once registered, else the bootstrap token.
    async fn presented_token(&self) -> Result<Option<String>, OcpiError> {
        let record = self.ctx.store.load(&self.peer.peer_id).await?;
        Ok(record
            .as_ref()
            .and_then(|r| r.peer_token())
            .map(str::to_string)
            .or_else(|| self.peer.bootstrap_token.clone()))
    }

    fn envelope(&self, version: Option<VersionId>, authorization: Option<String>) -> RequestEnvelope {
        let mut envelope = RequestEnvelope::new(
            self.ctx.config.local.party.clone(),
            self.ctx.config.request_timeout,
        )
        .with_correlation(self.attempt.correlation_id)
        .with_authorization(authorization);
        if let Some(version) = version {
            envelope = envelope.with_version(version);
        }
        envelope
    }

    /// Wrap one transport call in the notification pair and the request timeout.
    async fn dispatch<T, F>(
        &mut self,
        kind: CallKind,
        envelope: &RequestEnvelope,
        call: F,
        describe: impl Fn(&T) -> CallResult,
    ) -> Result<T, OcpiError>
    where
        F: Future<Output = Result<T, OcpiError>>,
    {
        let before = BeforeCall::new(kind, envelope);
        let mut observer_errors = self.ctx.bus.emit_before(&before);

        let started = Instant::now();
        let result = match tokio::time::timeout(envelope.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OcpiError::Timeout(envelope.timeout)),
        };
        let elapsed = started.elapsed();

        let settled = match &result {
            Ok(value) => describe(value),
            Err(e) => CallResult::Failed(e.to_string()),
        };
        let after = AfterCall::settle(&before, settled, elapsed);
        observer_errors.extend(self.ctx.bus.emit_after(&after));

        self.pending.extend(observer_errors);
        result
    }
}

/// Whether a failed mutating call may still have been applied by the peer.
fn response_lost(err: &OcpiError) -> bool {
    match err {
        OcpiError::Timeout(_) | OcpiError::Json(_) => true,
        OcpiError::Http(e) => !e.is_connect() && !e.is_builder(),
        _ => false,
    }
}

/// Composite flows keep going past observer failures; they are still
/// collected on the registration.
pub(crate) fn tolerate_observer<T: Default>(result: Result<T, OcpiError>) -> Result<T, OcpiError> {
    match result {
        Err(OcpiError::Observer { .. }) => Ok(T::default()),
        other => other,
    }
}

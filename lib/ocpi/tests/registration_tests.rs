#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Integration tests for the registration state machine
//!
//! Runs full attempts against a scripted in-memory peer.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ocpi::{
    AfterCall, BeforeCall, BusinessDetails, CallKind, CallObserver, CorrelationId, Credentials,
    CredentialsVerb, Endpoint, FailureKind, MemoryPeerStore, ModuleId, ObserverError,
    OcpiError, OcpiTransport, PeerConfig, PeerStore, Registrar, RegistrarConfig,
    RegistrationState, RequestEnvelope, RequestId, VersionCatalog, VersionDetail, VersionId,
    VersionInformation,
};

// ==================== Scripted Peer ====================

#[derive(Debug, Clone)]
struct Recorded {
    kind: CallKind,
    request_id: RequestId,
    correlation_id: Option<CorrelationId>,
    authorization: Option<String>,
}

struct ScriptedPeer {
    versions: Vec<VersionInformation>,
    details: HashMap<VersionId, VersionDetail>,
    issued: Credentials,
    versions_delay: Mutex<Option<Duration>>,
    credentials_delay: Mutex<Option<Duration>>,
    /// Verbs the peer answers with a refusal.
    refused: Mutex<HashSet<CredentialsVerb>>,
    /// Our credentials as the peer currently holds them.
    held: Mutex<Option<Credentials>>,
    calls: Mutex<Vec<Recorded>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedPeer {
    fn new(versions: &[&str]) -> Self {
        let versions: Vec<VersionInformation> = versions
            .iter()
            .map(|v| VersionInformation::new(*v, format!("https://b/ocpi/{}", v)))
            .collect();
        let details = versions
            .iter()
            .map(|info| {
                let detail = VersionDetail {
                    version: info.version.clone(),
                    endpoints: vec![
                        Endpoint {
                            identifier: ModuleId::Credentials,
                            role: None,
                            url: format!("{}/credentials", info.url),
                        },
                        Endpoint {
                            identifier: ModuleId::Locations,
                            role: None,
                            url: format!("{}/locations", info.url),
                        },
                    ],
                };
                (info.version.clone(), detail)
            })
            .collect();

        Self {
            versions,
            details,
            issued: credentials("xyz", "https://b/"),
            versions_delay: Mutex::new(None),
            credentials_delay: Mutex::new(None),
            refused: Mutex::new(HashSet::new()),
            held: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn without_module(mut self, version: &str, module: ModuleId) -> Self {
        if let Some(detail) = self.details.get_mut(&VersionId::new(version)) {
            detail.endpoints.retain(|e| e.identifier != module);
        }
        self
    }

    fn delay_versions(&self, delay: Duration) {
        *self.versions_delay.lock().unwrap() = Some(delay);
    }

    fn delay_credentials(&self, delay: Duration) {
        *self.credentials_delay.lock().unwrap() = Some(delay);
    }

    fn refuse(&self, verb: CredentialsVerb) {
        self.refused.lock().unwrap().insert(verb);
    }

    fn record(&self, kind: CallKind, envelope: &RequestEnvelope) {
        self.calls.lock().unwrap().push(Recorded {
            kind,
            request_id: envelope.request_id,
            correlation_id: envelope.correlation_id,
            authorization: envelope.authorization.clone(),
        });
    }

    fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    fn kinds(&self) -> Vec<CallKind> {
        self.calls().into_iter().map(|c| c.kind).collect()
    }

    fn held(&self) -> Option<Credentials> {
        self.held.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcpiTransport for ScriptedPeer {
    async fn get_versions(
        &self,
        envelope: &RequestEnvelope,
        _versions_url: &str,
    ) -> Result<Vec<VersionInformation>, OcpiError> {
        self.record(CallKind::GetVersions, envelope);
        let delay = *self.versions_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.versions.clone())
    }

    async fn get_version_details(
        &self,
        envelope: &RequestEnvelope,
        version: &VersionInformation,
    ) -> Result<VersionDetail, OcpiError> {
        self.record(CallKind::GetVersionDetails, envelope);
        self.details
            .get(&version.version)
            .cloned()
            .ok_or_else(|| OcpiError::VersionDetailUnavailable(version.version.to_string()))
    }

    async fn exchange_credentials(
        &self,
        envelope: &RequestEnvelope,
        verb: CredentialsVerb,
        _endpoint: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Option<Credentials>, OcpiError> {
        self.record(CallKind::Credentials(verb), envelope);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.credentials_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.refused.lock().unwrap().contains(&verb) {
            return Err(OcpiError::CredentialsRejected(format!("{} refused", verb)));
        }

        let mut held = self.held.lock().unwrap();
        match verb {
            CredentialsVerb::Get => Ok(Some(self.issued.clone())),
            CredentialsVerb::Post if held.is_some() => Err(OcpiError::CredentialsRejected(
                "already registered".to_string(),
            )),
            CredentialsVerb::Put | CredentialsVerb::Delete if held.is_none() => Err(
                OcpiError::CredentialsRejected("not registered".to_string()),
            ),
            CredentialsVerb::Post | CredentialsVerb::Put => {
                *held = credentials.cloned();
                Ok(Some(self.issued.clone()))
            }
            CredentialsVerb::Delete => {
                *held = None;
                Ok(None)
            }
        }
    }
}

fn credentials(token: &str, url: &str) -> Credentials {
    Credentials {
        token: token.to_string(),
        url: url.to_string(),
        business_details: BusinessDetails::named("Peer"),
        roles: vec![],
    }
}

// ==================== Fixtures ====================

fn config() -> RegistrarConfig {
    let mut config = RegistrarConfig::default();
    config.local.versions_url = "https://a/".to_string();
    config.local.token = Some("abc".to_string());
    config.catalog = VersionCatalog::accepting(["2.1", "2.2", "3.0"]);
    config.request_timeout = Duration::from_secs(2);
    config
}

fn peer() -> PeerConfig {
    PeerConfig::new("peer-b", "https://b/ocpi/versions").with_bootstrap_token("token-a")
}

fn setup(
    transport: ScriptedPeer,
    config: RegistrarConfig,
) -> (Arc<ScriptedPeer>, Arc<MemoryPeerStore>, Registrar) {
    let transport = Arc::new(transport);
    let store = Arc::new(MemoryPeerStore::new());
    let registrar = Registrar::new(transport.clone(), store.clone(), config);
    (transport, store, registrar)
}

#[derive(Default)]
struct Recorder {
    before: Mutex<Vec<BeforeCall>>,
    after: Mutex<Vec<AfterCall>>,
}

impl CallObserver for Recorder {
    fn before(&self, event: &BeforeCall) -> Result<(), ObserverError> {
        self.before.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn after(&self, event: &AfterCall) -> Result<(), ObserverError> {
        self.after.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct Failing;

impl CallObserver for Failing {
    fn before(&self, _event: &BeforeCall) -> Result<(), ObserverError> {
        Err(ObserverError("audit sink unavailable".to_string()))
    }
}

// ==================== Happy Path ====================

#[tokio::test]
async fn test_pinned_version_post_registers() {
    let mut config = config();
    config.pinned_version = Some(VersionId::new("3.0"));
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.1", "2.2", "3.0"]), config);

    let report = registrar.register(&peer(), None).await.unwrap();

    assert_eq!(report.attempt.state, RegistrationState::Registered);
    assert_eq!(report.attempt.version(), Some(&VersionId::new("3.0")));
    assert_eq!(report.credentials.as_ref().unwrap().token, "xyz");

    let record = store.load("peer-b").await.unwrap().unwrap();
    let relationship = record.relationship.unwrap();
    assert_eq!(relationship.version, VersionId::new("3.0"));
    assert_eq!(relationship.credentials_url, "https://b/ocpi/3.0/credentials");
    assert_eq!(relationship.local.token, "abc");
    assert_eq!(relationship.local.url, "https://a/");
    assert_eq!(relationship.remote.token, "xyz");
    assert_eq!(relationship.remote.url, "https://b/");
    assert_eq!(record.default_version, Some(VersionId::new("3.0")));

    assert_eq!(transport.held().unwrap().token, "abc");
    assert_eq!(
        transport.kinds(),
        vec![
            CallKind::GetVersions,
            CallKind::GetVersionDetails,
            CallKind::Credentials(CredentialsVerb::Post),
        ]
    );
}

#[tokio::test]
async fn test_highest_mutual_version_selected() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2", "3.0", "2.1"]), config());
    let mut registration = registrar.begin(&peer());

    registration.request_versions().await.unwrap();
    let selected = registration.select_version().await.unwrap();
    assert_eq!(selected.version, VersionId::new("3.0"));
    assert_eq!(selected.url, "https://b/ocpi/3.0");
}

#[tokio::test]
async fn test_selection_deterministic_across_attempts() {
    let (_transport, _store, registrar) =
        setup(ScriptedPeer::new(&["2.2", "2.1", "9.9"]), config());

    let mut first = registrar.begin(&peer());
    first.request_versions().await.unwrap();
    let mut second = registrar.begin(&peer());
    second.request_versions().await.unwrap();

    assert_eq!(
        first.select_version().await.unwrap(),
        second.select_version().await.unwrap()
    );
}

#[tokio::test]
async fn test_tokens_presented_per_verb() {
    let (transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());

    registrar.register(&peer(), None).await.unwrap();
    registrar.rotate(&peer()).await.unwrap();

    let auth: Vec<(CallKind, Option<String>)> = transport
        .calls()
        .into_iter()
        .map(|c| (c.kind, c.authorization))
        .collect();
    let token = |s: &str| Some(s.to_string());
    assert_eq!(
        auth,
        vec![
            (CallKind::GetVersions, token("token-a")),
            (CallKind::GetVersionDetails, token("token-a")),
            (CallKind::Credentials(CredentialsVerb::Post), token("token-a")),
            (CallKind::GetVersions, token("xyz")),
            (CallKind::GetVersionDetails, token("xyz")),
            (CallKind::Credentials(CredentialsVerb::Put), token("xyz")),
        ]
    );
}

#[tokio::test]
async fn test_register_twice_rotates_with_put() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());

    registrar.register(&peer(), None).await.unwrap();
    let first = store.load("peer-b").await.unwrap().unwrap();

    let report = registrar.register(&peer(), None).await.unwrap();
    assert_eq!(report.attempt.state, RegistrationState::Registered);
    assert_eq!(
        transport.kinds().last(),
        Some(&CallKind::Credentials(CredentialsVerb::Put))
    );

    let second = store.load("peer-b").await.unwrap().unwrap();
    assert!(second.relationship.unwrap().registered_at >= first.relationship.unwrap().registered_at);
}

// ==================== Round Trip & Idempotence ====================

#[tokio::test]
async fn test_post_then_get_returns_stored_peer_record() {
    let (_transport, store, registrar) = setup(ScriptedPeer::new(&["2.1", "2.2"]), config());

    registrar.register(&peer(), None).await.unwrap();
    let report = registrar.fetch_credentials(&peer()).await.unwrap();

    // GET does not commit
    assert_eq!(
        report.attempt.state,
        RegistrationState::CredentialsExchangePending
    );
    let stored = store.load("peer-b").await.unwrap().unwrap();
    assert_eq!(report.credentials, Some(stored.relationship.unwrap().remote));
}

#[tokio::test]
async fn test_delete_twice_fails_cleanly() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());

    registrar.register(&peer(), None).await.unwrap();
    let report = registrar.unregister(&peer()).await.unwrap();
    assert_eq!(report.attempt.state, RegistrationState::Deregistered);
    assert!(transport.held().is_none());

    let after_first = store.load("peer-b").await.unwrap().unwrap();
    assert!(!after_first.is_registered());
    assert_eq!(after_first.default_version, Some(VersionId::new("2.2")));

    let err = registrar.unregister(&peer()).await.unwrap_err();
    assert!(matches!(err, OcpiError::NotRegistered(ref id) if id == "peer-b"));
    assert_eq!(store.load("peer-b").await.unwrap().unwrap(), after_first);

    let deletes = transport
        .kinds()
        .into_iter()
        .filter(|k| *k == CallKind::Credentials(CredentialsVerb::Delete))
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn test_rotate_requires_registration() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());

    let err = registrar.rotate(&peer()).await.unwrap_err();
    assert!(matches!(err, OcpiError::NotRegistered(_)));
    assert!(!store.load("peer-b").await.unwrap().unwrap().is_registered());
    assert!(
        !transport
            .kinds()
            .contains(&CallKind::Credentials(CredentialsVerb::Put))
    );
}

#[tokio::test]
async fn test_post_refused_when_already_registered() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    registrar.register(&peer(), None).await.unwrap();

    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let err = registration.exchange(CredentialsVerb::Post).await.unwrap_err();
    assert!(matches!(err, OcpiError::AlreadyRegistered(_)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::AlreadyRegistered)
    );
}

// ==================== Failures ====================

#[tokio::test]
async fn test_empty_version_list() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&[]), config());
    let mut registration = registrar.begin(&peer());

    registration.request_versions().await.unwrap();
    let err = registration.select_version().await.unwrap_err();
    assert!(matches!(err, OcpiError::NoCompatibleVersion(_)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::NoCompatibleVersion)
    );

    // Terminal attempts refuse further steps
    let err = registration.request_details().await.unwrap_err();
    assert!(matches!(err, OcpiError::InvalidTransition { .. }));

    assert_eq!(transport.kinds(), vec![CallKind::GetVersions]);
    assert!(store.load("peer-b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_no_mutually_supported_version() {
    let (transport, _store, registrar) = setup(ScriptedPeer::new(&["1.0", "4.0"]), config());

    let err = registrar.register(&peer(), None).await.unwrap_err();
    assert!(matches!(err, OcpiError::NoCompatibleVersion(_)));
    assert_eq!(transport.kinds(), vec![CallKind::GetVersions]);
}

#[tokio::test]
async fn test_pinned_version_not_offered() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.1", "2.2"]), config());

    let err = registrar
        .register(&peer(), Some(VersionId::new("3.0")))
        .await
        .unwrap_err();
    assert!(matches!(err, OcpiError::NoCompatibleVersion(_)));
}

#[tokio::test]
async fn test_missing_credentials_module() {
    let transport = ScriptedPeer::new(&["2.2"]).without_module("2.2", ModuleId::Credentials);
    let (transport, store, registrar) = setup(transport, config());
    let mut registration = registrar.begin(&peer());

    let err = registration.negotiate().await.unwrap_err();
    assert!(matches!(err, OcpiError::CredentialsEndpointMissing(ref v) if v == "2.2"));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::CredentialsEndpointMissing)
    );
    assert_eq!(
        transport.kinds(),
        vec![CallKind::GetVersions, CallKind::GetVersionDetails]
    );
    assert!(!store.load("peer-b").await.unwrap().unwrap().is_registered());
}

#[tokio::test]
async fn test_steps_out_of_order_are_refused() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    let mut registration = registrar.begin(&peer());

    let err = registration.select_version().await.unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid transition: cannot select version from Idle"
    );
    assert_eq!(registration.state(), RegistrationState::Idle);

    let err = registration.exchange(CredentialsVerb::Post).await.unwrap_err();
    assert!(matches!(err, OcpiError::InvalidTransition { .. }));
    assert_eq!(registration.state(), RegistrationState::Idle);
}

#[tokio::test]
async fn test_rejected_put_keeps_record() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    registrar.register(&peer(), None).await.unwrap();
    let before = store.load("peer-b").await.unwrap().unwrap();

    transport.refuse(CredentialsVerb::Put);
    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let err = registration.exchange(CredentialsVerb::Put).await.unwrap_err();

    assert!(matches!(err, OcpiError::CredentialsRejected(_)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::CredentialsRejected)
    );
    assert_eq!(store.load("peer-b").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_rejected_delete_keeps_record() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    registrar.register(&peer(), None).await.unwrap();
    let before = store.load("peer-b").await.unwrap().unwrap();

    transport.refuse(CredentialsVerb::Delete);
    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let err = registration
        .exchange(CredentialsVerb::Delete)
        .await
        .unwrap_err();

    assert!(matches!(err, OcpiError::CredentialsRejected(_)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::CredentialsRejected)
    );
    assert_eq!(store.load("peer-b").await.unwrap().unwrap(), before);
    assert!(transport.held().is_some());
}

#[tokio::test]
async fn test_rejected_post_keeps_record() {
    let mut config = config();
    config.set_as_default_version = false;
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);
    store
        .save_default_version("peer-b", &VersionId::new("2.2"))
        .await
        .unwrap();
    let before = store.load("peer-b").await.unwrap().unwrap();

    transport.refuse(CredentialsVerb::Post);
    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let err = registration
        .exchange(CredentialsVerb::Post)
        .await
        .unwrap_err();

    assert!(matches!(err, OcpiError::CredentialsRejected(_)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::CredentialsRejected)
    );
    assert_eq!(store.load("peer-b").await.unwrap().unwrap(), before);
    assert!(registration.attempt().remote.is_none());
}

// ==================== Timeouts ====================

#[tokio::test]
async fn test_versions_timeout() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(50);
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);
    transport.delay_versions(Duration::from_millis(500));

    let mut registration = registrar.begin(&peer());
    let err = registration.request_versions().await.unwrap_err();

    assert!(matches!(err, OcpiError::Timeout(d) if d == Duration::from_millis(50)));
    assert!(err.is_retriable());
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::Timeout)
    );
    assert!(registration.versions().is_empty());
    assert!(store.load("peer-b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_put_timeout_is_unknown_and_keeps_record() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(50);
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);

    registrar.register(&peer(), None).await.unwrap();
    let before = store.load("peer-b").await.unwrap().unwrap();

    transport.delay_credentials(Duration::from_millis(500));
    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let err = registration.exchange(CredentialsVerb::Put).await.unwrap_err();

    assert!(matches!(
        err,
        OcpiError::OutcomeUnknown {
            verb: CredentialsVerb::Put,
            ..
        }
    ));
    assert!(!err.is_retriable());
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::Unknown)
    );
    assert_eq!(store.load("peer-b").await.unwrap().unwrap(), before);
}

#[tokio::test]
async fn test_get_timeout_is_plain_timeout() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(50);
    let (transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);
    transport.delay_credentials(Duration::from_millis(500));

    let err = registrar.fetch_credentials(&peer()).await.unwrap_err();
    assert!(matches!(err, OcpiError::Timeout(_)));
}

#[tokio::test]
async fn test_retry_reuses_correlation_id() {
    let mut config = config();
    config.request_timeout = Duration::from_millis(50);
    let (transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);
    transport.delay_versions(Duration::from_millis(500));

    let mut first = registrar.begin(&peer());
    assert!(first.request_versions().await.unwrap_err().is_retriable());

    *transport.versions_delay.lock().unwrap() = None;
    let mut retry = registrar.resume(&peer(), first.correlation_id());
    retry.negotiate().await.unwrap();

    let calls = transport.calls();
    assert!(
        calls
            .iter()
            .all(|c| c.correlation_id == Some(first.correlation_id()))
    );
    assert_ne!(calls[0].request_id, calls[1].request_id);
}

// ==================== Notifications ====================

#[tokio::test]
async fn test_notifications_share_correlation_id() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    let recorder = Arc::new(Recorder::default());
    registrar.bus().subscribe(recorder.clone());

    let report = registrar.register(&peer(), None).await.unwrap();

    let before = recorder.before.lock().unwrap().clone();
    let after = recorder.after.lock().unwrap().clone();
    let kinds: Vec<CallKind> = before.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            CallKind::Register,
            CallKind::GetVersions,
            CallKind::GetVersionDetails,
            CallKind::Credentials(CredentialsVerb::Post),
        ]
    );
    assert_eq!(after.len(), before.len());
    assert_eq!(after.last().unwrap().kind, CallKind::Register);
    assert!(after.iter().all(|e| e.result.is_success()));

    let correlation = Some(report.attempt.correlation_id);
    assert!(before.iter().all(|e| e.correlation_id == correlation));

    let request_ids: HashSet<RequestId> = before.iter().map(|e| e.request_id).collect();
    assert_eq!(request_ids.len(), before.len());

    for event in &after {
        let paired = before
            .iter()
            .find(|b| b.event_tracking_id == event.event_tracking_id)
            .unwrap();
        assert_eq!(paired.request_id, event.request_id);
        assert_eq!(paired.kind, event.kind);
    }
}

#[tokio::test]
async fn test_after_hook_sees_failure() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["1.0"]), config());
    let recorder = Arc::new(Recorder::default());
    registrar.bus().subscribe(recorder.clone());

    assert!(registrar.register(&peer(), None).await.is_err());

    let after = recorder.after.lock().unwrap().clone();
    let register = after.iter().find(|e| e.kind == CallKind::Register).unwrap();
    assert!(!register.result.is_success());
}

#[tokio::test]
async fn test_observer_error_surfaces_after_transition() {
    let (_transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    let recorder = Arc::new(Recorder::default());
    registrar.bus().subscribe(Arc::new(Failing));
    registrar.bus().subscribe(recorder.clone());

    let mut registration = registrar.begin(&peer());
    let err = registration.request_versions().await.unwrap_err();

    assert!(matches!(err, OcpiError::Observer { ref call, .. } if call == "get_versions"));
    assert_eq!(registration.state(), RegistrationState::VersionsRequested);
    assert_eq!(registration.versions().len(), 1);
    assert_eq!(registration.observer_errors().len(), 1);
    // Later observers still ran
    assert_eq!(recorder.before.lock().unwrap().len(), 1);
    assert_eq!(recorder.after.lock().unwrap().len(), 1);

    registration.select_version().await.unwrap();
}

#[tokio::test]
async fn test_composite_reports_observer_errors() {
    let (_transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    registrar.bus().subscribe(Arc::new(Failing));

    let report = registrar.register(&peer(), None).await.unwrap();
    assert_eq!(report.attempt.state, RegistrationState::Registered);
    // register, versions, details and POST each failed once
    assert_eq!(report.observer_errors.len(), 4);
    assert!(store.load("peer-b").await.unwrap().unwrap().is_registered());
}

// ==================== Cancellation & Concurrency ====================

#[tokio::test]
async fn test_cancel_discards_in_flight_result() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    transport.delay_credentials(Duration::from_millis(100));

    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    let token = registration.cancel_token();

    let (result, _) = tokio::join!(registration.commit(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    assert!(matches!(result, Err(OcpiError::Aborted)));
    assert_eq!(
        registration.state(),
        RegistrationState::Failed(FailureKind::Aborted)
    );
    // The peer applied the POST; nothing is rolled back or stored
    assert!(transport.held().is_some());
    assert!(!store.load("peer-b").await.unwrap().unwrap().is_registered());
}

#[tokio::test]
async fn test_cancelled_attempt_issues_no_further_calls() {
    let (transport, _store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    let mut registration = registrar.begin(&peer());
    registration.request_versions().await.unwrap();

    registration.cancel_token().cancel();
    let err = registration.select_version().await.unwrap_err();
    assert!(matches!(err, OcpiError::Aborted));
    assert_eq!(transport.kinds(), vec![CallKind::GetVersions]);
}

#[tokio::test]
async fn test_concurrent_attempts_same_peer_are_serialized() {
    let (transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config());
    transport.delay_credentials(Duration::from_millis(50));

    let peer = peer();
    let (a, b) = futures::future::join(
        registrar.register(&peer, None),
        registrar.register(&peer, None),
    )
    .await;
    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.attempt.state, RegistrationState::Registered);
    assert_eq!(b.attempt.state, RegistrationState::Registered);
    assert_ne!(a.attempt.correlation_id, b.attempt.correlation_id);

    assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
    let verbs: Vec<CallKind> = transport
        .kinds()
        .into_iter()
        .filter(|k| matches!(k, CallKind::Credentials(_)))
        .collect();
    assert_eq!(
        verbs,
        vec![
            CallKind::Credentials(CredentialsVerb::Post),
            CallKind::Credentials(CredentialsVerb::Put),
        ]
    );
    assert!(store.load("peer-b").await.unwrap().unwrap().is_registered());
}

#[tokio::test]
async fn test_default_version_persisted_even_on_failure() {
    let transport = ScriptedPeer::new(&["2.2"]).without_module("2.2", ModuleId::Credentials);
    let (_transport, store, registrar) = setup(transport, config());

    assert!(registrar.register(&peer(), None).await.is_err());
    let record = store.load("peer-b").await.unwrap().unwrap();
    assert_eq!(record.default_version, Some(VersionId::new("2.2")));
    assert!(record.relationship.is_none());
}

#[tokio::test]
async fn test_default_version_not_persisted_when_disabled() {
    let mut config = config();
    config.set_as_default_version = false;
    let (_transport, store, registrar) = setup(ScriptedPeer::new(&["2.2"]), config);

    let mut registration = registrar.begin(&peer());
    registration.negotiate().await.unwrap();
    assert!(store.load("peer-b").await.unwrap().is_none());
}

#[tokio::test]
async fn test_stored_default_version_preferred() {
    let (_transport, store, registrar) = setup(ScriptedPeer::new(&["2.1", "2.2", "3.0"]), config());
    store
        .save_default_version("peer-b", &VersionId::new("2.2"))
        .await
        .unwrap();

    let mut registration = registrar.begin(&peer());
    registration.request_versions().await.unwrap();
    let selected = registration.select_version().await.unwrap();
    assert_eq!(selected.version, VersionId::new("2.2"));
}

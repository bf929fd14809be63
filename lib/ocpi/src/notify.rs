//! Notification bus for protocol calls.
//!
//! Every network call made by a registration attempt is wrapped in a
//! before/after notification pair. Observers are invoked synchronously, in
//! registration order, on the task driving the attempt. They observe only:
//! an observer error never cancels the call it wraps, it is collected and
//! handed back to the dispatcher, which surfaces it once the step settles.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{
    CallKind, CorrelationId, Credentials, PartyId, RequestEnvelope, RequestId, VersionDetail,
    VersionId, VersionInformation,
};

/// Fired synchronously right before a call is dispatched.
#[derive(Debug, Clone)]
pub struct BeforeCall {
    pub kind: CallKind,
    pub log_timestamp: DateTime<Utc>,
    pub request_timestamp: DateTime<Utc>,
    pub sender: PartyId,
    /// Shared by the before and after events of one call.
    pub event_tracking_id: Uuid,
    pub request_id: RequestId,
    pub correlation_id: Option<CorrelationId>,
    pub version: Option<VersionId>,
    pub timeout: Duration,
}

impl BeforeCall {
    pub fn new(kind: CallKind, envelope: &RequestEnvelope) -> Self {
        let now = Utc::now();
        Self {
            kind,
            log_timestamp: now,
            request_timestamp: now,
            sender: envelope.sender.clone(),
            event_tracking_id: Uuid::new_v4(),
            request_id: envelope.request_id,
            correlation_id: envelope.correlation_id,
            version: envelope.version.clone(),
            timeout: envelope.timeout,
        }
    }
}

/// What a settled call produced.
#[derive(Debug, Clone)]
pub enum CallResult {
    Versions(Vec<VersionInformation>),
    VersionDetail(VersionDetail),
    Credentials(Credentials),
    /// Success without a payload (e.g. DELETE).
    Empty,
    Failed(String),
}

impl CallResult {
    pub fn is_success(&self) -> bool {
        !matches!(self, CallResult::Failed(_))
    }
}

/// Fired once a call settles, whether it succeeded, was rejected or timed out.
#[derive(Debug, Clone)]
pub struct AfterCall {
    pub kind: CallKind,
    pub log_timestamp: DateTime<Utc>,
    pub request_timestamp: DateTime<Utc>,
    pub sender: PartyId,
    pub event_tracking_id: Uuid,
    pub request_id: RequestId,
    pub correlation_id: Option<CorrelationId>,
    pub version: Option<VersionId>,
    pub timeout: Duration,
    pub result: CallResult,
    pub elapsed: Duration,
}

impl AfterCall {
    pub fn settle(before: &BeforeCall, result: CallResult, elapsed: Duration) -> Self {
        Self {
            kind: before.kind,
            log_timestamp: Utc::now(),
            request_timestamp: before.request_timestamp,
            sender: before.sender.clone(),
            event_tracking_id: before.event_tracking_id,
            request_id: before.request_id,
            correlation_id: before.correlation_id,
            version: before.version.clone(),
            timeout: before.timeout,
            result,
            elapsed,
        }
    }
}

/// Error raised by an observer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserverError(pub String);

impl std::fmt::Display for ObserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observer of protocol calls.
pub trait CallObserver: Send + Sync {
    fn before(&self, _event: &BeforeCall) -> Result<(), ObserverError> {
        Ok(())
    }

    fn after(&self, _event: &AfterCall) -> Result<(), ObserverError> {
        Ok(())
    }
}

/// Ordered registry of observers.
#[derive(Clone, Default)]
pub struct NotificationBus {
    observers: Arc<RwLock<Vec<Arc<dyn CallObserver>>>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn CallObserver>) {
        self.observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn CallObserver>> {
        self.observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Deliver to every observer; failures are collected, not short-circuited.
    pub fn emit_before(&self, event: &BeforeCall) -> Vec<ObserverError> {
        self.snapshot()
            .iter()
            .filter_map(|o| o.before(event).err())
            .collect()
    }

    pub fn emit_after(&self, event: &AfterCall) -> Vec<ObserverError> {
        self.snapshot()
            .iter()
            .filter_map(|o| o.after(event).err())
            .collect()
    }
}

/// Emits structured `tracing` events for every call.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl CallObserver for TracingObserver {
    fn before(&self, event: &BeforeCall) -> Result<(), ObserverError> {
        info!(
            event_type = "ocpi_call_started",
            call = %event.kind,
            sender = %event.sender,
            event_tracking_id = %event.event_tracking_id,
            request_id = %event.request_id,
            correlation_id = ?event.correlation_id.map(|c| c.to_string()),
            version = ?event.version.as_ref().map(|v| v.as_str()),
            timeout_ms = event.timeout.as_millis() as u64,
            "OCPI call started"
        );
        Ok(())
    }

    fn after(&self, event: &AfterCall) -> Result<(), ObserverError> {
        match &event.result {
            CallResult::Failed(reason) => warn!(
                event_type = "ocpi_call_finished",
                call = %event.kind,
                event_tracking_id = %event.event_tracking_id,
                request_id = %event.request_id,
                elapsed_ms = event.elapsed.as_millis() as u64,
                error = %reason,
                "OCPI call failed"
            ),
            _ => info!(
                event_type = "ocpi_call_finished",
                call = %event.kind,
                event_tracking_id = %event.event_tracking_id,
                request_id = %event.request_id,
                elapsed_ms = event.elapsed.as_millis() as u64,
                "OCPI call succeeded"
            ),
        }
        Ok(())
    }
}

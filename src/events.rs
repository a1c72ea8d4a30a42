//! Security events emitted by the trust and connectivity core.
//!
//! The core only produces events. Storage, rotation and querying belong to
//! whatever sink is plugged in; the default sink forwards them to `tracing`.
//! Sinks are advisory: lockout decisions are made by the authenticator alone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::store::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventKind {
    AuthSuccess,
    AuthFailure,
    TokenIssued,
    TokenRevoked,
    CertificateIssued,
    CertificateInvalid,
    ConnectionUp,
    ConnectionDown,
    LockoutEngaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SecurityEventKind,
    pub severity: Severity,
    pub node_id: Option<NodeId>,
    pub details: String,
}

impl SecurityEvent {
    pub fn new(kind: SecurityEventKind, severity: Severity, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            severity,
            node_id: None,
            details: details.into(),
        }
    }

    pub fn for_node(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }
}

/// Receiver of security events.
pub trait SecurityEventSink: Send + Sync {
    fn emit(&self, event: SecurityEvent);
}

/// Writes security events as structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl SecurityEventSink for TracingEventSink {
    fn emit(&self, event: SecurityEvent) {
        let node_id = event.node_id.unwrap_or(-1);
        match event.severity {
            Severity::Info => info!(
                target: "tether::security",
                kind = ?event.kind,
                node_id,
                details = %event.details,
                "security event"
            ),
            Severity::Warning => warn!(
                target: "tether::security",
                kind = ?event.kind,
                node_id,
                details = %event.details,
                "security event"
            ),
            Severity::Critical => error!(
                target: "tether::security",
                kind = ?event.kind,
                node_id,
                details = %event.details,
                "security event"
            ),
        }
    }
}

/// Sink that keeps every event in memory. Used by tests to assert on what
/// the core reported.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: parking_lot::Mutex<Vec<SecurityEvent>>,
}

#[cfg(test)]
impl RecordingSink {
    pub fn events(&self) -> Vec<SecurityEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: SecurityEventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

#[cfg(test)]
impl SecurityEventSink for RecordingSink {
    fn emit(&self, event: SecurityEvent) {
        self.events.lock().push(event);
    }
}

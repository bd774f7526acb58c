//! Audit trail for issuance decisions.
//!
//! Every attempt ends in exactly one [`AuditEvent`]. Events carry the full
//! denial detail even when the caller only sees a reason code. They never
//! carry key material; nonces appear only as a short digest.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{IdentityError, Outcome};

/// Default capacity of [`MemoryAuditSink`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Issued,
    Renewed,
    EvidenceRequested,
    Denied,
    Failed,
    Banned,
    Deleted,
}

impl From<Outcome> for AuditOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Denied => AuditOutcome::Denied,
            Outcome::Failed => AuditOutcome::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    /// Unix epoch milliseconds
    pub timestamp: u64,
    pub operation: String,
    pub subject: Option<String>,
    pub outcome: AuditOutcome,
    pub reason_code: Option<String>,
    pub reason: Option<String>,
    pub verifier_audit_id: Option<String>,
    pub cert_serial: Option<String>,
    pub nonce_digest: Option<String>,
    /// State names visited by the attempt, in order
    pub transitions: Vec<String>,
}

impl AuditEvent {
    pub fn new(operation: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: sovereign_core::now_ms(),
            operation: operation.into(),
            subject: None,
            outcome,
            reason_code: None,
            reason: None,
            verifier_audit_id: None,
            cert_serial: None,
            nonce_digest: None,
            transitions: Vec::new(),
        }
    }

    /// Event describing a failed attempt, with unredacted detail.
    pub fn from_error(operation: impl Into<String>, err: &IdentityError) -> Self {
        let mut event = Self::new(operation, err.outcome().into());
        event.reason_code = Some(err.reason_code());
        event.reason = Some(err.to_string());
        event.verifier_audit_id = err.audit_id().map(str::to_string);
        event
    }

    pub fn with_subject(mut self, subject: impl ToString) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.cert_serial = Some(serial.into());
        self
    }

    pub fn with_verifier_audit_id(mut self, audit_id: Option<String>) -> Self {
        if audit_id.is_some() {
            self.verifier_audit_id = audit_id;
        }
        self
    }

    pub fn with_nonce_digest(mut self, digest: Option<String>) -> Self {
        self.nonce_digest = digest;
        self
    }

    pub fn with_transitions(mut self, transitions: Vec<String>) -> Self {
        self.transitions = transitions;
        self
    }
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Emits audit events as structured `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let subject = event.subject.as_deref().unwrap_or("-");
        let reason_code = event.reason_code.as_deref().unwrap_or("-");
        let audit_id = event.verifier_audit_id.as_deref().unwrap_or("-");
        let serial = event.cert_serial.as_deref().unwrap_or("-");
        match event.outcome {
            AuditOutcome::Denied => warn!(
                target: "sovereign_identity::audit",
                event_id = %event.event_id,
                operation = %event.operation,
                subject,
                reason_code,
                audit_id,
                reason = event.reason.as_deref().unwrap_or("-"),
                "Identity issuance denied"
            ),
            AuditOutcome::Failed => error!(
                target: "sovereign_identity::audit",
                event_id = %event.event_id,
                operation = %event.operation,
                subject,
                reason_code,
                reason = event.reason.as_deref().unwrap_or("-"),
                "Identity issuance failed"
            ),
            outcome => info!(
                target: "sovereign_identity::audit",
                event_id = %event.event_id,
                operation = %event.operation,
                outcome = ?outcome,
                subject,
                serial,
                audit_id,
                "Identity lifecycle event"
            ),
        }
    }
}

/// Bounded in-memory ring of recent events.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            events: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    /// Snapshot, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<AuditEvent> {
        self.events
            .lock()
            .ok()
            .and_then(|events| events.back().cloned())
    }

    pub fn count(&self, outcome: AuditOutcome) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| e.outcome == outcome).count())
            .unwrap_or(0)
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        TracingAuditSink.record(event.clone());
        if let Ok(mut events) = self.events.lock() {
            if events.len() >= self.capacity {
                events.pop_front();
            }
            events.push_back(event);
        }
    }
}

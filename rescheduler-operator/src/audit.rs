//! Audit logging for cluster mutations made by the rescheduler.
//!
//! Every write the executor or admission injector performs is recorded as a
//! structured JSON event on the `audit` tracing target:
//! - Ledger annotation writes
//! - Pod evictions
//! - Owner and bare-pod recreation, and recreations that lost the object
//! - Scheduling hints injected at admission

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::ledger::Ledger;

/// Audit event types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A ledger annotation was written to a workload.
    LedgerWritten,
    /// A pod was deleted so its controller recreates it elsewhere.
    PodEvicted,
    /// A Job or CronJob was deleted and recreated with a new ledger.
    OwnerRecreated,
    /// A bare pod was deleted and recreated with a new ledger.
    PodRecreated,
    /// An object was deleted for recreation and its copy could not be
    /// created.
    RecreateFailed,
    /// A scheduling hint was added to a pod at admission.
    HintInjected,
}

/// Audit event severity levels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    /// Routine mutation.
    Info,
    /// Mutation that permanently changes behaviour (budget exhausted).
    Warning,
    /// A mutation left the cluster missing an object.
    Error,
}

/// A single audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Timestamp in RFC3339 format.
    pub timestamp: String,
    /// Event type.
    pub event_type: AuditEventType,
    /// Severity level.
    pub severity: AuditSeverity,
    /// Identity that performed the mutation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// `Kind/name` of the mutated object.
    pub resource: String,
    /// Resource namespace.
    pub namespace: String,
    /// Related object (the owner for pod events, the pod for owner events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Policy action or admission verdict that triggered the event.
    pub outcome: String,
    /// Human readable summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Structured metadata for the event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(
        event_type: AuditEventType,
        severity: AuditSeverity,
        resource: String,
        namespace: String,
        outcome: String,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event_type,
            severity,
            subject: None,
            resource,
            namespace,
            target: None,
            outcome,
            message: None,
            metadata: None,
        }
    }

    /// Set the subject.
    pub fn with_subject(mut self, subject: String) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Set the related object.
    pub fn with_target(mut self, target: String) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the message.
    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }

    /// Set structured metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Log the audit event as JSON.
    pub fn log(&self) {
        let json = match serde_json::to_string(self) {
            Ok(j) => j,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize audit event");
                return;
            }
        };

        match self.severity {
            AuditSeverity::Info => {
                info!(
                    target: "audit",
                    event_type = ?self.event_type,
                    resource = %self.resource,
                    outcome = %self.outcome,
                    "{}",
                    json
                );
            }
            AuditSeverity::Warning => {
                warn!(
                    target: "audit",
                    event_type = ?self.event_type,
                    resource = %self.resource,
                    outcome = %self.outcome,
                    "{}",
                    json
                );
            }
            AuditSeverity::Error => {
                error!(
                    target: "audit",
                    event_type = ?self.event_type,
                    resource = %self.resource,
                    outcome = %self.outcome,
                    "{}",
                    json
                );
            }
        }
    }
}

/// Builds and emits audit events attributed to one identity.
pub struct AuditLogger {
    subject: String,
}

impl AuditLogger {
    /// Create a new audit logger.
    pub fn new(subject: String) -> Self {
        Self { subject }
    }

    /// Ledger annotation written to `kind/name`.
    pub fn ledger_written(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        pod: &str,
        action: &str,
        ledger: &Ledger,
    ) -> AuditEvent {
        let severity = if action == "freeze" {
            AuditSeverity::Warning
        } else {
            AuditSeverity::Info
        };
        AuditEvent::new(
            AuditEventType::LedgerWritten,
            severity,
            format!("{kind}/{name}"),
            namespace.to_string(),
            action.to_string(),
        )
        .with_subject(self.subject.clone())
        .with_target(format!("Pod/{pod}"))
        .with_metadata(serde_json::json!({
            "attempts": ledger.attempts,
            "excluded_hosts": ledger.hosts(),
        }))
        .with_message(format!(
            "Recorded attempt {} for {kind}/{name}",
            ledger.attempts
        ))
    }

    /// Pod deleted after its owner's ledger was updated.
    pub fn pod_evicted(&self, namespace: &str, pod: &str, owner: &str, action: &str) -> AuditEvent {
        AuditEvent::new(
            AuditEventType::PodEvicted,
            AuditSeverity::Info,
            format!("Pod/{pod}"),
            namespace.to_string(),
            action.to_string(),
        )
        .with_subject(self.subject.clone())
        .with_target(owner.to_string())
        .with_message(format!("Evicted pod {pod} for rescheduling"))
    }

    /// Owner (or bare pod) deleted and created again.
    pub fn recreated(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        action: &str,
        ledger: &Ledger,
    ) -> AuditEvent {
        let event_type = if kind == "Pod" {
            AuditEventType::PodRecreated
        } else {
            AuditEventType::OwnerRecreated
        };
        AuditEvent::new(
            event_type,
            AuditSeverity::Info,
            format!("{kind}/{name}"),
            namespace.to_string(),
            action.to_string(),
        )
        .with_subject(self.subject.clone())
        .with_metadata(serde_json::json!({
            "attempts": ledger.attempts,
            "excluded_hosts": ledger.hosts(),
        }))
        .with_message(format!("Recreated {kind}/{name} with updated ledger"))
    }

    /// `kind/name` was deleted but its copy was never created. The copy's
    /// manifest is kept in the metadata for manual recovery.
    pub fn recreate_failed(
        &self,
        kind: &str,
        namespace: &str,
        name: &str,
        action: &str,
        manifest: &serde_json::Value,
        cause: &str,
    ) -> AuditEvent {
        AuditEvent::new(
            AuditEventType::RecreateFailed,
            AuditSeverity::Error,
            format!("{kind}/{name}"),
            namespace.to_string(),
            action.to_string(),
        )
        .with_subject(self.subject.clone())
        .with_metadata(serde_json::json!({
            "manifest": manifest,
            "error": cause,
        }))
        .with_message(format!("Deleted {kind}/{name} but could not create it again"))
    }

    /// Hint annotation added to a pod at admission.
    pub fn hint_injected(
        &self,
        namespace: &str,
        pod: &str,
        owner: &str,
        hosts: &[String],
    ) -> AuditEvent {
        AuditEvent::new(
            AuditEventType::HintInjected,
            AuditSeverity::Info,
            format!("Pod/{pod}"),
            namespace.to_string(),
            "patched".to_string(),
        )
        .with_subject(self.subject.clone())
        .with_target(owner.to_string())
        .with_metadata(serde_json::json!({ "excluded_hosts": hosts }))
        .with_message(format!("Excluded {} node(s) from placement", hosts.len()))
    }
}

/// Global audit logger instance, attributed to the rescheduler's service
/// account.
static AUDIT_LOGGER: once_cell::sync::Lazy<AuditLogger> = once_cell::sync::Lazy::new(|| {
    AuditLogger::new("system:serviceaccount:kube-system:kse-rescheduler".to_string())
});

/// Get the global audit logger.
///
/// ```ignore
/// use rescheduler_operator::audit::audit_logger;
///
/// audit_logger()
///     .pod_evicted("apps", "web-5d9-x1", "Deployment/web", "retry")
///     .log();
/// ```
pub fn audit_logger() -> &'static AuditLogger {
    &AUDIT_LOGGER
}

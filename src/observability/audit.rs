/// Structured audit events
/// One JSON object per event, emitted on the `execbox::audit` log target so the
/// host's logger decides where the audit trail goes.
///
/// Events: run start, admission rejection, limit violation, signal escalation,
/// cleanup outcome, final outcome, invariant violation.
use crate::config::types::{ExecutionResult, LimitKind, RejectReason};
use crate::kernel::signal::KillReport;
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};

pub const AUDIT_TARGET: &str = "execbox::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeverity {
    #[serde(rename = "critical")]
    Critical,
    #[serde(rename = "high")]
    High,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "low")]
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    #[serde(rename = "run_start")]
    RunStart,
    #[serde(rename = "admission_rejected")]
    AdmissionRejected,
    #[serde(rename = "limit_violation")]
    LimitViolation,
    #[serde(rename = "signal_escalation")]
    SignalEscalation,
    #[serde(rename = "cleanup_success")]
    CleanupSuccess,
    #[serde(rename = "cleanup_failure")]
    CleanupFailure,
    #[serde(rename = "final_outcome")]
    FinalOutcome,
    #[serde(rename = "invariant_violation")]
    InvariantViolation,
}

impl AuditEventType {
    pub fn default_severity(&self) -> AuditSeverity {
        match self {
            AuditEventType::RunStart => AuditSeverity::Low,
            AuditEventType::FinalOutcome => AuditSeverity::Low,
            AuditEventType::CleanupSuccess => AuditSeverity::Low,
            AuditEventType::AdmissionRejected => AuditSeverity::Medium,
            AuditEventType::SignalEscalation => AuditSeverity::Medium,
            AuditEventType::LimitViolation => AuditSeverity::High,
            AuditEventType::CleanupFailure => AuditSeverity::Critical,
            AuditEventType::InvariantViolation => AuditSeverity::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub details: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_pid: Option<i32>,
    /// Event-specific payload
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_id: &str, details: impl Into<String>) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            timestamp: Utc::now(),
            run_id: run_id.to_string(),
            details: details.into(),
            root_pid: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_root_pid(mut self, pid: i32) -> Self {
        self.root_pid = Some(pid);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"event_type\":\"{:?}\",\"run_id\":\"{}\",\"encode_error\":\"{}\"}}",
                self.event_type, self.run_id, e
            )
        })
    }
}

/// Emit one event on the audit target at the level its severity maps to
pub fn emit(event: &AuditEvent) {
    let line = event.to_json();
    match event.severity {
        AuditSeverity::Critical | AuditSeverity::High => error!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Medium => warn!(target: AUDIT_TARGET, "{}", line),
        AuditSeverity::Low => info!(target: AUDIT_TARGET, "{}", line),
    }
}

/// Convenience constructors for the events the executor records
pub mod events {
    use super::*;

    pub fn run_start(run_id: &str, root_pid: i32, namespaces: &[String]) {
        emit(
            &AuditEvent::new(AuditEventType::RunStart, run_id, "sandbox launched")
                .with_root_pid(root_pid)
                .with_data(serde_json::json!({ "namespaces": namespaces })),
        );
    }

    pub fn admission_rejected(run_id: &str, reason: RejectReason, detail: &str) {
        emit(
            &AuditEvent::new(AuditEventType::AdmissionRejected, run_id, detail)
                .with_data(serde_json::json!({ "reason": reason })),
        );
    }

    pub fn limit_violation(run_id: &str, limit: LimitKind, cause: &str) {
        emit(
            &AuditEvent::new(
                AuditEventType::LimitViolation,
                run_id,
                format!("{} limit exceeded", limit),
            )
            .with_data(serde_json::json!({ "limit": limit, "cause": cause })),
        );
    }

    pub fn signal_escalation(run_id: &str, report: &KillReport) {
        let severity = if report.kill_sent {
            AuditSeverity::High
        } else {
            AuditSeverity::Medium
        };
        emit(
            &AuditEvent::new(AuditEventType::SignalEscalation, run_id, "run terminated")
                .with_severity(severity)
                .with_data(serde_json::to_value(report).unwrap_or_default()),
        );
    }

    pub fn cleanup(run_id: &str, survivors: usize, scratch_removed: bool, notes: &[String]) {
        let event_type = if survivors == 0 && scratch_removed {
            AuditEventType::CleanupSuccess
        } else {
            AuditEventType::CleanupFailure
        };
        emit(
            &AuditEvent::new(event_type, run_id, "teardown finished").with_data(serde_json::json!({
                "survivors": survivors,
                "scratch_removed": scratch_removed,
                "notes": notes,
            })),
        );
    }

    pub fn final_outcome(result: &ExecutionResult) {
        emit(
            &AuditEvent::new(AuditEventType::FinalOutcome, &result.run_id, result.kind.to_string())
                .with_data(serde_json::json!({
                    "kind": result.kind,
                    "limit": result.limit,
                    "reject_reason": result.reject_reason,
                    "cancelled": result.cancelled,
                    "exit_code": result.exit_code,
                    "signal": result.signal,
                    "wall_time_ms": result.wall_time_ms,
                    "cpu_time_ms": result.cpu_time_ms,
                    "peak_memory_bytes": result.peak_memory_bytes,
                })),
        );
    }

    pub fn invariant_violation(run_id: &str, detail: &str) {
        emit(&AuditEvent::new(
            AuditEventType::InvariantViolation,
            run_id,
            detail,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_severity() {
        assert_eq!(
            AuditEventType::InvariantViolation.default_severity(),
            AuditSeverity::Critical
        );
        assert_eq!(AuditEventType::RunStart.default_severity(), AuditSeverity::Low);
        assert_eq!(
            AuditEventType::LimitViolation.default_severity(),
            AuditSeverity::High
        );
    }

    #[test]
    fn test_event_json_shape() {
        let event = AuditEvent::new(AuditEventType::RunStart, "run-1", "sandbox launched")
            .with_root_pid(4242)
            .with_data(serde_json::json!({ "namespaces": ["Network"] }));
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["event_type"], "run_start");
        assert_eq!(value["severity"], "low");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["root_pid"], 4242);
        assert_eq!(value["data"]["namespaces"][0], "Network");
    }

    #[test]
    fn test_empty_payload_is_omitted() {
        let event = AuditEvent::new(AuditEventType::InvariantViolation, "run-2", "survivor");
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert!(value.get("data").is_none());
        assert!(value.get("root_pid").is_none());
    }
}

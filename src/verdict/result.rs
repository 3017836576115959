//! Evidence + verdict -> the caller-facing result.

use crate::config::types::ExecutionResult;
use crate::core::types::RunEvidence;
use crate::utils::output::{CapturedOutput, OutputIntegrity};
use crate::verdict::Verdict;
use chrono::{DateTime, Utc};
use std::time::Duration;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Cut at the cap, or the collector stopped before EOF
fn is_partial(capture: &CapturedOutput) -> bool {
    capture.truncated || capture.integrity != OutputIntegrity::Complete
}

/// Build the one terminal result for a run that reached the sandbox.
pub fn execution_result(
    run_id: String,
    verdict: &Verdict,
    evidence: RunEvidence,
    queue_wait: Duration,
    submitted_at: DateTime<Utc>,
) -> ExecutionResult {
    let mut notes: Vec<String> = evidence
        .kill_report
        .as_ref()
        .map(|report| report.notes.clone())
        .unwrap_or_default();
    for (name, capture) in [("stdout", &evidence.stdout), ("stderr", &evidence.stderr)] {
        if matches!(capture.integrity, OutputIntegrity::Abandoned | OutputIntegrity::ReadError) {
            notes.push(format!(
                "{} capture {} after {} byte(s)",
                name, capture.integrity, capture.total_bytes
            ));
        }
    }
    let error = (!notes.is_empty()).then(|| notes.join("; "));

    ExecutionResult {
        run_id,
        kind: verdict.kind,
        stdout: evidence.stdout.to_text(),
        stderr: evidence.stderr.to_text(),
        stdout_truncated: is_partial(&evidence.stdout),
        stderr_truncated: is_partial(&evidence.stderr),
        stdout_integrity: evidence.stdout.integrity,
        stderr_integrity: evidence.stderr.integrity,
        stdout_bytes: evidence.stdout.total_bytes,
        stderr_bytes: evidence.stderr.total_bytes,
        exit_code: evidence.exit_code,
        signal: evidence.signal,
        limit: verdict.limit,
        reject_reason: None,
        cancelled: verdict.cancelled,
        error,
        wall_time_ms: Some(millis(evidence.wall_time)),
        cpu_time_ms: evidence.cpu_time.map(millis),
        peak_memory_bytes: evidence.peak_memory_bytes,
        queue_wait_ms: Some(millis(queue_wait)),
        submitted_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LimitKind, OutcomeKind};
    use crate::core::types::RunState;
    use crate::verdict::VerdictCause;

    fn verdict(kind: OutcomeKind, state: RunState, limit: Option<LimitKind>) -> Verdict {
        Verdict {
            state,
            kind,
            limit,
            cancelled: false,
            cause: VerdictCause::NormalExit,
        }
    }

    #[test]
    fn completed_run_carries_output_and_usage() {
        let evidence = RunEvidence {
            exit_code: Some(0),
            wall_time: Duration::from_millis(42),
            cpu_time: Some(Duration::from_millis(7)),
            peak_memory_bytes: Some(1 << 20),
            stdout: CapturedOutput {
                bytes: b"hello\n".to_vec(),
                truncated: false,
                total_bytes: 6,
                integrity: OutputIntegrity::Complete,
            },
            ..Default::default()
        };
        let result = execution_result(
            "r".to_string(),
            &verdict(OutcomeKind::Completed, RunState::Completed, None),
            evidence,
            Duration::from_millis(3),
            Utc::now(),
        );
        assert_eq!(result.kind, OutcomeKind::Completed);
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.stderr, "");
        assert!(!result.is_truncated());
        assert_eq!(result.wall_time_ms, Some(42));
        assert_eq!(result.cpu_time_ms, Some(7));
        assert_eq!(result.queue_wait_ms, Some(3));
        assert!(result.error.is_none());
    }

    #[test]
    fn unmeasured_usage_stays_unset() {
        let result = execution_result(
            "r".to_string(),
            &verdict(OutcomeKind::LimitExceeded, RunState::LimitExceeded, Some(LimitKind::Memory)),
            RunEvidence::default(),
            Duration::ZERO,
            Utc::now(),
        );
        assert_eq!(result.limit, Some(LimitKind::Memory));
        assert!(result.cpu_time_ms.is_none());
        assert!(result.peak_memory_bytes.is_none());
    }

    #[test]
    fn abandoned_capture_is_reported_as_partial() {
        let evidence = RunEvidence {
            exit_code: Some(0),
            stdout: CapturedOutput {
                bytes: b"early\n".to_vec(),
                truncated: false,
                total_bytes: 6,
                integrity: OutputIntegrity::Abandoned,
            },
            stderr: CapturedOutput {
                bytes: b"x".repeat(8),
                truncated: true,
                total_bytes: 4096,
                integrity: OutputIntegrity::Truncated,
            },
            ..Default::default()
        };
        let result = execution_result(
            "r".to_string(),
            &verdict(OutcomeKind::Completed, RunState::Completed, None),
            evidence,
            Duration::ZERO,
            Utc::now(),
        );
        assert_eq!(result.kind, OutcomeKind::Completed);
        assert_eq!(result.stdout, "early\n");
        assert!(result.stdout_truncated);
        assert_eq!(result.stdout_integrity, OutputIntegrity::Abandoned);
        assert_eq!(result.stdout_bytes, 6);
        assert!(result.stderr_truncated);
        assert_eq!(result.stderr_bytes, 4096);

        // the cap is expected; only the abandoned stream is called out
        let error = result.error.as_ref().unwrap();
        assert!(error.contains("stdout capture abandoned"), "{}", error);
        assert!(!error.contains("stderr"), "{}", error);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["stdout_integrity"], "abandoned");
        assert_eq!(json["stderr_integrity"], "truncated");
    }
}

/// Verdict classification
/// Maps the supervisor's evidence for one run onto exactly one outcome.
/// Pure function: same evidence and profile, same verdict.
use crate::config::types::{LimitKind, OutcomeKind, ResourceProfile};
use crate::core::types::{RunEvidence, RunState, TerminationCause};
use serde::{Deserialize, Serialize};

/// Abnormal exits this close to the memory ceiling are attributed to it
pub const MEMORY_ATTRIBUTION_RATIO: f64 = 0.9;

/// Which piece of evidence decided the verdict
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictCause {
    Cancelled,
    WallTimeout,
    MemoryWatchdog,
    CpuWatchdog,
    CpuSignal,
    FileSizeSignal,
    CgroupOom,
    MemoryPeak,
    PidsLimit,
    MemoryNearCeiling,
    NormalExit,
    NonzeroExit,
    Signaled,
    NoStatus,
}

impl std::fmt::Display for VerdictCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VerdictCause::Cancelled => "cancelled",
            VerdictCause::WallTimeout => "wall_timeout",
            VerdictCause::MemoryWatchdog => "memory_watchdog",
            VerdictCause::CpuWatchdog => "cpu_watchdog",
            VerdictCause::CpuSignal => "cpu_signal",
            VerdictCause::FileSizeSignal => "file_size_signal",
            VerdictCause::CgroupOom => "cgroup_oom",
            VerdictCause::MemoryPeak => "memory_peak",
            VerdictCause::PidsLimit => "pids_limit",
            VerdictCause::MemoryNearCeiling => "memory_near_ceiling",
            VerdictCause::NormalExit => "normal_exit",
            VerdictCause::NonzeroExit => "nonzero_exit",
            VerdictCause::Signaled => "signaled",
            VerdictCause::NoStatus => "no_status",
        };
        write!(f, "{}", name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub state: RunState,
    pub kind: OutcomeKind,
    pub limit: Option<LimitKind>,
    pub cancelled: bool,
    pub cause: VerdictCause,
}

impl Verdict {
    fn new(state: RunState, limit: Option<LimitKind>, cause: VerdictCause) -> Self {
        let kind = match state {
            RunState::Completed => OutcomeKind::Completed,
            RunState::TimedOut => OutcomeKind::TimedOut,
            RunState::LimitExceeded => OutcomeKind::LimitExceeded,
            RunState::LaunchFailed => OutcomeKind::LaunchFailure,
            RunState::Crashed | RunState::Pending | RunState::Running => OutcomeKind::Crashed,
        };
        Self {
            state,
            kind,
            limit,
            cancelled: cause == VerdictCause::Cancelled,
            cause,
        }
    }

    fn over_limit(limit: LimitKind, cause: VerdictCause) -> Self {
        Self::new(RunState::LimitExceeded, Some(limit), cause)
    }
}

/// Verdict classifier - pure function over the evidence
pub struct VerdictClassifier;

impl VerdictClassifier {
    pub fn classify(evidence: &RunEvidence, profile: &ResourceProfile) -> Verdict {
        // Supervisor-initiated kills take precedence over whatever status the
        // kill itself produced.
        match evidence.termination {
            Some(TerminationCause::Cancelled) => {
                return Verdict::new(RunState::TimedOut, None, VerdictCause::Cancelled)
            }
            Some(TerminationCause::WallTime) => {
                return Verdict::new(RunState::TimedOut, None, VerdictCause::WallTimeout)
            }
            Some(TerminationCause::MemoryWatchdog) => {
                return Verdict::over_limit(LimitKind::Memory, VerdictCause::MemoryWatchdog)
            }
            Some(TerminationCause::CpuWatchdog) => {
                return Verdict::over_limit(LimitKind::CpuTime, VerdictCause::CpuWatchdog)
            }
            None => {}
        }

        if let Some(signal) = evidence.signal {
            if signal == libc::SIGXCPU {
                return Verdict::over_limit(LimitKind::CpuTime, VerdictCause::CpuSignal);
            }
            if signal == libc::SIGKILL && Self::cpu_exhausted(evidence, profile) {
                // RLIMIT_CPU hard limit delivers SIGKILL
                return Verdict::over_limit(LimitKind::CpuTime, VerdictCause::CpuSignal);
            }
            if signal == libc::SIGXFSZ {
                return Verdict::over_limit(LimitKind::FileSize, VerdictCause::FileSizeSignal);
            }
        }

        if let Some(cgroup) = &evidence.cgroup {
            if cgroup.oom_kill_events > 0 {
                return Verdict::over_limit(LimitKind::Memory, VerdictCause::CgroupOom);
            }
        }

        // Peak usage above the ceiling between watchdog samples, however the
        // run ended
        if Self::memory_exceeded(evidence, profile) {
            return Verdict::over_limit(LimitKind::Memory, VerdictCause::MemoryPeak);
        }

        let abnormal = evidence.signal.is_some() || evidence.exit_code.map_or(true, |c| c != 0);
        if abnormal {
            if let Some(cgroup) = &evidence.cgroup {
                if cgroup.pids_max_events > 0 {
                    return Verdict::over_limit(LimitKind::Processes, VerdictCause::PidsLimit);
                }
            }
            if Self::memory_near_ceiling(evidence, profile) {
                return Verdict::over_limit(LimitKind::Memory, VerdictCause::MemoryNearCeiling);
            }
        }

        match (evidence.exit_code, evidence.signal) {
            (Some(0), _) => Verdict::new(RunState::Completed, None, VerdictCause::NormalExit),
            (Some(_), _) => Verdict::new(RunState::Crashed, None, VerdictCause::NonzeroExit),
            (None, Some(_)) => Verdict::new(RunState::Crashed, None, VerdictCause::Signaled),
            (None, None) => Verdict::new(RunState::Crashed, None, VerdictCause::NoStatus),
        }
    }

    fn cpu_exhausted(evidence: &RunEvidence, profile: &ResourceProfile) -> bool {
        evidence
            .cpu_time
            .map(|cpu| cpu >= profile.cpu_time)
            .unwrap_or(false)
    }

    fn memory_exceeded(evidence: &RunEvidence, profile: &ResourceProfile) -> bool {
        evidence
            .peak_memory_bytes
            .map(|peak| peak > profile.memory_bytes)
            .unwrap_or(false)
    }

    fn memory_near_ceiling(evidence: &RunEvidence, profile: &ResourceProfile) -> bool {
        let threshold = (profile.memory_bytes as f64 * MEMORY_ATTRIBUTION_RATIO) as u64;
        evidence
            .peak_memory_bytes
            .map(|peak| peak >= threshold)
            .unwrap_or(false)
    }
}

use crate::kernel::cgroup::CgroupEvidence;
use crate::kernel::signal::KillReport;
use crate::utils::output::CapturedOutput;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Caller-held handle that abandons a queued or running request.
///
/// Cloning shares the flag; cancelling is idempotent.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Sandbox lifecycle. Terminal states are never left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    Completed,
    TimedOut,
    LimitExceeded,
    Crashed,
    LaunchFailed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Pending | RunState::Running)
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        match self {
            RunState::Pending => matches!(next, RunState::Running | RunState::LaunchFailed),
            RunState::Running => next.is_terminal() && next != RunState::LaunchFailed,
            _ => false,
        }
    }
}

/// Why the supervisor killed a run before it exited on its own
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TerminationCause {
    WallTime,
    Cancelled,
    MemoryWatchdog,
    CpuWatchdog,
}

/// Everything the supervisor observed about a finished run.
///
/// Measurements that could not be taken are `None`.
#[derive(Clone, Debug, Default)]
pub struct RunEvidence {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub termination: Option<TerminationCause>,
    pub kill_report: Option<KillReport>,
    pub wall_time: Duration,
    pub cpu_time: Option<Duration>,
    pub peak_memory_bytes: Option<u64>,
    pub cgroup: Option<CgroupEvidence>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
    /// Processes still running after teardown gave up
    pub survivors: usize,
}

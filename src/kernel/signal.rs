/// Signal handling for execbox
/// Host-side: async-safe handlers so the CLI can cancel a run on Ctrl-C.
/// Run-side: SIGTERM -> grace -> SIGKILL escalation over a tracked process tree.
use crate::kernel::process_tree::{ProcessIdentity, ProcessTracker};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Global signal received (async-safe atomic)
static SIGNAL_RECEIVED: AtomicU32 = AtomicU32::new(0);

/// Signal handler state
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers for SIGINT, SIGTERM, SIGHUP.
    /// Call early in main() before any threads are spawned.
    pub fn init() -> Result<Self, String> {
        let sig_action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        unsafe {
            signal::sigaction(Signal::SIGINT, &sig_action)
                .map_err(|e| format!("Failed to install SIGINT handler: {}", e))?;

            signal::sigaction(Signal::SIGTERM, &sig_action)
                .map_err(|e| format!("Failed to install SIGTERM handler: {}", e))?;

            signal::sigaction(Signal::SIGHUP, &sig_action)
                .map_err(|e| format!("Failed to install SIGHUP handler: {}", e))?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    /// Only atomic stores: no allocations, no locks, no I/O
    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal as u32, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    /// Signal that was received (0 if none)
    pub fn get_signal(&self) -> u32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Returns true if a signal arrived before the timeout
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        false
    }
}

/// Signal escalation report for a terminated run
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    /// Processes still running after SIGKILL was sent
    pub survivors: usize,
    pub notes: Vec<String>,
}

/// Deliver `sig` to the process group and to every tracked member outside it.
pub fn signal_run(pgid: i32, members: &[ProcessIdentity], sig: Signal, notes: &mut Vec<String>) {
    match signal::killpg(Pid::from_raw(pgid), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => notes.push(format!("killpg({}, {}) failed: {}", pgid, sig, e)),
    }

    for member in members {
        // identity check right before the kill so a recycled pid is skipped
        if !member.is_alive() {
            continue;
        }
        match signal::kill(Pid::from_raw(member.pid), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => notes.push(format!("kill({}, {}) failed: {}", member.pid, sig, e)),
        }
    }
}

/// SIGTERM the whole run, wait up to `grace`, then SIGKILL whatever is left.
pub fn terminate_run(tracker: &mut ProcessTracker, grace: Duration, poll: Duration) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();
    let pgid = tracker.pgid();

    let members = tracker.survivors();
    signal_run(pgid, &members, Signal::SIGTERM, &mut report.notes);
    report.term_sent = true;

    let deadline = start + grace;
    loop {
        if tracker.survivors().is_empty() {
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(poll.min(deadline - now));
    }

    let members = tracker.survivors();
    signal_run(pgid, &members, Signal::SIGKILL, &mut report.notes);
    report.kill_sent = true;
    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// SIGKILL every tracked member until none survive or `budget` runs out.
///
/// Returns the identities still running afterwards.
pub fn kill_until_gone(
    tracker: &mut ProcessTracker,
    budget: Duration,
    poll: Duration,
) -> Vec<ProcessIdentity> {
    let start = Instant::now();
    let mut notes = Vec::new();
    loop {
        let survivors = tracker.survivors();
        if survivors.is_empty() || start.elapsed() >= budget {
            for note in notes {
                log::warn!("{}", note);
            }
            return survivors;
        }
        signal_run(tracker.pgid(), &survivors, Signal::SIGKILL, &mut notes);
        std::thread::sleep(poll);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_handler_init() {
        let handler = SignalHandler::init();
        assert!(handler.is_ok());
    }

    #[test]
    fn test_shutdown_flag() {
        let handler = SignalHandler::init().unwrap();
        assert!(!handler.shutdown_requested());

        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        assert!(handler.shutdown_requested());
        assert!(handler.wait_for_signal(Duration::from_millis(10)));

        SHUTDOWN_REQUESTED.store(false, Ordering::SeqCst);
    }

    #[test]
    fn test_terminate_run_kills_group() {
        use std::os::unix::process::CommandExt;

        let mut child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .process_group(0)
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let mut tracker = ProcessTracker::new(child.id() as i32);
        tracker.sample();
        let report = terminate_run(&mut tracker, Duration::from_millis(200), Duration::from_millis(10));
        assert!(report.term_sent);

        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(kill_until_gone(&mut tracker, Duration::from_secs(1), Duration::from_millis(10)).is_empty());
    }
}

use crate::config::types::{ResourceProfile, Result, SandboxError};
use crate::core::sandbox::SandboxHandle;
use crate::core::types::{CancelToken, RunEvidence, RunState, TerminationCause};
use crate::kernel::cgroup::{CgroupBackend, CgroupEvidence};
use crate::kernel::process_tree::ProcessIdentity;
use crate::kernel::signal::{kill_until_gone, terminate_run, KillReport};
use crate::safety::workspace::Workspace;
use crate::verdict::{Verdict, VerdictClassifier};
use std::time::{Duration, Instant};

/// /proc scans are far more expensive than wait4, so watchdogs sample less often
const WATCHDOG_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);

/// How long teardown keeps SIGKILLing before it declares survivors
const TEARDOWN_BUDGET: Duration = Duration::from_secs(2);

fn to_supervisor_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Supervisor(format!("{}: {}", prefix, err))
}

/// Timing knobs for one supervised run
#[derive(Clone, Copy, Debug)]
pub struct SupervisorSettings {
    pub poll_interval: Duration,
    pub termination_grace: Duration,
    pub output_drain: Duration,
}

/// What teardown managed to release
#[derive(Clone, Debug, Default)]
pub struct TeardownReport {
    pub survivors: usize,
    /// Tracked processes still running when teardown gave up
    pub leaked: Vec<ProcessIdentity>,
    pub orphans_reaped: usize,
    pub scratch_removed: bool,
    pub cgroup_removed: bool,
    pub notes: Vec<String>,
}

impl TeardownReport {
    /// Anything left behind is an invariant violation
    pub fn is_clean(&self) -> bool {
        self.survivors == 0 && self.scratch_removed
    }
}

pub struct RunOutcome {
    pub evidence: RunEvidence,
    pub verdict: Verdict,
    pub teardown: TeardownReport,
}

/// Status and usage of the root process as reported by wait4
struct RootExit {
    exit_code: Option<i32>,
    signal: Option<i32>,
    cpu_time: Duration,
    max_rss_bytes: u64,
}

fn timeval(tv: libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

/// Non-blocking wait4 on the root. `Ok(None)` while it is still running.
fn poll_root(pid: i32) -> std::io::Result<Option<RootExit>> {
    let mut status: libc::c_int = 0;
    // SAFETY: zeroed rusage is a valid out-parameter.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: waiting on our own direct child with valid pointers.
        let rc = unsafe { libc::wait4(pid, &mut status, libc::WNOHANG, &mut usage) };
        if rc == 0 {
            return Ok(None);
        }
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(err);
        }
        break;
    }

    let (exit_code, signal) = if libc::WIFEXITED(status) {
        (Some(libc::WEXITSTATUS(status)), None)
    } else if libc::WIFSIGNALED(status) {
        (None, Some(libc::WTERMSIG(status)))
    } else {
        (None, None)
    };

    Ok(Some(RootExit {
        exit_code,
        signal,
        cpu_time: timeval(usage.ru_utime) + timeval(usage.ru_stime),
        // ru_maxrss is in KiB on Linux
        max_rss_bytes: (usage.ru_maxrss.max(0) as u64).saturating_mul(1024),
    }))
}

/// Drive one launched run to a verdict and release everything it held.
///
/// Teardown always runs to completion; failures along the way are recorded
/// as evidence. The only error is an illegal lifecycle transition.
pub fn supervise(
    mut handle: SandboxHandle,
    profile: &ResourceProfile,
    settings: SupervisorSettings,
    cancel: Option<&CancelToken>,
    cgroup: Option<&dyn CgroupBackend>,
    workspace: &mut Workspace,
) -> Result<RunOutcome> {
    let pid = handle.pid;
    let deadline = handle.started + profile.wall_time;
    let mut termination: Option<TerminationCause> = None;
    let mut kill_report: Option<KillReport> = None;
    let mut terminated_at: Option<Instant> = None;
    let mut last_sample: Option<Instant> = None;
    let mut root_exit: Option<RootExit> = None;
    let mut notes = Vec::new();

    loop {
        match poll_root(pid) {
            Ok(Some(exit)) => {
                root_exit = Some(exit);
                break;
            }
            Ok(None) => {}
            Err(e) => {
                // ECHILD: someone else reaped the root; nothing left to wait for
                notes.push(format!("wait4({}) failed: {}", pid, e));
                if termination.is_none() {
                    kill_report = Some(terminate_run(
                        &mut handle.tracker,
                        settings.termination_grace,
                        settings.poll_interval,
                    ));
                }
                break;
            }
        }

        let now = Instant::now();
        if termination.is_none() {
            let cause = if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                Some(TerminationCause::Cancelled)
            } else if now >= deadline {
                Some(TerminationCause::WallTime)
            } else if last_sample.map_or(true, |t| now - t >= WATCHDOG_SAMPLE_INTERVAL) {
                last_sample = Some(now);
                let sample = handle.tracker.sample();
                if sample.rss_bytes > profile.memory_bytes {
                    log::info!(
                        "Run {} over memory: rss {} > {} bytes",
                        handle.run_id,
                        sample.rss_bytes,
                        profile.memory_bytes
                    );
                    Some(TerminationCause::MemoryWatchdog)
                } else if sample.cpu_time > profile.cpu_time {
                    log::info!(
                        "Run {} over CPU time: {:?} > {:?}",
                        handle.run_id,
                        sample.cpu_time,
                        profile.cpu_time
                    );
                    Some(TerminationCause::CpuWatchdog)
                } else {
                    None
                }
            } else {
                None
            };

            if let Some(cause) = cause {
                log::debug!("Terminating run {} ({:?})", handle.run_id, cause);
                // final usage before the kill wipes it out
                handle.tracker.sample();
                termination = Some(cause);
                kill_report = Some(terminate_run(
                    &mut handle.tracker,
                    settings.termination_grace,
                    settings.poll_interval,
                ));
                terminated_at = Some(Instant::now());
                continue;
            }
        } else if terminated_at.map_or(false, |t| now - t >= TEARDOWN_BUDGET) {
            notes.push(format!("root {} not reaped within {:?} of SIGKILL", pid, TEARDOWN_BUDGET));
            break;
        }

        std::thread::sleep(settings.poll_interval);
    }
    let wall_time = handle.started.elapsed();

    // Root is gone (or unreachable); take one last look at the rest of the run
    // before killing it so usage of late descendants is not lost.
    let last = handle.tracker.sample();

    let mut teardown = TeardownReport {
        notes,
        ..Default::default()
    };
    let survivors = kill_until_gone(&mut handle.tracker, TEARDOWN_BUDGET, settings.poll_interval);
    teardown.orphans_reaped = handle.tracker.reap_orphans();

    let cgroup_evidence = cgroup.and_then(|backend| {
        if !handle.cgroup_attached {
            return None;
        }
        settle_cgroup(backend, &handle.run_id, &mut teardown)
    });

    handle.tracker.release_claims(&survivors);
    teardown.survivors = survivors.len();
    teardown.leaked = survivors;
    if let Some(backend) = cgroup.filter(|_| handle.cgroup_attached && !teardown.cgroup_removed) {
        // a populated cgroup holds processes the /proc walk could not see
        if let Ok(false) = backend.is_empty(&handle.run_id) {
            teardown.survivors = teardown.survivors.max(1);
        }
    }
    if root_exit.is_none() && root_alive(pid) {
        teardown.survivors = teardown.survivors.max(1);
    }

    // Output: every writer is dead unless survivors remain, so EOF should be
    // immediate; the drain window only bounds the survivor case.
    let stdout = handle.stdout.finish(settings.output_drain);
    let stderr = handle.stderr.finish(settings.output_drain);
    if let Some(feeder) = handle.stdin_feeder.take() {
        if teardown.survivors == 0 {
            let _ = feeder.join();
        }
    }

    if teardown.survivors == 0 {
        match workspace.cleanup() {
            Ok(()) => teardown.scratch_removed = true,
            Err(e) => teardown.notes.push(format!("scratch cleanup failed: {}", e)),
        }
    } else {
        log::error!(
            "Run {} left {} survivor(s) after teardown; keeping {}",
            handle.run_id,
            teardown.survivors,
            workspace.run_dir().display()
        );
        workspace.retain();
    }
    for note in &teardown.notes {
        log::warn!("Run {}: {}", handle.run_id, note);
    }

    let cpu_time = [
        root_exit.as_ref().map(|e| e.cpu_time),
        (last.cpu_time > Duration::ZERO).then_some(last.cpu_time),
        cgroup_evidence
            .as_ref()
            .and_then(|c| c.cpu_usage_usec)
            .map(Duration::from_micros),
    ]
    .into_iter()
    .flatten()
    .max();

    let peak_memory_bytes = [
        root_exit.as_ref().map(|e| e.max_rss_bytes),
        Some(handle.tracker.peak_rss_bytes()).filter(|b| *b > 0),
        cgroup_evidence.as_ref().and_then(|c| c.memory_peak),
    ]
    .into_iter()
    .flatten()
    .max();

    let evidence = RunEvidence {
        exit_code: root_exit.as_ref().and_then(|e| e.exit_code),
        signal: root_exit.as_ref().and_then(|e| e.signal),
        termination,
        kill_report,
        wall_time,
        cpu_time,
        peak_memory_bytes,
        cgroup: cgroup_evidence,
        stdout,
        stderr,
        survivors: teardown.survivors,
    };

    let verdict = VerdictClassifier::classify(&evidence, profile);
    if !handle.state.can_transition_to(verdict.state) {
        return Err(to_supervisor_error(
            "illegal transition",
            format!("{:?} -> {:?}", handle.state, verdict.state),
        ));
    }
    handle.state = verdict.state;
    log::info!(
        "Run {} finished: {} ({}) in {:?}",
        handle.run_id,
        verdict.kind,
        verdict.cause,
        wall_time
    );

    Ok(RunOutcome {
        evidence,
        verdict,
        teardown,
    })
}

fn root_alive(pid: i32) -> bool {
    // SAFETY: signal 0 only probes for existence.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Kill anything left in the run's cgroup, read its evidence, then remove it.
fn settle_cgroup(
    backend: &dyn CgroupBackend,
    run_id: &str,
    teardown: &mut TeardownReport,
) -> Option<CgroupEvidence> {
    if let Err(e) = backend.kill_all(run_id) {
        teardown.notes.push(format!("cgroup kill failed: {}", e));
    }

    let start = Instant::now();
    while !backend.is_empty(run_id).unwrap_or(true) && start.elapsed() < TEARDOWN_BUDGET {
        std::thread::sleep(Duration::from_millis(10));
    }

    let evidence = match backend.collect_evidence(run_id) {
        Ok(evidence) => Some(evidence),
        Err(e) => {
            teardown.notes.push(format!("cgroup evidence unavailable: {}", e));
            None
        }
    };

    match backend.remove(run_id) {
        Ok(()) => teardown.cgroup_removed = true,
        Err(e) => teardown.notes.push(format!("cgroup remove failed: {}", e)),
    }
    evidence
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn teardown_clean_requires_scratch_removal() {
        let mut report = TeardownReport::default();
        assert!(!report.is_clean());
        report.scratch_removed = true;
        assert!(report.is_clean());
        report.survivors = 1;
        assert!(!report.is_clean());
    }

    #[test]
    fn poll_root_reports_exit_code_and_usage() {
        let child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 3")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let exit = loop {
            if let Some(exit) = poll_root(pid).unwrap() {
                break exit;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(exit.exit_code, Some(3));
        assert_eq!(exit.signal, None);
        assert!(exit.max_rss_bytes > 0);
    }

    #[test]
    fn poll_root_reports_signal() {
        let child = std::process::Command::new("/bin/sh")
            .arg("-c")
            .arg("kill -KILL $$")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let exit = loop {
            if let Some(exit) = poll_root(pid).unwrap() {
                break exit;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(exit.signal, Some(libc::SIGKILL));
        assert_eq!(exit.exit_code, None);
    }
}

//! Request entry point
//!
//! `Executor` owns everything shared between runs and turns every request
//! into exactly one `ExecutionResult`.

use crate::config::config::SandboxConfig;
use crate::config::types::{
    ExecutionRequest, ExecutionResult, HealthStatus, RejectReason, ResourceProfile,
    Result, SandboxError,
};
use crate::config::validator::validate_config;
use crate::core::sandbox::{launch, LaunchSpec};
use crate::core::supervisor::{supervise, RunOutcome, SupervisorSettings};
use crate::core::types::CancelToken;
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend};
use crate::kernel::credentials::CredentialPlan;
use crate::kernel::process_tree::{ProcessIdentity, ProcessRegistry};
use crate::observability::audit::events;
use crate::observability::metrics::{ExecutorMetrics, Gauge, MetricsSnapshot};
use crate::safety::admission::{AdmissionController, AdmissionError, AdmissionSnapshot};
use crate::safety::workspace::WorkspaceManager;
use crate::utils::env_hygiene::EnvHygiene;
use crate::verdict::execution_result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of `Executor::health_check`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub active_runs: usize,
    /// Scratch directories with no run attached
    pub stale_workspaces: usize,
    /// Processes left behind by earlier runs that are still alive
    pub leaked_processes: usize,
    pub invariant_violations: u64,
}

#[derive(Debug)]
struct HealthState {
    status: HealthStatus,
    active: HashSet<String>,
    leaked: Vec<ProcessIdentity>,
}

/// Decrements the active gauge on every exit path
struct ActiveRun<'a>(&'a Gauge);

impl<'a> ActiveRun<'a> {
    fn enter(gauge: &'a Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub struct Executor {
    config: SandboxConfig,
    admission: AdmissionController,
    workspaces: WorkspaceManager,
    cgroup: Option<Box<dyn CgroupBackend>>,
    /// Processes claimed by in-flight runs of any executor in this process
    registry: Arc<ProcessRegistry>,
    env: EnvHygiene,
    metrics: ExecutorMetrics,
    health: Mutex<HealthState>,
}

impl Executor {
    /// Validate the configuration and set up shared state.
    ///
    /// Refuses to start on any configuration error.
    pub fn new(config: SandboxConfig) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in &validation.warnings {
            log::warn!("config: {}", warning);
        }

        if config.isolation.subreaper {
            if let Err(e) = nix::sys::prctl::set_child_subreaper(true) {
                log::warn!("Could not register as child subreaper: {}", e);
            }
        }

        let cgroup = match &config.isolation.cgroup_parent {
            Some(parent) => Some(create_cgroup_backend(parent)?),
            None => None,
        };

        let workspaces = WorkspaceManager::new(config.scratch_root.clone())?;
        let admission = AdmissionController::new(config.admission.clone());
        let env = EnvHygiene::new(config.environment.clone());

        log::info!(
            "Executor ready: interpreter {}, scratch {}, cgroup {}",
            config.interpreter.program.display(),
            workspaces.base_dir().display(),
            cgroup.as_ref().map_or("off", |c| c.backend_name())
        );

        Ok(Self {
            config,
            admission,
            workspaces,
            cgroup,
            registry: ProcessRegistry::global(),
            env,
            metrics: ExecutorMetrics::new(),
            health: Mutex::new(HealthState {
                status: HealthStatus::Healthy,
                active: HashSet::new(),
                leaked: Vec::new(),
            }),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn submit(&self, request: ExecutionRequest) -> ExecutionResult {
        self.execute(request, None)
    }

    /// Like `submit`; cancelling the token abandons the request while queued
    /// or running.
    pub fn submit_with_cancel(&self, request: ExecutionRequest, cancel: &CancelToken) -> ExecutionResult {
        self.execute(request, Some(cancel))
    }

    pub fn run_source(&self, source: &str) -> ExecutionResult {
        self.submit(ExecutionRequest::new(source))
    }

    pub fn health(&self) -> HealthStatus {
        self.lock_health().status
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn admission_snapshot(&self) -> AdmissionSnapshot {
        self.admission.snapshot()
    }

    /// Recount stale workspaces and leaked processes.
    ///
    /// Health recovers once nothing from a faulty teardown is left.
    pub fn health_check(&self) -> HealthReport {
        let mut health = self.lock_health();
        health.leaked.retain(ProcessIdentity::is_alive);

        let stale = match std::fs::read_dir(self.workspaces.base_dir()) {
            Ok(entries) => Some(
                entries
                    .flatten()
                    .filter(|e| {
                        let name = e.file_name().to_string_lossy().into_owned();
                        !health.active.contains(&name)
                    })
                    .count(),
            ),
            Err(e) => {
                log::error!(
                    "Scratch root {} unreadable: {}",
                    self.workspaces.base_dir().display(),
                    e
                );
                None
            }
        };

        health.status = match stale {
            None => HealthStatus::Unhealthy,
            Some(_) if !health.leaked.is_empty() => HealthStatus::Degraded,
            // scratch retained by a faulty teardown stays a fault until swept
            Some(n) if n > 0 && health.status == HealthStatus::Degraded => HealthStatus::Degraded,
            Some(_) => HealthStatus::Healthy,
        };

        HealthReport {
            status: health.status,
            active_runs: health.active.len(),
            stale_workspaces: stale.unwrap_or(0),
            leaked_processes: health.leaked.len(),
            invariant_violations: self.metrics.invariant_violations.get(),
        }
    }

    /// Remove scratch directories older than `max_age`
    pub fn sweep_stale_workspaces(&self, max_age: Duration) -> Result<usize> {
        let removed = self.workspaces.cleanup_old_workspaces(max_age)?;
        if removed > 0 {
            log::info!("Swept {} stale workspace(s)", removed);
        }
        Ok(removed)
    }

    fn lock_health(&self) -> MutexGuard<'_, HealthState> {
        self.health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute(&self, request: ExecutionRequest, cancel: Option<&CancelToken>) -> ExecutionResult {
        let run_id = uuid::Uuid::new_v4().to_string();
        let result = match self.admit_and_run(&run_id, &request, cancel) {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Run {} failed to launch: {}", run_id, e);
                ExecutionResult::launch_failure(run_id, &e, request.submitted_at)
            }
        };
        self.metrics.record_outcome(result.kind, result.cancelled);
        events::final_outcome(&result);
        result
    }

    fn reject(
        &self,
        run_id: &str,
        request: &ExecutionRequest,
        reason: RejectReason,
        detail: String,
        queue_wait: Option<Duration>,
    ) -> ExecutionResult {
        log::info!("Run {} rejected: {} ({})", run_id, reason, detail);
        self.metrics.record_rejection(reason);
        events::admission_rejected(run_id, reason, &detail);
        ExecutionResult::rejected(
            run_id.to_string(),
            reason,
            Some(detail),
            request.submitted_at,
            queue_wait,
        )
    }

    fn admit_and_run(
        &self,
        run_id: &str,
        request: &ExecutionRequest,
        cancel: Option<&CancelToken>,
    ) -> Result<ExecutionResult> {
        if request.source.len() > self.config.max_source_bytes {
            return Ok(self.reject(
                run_id,
                request,
                RejectReason::SourceTooLarge,
                format!(
                    "source is {} bytes, limit {}",
                    request.source.len(),
                    self.config.max_source_bytes
                ),
                None,
            ));
        }
        if let Some(stdin) = &request.stdin {
            if stdin.len() > self.config.max_stdin_bytes {
                return Ok(self.reject(
                    run_id,
                    request,
                    RejectReason::SourceTooLarge,
                    format!(
                        "stdin is {} bytes, limit {}",
                        stdin.len(),
                        self.config.max_stdin_bytes
                    ),
                    None,
                ));
            }
        }

        let profile = match self.config.resolve_profile(&request.limits) {
            Ok(profile) => profile,
            Err(detail) => {
                return Ok(self.reject(run_id, request, RejectReason::InvalidLimits, detail, None))
            }
        };

        let ticket = match self.admission.acquire(cancel) {
            Ok(ticket) => ticket,
            Err(e) => {
                let (reason, waited) = match &e {
                    AdmissionError::QueueFull { .. } => (RejectReason::QueueFull, None),
                    AdmissionError::QueueTimeout { waited } => (RejectReason::QueueTimeout, Some(*waited)),
                    AdmissionError::Cancelled { waited } => (RejectReason::Cancelled, Some(*waited)),
                };
                return Ok(self.reject(run_id, request, reason, e.to_string(), waited));
            }
        };

        let result = self.run_admitted(run_id, request, &profile, cancel, ticket.queue_wait());
        drop(ticket);
        result
    }

    fn run_admitted(
        &self,
        run_id: &str,
        request: &ExecutionRequest,
        profile: &ResourceProfile,
        cancel: Option<&CancelToken>,
        queue_wait: Duration,
    ) -> Result<ExecutionResult> {
        let _active = ActiveRun::enter(&self.metrics.active_runs);
        self.lock_health().active.insert(run_id.to_string());
        let outcome = self.launch_and_supervise(run_id, request, profile, cancel);
        self.lock_health().active.remove(run_id);

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(SandboxError::Supervisor(detail)) => {
                return Ok(self.supervisor_fault(run_id, detail, request.submitted_at));
            }
            Err(e) => return Err(e),
        };

        let RunOutcome {
            evidence,
            verdict,
            teardown,
        } = outcome;

        if let Some(report) = &evidence.kill_report {
            events::signal_escalation(run_id, report);
        }
        if let Some(limit) = verdict.limit {
            self.metrics.record_limit_violation(limit);
            events::limit_violation(run_id, limit, &verdict.cause.to_string());
        }
        if evidence.stdout.truncated || evidence.stderr.truncated {
            self.metrics.output_truncated.inc();
        }

        self.metrics.orphans_reaped.add(teardown.orphans_reaped as u64);
        self.metrics.record_cleanup(teardown.is_clean());
        events::cleanup(
            run_id,
            teardown.survivors,
            teardown.scratch_removed,
            &teardown.notes,
        );
        if teardown.survivors > 0 {
            self.invariant_violated(
                run_id,
                &format!("{} process(es) survived teardown", teardown.survivors),
                teardown.leaked,
            );
        } else if !teardown.scratch_removed {
            log::error!("Run {}: scratch directory not removed", run_id);
        }

        Ok(execution_result(
            run_id.to_string(),
            &verdict,
            evidence,
            queue_wait,
            request.submitted_at,
        ))
    }

    fn launch_and_supervise(
        &self,
        run_id: &str,
        request: &ExecutionRequest,
        profile: &ResourceProfile,
        cancel: Option<&CancelToken>,
    ) -> Result<RunOutcome> {
        // chown only when the identity switch will actually happen
        let owner = CredentialPlan::for_service(self.config.isolation.run_as)?.target();
        let mut workspace = self.workspaces.create_workspace(
            run_id,
            &self.config.interpreter.source_file,
            &request.source,
            owner,
        )?;
        let environment = self.env.sanitize_environment(workspace.run_dir());
        let cgroup = self.cgroup.as_deref();

        let handle = launch(LaunchSpec {
            run_id,
            config: &self.config,
            profile,
            workspace: &workspace,
            environment,
            stdin: request.stdin.clone(),
            cgroup,
            registry: Some(&self.registry),
        })?;

        events::run_start(run_id, handle.pid, &handle.namespaces);

        let settings = SupervisorSettings {
            poll_interval: self.config.poll_interval(),
            termination_grace: self.config.termination_grace(),
            output_drain: Duration::from_millis(self.config.output_drain_ms),
        };
        supervise(handle, profile, settings, cancel, cgroup, &mut workspace)
    }

    /// The service lost track of the run; nothing the program did is known,
    /// so this is never reported as a program outcome.
    fn supervisor_fault(
        &self,
        run_id: &str,
        detail: String,
        submitted_at: chrono::DateTime<chrono::Utc>,
    ) -> ExecutionResult {
        self.invariant_violated(run_id, &detail, Vec::new());
        ExecutionResult::launch_failure(
            run_id.to_string(),
            &SandboxError::Supervisor(detail),
            submitted_at,
        )
    }

    fn invariant_violated(&self, run_id: &str, detail: &str, leaked: Vec<ProcessIdentity>) {
        log::error!("Run {}: supervisor invariant violated: {}", run_id, detail);
        self.metrics.invariant_violations.inc();
        events::invariant_violation(run_id, detail);
        {
            let mut health = self.lock_health();
            health.status = HealthStatus::Degraded;
            health.leaked.extend(leaked);
        }
        let report = self.health_check();
        log::error!(
            "Health {:?}: {} stale workspace(s), {} leaked process(es)",
            report.status,
            report.stale_workspaces,
            report.leaked_processes
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{LimitOverrides, OutcomeKind};

    fn executor(scratch: &std::path::Path) -> Executor {
        let mut config = SandboxConfig::default();
        config.scratch_root = scratch.to_path_buf();
        config.interpreter.program = "/bin/sh".into();
        config.interpreter.args = Vec::new();
        config.interpreter.source_file = "main.sh".to_string();
        config.isolation.subreaper = false;
        config.max_source_bytes = 64;
        Executor::new(config).unwrap()
    }

    #[test]
    fn oversized_source_is_rejected_before_admission() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec.run_source(&"x".repeat(65));
        assert_eq!(result.kind, OutcomeKind::Rejected);
        assert_eq!(result.reject_reason, Some(RejectReason::SourceTooLarge));
        assert_eq!(exec.admission_snapshot().high_water, 0);
        assert_eq!(exec.metrics_snapshot().rejections.source_too_large, 1);
    }

    #[test]
    fn limits_above_maximum_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let request = ExecutionRequest::new("exit 0").with_limits(LimitOverrides {
            wall_time_ms: Some(exec.config().maximums.wall_time_ms + 1),
            ..Default::default()
        });
        let result = exec.submit(request);
        assert_eq!(result.kind, OutcomeKind::Rejected);
        assert_eq!(result.reject_reason, Some(RejectReason::InvalidLimits));
        assert!(result.error.unwrap().contains("wall_time_ms"));
    }

    #[test]
    fn invalid_config_refuses_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.scratch_root = dir.path().to_path_buf();
        config.admission.max_concurrent = 0;
        assert!(Executor::new(config).is_err());
    }

    #[test]
    fn fresh_executor_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let report = exec.health_check();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.stale_workspaces, 0);
        assert_eq!(exec.health(), HealthStatus::Healthy);
    }

    #[test]
    fn missing_interpreter_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SandboxConfig::default();
        config.scratch_root = dir.path().to_path_buf();
        config.interpreter.program = "/nonexistent/bin/interp".into();
        config.isolation.subreaper = false;
        config.isolation.network = crate::config::types::NetworkPolicy::Inherit;
        config.isolation.read_only_root = false;
        // a missing interpreter is only a config warning
        let exec = Executor::new(config).unwrap();
        let result = exec.run_source("print(1)");
        assert_eq!(result.kind, OutcomeKind::LaunchFailure);
        assert!(result.error.is_some());
        assert_eq!(exec.admission_snapshot().in_use, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn supervisor_fault_is_a_service_failure() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let result = exec.supervisor_fault(
            "r1",
            "illegal transition: Running -> Queued".to_string(),
            chrono::Utc::now(),
        );
        assert_eq!(result.kind, OutcomeKind::LaunchFailure);
        assert!(result.exit_code.is_none());
        assert!(result.limit.is_none());
        let error = result.error.unwrap();
        assert!(error.contains("invariant violated"), "{}", error);
        assert!(error.contains("illegal transition"), "{}", error);
        // teardown had already finished, so nothing is left to degrade health
        let report = exec.health_check();
        assert_eq!(report.invariant_violations, 1);
        assert_eq!(report.leaked_processes, 0);
    }
}

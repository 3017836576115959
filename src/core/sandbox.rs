//! Sandbox launch: one isolated child per run.
//!
//! All per-run plans are built here in the parent; the forked child only
//! replays them through the pre-exec chain before exec.

use crate::config::config::SandboxConfig;
use crate::config::types::{ResourceProfile, Result, SandboxError};
use crate::core::types::RunState;
use crate::exec::preexec::ChildPlan;
use crate::kernel::cgroup::CgroupBackend;
use crate::kernel::credentials::CredentialPlan;
use crate::kernel::namespace::IsolationPlan;
use crate::kernel::process_tree::{is_subreaper, ProcessRegistry, ProcessTracker};
use crate::kernel::rlimits::RlimitPlan;
use crate::safety::workspace::Workspace;
use crate::utils::output::{spawn_stdin_feeder, StreamCollector};
use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

fn to_launch_error(prefix: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Launch(format!("{}: {}", prefix, err))
}

/// Inputs for launching one run
pub struct LaunchSpec<'a> {
    pub run_id: &'a str,
    pub config: &'a SandboxConfig,
    pub profile: &'a ResourceProfile,
    pub workspace: &'a Workspace,
    pub environment: BTreeMap<String, String>,
    pub stdin: Option<Vec<u8>>,
    pub cgroup: Option<&'a dyn CgroupBackend>,
    /// Claims shared with concurrent runs; orphans are only adopted while
    /// the service is a child subreaper
    pub registry: Option<&'a Arc<ProcessRegistry>>,
}

/// A running sandbox, owned by the supervisor until teardown
pub struct SandboxHandle {
    pub run_id: String,
    pub child: Child,
    pub pid: i32,
    pub tracker: ProcessTracker,
    pub stdout: StreamCollector,
    pub stderr: StreamCollector,
    pub stdin_feeder: Option<JoinHandle<()>>,
    pub started: Instant,
    pub state: RunState,
    pub cgroup_attached: bool,
    pub namespaces: Vec<String>,
}

/// Create the isolated child. Nothing untrusted runs before this returns Ok.
pub fn launch(spec: LaunchSpec<'_>) -> Result<SandboxHandle> {
    let LaunchSpec {
        run_id,
        config,
        profile,
        workspace,
        environment,
        stdin,
        cgroup,
        registry,
    } = spec;

    let rlimits = RlimitPlan::for_profile(profile, config.isolation.address_space_factor)?;
    let isolation = IsolationPlan::new(profile, workspace.run_dir())?;
    let credentials = CredentialPlan::for_service(config.isolation.run_as)?;

    let cgroup_procs = match cgroup {
        Some(backend) => {
            backend.create(run_id, profile)?;
            Some(backend.procs_path(run_id))
        }
        None => None,
    };
    let plan = ChildPlan::new(cgroup_procs.as_deref(), rlimits, isolation, credentials)?;
    let namespaces = plan.isolation().get_enabled_namespaces();

    log::debug!(
        "Launching run {}: namespaces={:?}, run_as={:?}, cgroup={}",
        run_id,
        namespaces,
        plan.credentials().target(),
        cgroup_procs.is_some()
    );

    let mut cmd = Command::new(&config.interpreter.program);
    cmd.args(&config.interpreter.args)
        .arg(workspace.source_file())
        .env_clear()
        .envs(&environment)
        .current_dir(workspace.run_dir())
        .process_group(0)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // SAFETY: the closure only calls async-signal-safe syscalls on data
    // prepared above; it allocates nothing.
    unsafe {
        cmd.pre_exec(move || plan.run());
    }

    let registry = registry.filter(|_| is_subreaper());
    // no run may scan for orphans between this spawn and the root's claim
    let mut claims = registry.map(|r| r.lock());

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            discard_cgroup(cgroup, run_id);
            return Err(to_launch_error(
                &format!("spawn {}", config.interpreter.program.display()),
                e,
            ));
        }
    };
    let pid = child.id() as i32;
    let mut tracker = ProcessTracker::new(pid);
    if let (Some(registry), Some(owned)) = (registry, claims.as_mut()) {
        owned.insert(tracker.root());
        tracker = tracker.with_adoption(Arc::clone(registry));
    }
    drop(claims);

    let output_cap = usize::try_from(profile.output_bytes).unwrap_or(usize::MAX);
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| to_launch_error("stdout", "pipe missing"))
        .and_then(|s| StreamCollector::spawn("stdout", s, output_cap).map_err(|e| to_launch_error("stdout collector", e)));
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| to_launch_error("stderr", "pipe missing"))
        .and_then(|s| StreamCollector::spawn("stderr", s, output_cap).map_err(|e| to_launch_error("stderr collector", e)));

    let (stdout, stderr) = match (stdout, stderr) {
        (Ok(out), Ok(err)) => (out, err),
        (Err(e), _) | (_, Err(e)) => {
            abort_child(&mut child);
            tracker.release_claims(&[]);
            discard_cgroup(cgroup, run_id);
            return Err(e);
        }
    };

    let stdin_feeder = match (stdin, child.stdin.take()) {
        (Some(data), Some(pipe)) => match spawn_stdin_feeder(pipe, data) {
            Ok(handle) => Some(handle),
            Err(e) => {
                abort_child(&mut child);
                tracker.release_claims(&[]);
                discard_cgroup(cgroup, run_id);
                return Err(to_launch_error("stdin feeder", e));
            }
        },
        _ => None,
    };

    log::info!(
        "Run {} started as pid {} (orphan adoption {})",
        run_id,
        pid,
        if registry.is_some() { "on" } else { "off" }
    );

    Ok(SandboxHandle {
        run_id: run_id.to_string(),
        child,
        pid,
        tracker,
        stdout,
        stderr,
        stdin_feeder,
        started,
        state: RunState::Running,
        cgroup_attached: cgroup.is_some(),
        namespaces,
    })
}

fn abort_child(child: &mut Child) {
    // SAFETY: the child leads its own process group.
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
    let _ = child.wait();
}

fn discard_cgroup(cgroup: Option<&dyn CgroupBackend>, run_id: &str) {
    if let Some(backend) = cgroup {
        if let Err(e) = backend.remove(run_id) {
            log::warn!("Failed to remove cgroup after launch failure: {}", e);
        }
    }
}

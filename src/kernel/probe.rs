//! Host capability probe.
//!
//! Spawns `/bin/sh -c "exit 0"` once per control with only that control
//! enabled, so the report says what this host can enforce right now rather
//! than what the kernel config claims.

use crate::config::config::SandboxConfig;
use crate::config::types::{LimitOverrides, NetworkPolicy, ResourceProfile, Result, SandboxError};
use crate::exec::preexec::ChildPlan;
use crate::kernel::cgroup::{create_cgroup_backend, CgroupBackend};
use crate::kernel::credentials::CredentialPlan;
use crate::kernel::namespace::IsolationPlan;
use crate::kernel::process_tree::{ProcessIdentity, ProcessRegistry};
use crate::kernel::rlimits::RlimitPlan;
use crate::safety::workspace::WorkspaceManager;
use serde::{Deserialize, Serialize};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Stdio};

const PROBE_SHELL: &str = "/bin/sh";

/// Outcome of trying one control
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStatus {
    pub enforced: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ControlStatus {
    fn ok() -> Self {
        Self {
            enforced: true,
            detail: None,
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            enforced: false,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostReport {
    pub running_as_root: bool,
    pub kernel_release: Option<String>,
    pub interpreter_found: bool,
    pub rlimits: ControlStatus,
    pub network_namespace: ControlStatus,
    pub read_only_root: ControlStatus,
    /// `None` when no cgroup parent is configured
    pub cgroup: Option<ControlStatus>,
    /// `None` when no run_as identity is configured
    pub run_as: Option<ControlStatus>,
    pub subreaper: bool,
}

impl HostReport {
    /// Every control the configuration asks for can be enforced
    pub fn meets_config(&self, config: &SandboxConfig) -> bool {
        self.interpreter_found
            && self.rlimits.enforced
            && (config.isolation.network == NetworkPolicy::Inherit
                || self.network_namespace.enforced)
            && (!config.isolation.read_only_root || self.read_only_root.enforced)
            && self.cgroup.as_ref().map_or(true, |c| c.enforced)
            && self.run_as.as_ref().map_or(true, |c| c.enforced)
    }
}

fn kernel_release() -> Option<String> {
    nix::sys::utsname::uname()
        .ok()
        .map(|u| u.release().to_string_lossy().into_owned())
}

fn is_executable(path: &Path) -> bool {
    nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok()
}

/// Run the probe shell under `plan`
fn spawn_with(plan: ChildPlan, scratch: &Path) -> ControlStatus {
    let mut cmd = Command::new(PROBE_SHELL);
    cmd.arg("-c")
        .arg("exit 0")
        .env_clear()
        .current_dir(scratch)
        .process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: ChildPlan::run is async-signal-safe.
    unsafe {
        cmd.pre_exec(move || plan.run());
    }

    // registered like a run root so concurrent runs never adopt it
    let registry = ProcessRegistry::global();
    let mut owned = registry.lock();
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return ControlStatus::failed(e.to_string()),
    };
    let identity = ProcessIdentity::capture(child.id() as i32);
    if let Some(identity) = identity {
        owned.insert(identity);
    }
    drop(owned);

    let status = child.wait();
    if let Some(identity) = &identity {
        registry.release(identity);
    }
    match status {
        Ok(status) if status.success() => ControlStatus::ok(),
        Ok(status) => ControlStatus::failed(format!("probe exited with {}", status)),
        Err(e) => ControlStatus::failed(e.to_string()),
    }
}

fn try_profile(
    config: &SandboxConfig,
    profile: &ResourceProfile,
    scratch: &Path,
    credentials: CredentialPlan,
    cgroup_procs: Option<&Path>,
) -> ControlStatus {
    let plan = RlimitPlan::for_profile(profile, config.isolation.address_space_factor)
        .and_then(|rlimits| {
            let isolation = IsolationPlan::new(profile, scratch)?;
            ChildPlan::new(cgroup_procs, rlimits, isolation, credentials)
        });
    match plan {
        Ok(plan) => spawn_with(plan, scratch),
        Err(e) => ControlStatus::failed(e.to_string()),
    }
}

fn probe_cgroup(
    config: &SandboxConfig,
    parent: &Path,
    base: &ResourceProfile,
    scratch: &Path,
) -> ControlStatus {
    let backend = match create_cgroup_backend(parent) {
        Ok(backend) => backend,
        Err(e) => return ControlStatus::failed(e.to_string()),
    };
    let id = format!("probe-{}", uuid::Uuid::new_v4());
    if let Err(e) = backend.create(&id, base) {
        return ControlStatus::failed(e.to_string());
    }
    let procs = backend.procs_path(&id);
    let status = try_profile(config, base, scratch, CredentialPlan::default(), Some(&procs));
    release_cgroup(backend.as_ref(), &id);
    status
}

fn release_cgroup(backend: &dyn CgroupBackend, id: &str) {
    if let Err(e) = backend.kill_all(id) {
        log::debug!("probe cgroup kill: {}", e);
    }
    if let Err(e) = backend.remove(id) {
        log::warn!("probe cgroup {} not removed: {}", id, e);
    }
}

/// Try every control the host could enforce for `config`.
pub fn probe_host(config: &SandboxConfig) -> Result<HostReport> {
    let mut base = config
        .resolve_profile(&LimitOverrides::default())
        .map_err(SandboxError::Config)?;
    base.network = NetworkPolicy::Inherit;
    base.filesystem.read_only_root = false;

    let manager = WorkspaceManager::new(config.scratch_root.clone())?;
    let run_id = format!("probe-{}", uuid::Uuid::new_v4());
    let mut workspace = manager.create_workspace(&run_id, "probe.sh", b"exit 0\n", None)?;
    let scratch = workspace.run_dir().to_path_buf();

    let rlimits = try_profile(config, &base, &scratch, CredentialPlan::default(), None);

    let mut net = base.clone();
    net.network = NetworkPolicy::Isolated;
    let network_namespace = try_profile(config, &net, &scratch, CredentialPlan::default(), None);

    let mut ro = base.clone();
    ro.filesystem.read_only_root = true;
    let read_only_root = try_profile(config, &ro, &scratch, CredentialPlan::default(), None);

    let cgroup = config
        .isolation
        .cgroup_parent
        .as_deref()
        .map(|parent| probe_cgroup(config, parent, &base, &scratch));

    let run_as = config.isolation.run_as.map(|identity| {
        if !nix::unistd::geteuid().is_root() {
            return ControlStatus::failed("service is not root; run_as is ignored");
        }
        match CredentialPlan::for_service(Some(identity)) {
            // the probe scratch belongs to root; the shell only needs to exec
            Ok(plan) => try_profile(config, &base, Path::new("/"), plan, None),
            Err(e) => ControlStatus::failed(e.to_string()),
        }
    });

    if let Err(e) = workspace.cleanup() {
        log::warn!("probe workspace not removed: {}", e);
    }

    Ok(HostReport {
        running_as_root: nix::unistd::geteuid().is_root(),
        kernel_release: kernel_release(),
        interpreter_found: is_executable(&config.interpreter.program),
        rlimits,
        network_namespace,
        read_only_root,
        cgroup,
        run_as,
        subreaper: config.isolation.subreaper,
    })
}

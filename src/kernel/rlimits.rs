//! Resource limiter: turns a `ResourceProfile` into concrete `setrlimit` calls.
//!
//! The plan is computed (and checked against the host) in the parent. The child
//! only replays it between fork and exec, so nothing here may allocate on the
//! apply path.

use crate::config::types::{ResourceProfile, Result, SandboxError};

#[cfg(all(target_os = "linux", target_env = "gnu"))]
pub type RawResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
pub type RawResource = libc::c_int;

/// One `setrlimit` call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RlimitSetting {
    pub name: &'static str,
    pub resource: RawResource,
    pub soft: libc::rlim_t,
    pub hard: libc::rlim_t,
}

/// Ordered list of limits applied to the child before exec
#[derive(Clone, Debug, Default)]
pub struct RlimitPlan {
    settings: Vec<RlimitSetting>,
}

impl RlimitPlan {
    /// Build the plan for a profile and verify the host can enforce it.
    ///
    /// A ceiling above the host hard limit is lowered to the host value.
    /// An unreadable host limit or an unsupported platform is an error.
    pub fn for_profile(profile: &ResourceProfile, address_space_factor: u64) -> Result<Self> {
        if !cfg!(target_os = "linux") {
            return Err(SandboxError::ResourceLimit(
                "resource ceilings are only enforced on Linux".to_string(),
            ));
        }

        let mut plan = RlimitPlan::default();

        // soft -> SIGXCPU, hard -> SIGKILL one second later
        let cpu_secs = profile.cpu_time.as_millis().div_ceil(1000).max(1) as libc::rlim_t;
        plan.push("RLIMIT_CPU", libc::RLIMIT_CPU as RawResource, cpu_secs, cpu_secs + 1)?;

        if address_space_factor > 0 {
            let bytes = profile.memory_bytes.saturating_mul(address_space_factor) as libc::rlim_t;
            plan.push("RLIMIT_AS", libc::RLIMIT_AS as RawResource, bytes, bytes)?;
        }

        let nofile = profile.max_open_files as libc::rlim_t;
        plan.push("RLIMIT_NOFILE", libc::RLIMIT_NOFILE as RawResource, nofile, nofile)?;

        let nproc = profile.max_processes as libc::rlim_t;
        plan.push("RLIMIT_NPROC", libc::RLIMIT_NPROC as RawResource, nproc, nproc)?;

        let fsize = profile.file_size_bytes as libc::rlim_t;
        plan.push("RLIMIT_FSIZE", libc::RLIMIT_FSIZE as RawResource, fsize, fsize)?;

        plan.push("RLIMIT_CORE", libc::RLIMIT_CORE as RawResource, 0, 0)?;
        plan.push("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK as RawResource, 0, 0)?;

        Ok(plan)
    }

    fn push(
        &mut self,
        name: &'static str,
        resource: RawResource,
        soft: libc::rlim_t,
        hard: libc::rlim_t,
    ) -> Result<()> {
        let (_, host_hard) = host_limit(name, resource)?;
        let mut hard = hard;
        if host_hard != libc::RLIM_INFINITY && hard > host_hard {
            log::warn!(
                "{} hard limit {} exceeds host hard limit {}; using host value",
                name,
                hard,
                host_hard
            );
            hard = host_hard;
        }
        self.settings.push(RlimitSetting {
            name,
            resource,
            soft: soft.min(hard),
            hard,
        });
        Ok(())
    }

    pub fn settings(&self) -> &[RlimitSetting] {
        &self.settings
    }

    pub fn get(&self, name: &str) -> Option<&RlimitSetting> {
        self.settings.iter().find(|s| s.name == name)
    }

    /// Apply every limit to the calling process.
    ///
    /// Async-signal-safe: only `setrlimit` and errno reads.
    pub fn apply(&self) -> std::io::Result<()> {
        for setting in &self.settings {
            let limit = libc::rlimit {
                rlim_cur: setting.soft,
                rlim_max: setting.hard,
            };
            // SAFETY: plain syscall with a valid pointer to a stack value.
            let rc = unsafe { libc::setrlimit(setting.resource, &limit) };
            if rc != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

/// Current (soft, hard) limit of the calling process
pub fn host_limit(name: &str, resource: RawResource) -> Result<(libc::rlim_t, libc::rlim_t)> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    let rc = unsafe { libc::getrlimit(resource, &mut limit) };
    if rc != 0 {
        return Err(SandboxError::ResourceLimit(format!(
            "cannot read host {}: {}",
            name,
            std::io::Error::last_os_error()
        )));
    }
    Ok((limit.rlim_cur, limit.rlim_max))
}

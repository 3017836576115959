//! Safe UID/GID transitions to unprivileged credentials.
//!
//! CRITICAL: setresgid MUST be called BEFORE setresuid to prevent
//! privilege escalation through saved-set-user-ID.

use crate::config::config::RunAs;
use crate::config::types::{Result, SandboxError};

/// Reject root UIDs/GIDs (0) as a target identity.
pub fn validate_ids(uid: u32, gid: u32) -> Result<()> {
    if uid == 0 || gid == 0 {
        return Err(SandboxError::Config(format!(
            "Cannot transition to root UID/GID (uid={}, gid={})",
            uid, gid
        )));
    }
    Ok(())
}

/// Identity the child switches to before exec, decided in the parent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CredentialPlan {
    target: Option<RunAs>,
}

impl CredentialPlan {
    /// Only a root service can switch identity; otherwise the child keeps the
    /// service's own unprivileged identity.
    pub fn for_service(run_as: Option<RunAs>) -> Result<Self> {
        let Some(run_as) = run_as else {
            return Ok(Self::default());
        };
        validate_ids(run_as.uid, run_as.gid)?;

        if !nix::unistd::geteuid().is_root() {
            log::warn!(
                "run_as uid={} gid={} ignored: service is not root",
                run_as.uid,
                run_as.gid
            );
            return Ok(Self::default());
        }

        Ok(Self {
            target: Some(run_as),
        })
    }

    pub fn target(&self) -> Option<RunAs> {
        self.target
    }

    /// clear groups -> setresgid -> setresuid -> verify.
    ///
    /// Runs in the child between fork and exec: raw syscalls only.
    pub fn apply(&self) -> std::io::Result<()> {
        let Some(RunAs { uid, gid }) = self.target else {
            return Ok(());
        };

        // SAFETY: plain credential syscalls; no memory is touched besides
        // the null group list.
        unsafe {
            if libc::setgroups(0, std::ptr::null()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            // CRITICAL: GID before UID
            if libc::setresgid(gid, gid, gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setresuid(uid, uid, uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            if libc::getuid() != uid
                || libc::geteuid() != uid
                || libc::getgid() != gid
                || libc::getegid() != gid
            {
                return Err(std::io::Error::from_raw_os_error(libc::EPERM));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_ids_rejects_root_uid() {
        assert!(validate_ids(0, 1000).is_err());
    }

    #[test]
    fn validate_ids_rejects_root_gid() {
        assert!(validate_ids(1000, 0).is_err());
    }

    #[test]
    fn validate_ids_accepts_non_root() {
        assert!(validate_ids(1000, 1000).is_ok());
    }

    #[test]
    fn no_run_as_is_a_no_op() {
        let plan = CredentialPlan::for_service(None).unwrap();
        assert!(plan.target().is_none());
        assert!(plan.apply().is_ok());
    }

    #[test]
    fn run_as_root_is_rejected() {
        assert!(CredentialPlan::for_service(Some(RunAs { uid: 0, gid: 0 })).is_err());
    }

    #[test]
    fn run_as_only_honored_for_root_service() {
        let plan = CredentialPlan::for_service(Some(RunAs {
            uid: 65534,
            gid: 65534,
        }))
        .unwrap();
        assert_eq!(plan.target().is_some(), nix::unistd::geteuid().is_root());
    }
}

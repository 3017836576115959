/// Pre-Exec Ordering Enforcement
///
/// The setup sequence between fork and exec is FIXED:
/// 1. prctl(PR_SET_PDEATHSIG, SIGKILL), then confirm the parent is still there
/// 2. join the run cgroup (when configured) before anything else can fork
/// 3. unshare namespaces, write id maps, read-only root with writable scratch
/// 4. setgroups, setresgid, then setresuid (root service with run_as only)
/// 5. apply the rlimit plan and umask; RLIMIT_NOFILE comes after every open
/// 6. prctl(PR_SET_NO_NEW_PRIVS, 1) and mark every fd above stderr close-on-exec
/// 7. exec (performed by std::process::Command)
///
/// Everything runs in the forked child of a multi-threaded parent, so each
/// step only issues syscalls on buffers prepared by `ChildPlan::new`.
use crate::config::types::{Result, SandboxError};
use crate::kernel::credentials::CredentialPlan;
use crate::kernel::namespace::IsolationPlan;
use crate::kernel::rlimits::RlimitPlan;
use std::ffi::CString;
use std::io;
use std::marker::PhantomData;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Everything the child needs, computed in the parent before fork.
#[derive(Clone, Debug)]
pub struct ChildPlan {
    parent_pid: libc::pid_t,
    cgroup_procs: Option<CString>,
    rlimits: RlimitPlan,
    isolation: IsolationPlan,
    credentials: CredentialPlan,
}

impl ChildPlan {
    pub fn new(
        cgroup_procs: Option<&Path>,
        rlimits: RlimitPlan,
        isolation: IsolationPlan,
        credentials: CredentialPlan,
    ) -> Result<Self> {
        let cgroup_procs = match cgroup_procs {
            Some(path) => Some(CString::new(path.as_os_str().as_bytes()).map_err(|_| {
                SandboxError::Cgroup(format!("cgroup path contains NUL byte: {}", path.display()))
            })?),
            None => None,
        };

        Ok(Self {
            parent_pid: std::process::id() as libc::pid_t,
            cgroup_procs,
            rlimits,
            isolation,
            credentials,
        })
    }

    pub fn isolation(&self) -> &IsolationPlan {
        &self.isolation
    }

    pub fn credentials(&self) -> &CredentialPlan {
        &self.credentials
    }

    /// Walk the whole chain. Called from `CommandExt::pre_exec`.
    pub fn run(&self) -> io::Result<()> {
        Sandbox::<FreshChild>::new(self)
            .bind_lifecycle()?
            .attach_to_cgroup()?
            .isolate()?
            .drop_credentials()?
            .apply_limits()?
            .lock_privileges()?
            .ready_for_exec()
            .finish();
        Ok(())
    }
}

// FreshChild -> LifecycleBound -> CgroupAttached -> Isolated ->
// CredsDropped -> LimitsApplied -> PrivsLocked -> ExecReady
//
// Each step consumes the prior state; only ExecReady may hand over to exec.

/// Type-state marker: Fresh child process, no setup done yet
pub struct FreshChild;

/// Type-state marker: Child dies with its supervisor
pub struct LifecycleBound;

/// Type-state marker: Process attached to cgroup
pub struct CgroupAttached;

/// Type-state marker: rlimits and umask applied
pub struct LimitsApplied;

/// Type-state marker: Namespaces and filesystem view set up
pub struct Isolated;

/// Type-state marker: Credentials have been dropped
pub struct CredsDropped;

/// Type-state marker: Privileges have been locked down
pub struct PrivsLocked;

/// Type-state marker: Ready for exec (all gates passed)
pub struct ExecReady;

/// Child process setup with type-state tracking
pub struct Sandbox<'a, S> {
    plan: &'a ChildPlan,
    _state: PhantomData<S>,
}

impl<'a, S> Sandbox<'a, S> {
    fn advance<T>(self) -> Sandbox<'a, T> {
        Sandbox {
            plan: self.plan,
            _state: PhantomData,
        }
    }
}

impl<'a> Sandbox<'a, FreshChild> {
    pub fn new(plan: &'a ChildPlan) -> Self {
        Self {
            plan,
            _state: PhantomData,
        }
    }

    pub fn bind_lifecycle(self) -> io::Result<Sandbox<'a, LifecycleBound>> {
        use nix::sys::prctl;
        use nix::sys::signal::Signal;

        prctl::set_pdeathsig(Signal::SIGKILL)?;

        // the parent may have exited between fork and prctl
        // SAFETY: getppid has no preconditions.
        if unsafe { libc::getppid() } != self.plan.parent_pid {
            return Err(io::Error::from_raw_os_error(libc::ESRCH));
        }

        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, LifecycleBound> {
    /// Join the run cgroup by writing "0" (the caller) into cgroup.procs
    pub fn attach_to_cgroup(self) -> io::Result<Sandbox<'a, CgroupAttached>> {
        if let Some(procs) = &self.plan.cgroup_procs {
            // SAFETY: open/write/close with a valid path and static buffer.
            unsafe {
                let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error());
                }
                let written = libc::write(fd, b"0".as_ptr().cast(), 1);
                let err = io::Error::last_os_error();
                libc::close(fd);
                if written != 1 {
                    return Err(err);
                }
            }
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, CgroupAttached> {
    pub fn isolate(self) -> io::Result<Sandbox<'a, Isolated>> {
        self.plan.isolation.apply()?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, Isolated> {
    pub fn drop_credentials(self) -> io::Result<Sandbox<'a, CredsDropped>> {
        self.plan.credentials.apply()?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, CredsDropped> {
    pub fn apply_limits(self) -> io::Result<Sandbox<'a, LimitsApplied>> {
        self.plan.rlimits.apply()?;
        // SAFETY: umask cannot fail.
        unsafe {
            libc::umask(0o077);
        }
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, LimitsApplied> {
    pub fn lock_privileges(self) -> io::Result<Sandbox<'a, PrivsLocked>> {
        nix::sys::prctl::set_no_new_privs()?;
        mark_inherited_fds_cloexec()?;
        Ok(self.advance())
    }
}

impl<'a> Sandbox<'a, PrivsLocked> {
    pub fn ready_for_exec(self) -> Sandbox<'a, ExecReady> {
        self.advance()
    }
}

impl<'a> Sandbox<'a, ExecReady> {
    /// End of the chain; std performs the exec right after `pre_exec` returns
    pub fn finish(self) {}
}

/// Any descriptor above stderr must not reach the program.
///
/// close_range(CLOSE_RANGE_CLOEXEC) where available, fcntl sweep otherwise.
fn mark_inherited_fds_cloexec() -> io::Result<()> {
    // SAFETY: raw syscall with integer arguments.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_close_range,
            3 as libc::c_uint,
            libc::c_uint::MAX,
            CLOSE_RANGE_CLOEXEC,
        )
    };
    if rc == 0 {
        return Ok(());
    }

    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit writes into the provided struct only.
    let max_fd = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur.min(65_536) as libc::c_int
    } else {
        1024
    };

    for fd in 3..max_fd {
        // SAFETY: fcntl on an fd that may not exist just returns EBADF.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC);
            }
        }
    }
    Ok(())
}

/// Namespace isolation for the sandboxed child
/// Network namespace (no interfaces up), mount namespace with a read-only
/// root, and a user namespace when the service itself is unprivileged.
use crate::config::types::{NetworkPolicy, ResourceProfile, Result, SandboxError};

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// Identity mapping written into a fresh user namespace
#[derive(Clone, Debug)]
struct IdMaps {
    setgroups_path: CString,
    uid_map_path: CString,
    gid_map_path: CString,
    uid_map: Vec<u8>,
    gid_map: Vec<u8>,
}

/// Read-only root remount with the scratch directory kept writable
#[derive(Clone, Debug)]
struct RootRemount {
    root: CString,
    scratch: CString,
    remount_flags: MsFlags,
}

/// Everything the child needs to isolate itself, computed in the parent.
#[derive(Clone, Debug)]
pub struct IsolationPlan {
    flags: CloneFlags,
    id_maps: Option<IdMaps>,
    remount: Option<RootRemount>,
}

impl IsolationPlan {
    pub fn new(profile: &ResourceProfile, scratch: &Path) -> Result<Self> {
        let mut flags = CloneFlags::empty();
        if profile.network == NetworkPolicy::Isolated {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let remount = if profile.filesystem.read_only_root {
            flags |= CloneFlags::CLONE_NEWNS;
            Some(RootRemount {
                root: cstring("/")?,
                scratch: CString::new(scratch.as_os_str().as_bytes()).map_err(|_| {
                    SandboxError::Namespace(format!(
                        "scratch path contains NUL byte: {}",
                        scratch.display()
                    ))
                })?,
                remount_flags: root_remount_flags()?,
            })
        } else {
            None
        };

        let id_maps = if !flags.is_empty() && !nix::unistd::geteuid().is_root() {
            flags |= CloneFlags::CLONE_NEWUSER;
            let uid = nix::unistd::geteuid().as_raw();
            let gid = nix::unistd::getegid().as_raw();
            Some(IdMaps {
                setgroups_path: cstring("/proc/self/setgroups")?,
                uid_map_path: cstring("/proc/self/uid_map")?,
                gid_map_path: cstring("/proc/self/gid_map")?,
                uid_map: format!("{} {} 1\n", uid, uid).into_bytes(),
                gid_map: format!("{} {} 1\n", gid, gid).into_bytes(),
            })
        } else {
            None
        };

        Ok(Self {
            flags,
            id_maps,
            remount,
        })
    }

    pub fn is_isolation_enabled(&self) -> bool {
        !self.flags.is_empty()
    }

    pub fn get_enabled_namespaces(&self) -> Vec<String> {
        let mut namespaces = Vec::new();
        if self.flags.contains(CloneFlags::CLONE_NEWUSER) {
            namespaces.push("User".to_string());
        }
        if self.flags.contains(CloneFlags::CLONE_NEWNET) {
            namespaces.push("Network".to_string());
        }
        if self.flags.contains(CloneFlags::CLONE_NEWNS) {
            namespaces.push("Mount".to_string());
        }
        namespaces
    }

    /// Apply inside the child. Async-signal-safe: syscalls on precomputed buffers only.
    pub fn apply(&self) -> std::io::Result<()> {
        if self.flags.is_empty() {
            return Ok(());
        }

        unshare(self.flags)?;

        if let Some(maps) = &self.id_maps {
            // setgroups must be denied before an unprivileged gid_map write
            write_proc_file(&maps.setgroups_path, b"deny")?;
            write_proc_file(&maps.uid_map_path, &maps.uid_map)?;
            write_proc_file(&maps.gid_map_path, &maps.gid_map)?;
        }

        if let Some(remount) = &self.remount {
            harden_mount_propagation(&remount.root)?;

            mount(
                Some(remount.scratch.as_c_str()),
                remount.scratch.as_c_str(),
                None::<&CStr>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&CStr>,
            )?;

            mount(
                None::<&CStr>,
                remount.root.as_c_str(),
                None::<&CStr>,
                remount.remount_flags,
                None::<&CStr>,
            )?;

            // cwd was resolved before the bind mount; re-enter through it
            // SAFETY: chdir on a valid NUL-terminated path.
            if unsafe { libc::chdir(remount.scratch.as_ptr()) } != 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        Ok(())
    }
}

/// mount(NULL, "/", NULL, MS_REC | MS_PRIVATE, NULL) so nothing done inside
/// the sandbox propagates back to the host.
fn harden_mount_propagation(root: &CStr) -> std::io::Result<()> {
    mount(
        None::<&CStr>,
        root,
        None::<&CStr>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&CStr>,
    )?;
    Ok(())
}

/// Flags for the read-only bind remount of `/`.
///
/// Inside a user namespace the kernel refuses a remount that clears locked
/// flags, so the current nosuid/nodev/noexec/atime flags are carried over.
fn root_remount_flags() -> Result<MsFlags> {
    use nix::sys::statvfs::{statvfs, FsFlags};

    let stat = statvfs("/").map_err(|e| {
        SandboxError::Namespace(format!("statvfs(/) failed: {}", e))
    })?;
    let current = stat.flags();

    let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY;
    let carried = [
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ];
    for (st, ms) in carried {
        if current.contains(st) {
            flags |= ms;
        }
    }
    Ok(flags)
}

fn write_proc_file(path: &CStr, content: &[u8]) -> std::io::Result<()> {
    // SAFETY: open/write/close on a valid path and buffer; no allocation.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let written = libc::write(fd, content.as_ptr().cast(), content.len());
        let err = std::io::Error::last_os_error();
        libc::close(fd);
        if written < 0 || written as usize != content.len() {
            return Err(err);
        }
    }
    Ok(())
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| SandboxError::Namespace(format!("path contains NUL byte: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::FilesystemPolicy;
    use std::time::Duration;

    fn profile(network: NetworkPolicy, read_only_root: bool) -> ResourceProfile {
        ResourceProfile {
            cpu_time: Duration::from_secs(1),
            wall_time: Duration::from_secs(2),
            memory_bytes: 64 * 1024 * 1024,
            output_bytes: 1024,
            max_processes: 16,
            max_open_files: 32,
            file_size_bytes: 1024,
            network,
            filesystem: FilesystemPolicy { read_only_root },
        }
    }

    #[test]
    fn no_isolation_means_no_unshare() {
        let plan = IsolationPlan::new(&profile(NetworkPolicy::Inherit, false), Path::new("/tmp")).unwrap();
        assert!(!plan.is_isolation_enabled());
        assert!(plan.get_enabled_namespaces().is_empty());
        assert!(plan.apply().is_ok());
    }

    #[test]
    fn network_isolation_requests_netns() {
        let plan = IsolationPlan::new(&profile(NetworkPolicy::Isolated, false), Path::new("/tmp")).unwrap();
        let namespaces = plan.get_enabled_namespaces();
        assert!(namespaces.contains(&"Network".to_string()));
        assert!(!namespaces.contains(&"Mount".to_string()));
        if !nix::unistd::geteuid().is_root() {
            assert!(namespaces.contains(&"User".to_string()));
        }
    }

    #[test]
    fn read_only_root_requests_mountns() {
        let plan = IsolationPlan::new(&profile(NetworkPolicy::Inherit, true), Path::new("/tmp")).unwrap();
        assert!(plan.get_enabled_namespaces().contains(&"Mount".to_string()));
        let remount = plan.remount.as_ref().unwrap();
        assert!(remount.remount_flags.contains(MsFlags::MS_RDONLY));
        assert!(remount.remount_flags.contains(MsFlags::MS_BIND));
    }
}

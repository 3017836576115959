/// Cgroup v2 backend
/// One child cgroup per run under a configured parent; memory.oom.group
/// makes an OOM kill take the whole run down.
use crate::config::types::{ResourceProfile, Result, SandboxError};
use crate::kernel::cgroup::backend::{CgroupBackend, CgroupEvidence};
use std::fs;
use std::path::{Path, PathBuf};

/// Cgroup v2 backend
pub struct CgroupV2 {
    base_path: PathBuf,
}

impl CgroupV2 {
    pub fn new(base_path: &Path) -> Result<Self> {
        if !base_path.is_absolute() {
            return Err(SandboxError::Cgroup(format!(
                "cgroup parent must be absolute: {}",
                base_path.display()
            )));
        }
        Ok(CgroupV2 {
            base_path: base_path.to_path_buf(),
        })
    }

    fn instance_path(&self, instance_id: &str) -> PathBuf {
        self.base_path.join(instance_id)
    }

    fn write_required(&self, path: &Path, value: &str) -> Result<()> {
        fs::write(path, value).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    fn write_optional(&self, path: &Path, value: &str) {
        if let Err(e) = fs::write(path, value) {
            log::warn!("Failed to write {} (continuing): {}", path.display(), e);
        }
    }

    /// memory.peak (kernel 5.19+) with fallback to memory.current
    fn read_peak_memory(&self, instance_id: &str) -> Option<u64> {
        let path = self.instance_path(instance_id);
        read_u64(&path.join("memory.peak")).or_else(|| read_u64(&path.join("memory.current")))
    }

    fn read_cpu_usage(&self, instance_id: &str) -> Option<u64> {
        let content = fs::read_to_string(self.instance_path(instance_id).join("cpu.stat")).ok()?;
        keyed_value(&content, "usage_usec")
    }
}

impl CgroupBackend for CgroupV2 {
    fn backend_name(&self) -> &str {
        "cgroup_v2"
    }

    fn create(&self, instance_id: &str, profile: &ResourceProfile) -> Result<()> {
        let path = self.instance_path(instance_id);

        fs::create_dir_all(&path)
            .map_err(|e| SandboxError::Cgroup(format!("Failed to create cgroup: {}", e)))?;

        self.write_required(&path.join("memory.max"), &profile.memory_bytes.to_string())?;
        self.write_required(&path.join("pids.max"), &profile.max_processes.to_string())?;
        // No swap, otherwise memory.max only bounds the resident part
        self.write_optional(&path.join("memory.swap.max"), "0");
        self.write_optional(&path.join("memory.oom.group"), "1");

        Ok(())
    }

    fn procs_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id).join("cgroup.procs")
    }

    fn collect_evidence(&self, instance_id: &str) -> Result<CgroupEvidence> {
        let path = self.instance_path(instance_id);
        if !path.exists() {
            return Err(SandboxError::Cgroup(format!(
                "cgroup {} does not exist",
                path.display()
            )));
        }

        let oom_kill_events = fs::read_to_string(path.join("memory.events"))
            .ok()
            .and_then(|c| keyed_value(&c, "oom_kill"))
            .unwrap_or(0);
        let pids_max_events = fs::read_to_string(path.join("pids.events"))
            .ok()
            .and_then(|c| keyed_value(&c, "max"))
            .unwrap_or(0);

        Ok(CgroupEvidence {
            memory_peak: self.read_peak_memory(instance_id),
            oom_kill_events,
            pids_max_events,
            cpu_usage_usec: self.read_cpu_usage(instance_id),
        })
    }

    fn kill_all(&self, instance_id: &str) -> Result<()> {
        let kill_path = self.instance_path(instance_id).join("cgroup.kill");
        if kill_path.exists() {
            self.write_required(&kill_path, "1")?;
        }
        Ok(())
    }

    fn is_empty(&self, instance_id: &str) -> Result<bool> {
        let procs = self.procs_path(instance_id);
        match fs::read_to_string(&procs) {
            Ok(content) => Ok(content.trim().is_empty()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(SandboxError::Cgroup(format!(
                "Failed to read {}: {}",
                procs.display(),
                e
            ))),
        }
    }

    fn remove(&self, instance_id: &str) -> Result<()> {
        let path = self.instance_path(instance_id);

        if path.exists() {
            fs::remove_dir(&path)
                .map_err(|e| SandboxError::Cgroup(format!("Failed to remove cgroup: {}", e)))?;
        }

        Ok(())
    }

    fn get_cgroup_path(&self, instance_id: &str) -> PathBuf {
        self.instance_path(instance_id)
    }
}

fn read_u64(path: &Path) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse::<u64>().ok()
}

/// Value of `key` in a "key value" per-line file such as memory.events
fn keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        if parts.next()? == key {
            parts.next()?.parse::<u64>().ok()
        } else {
            None
        }
    })
}

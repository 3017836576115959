//! Host configuration consumed by the executor at startup.
//!
//! Loaded from JSON; every section has defaults so a partial file is valid.

use crate::config::types::{
    FilesystemPolicy, LimitOverrides, NetworkPolicy, ResourceProfile, Result, SandboxError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interpreter launched for every run as `program args... <source_file>`
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// File name the source is written to inside the scratch area
    pub source_file: String,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/bin/python3"),
            // -I: isolated mode (ignores PYTHON* env and user site), -B: no .pyc
            args: vec!["-I".to_string(), "-B".to_string()],
            source_file: "main.py".to_string(),
        }
    }
}

/// One complete set of ceilings, used both for defaults and for maxima
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub cpu_time_ms: u64,
    pub wall_time_ms: u64,
    pub memory_bytes: u64,
    pub output_bytes: u64,
    pub max_processes: u32,
    pub max_open_files: u64,
    pub file_size_bytes: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            cpu_time_ms: 5_000,
            wall_time_ms: 10_000,
            memory_bytes: 256 * 1024 * 1024,
            output_bytes: 64 * 1024,
            max_processes: 256,
            max_open_files: 64,
            file_size_bytes: 16 * 1024 * 1024,
        }
    }
}

impl LimitSettings {
    /// Host ceilings that requests may raise their limits up to
    pub fn default_maximums() -> Self {
        Self {
            cpu_time_ms: 30_000,
            wall_time_ms: 60_000,
            memory_bytes: 1024 * 1024 * 1024,
            output_bytes: 1024 * 1024,
            max_processes: 1024,
            max_open_files: 256,
            file_size_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueuePolicy {
    /// Wait FIFO for a slot, bounded by queue depth and queue timeout
    #[serde(rename = "queue")]
    Queue,
    /// Reject as soon as every slot is taken
    #[serde(rename = "reject")]
    Reject,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent: usize,
    pub queue_depth: usize,
    pub queue_timeout_ms: u64,
    pub policy: QueuePolicy,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            max_concurrent: cpus,
            queue_depth: cpus * 4,
            queue_timeout_ms: 5_000,
            policy: QueuePolicy::Queue,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    pub network: NetworkPolicy,
    pub read_only_root: bool,
    /// Identity the program runs as; only honored when the service is root
    pub run_as: Option<RunAs>,
    /// Existing cgroup v2 directory under which per-run cgroups are created
    pub cgroup_parent: Option<PathBuf>,
    /// Register the service as child subreaper so orphaned descendants can be reaped
    pub subreaper: bool,
    /// RLIMIT_AS = memory ceiling * factor; 0 (the default) leaves the
    /// address space unlimited and leaves memory to the watchdog and cgroup.
    /// A refused allocation surfaces as the program's own error.
    pub address_space_factor: u64,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            network: NetworkPolicy::Isolated,
            read_only_root: true,
            run_as: None,
            cgroup_parent: None,
            subreaper: true,
            address_space_factor: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Host variables copied into the child when present
    pub passthrough: Vec<String>,
    /// Fixed values; override passthrough and the built-in deterministic set
    pub fixed: BTreeMap<String, String>,
    pub path: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            passthrough: Vec::new(),
            fixed: BTreeMap::new(),
            path: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

/// Top-level sandbox configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub interpreter: InterpreterConfig,
    pub defaults: LimitSettings,
    pub maximums: LimitSettings,
    pub admission: AdmissionConfig,
    pub isolation: IsolationConfig,
    pub environment: EnvironmentConfig,
    pub scratch_root: PathBuf,
    pub max_source_bytes: usize,
    pub max_stdin_bytes: usize,
    pub termination_grace_ms: u64,
    pub poll_interval_ms: u64,
    /// How long collectors may keep draining after the run is reaped
    pub output_drain_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            interpreter: InterpreterConfig::default(),
            defaults: LimitSettings::default(),
            maximums: LimitSettings::default_maximums(),
            admission: AdmissionConfig::default(),
            isolation: IsolationConfig::default(),
            environment: EnvironmentConfig::default(),
            scratch_root: Self::runtime_root_dir(),
            max_source_bytes: 256 * 1024,
            max_stdin_bytes: 1024 * 1024,
            termination_grace_ms: 200,
            poll_interval_ms: 10,
            output_drain_ms: 500,
        }
    }
}

impl SandboxConfig {
    /// Scratch root scoped by effective UID so root and non-root services
    /// never share run directories.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = nix::unistd::geteuid();
        std::env::temp_dir().join(format!("execbox-uid-{}", euid))
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SandboxError::Config(format!("invalid config JSON: {}", e)))
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.admission.queue_timeout_ms)
    }

    /// Merge request overrides onto the defaults.
    ///
    /// An override above the configured maximum is an error naming the field.
    pub fn resolve_profile(&self, overrides: &LimitOverrides) -> std::result::Result<ResourceProfile, String> {
        let d = &self.defaults;
        let m = &self.maximums;

        fn pick<T: PartialOrd + Copy + std::fmt::Display>(
            name: &str,
            requested: Option<T>,
            default: T,
            max: T,
            zero: T,
        ) -> std::result::Result<T, String> {
            match requested {
                Some(v) if v == zero => Err(format!("{} must be greater than zero", name)),
                Some(v) if v > max => Err(format!("{} {} exceeds host maximum {}", name, v, max)),
                Some(v) => Ok(v),
                None => Ok(default),
            }
        }

        let cpu_ms = pick("cpu_time_ms", overrides.cpu_time_ms, d.cpu_time_ms, m.cpu_time_ms, 0)?;
        let wall_ms = pick("wall_time_ms", overrides.wall_time_ms, d.wall_time_ms, m.wall_time_ms, 0)?;
        let memory = pick("memory_bytes", overrides.memory_bytes, d.memory_bytes, m.memory_bytes, 0)?;
        let output = pick("output_bytes", overrides.output_bytes, d.output_bytes, m.output_bytes, 0)?;
        let processes = pick(
            "max_processes",
            overrides.max_processes,
            d.max_processes,
            m.max_processes,
            0,
        )?;

        Ok(ResourceProfile {
            cpu_time: Duration::from_millis(cpu_ms),
            wall_time: Duration::from_millis(wall_ms),
            memory_bytes: memory,
            output_bytes: output,
            max_processes: processes,
            max_open_files: d.max_open_files,
            file_size_bytes: d.file_size_bytes,
            network: self.isolation.network,
            filesystem: FilesystemPolicy {
                read_only_root: self.isolation.read_only_root,
            },
        })
    }
}

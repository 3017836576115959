// Config Validation
// Startup validation: the executor refuses to start on any error and logs
// every warning.

use crate::config::config::{LimitSettings, SandboxConfig};
use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::is_cgroup_v2_dir;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Check the configuration without failing; callers decide what to do with errors.
pub fn check_config(config: &SandboxConfig) -> ValidationResult {
    let mut result = ValidationResult::new();

    validate_limit_set("defaults", &config.defaults, &mut result);
    validate_limit_set("maximums", &config.maximums, &mut result);
    validate_defaults_within_maximums(config, &mut result);
    validate_admission(config, &mut result);
    validate_interpreter(config, &mut result);
    validate_paths(config, &mut result);
    validate_isolation(config, &mut result);
    validate_timing(config, &mut result);

    result
}

/// Validate at startup and fail fast with every error at once.
pub fn validate_config(config: &SandboxConfig) -> Result<ValidationResult> {
    let result = check_config(config);
    if !result.is_valid() {
        return Err(SandboxError::Config(format!(
            "config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }
    Ok(result)
}

fn validate_limit_set(name: &str, limits: &LimitSettings, result: &mut ValidationResult) {
    let fields: [(&str, u64); 7] = [
        ("cpu_time_ms", limits.cpu_time_ms),
        ("wall_time_ms", limits.wall_time_ms),
        ("memory_bytes", limits.memory_bytes),
        ("output_bytes", limits.output_bytes),
        ("max_processes", limits.max_processes as u64),
        ("max_open_files", limits.max_open_files),
        ("file_size_bytes", limits.file_size_bytes),
    ];
    for (field, value) in fields {
        if value == 0 {
            result.add_error(format!("{}.{} cannot be zero", name, field));
        }
    }

    if limits.memory_bytes > 0 && limits.memory_bytes < 4 * 1024 * 1024 {
        result.add_warning(format!(
            "{}.memory_bytes {} is very low (< 4MB); most interpreters will not start",
            name, limits.memory_bytes
        ));
    }

    if limits.max_open_files > 0 && limits.max_open_files < 8 {
        result.add_warning(format!(
            "{}.max_open_files {} leaves almost no descriptors beyond stdio",
            name, limits.max_open_files
        ));
    }

    if limits.wall_time_ms < limits.cpu_time_ms {
        result.add_error(format!(
            "{}.wall_time_ms ({}) must be >= cpu_time_ms ({})",
            name, limits.wall_time_ms, limits.cpu_time_ms
        ));
    }
}

fn validate_defaults_within_maximums(config: &SandboxConfig, result: &mut ValidationResult) {
    let d = &config.defaults;
    let m = &config.maximums;
    let pairs: [(&str, u64, u64); 7] = [
        ("cpu_time_ms", d.cpu_time_ms, m.cpu_time_ms),
        ("wall_time_ms", d.wall_time_ms, m.wall_time_ms),
        ("memory_bytes", d.memory_bytes, m.memory_bytes),
        ("output_bytes", d.output_bytes, m.output_bytes),
        ("max_processes", d.max_processes as u64, m.max_processes as u64),
        ("max_open_files", d.max_open_files, m.max_open_files),
        ("file_size_bytes", d.file_size_bytes, m.file_size_bytes),
    ];
    for (field, default, max) in pairs {
        if default > max {
            result.add_error(format!(
                "defaults.{} ({}) exceeds maximums.{} ({})",
                field, default, field, max
            ));
        }
    }
}

fn validate_admission(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.admission.max_concurrent == 0 {
        result.add_error("admission.max_concurrent cannot be zero".to_string());
    }

    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    if config.admission.max_concurrent > cpus * 4 {
        result.add_warning(format!(
            "admission.max_concurrent {} is far above the {} available CPUs",
            config.admission.max_concurrent, cpus
        ));
    }
}

fn validate_interpreter(config: &SandboxConfig, result: &mut ValidationResult) {
    let interp = &config.interpreter;
    if !interp.program.is_absolute() {
        result.add_error(format!(
            "interpreter.program must be an absolute path: {:?}",
            interp.program
        ));
    } else if !interp.program.exists() {
        result.add_warning(format!(
            "interpreter.program does not exist: {:?}",
            interp.program
        ));
    }

    let name = interp.source_file.as_str();
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        result.add_error(format!(
            "interpreter.source_file must be a plain file name: {:?}",
            name
        ));
    }

    if interp
        .args
        .iter()
        .any(|a| a.as_bytes().contains(&0))
    {
        result.add_error("interpreter.args contain a NUL byte".to_string());
    }
}

fn validate_paths(config: &SandboxConfig, result: &mut ValidationResult) {
    if !config.scratch_root.is_absolute() {
        result.add_error(format!(
            "scratch_root must be an absolute path: {:?}",
            config.scratch_root
        ));
    }

    if let Some(ref parent) = config.isolation.cgroup_parent {
        if !parent.is_absolute() {
            result.add_error(format!(
                "isolation.cgroup_parent must be an absolute path: {:?}",
                parent
            ));
        } else if !is_cgroup_v2_dir(parent) {
            result.add_error(format!(
                "isolation.cgroup_parent {:?} is not a cgroup v2 directory",
                parent
            ));
        }
    }

    if config.max_source_bytes == 0 {
        result.add_error("max_source_bytes cannot be zero".to_string());
    }
}

fn validate_isolation(config: &SandboxConfig, result: &mut ValidationResult) {
    if let Some(run_as) = config.isolation.run_as {
        if run_as.uid == 0 || run_as.gid == 0 {
            result.add_error(
                "isolation.run_as cannot be root (uid/gid 0) for untrusted programs".to_string(),
            );
        }
        if !nix::unistd::geteuid().is_root() {
            result.add_warning(
                "isolation.run_as is ignored when the service does not run as root".to_string(),
            );
        }
    }

    if config.isolation.address_space_factor > 0 {
        result.add_warning(format!(
            "isolation.address_space_factor is {}: allocations refused by RLIMIT_AS are \
             reported as crashes, not memory limits",
            config.isolation.address_space_factor
        ));
    }

    if !config.isolation.subreaper && config.isolation.cgroup_parent.is_none() {
        result.add_warning(
            "neither isolation.subreaper nor isolation.cgroup_parent is set: \
             descendants that leave the session cannot be tracked"
                .to_string(),
        );
    }

    for key in config.environment.fixed.keys() {
        if key.is_empty() || key.contains('=') || key.as_bytes().contains(&0) {
            result.add_error(format!("environment.fixed has an invalid name: {:?}", key));
        }
    }
}

fn validate_timing(config: &SandboxConfig, result: &mut ValidationResult) {
    if config.poll_interval_ms == 0 {
        result.add_error("poll_interval_ms cannot be zero".to_string());
    }
    if config.poll_interval_ms > config.termination_grace_ms.max(1) * 10 {
        result.add_warning(format!(
            "poll_interval_ms ({}) is much coarser than termination_grace_ms ({})",
            config.poll_interval_ms, config.termination_grace_ms
        ));
    }
}

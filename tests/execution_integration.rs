//! End-to-end runs through the executor
//!
//! The interpreter is `/bin/sh` so the tests need nothing beyond a POSIX
//! userland. Host network and a writable root are used unless a test is
//! specifically about those controls and the host can enforce them.

use execbox::config::config::SandboxConfig;
use execbox::kernel::cgroup::is_cgroup_v2_dir;
use execbox::kernel::probe::probe_host;
use execbox::{
    CancelToken, ExecutionRequest, Executor, HealthStatus, LimitKind, LimitOverrides, NetworkPolicy,
    OutcomeKind,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

fn shell_config(scratch: &Path) -> SandboxConfig {
    let mut config = SandboxConfig::default();
    config.scratch_root = scratch.to_path_buf();
    config.interpreter.program = "/bin/sh".into();
    config.interpreter.args = Vec::new();
    config.interpreter.source_file = "main.sh".to_string();
    config.isolation.network = NetworkPolicy::Inherit;
    config.isolation.read_only_root = false;
    config.defaults.wall_time_ms = 5_000;
    config
}

/// The shipped isolation settings, minus what this host cannot enforce
fn default_isolation_config(scratch: &Path) -> SandboxConfig {
    let mut config = shell_config(scratch);
    config.isolation = SandboxConfig::default().isolation;
    let report = probe_host(&config).unwrap();
    if !report.network_namespace.enforced {
        config.isolation.network = NetworkPolicy::Inherit;
    }
    if !report.read_only_root.enforced {
        config.isolation.read_only_root = false;
    }
    config
}

fn shell_executor(scratch: &Path) -> Executor {
    Executor::new(shell_config(scratch)).unwrap()
}

fn scratch_is_empty(scratch: &Path) -> bool {
    std::fs::read_dir(scratch)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

fn wait_until_gone(pid: i32, budget: Duration) -> bool {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => return true,
            // A zombie has no code left to run
            Ok(stat) if stat.rsplit(')').next().map_or(false, |s| s.trim_start().starts_with('Z')) => {
                return true
            }
            Ok(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    false
}

#[test]
fn test_hello_world_completes() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("echo hello");

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "");
    assert_eq!(result.exit_code, Some(0));
    assert!(!result.is_truncated());
    assert!(result.wall_time_ms.is_some());
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn test_stderr_is_captured_separately() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("echo out; echo err >&2");

    assert_eq!(result.kind, OutcomeKind::Completed);
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
}

#[test]
fn test_empty_output_is_still_completed() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("true");

    assert_eq!(result.kind, OutcomeKind::Completed);
    assert_eq!(result.stdout, "");
}

#[test]
fn test_nonzero_exit_is_crashed_with_output() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("echo partial; echo boom >&2; exit 3");

    assert_eq!(result.kind, OutcomeKind::Crashed);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.stdout, "partial\n");
    assert_eq!(result.stderr, "boom\n");
}

#[test]
fn test_self_signal_is_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("kill -SEGV $$");

    assert_eq!(result.kind, OutcomeKind::Crashed);
    assert_eq!(result.signal, Some(libc::SIGSEGV));
}

#[test]
fn test_stdin_is_delivered() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let request = ExecutionRequest::new("cat").with_stdin("line one\nline two\n");
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::Completed);
    assert_eq!(result.stdout, "line one\nline two\n");
}

#[test]
fn test_runs_in_private_scratch_directory() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("pwd; ls");

    assert_eq!(result.kind, OutcomeKind::Completed);
    let mut lines = result.stdout.lines();
    let cwd = lines.next().unwrap();
    assert!(cwd.starts_with(dir.path().to_str().unwrap()), "cwd {}", cwd);
    assert_eq!(lines.collect::<Vec<_>>(), vec!["main.sh"]);
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn test_host_secrets_are_not_inherited() {
    std::env::set_var("EXECBOX_TEST_API_KEY", "hunter2");
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let result = exec.run_source("echo \"${EXECBOX_TEST_API_KEY:-absent}\"; env");

    assert_eq!(result.kind, OutcomeKind::Completed);
    assert!(result.stdout.starts_with("absent\n"));
    assert!(!result.stdout.contains("hunter2"));
    assert!(!result.stdout.contains("LD_PRELOAD"));
}

#[test]
fn test_wall_timeout_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let request = ExecutionRequest::new("sleep 30 & echo $!; sleep 30").with_limits(LimitOverrides {
        wall_time_ms: Some(300),
        ..Default::default()
    });
    let started = Instant::now();
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::TimedOut, "{:?}", result);
    assert!(!result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));

    let background: i32 = result.stdout.trim().parse().unwrap();
    assert!(
        wait_until_gone(background, Duration::from_secs(2)),
        "background pid {} survived the run",
        background
    );
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn test_cpu_loop_is_killed_over_limit() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let request = ExecutionRequest::new("while :; do :; done").with_limits(LimitOverrides {
        cpu_time_ms: Some(300),
        ..Default::default()
    });
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::LimitExceeded, "{:?}", result);
    assert_eq!(result.limit, Some(LimitKind::CpuTime));
    assert!(result.cpu_time_ms.unwrap() >= 250);
}

#[test]
fn test_memory_hog_is_killed_over_limit() {
    let dir = tempfile::tempdir().unwrap();
    let exec = Executor::new(default_isolation_config(dir.path())).unwrap();

    let request = ExecutionRequest::new("x=$(head -c 200000000 /dev/zero | tr '\\0' a); echo done")
        .with_limits(LimitOverrides {
            memory_bytes: Some(32 * 1024 * 1024),
            ..Default::default()
        });
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::LimitExceeded, "{:?}", result);
    assert_eq!(result.limit, Some(LimitKind::Memory));
    assert!(!result.stdout.contains("done"));
}

#[test]
fn test_single_large_allocation_is_memory_limit() {
    let python = Path::new("/usr/bin/python3");
    if !python.exists() {
        println!("skipping: {} not installed", python.display());
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = default_isolation_config(dir.path());
    config.interpreter = SandboxConfig::default().interpreter;
    let exec = Executor::new(config).unwrap();

    let request = ExecutionRequest::new("x = bytearray(1024 * 1024 * 1024)\nprint('allocated')\n")
        .with_limits(LimitOverrides {
            memory_bytes: Some(64 * 1024 * 1024),
            ..Default::default()
        });
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::LimitExceeded, "{:?}", result);
    assert_eq!(result.limit, Some(LimitKind::Memory));
    assert!(!result.stdout.contains("allocated"));
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn test_setsid_grandchild_is_killed_with_the_run() {
    if !Path::new("/usr/bin/setsid").exists() && !Path::new("/bin/setsid").exists() {
        println!("skipping: setsid not installed");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let exec = Executor::new(default_isolation_config(dir.path())).unwrap();

    // The intermediate subshell exits at once, so the grandchild is
    // re-parented out of the run in a fresh session with every pipe closed.
    let source = "(setsid sh -c 'echo $$ >&2; exec sleep 30 </dev/null >/dev/null 2>&1' &)\n\
                  sleep 0.5\n\
                  echo parent-done\n";
    let started = Instant::now();
    let result = exec.run_source(source);

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "parent-done\n");
    assert!(started.elapsed() < Duration::from_secs(10));

    let escaped: i32 = result.stderr.trim().parse().unwrap();
    assert!(
        wait_until_gone(escaped, Duration::from_secs(2)),
        "session leader {} survived the run",
        escaped
    );
    let report = exec.health_check();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.leaked_processes, 0);
    assert_eq!(report.invariant_violations, 0);
    assert!(scratch_is_empty(dir.path()));
}

#[test]
fn test_output_over_cap_is_truncated_not_deadlocked() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let request = ExecutionRequest::new("head -c 1000000 /dev/zero | tr '\\0' x; echo finished >&2")
        .with_limits(LimitOverrides {
            output_bytes: Some(1024),
            ..Default::default()
        });
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert!(result.stdout_truncated);
    assert!(!result.stderr_truncated);
    assert_eq!(result.stdout_bytes, 1_000_000);
    assert!(result.stdout.len() <= 1024);
    assert!(result.stdout.chars().all(|c| c == 'x'));
    assert_eq!(result.stderr, "finished\n");
}

#[test]
fn test_cancel_terminates_running_program() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());
    let token = CancelToken::new();

    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };
    let started = Instant::now();
    let result = exec.submit_with_cancel(ExecutionRequest::new("sleep 30"), &token);
    canceller.join().unwrap();

    assert_eq!(result.kind, OutcomeKind::TimedOut);
    assert!(result.cancelled);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(exec.metrics_snapshot().outcomes.cancelled, 1);
}

#[test]
fn test_generous_process_limit_allows_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    let request = ExecutionRequest::new("echo a | cat | cat | tr a b").with_limits(LimitOverrides {
        max_processes: Some(512),
        ..Default::default()
    });
    let result = exec.submit(request);

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "b\n");
}

#[test]
fn test_every_run_leaves_executor_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let exec = shell_executor(dir.path());

    exec.run_source("echo ok");
    exec.run_source("exit 9");
    exec.submit(ExecutionRequest::new("sleep 5").with_limits(LimitOverrides {
        wall_time_ms: Some(100),
        ..Default::default()
    }));

    let report = exec.health_check();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert_eq!(report.active_runs, 0);
    assert_eq!(report.stale_workspaces, 0);
    assert_eq!(report.leaked_processes, 0);

    let metrics = exec.metrics_snapshot();
    assert_eq!(metrics.outcomes.completed, 1);
    assert_eq!(metrics.outcomes.crashed, 1);
    assert_eq!(metrics.outcomes.timed_out, 1);
    assert_eq!(metrics.cleanup_failure, 0);
}

#[test]
fn test_network_is_isolated_when_host_supports_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = shell_config(dir.path());
    config.isolation.network = NetworkPolicy::Isolated;

    let report = probe_host(&config).unwrap();
    if !report.network_namespace.enforced {
        println!(
            "skipping: network namespace unavailable ({:?})",
            report.network_namespace.detail
        );
        return;
    }
    let exec = Executor::new(config).unwrap();

    // Every interface line in /proc/net/dev has a colon; only loopback remains
    let result = exec.run_source("grep -c : /proc/net/dev");

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout.trim(), "1");
}

#[test]
fn test_read_only_root_when_host_supports_it() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = shell_config(dir.path());
    config.isolation.read_only_root = true;

    let report = probe_host(&config).unwrap();
    if !report.read_only_root.enforced {
        println!(
            "skipping: read-only root unavailable ({:?})",
            report.read_only_root.detail
        );
        return;
    }
    let exec = Executor::new(config).unwrap();

    let result = exec.run_source("echo scratch > note && cat note; touch /execbox-escape 2>/dev/null || echo denied");

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "scratch\ndenied\n");
    assert!(!Path::new("/execbox-escape").exists());
}

#[test]
fn test_python_hello_world() {
    let python = Path::new("/usr/bin/python3");
    if !python.exists() {
        println!("skipping: {} not installed", python.display());
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = SandboxConfig::default();
    config.scratch_root = dir.path().to_path_buf();
    config.isolation.network = NetworkPolicy::Inherit;
    config.isolation.read_only_root = false;
    let exec = Executor::new(config).unwrap();

    let result = exec.run_source("print('hello')\nraise SystemExit(0)\n");

    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "hello\n");

    let result = exec.run_source("print(undefined_name)\n");
    assert_eq!(result.kind, OutcomeKind::Crashed);
    assert!(result.stderr.contains("NameError"));
}

/// A cgroup v2 directory per-run cgroups can be created under, if any
fn writable_cgroup_parent() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("EXECBOX_TEST_CGROUP") {
        return Some(PathBuf::from(path)).filter(|p| is_cgroup_v2_dir(p));
    }
    let root = Path::new("/sys/fs/cgroup");
    if !is_cgroup_v2_dir(root) {
        return None;
    }
    let parent = root.join("execbox-test");
    std::fs::create_dir_all(&parent).ok()?;
    // Children need the controllers delegated; probe_host reports if not
    let _ = std::fs::write(parent.join("cgroup.subtree_control"), "+memory +pids");
    Some(parent).filter(|p| is_cgroup_v2_dir(p))
}

#[test]
fn test_cgroup_limits_when_host_supports_it() {
    let Some(parent) = writable_cgroup_parent() else {
        println!("skipping: no writable cgroup v2 parent");
        return;
    };
    let dir = tempfile::tempdir().unwrap();
    let mut config = shell_config(dir.path());
    config.isolation.cgroup_parent = Some(parent.clone());

    let report = probe_host(&config).unwrap();
    let status = report.cgroup.clone().unwrap();
    if !status.enforced {
        println!("skipping: cgroup unavailable ({:?})", status.detail);
        return;
    }
    let exec = Executor::new(config).unwrap();

    let request = ExecutionRequest::new("x=$(head -c 200000000 /dev/zero | tr '\\0' a); echo done")
        .with_limits(LimitOverrides {
            memory_bytes: Some(32 * 1024 * 1024),
            ..Default::default()
        });
    let result = exec.submit(request);
    assert_eq!(result.kind, OutcomeKind::LimitExceeded, "{:?}", result);
    assert_eq!(result.limit, Some(LimitKind::Memory));
    assert!(!result.stdout.contains("done"));

    let result = exec.run_source("sleep 30 & echo ok");
    assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
    assert_eq!(result.stdout, "ok\n");

    // per-run cgroups go away with their runs
    let leftover = std::fs::read_dir(&parent)
        .unwrap()
        .flatten()
        .filter(|e| e.path().is_dir())
        .count();
    assert_eq!(leftover, 0);
    assert_eq!(exec.health_check().status, HealthStatus::Healthy);
}

//! Concurrency bounds seen through the executor

use execbox::config::config::{QueuePolicy, SandboxConfig};
use execbox::{ExecutionRequest, Executor, NetworkPolicy, OutcomeKind, RejectReason};
use std::path::Path;
use std::time::{Duration, Instant};

fn executor(scratch: &Path, slots: usize, depth: usize, timeout_ms: u64, policy: QueuePolicy) -> Executor {
    let mut config = SandboxConfig::default();
    config.scratch_root = scratch.to_path_buf();
    config.interpreter.program = "/bin/sh".into();
    config.interpreter.args = Vec::new();
    config.interpreter.source_file = "main.sh".to_string();
    config.isolation.network = NetworkPolicy::Inherit;
    config.isolation.read_only_root = false;
    config.admission.max_concurrent = slots;
    config.admission.queue_depth = depth;
    config.admission.queue_timeout_ms = timeout_ms;
    config.admission.policy = policy;
    Executor::new(config).unwrap()
}

#[test]
fn test_concurrency_never_exceeds_slots() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), 2, 16, 30_000, QueuePolicy::Queue);

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let exec = &exec;
                s.spawn(move || exec.run_source(&format!("sleep 0.2; echo {}", i)))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.kind, OutcomeKind::Completed, "{:?}", result);
        assert_eq!(result.stdout, format!("{}\n", i));
    }
    let snapshot = exec.admission_snapshot();
    assert_eq!(snapshot.high_water, 2);
    assert_eq!(snapshot.in_use, 0);
    assert_eq!(snapshot.queued, 0);
    assert_eq!(exec.metrics_snapshot().active_runs, 0);
}

#[test]
fn test_reject_policy_reports_overloaded() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), 1, 0, 1_000, QueuePolicy::Reject);

    std::thread::scope(|s| {
        let busy = s.spawn(|| exec.run_source("sleep 1"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while exec.admission_snapshot().in_use == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let rejected = exec.run_source("echo never");
        assert_eq!(rejected.kind, OutcomeKind::Rejected);
        assert_eq!(rejected.reject_reason, Some(RejectReason::QueueFull));
        assert!(rejected.reject_reason.unwrap().is_overloaded());
        assert_eq!(rejected.stdout, "");

        assert_eq!(busy.join().unwrap().kind, OutcomeKind::Completed);
    });

    assert_eq!(exec.metrics_snapshot().rejections.queue_full, 1);
}

#[test]
fn test_queued_request_times_out_without_running() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), 1, 4, 100, QueuePolicy::Queue);

    std::thread::scope(|s| {
        let busy = s.spawn(|| exec.run_source("sleep 1"));

        let deadline = Instant::now() + Duration::from_secs(5);
        while exec.admission_snapshot().in_use == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let started = Instant::now();
        let waited = exec.run_source("echo never");
        assert_eq!(waited.kind, OutcomeKind::Rejected);
        assert_eq!(waited.reject_reason, Some(RejectReason::QueueTimeout));
        assert!(started.elapsed() < Duration::from_millis(900));

        busy.join().unwrap();
    });
}

#[test]
fn test_queued_requests_are_served_in_arrival_order() {
    let dir = tempfile::tempdir().unwrap();
    let exec = executor(dir.path(), 1, 8, 30_000, QueuePolicy::Queue);
    let order = std::sync::Mutex::new(Vec::new());

    std::thread::scope(|s| {
        let blocker = s.spawn(|| exec.run_source("sleep 1"));
        let deadline = Instant::now() + Duration::from_secs(5);
        while exec.admission_snapshot().in_use == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }

        let mut waiters = Vec::new();
        for i in 0..4 {
            let exec = &exec;
            let order = &order;
            waiters.push(s.spawn(move || {
                let result = exec.submit(ExecutionRequest::new(format!("echo {}", i)));
                order.lock().unwrap().push(result.stdout.trim().to_string());
            }));
            // Make arrival order deterministic
            let deadline = Instant::now() + Duration::from_secs(5);
            while exec.admission_snapshot().queued < i + 1 && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        blocker.join().unwrap();
        for waiter in waiters {
            waiter.join().unwrap();
        }
    });

    assert_eq!(order.into_inner().unwrap(), vec!["0", "1", "2", "3"]);
}

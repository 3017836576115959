use crate::config::config::SandboxConfig;
use crate::config::types::{ExecutionRequest, LimitOverrides, OutcomeKind};
use crate::core::types::CancelToken;
use crate::executor::Executor;
use crate::kernel::probe::probe_host;
use crate::kernel::signal::SignalHandler;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::{bounded, TryRecvError};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file; built-in defaults when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one program in the sandbox and print the result as JSON
    Run {
        /// Source file to run
        #[arg(conflicts_with = "code", required_unless_present = "code")]
        file: Option<PathBuf>,
        /// Source code as string
        #[arg(long)]
        code: Option<String>,
        /// Input data to pass to stdin
        #[arg(long)]
        stdin: Option<String>,
        /// CPU time limit in milliseconds
        #[arg(long)]
        cpu_ms: Option<u64>,
        /// Wall clock time limit in milliseconds
        #[arg(long)]
        wall_ms: Option<u64>,
        /// Memory limit in MB
        #[arg(long)]
        mem: Option<u64>,
        /// Per-stream output cap in bytes
        #[arg(long)]
        output_bytes: Option<u64>,
        /// Maximum number of processes
        #[arg(long)]
        processes: Option<u32>,
    },
    /// Probe which isolation controls this host can enforce
    Check,
    /// Remove stale scratch workspaces
    Sweep {
        /// Remove workspaces older than this many seconds
        #[arg(long, default_value_t = 3600)]
        max_age_secs: u64,
    },
}

fn load_config(path: Option<&Path>) -> Result<SandboxConfig> {
    match path {
        Some(path) => SandboxConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(SandboxConfig::default()),
    }
}

/// Parse arguments, run the subcommand, and return the process exit code.
pub fn run() -> Result<i32> {
    env_logger::init();

    if !cfg!(target_os = "linux") {
        anyhow::bail!("execbox requires Linux for its isolation controls");
    }

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            file,
            code,
            stdin,
            cpu_ms,
            wall_ms,
            mem,
            output_bytes,
            processes,
        } => {
            let source = match (code, file) {
                (Some(code), _) => code.into_bytes(),
                (None, Some(file)) => std::fs::read(&file)
                    .with_context(|| format!("reading {}", file.display()))?,
                (None, None) => anyhow::bail!("either a file or --code is required"),
            };

            let limits = LimitOverrides {
                cpu_time_ms: cpu_ms,
                wall_time_ms: wall_ms,
                memory_bytes: mem.map(|mb| mb.saturating_mul(1024 * 1024)),
                output_bytes,
                max_processes: processes,
            };
            let mut request = ExecutionRequest::new(source).with_limits(limits);
            if let Some(stdin) = stdin {
                request = request.with_stdin(stdin);
            }

            let executor = Executor::new(config).context("starting executor")?;
            let result = run_cancellable(&executor, request)?;

            println!("{}", result.to_json()?);
            Ok(if result.kind == OutcomeKind::LaunchFailure { 1 } else { 0 })
        }
        Commands::Check => {
            let report = probe_host(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(if report.meets_config(&config) { 0 } else { 1 })
        }
        Commands::Sweep { max_age_secs } => {
            let executor = Executor::new(config).context("starting executor")?;
            let removed = executor.sweep_stale_workspaces(Duration::from_secs(max_age_secs))?;
            println!("{}", serde_json::json!({ "removed": removed }));
            Ok(0)
        }
    }
}

/// Ctrl-C / SIGTERM cancel the run instead of killing the CLI, so the
/// sandbox is still torn down and a result is still printed.
fn run_cancellable(
    executor: &Executor,
    request: ExecutionRequest,
) -> Result<crate::config::types::ExecutionResult> {
    let handler = SignalHandler::init().map_err(anyhow::Error::msg)?;
    let token = CancelToken::new();
    let (done_tx, done_rx) = bounded::<()>(1);

    let watcher_token = token.clone();
    let watcher = std::thread::Builder::new()
        .name("execbox-signals".to_string())
        .spawn(move || loop {
            if handler.wait_for_signal(Duration::from_millis(50)) {
                log::warn!("Signal {} received; cancelling run", handler.get_signal());
                watcher_token.cancel();
                return;
            }
            match done_rx.try_recv() {
                Err(TryRecvError::Empty) => continue,
                _ => return,
            }
        })
        .context("starting signal watcher")?;

    let result = executor.submit_with_cancel(request, &token);
    let _ = done_tx.send(());
    let _ = watcher.join();
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_accepts_inline_code_and_limits() {
        let cli = Cli::try_parse_from([
            "execbox", "run", "--code", "print(1)", "--wall-ms", "500", "--mem", "64",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { code, wall_ms, mem, file, .. } => {
                assert_eq!(code.as_deref(), Some("print(1)"));
                assert_eq!(wall_ms, Some(500));
                assert_eq!(mem, Some(64));
                assert!(file.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_requires_a_source() {
        assert!(Cli::try_parse_from(["execbox", "run"]).is_err());
        assert!(Cli::try_parse_from(["execbox", "run", "a.py", "--code", "x"]).is_err());
    }

    #[test]
    fn test_sweep_default_age() {
        let cli = Cli::try_parse_from(["execbox", "--config", "/etc/execbox.json", "sweep"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/execbox.json")));
        match cli.command {
            Commands::Sweep { max_age_secs } => assert_eq!(max_age_secs, 3600),
            _ => panic!("expected sweep"),
        }
    }
}

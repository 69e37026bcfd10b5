// src/lib.rs

pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod logging;
pub mod transport;
pub mod types;

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tracing::{debug, info, warn};

use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_optional};
use crate::engine::{Coordinator, LifecycleState, RunEvent, RunId, RunOutcome};
use crate::transport::{TransportSelector, TransportSettings};
use crate::types::{IpcMode, RunRequest};

/// Exit status reported when the run was canceled (Ctrl-C).
pub const EXIT_CANCELED: i32 = 130;
/// Exit status reported when the run failed before the child could answer.
pub const EXIT_FAILURE: i32 = 1;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading and request resolution
/// - the lifecycle coordinator with the production transports
/// - Ctrl-C handling (cancels the run)
/// - printing of output/error lines
///
/// Returns the exit status the process should end with.
pub async fn run(args: CliArgs) -> Result<i32> {
    let cfg = load_optional(args.config.as_deref()).context("loading configuration")?;
    let request = resolve_request(&args, &cfg)?;

    if args.dry_run {
        print_dry_run(&request, &cfg.transport);
        return Ok(0);
    }

    let interactive = args.interactive && request.mode == IpcMode::LocalSocket;
    if args.interactive && !interactive {
        warn!("--interactive only applies to socket mode; ignoring it");
    }

    let (coordinator, mut events) = Coordinator::new(TransportSelector::new(cfg.transport));
    let coordinator = Arc::new(coordinator);

    // Ctrl-C → cancel the run; teardown follows from the cancellation.
    {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("Ctrl+C received; canceling run");
            coordinator.cancel();
        });
    }

    let runner = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.run(request).await })
    };

    let mut stdin_lines = interactive.then(|| BufReader::new(tokio::io::stdin()).lines());
    let mut running = false;

    let status = loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(RunEvent::Output { line, .. }) => println!("{line}"),
                Some(RunEvent::Error { line, .. }) => eprintln!("{line}"),
                Some(RunEvent::StateChanged(state)) => {
                    debug!(?state, "run state changed");
                    running = state == LifecycleState::Running;
                }
                Some(RunEvent::Finished { run, outcome }) => break exit_status(run, outcome),
                None => break EXIT_FAILURE,
            },
            line = next_stdin_line(&mut stdin_lines), if running => match line {
                Some(line) => {
                    if let Err(e) = coordinator.send(&line).await {
                        warn!(error = %e, "failed to forward input line");
                    }
                }
                None => {
                    debug!("stdin closed; no more interactive input");
                    stdin_lines = None;
                }
            },
        }
    };

    coordinator.stop().await;
    match runner.await {
        Ok(Ok(id)) => debug!(run = %id, "run finished"),
        Ok(Err(e)) => debug!(error = %e, "run ended with an error"),
        Err(e) => warn!(error = %e, "run task failed"),
    }

    Ok(status)
}

async fn next_stdin_line(lines: &mut Option<Lines<BufReader<Stdin>>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

fn exit_status(run: RunId, outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Exited(signal) => {
            info!(run = %run, exit_code = signal.exit_code, "child exited");
            if signal.exit_code < 0 {
                EXIT_FAILURE
            } else {
                signal.exit_code
            }
        }
        RunOutcome::Canceled => {
            eprintln!("ipcrun: canceled");
            EXIT_CANCELED
        }
        RunOutcome::Failed { kind, message } => {
            eprintln!("ipcrun: {kind}: {message}");
            EXIT_FAILURE
        }
        RunOutcome::Stopped => EXIT_FAILURE,
    }
}

/// Build the run request from the command line, falling back to the named
/// (or default) profile for anything not given as a flag.
pub fn resolve_request(args: &CliArgs, cfg: &ConfigFile) -> Result<RunRequest> {
    let profile = match &args.profile {
        Some(name) => Some(
            cfg.profile(name)
                .ok_or_else(|| anyhow!("unknown profile '{name}'"))?,
        ),
        None => cfg.default_profile().map(|(_, profile)| profile),
    };

    let interpreter = args
        .interpreter
        .clone()
        .or_else(|| profile.map(|p| PathBuf::from(&p.interpreter)))
        .ok_or_else(|| anyhow!("no interpreter given; use --interpreter or a profile"))?;

    let script = args
        .script
        .clone()
        .or_else(|| profile.and_then(|p| p.script.clone()));

    let extra_args = if args.script_args.is_empty() {
        profile.map(|p| p.args.clone()).unwrap_or_default()
    } else {
        args.script_args.clone()
    };

    let mode = args
        .mode
        .or_else(|| profile.map(|p| p.mode))
        .unwrap_or_default();

    let payload = match read_payload(args)? {
        Some(payload) => payload,
        None => profile
            .and_then(|p| p.payload.clone())
            .unwrap_or_default(),
    };

    let mut script_args: Vec<String> = script.into_iter().collect();
    script_args.extend(extra_args);

    Ok(RunRequest {
        interpreter,
        script_args,
        mode,
        payload,
    })
}

fn read_payload(args: &CliArgs) -> Result<Option<String>> {
    if let Some(payload) = &args.payload {
        return Ok(Some(payload.clone()));
    }
    let Some(path) = &args.payload_file else {
        return Ok(None);
    };

    let raw = if path == Path::new("-") {
        if args.interactive {
            bail!("--payload-file - reads stdin, which --interactive also needs");
        }
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("reading payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("reading payload file '{}'", path.display()))?
    };

    Ok(Some(raw.trim_end_matches(['\r', '\n']).to_string()))
}

/// Simple dry-run output: the resolved request and transport timings.
fn print_dry_run(request: &RunRequest, transport: &TransportSettings) {
    println!("ipcrun dry-run");
    println!("  interpreter: {}", request.interpreter.display());
    println!("  args: {:?}", request.script_args);
    println!("  mode: {}", request.mode);
    println!("  payload: {}", request.payload);
    println!();
    println!("transport:");
    println!("  startup_grace: {:?}", transport.startup_grace);
    println!("  connect_timeout: {:?}", transport.connect_timeout);
    println!("  stop_grace: {:?}", transport.stop_grace);
    println!("  kill_timeout: {:?}", transport.kill_timeout);
    println!("  drain_timeout: {:?}", transport.drain_timeout);
    println!("  max_line_bytes: {}", transport.max_line_bytes);

    debug!("dry-run complete (no execution)");
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use clap::Parser;

    use super::*;
    use crate::config::ProfileConfig;

    fn config_with_profile() -> ConfigFile {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "echo".to_string(),
            ProfileConfig {
                interpreter: "python3".into(),
                script: Some("echo.py".into()),
                args: vec!["--upper".into()],
                mode: IpcMode::LocalSocket,
                payload: Some("{\"value\":\"ping\"}".into()),
            },
        );
        ConfigFile {
            transport: TransportSettings::default(),
            default_profile: Some("echo".into()),
            profiles,
        }
    }

    #[test]
    fn default_profile_fills_everything() {
        let args = CliArgs::try_parse_from(["ipcrun"]).unwrap();
        let req = resolve_request(&args, &config_with_profile()).unwrap();

        assert_eq!(req.interpreter, PathBuf::from("python3"));
        assert_eq!(req.script_args, vec!["echo.py", "--upper"]);
        assert_eq!(req.mode, IpcMode::LocalSocket);
        assert_eq!(req.payload, "{\"value\":\"ping\"}");
    }

    #[test]
    fn flags_override_profile_fields() {
        let args = CliArgs::try_parse_from([
            "ipcrun", "--mode", "stdio", "--payload", "x", "--", "--lower",
        ])
        .unwrap();
        let req = resolve_request(&args, &config_with_profile()).unwrap();

        assert_eq!(req.mode, IpcMode::StandardStream);
        assert_eq!(req.payload, "x");
        assert_eq!(req.script_args, vec!["echo.py", "--lower"]);
    }

    #[test]
    fn stdin_payload_and_interactive_are_rejected() {
        let args = CliArgs::try_parse_from([
            "ipcrun", "--interpreter", "cat", "--payload-file", "-", "--interactive",
        ])
        .unwrap();
        let err = resolve_request(&args, &ConfigFile::default()).unwrap_err();
        assert!(err.to_string().contains("--interactive"), "{err}");
    }

    #[test]
    fn missing_interpreter_is_an_error() {
        let args = CliArgs::try_parse_from(["ipcrun", "--script", "a.py"]).unwrap();
        assert!(resolve_request(&args, &ConfigFile::default()).is_err());
    }

    #[test]
    fn unknown_profile_is_an_error() {
        let args = CliArgs::try_parse_from(["ipcrun", "--profile", "nope"]).unwrap();
        let err = resolve_request(&args, &config_with_profile()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn exit_status_mapping() {
        let run = RunId(1);
        assert_eq!(
            exit_status(
                run,
                RunOutcome::Exited(transport::ExitSignal { exit_code: 3 })
            ),
            3
        );
        assert_eq!(exit_status(run, RunOutcome::Canceled), EXIT_CANCELED);
        assert_eq!(
            exit_status(
                run,
                RunOutcome::Exited(transport::ExitSignal { exit_code: -1 })
            ),
            EXIT_FAILURE
        );
    }
}

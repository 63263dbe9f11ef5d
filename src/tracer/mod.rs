//! The supervisor core: launches the tracee, arms the limit watchers, drives
//! the trace loop and reduces everything to a single verdict.

mod error;
mod trace_loop;
mod watchers;

pub mod kill;

pub use self::error::{RunnerError, Violation};

use self::trace_loop::LoopOutcome;
use self::watchers::WatcherSet;
use crate::config::Config;
use crate::launch::{self, Credentials};
use crate::stats::StatsSink;
use crate::{affinity, procfs};

use std::sync::mpsc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::unistd::Pid;

/// The supervised process, fixed at launch.
#[derive(Debug, Clone, Copy)]
pub struct Tracee {
    pub pid: Pid,
    pub pgid: Pid,
}

/// Final outcome of a supervised run.
#[derive(Debug)]
pub struct Verdict {
    pub exit_code: i32,
    pub error: Option<RunnerError>,
}

/// Runs the tracee to completion under full supervision.
///
/// The caller's thread becomes the tracer and must not change for the whole
/// run; watchers live on their own threads and never trace.
pub fn run(cfg: &Config, credentials: Option<&Credentials>) -> Result<Verdict> {
    let tracee = launch::spawn(cfg, credentials)?;
    info!(
        "tracee started: {} (pid {}, pgid {})",
        cfg.process_path.display(),
        tracee.pid,
        tracee.pgid
    );

    let result = supervise(cfg, &tracee);
    if result.is_err() {
        // Even a failed setup must not leave a stopped tracee behind.
        kill::terminate(tracee.pid, tracee.pgid);
    }
    result
}

fn supervise(cfg: &Config, tracee: &Tracee) -> Result<Verdict> {
    let applied = affinity::apply(&cfg.affinity, tracee.pid)?;
    let cores = if applied.is_empty() {
        procfs::online_cpu_count().unwrap_or(1)
    } else {
        debug!("processor affinity set to {:?}", applied);
        applied.len()
    };

    let sink = match &cfg.stats_file {
        Some(path) => Some(
            StatsSink::create(path)
                .with_context(|| format!("unable to open statistics file {}", path.display()))?,
        ),
        None => None,
    };

    let (violations_tx, violations_rx) = mpsc::sync_channel(1);
    let watchers = WatcherSet::start(cfg, tracee, cores, sink, violations_tx)?;

    let outcome = trace_loop::drive(tracee, cfg);

    // Deterministic teardown regardless of how the loop ended: nothing in
    // the tracee's group survives, watchers are drained before assembly.
    kill::terminate(tracee.pid, tracee.pgid);
    watchers.stop();

    let pending = violations_rx.try_recv().ok();
    let verdict = assemble(outcome, pending, cfg.propagate_exit_code);
    match &verdict.error {
        Some(err) => warn!("process killed, cause: {}", err),
        None => debug!("tracee finished, exit code {}", verdict.exit_code),
    }
    Ok(verdict)
}

/// Merges the trace loop outcome with a watcher-reported violation.
/// Violations always win, even against a clean exit in the same instant.
fn assemble(
    outcome: Result<LoopOutcome, RunnerError>,
    pending: Option<Violation>,
    propagate_exit_code: bool,
) -> Verdict {
    if let Some(violation) = pending {
        return Verdict {
            exit_code: violation.exit_code(),
            error: Some(RunnerError::Violation(violation)),
        };
    }

    match outcome {
        Ok(LoopOutcome::Exited(code)) => {
            let exit_code = if !propagate_exit_code {
                0
            } else if code < 0 {
                1
            } else {
                code
            };
            Verdict {
                exit_code,
                error: None,
            }
        }
        Ok(LoopOutcome::Signaled(signal)) => Verdict {
            exit_code: 1,
            error: Some(RunnerError::TraceeSignaled(signal)),
        },
        Err(err) => Verdict {
            exit_code: err.exit_code(),
            error: Some(err),
        },
    }
}

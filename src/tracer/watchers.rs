//! Cooperative limit watchers running beside the trace loop.
//!
//! Each watcher owns its own stop receiver; dropping the senders fans the
//! stop signal out to all of them. `recv_timeout` doubles as the tick timer,
//! so a watcher notices the stop within one tick. The first watcher to catch
//! a violation wins the single-slot channel and triggers the group kill.

use super::error::Violation;
use super::{kill, Tracee};
use crate::config::Config;
use crate::human;
use crate::procfs;
use crate::stats::StatsSink;

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, warn};
use nix::unistd::Pid;

const POLL_TICK: Duration = Duration::from_millis(500);
const USAGE_TICK: Duration = Duration::from_secs(1);

enum Never {}

pub(super) struct WatcherSet {
    stop_txs: Vec<Sender<Never>>,
    handles: Vec<JoinHandle<()>>,
}

impl WatcherSet {
    pub(super) fn start(
        cfg: &Config,
        tracee: &Tracee,
        cores: usize,
        sink: Option<StatsSink>,
        violations: SyncSender<Violation>,
    ) -> Result<Self> {
        let mut set = WatcherSet {
            stop_txs: Vec::new(),
            handles: Vec::new(),
        };
        let pid = tracee.pid;
        let pgid = tracee.pgid;

        if let Some(limit) = cfg.real_time_limit() {
            let violations = violations.clone();
            set.spawn("real-time watcher", move |stop| {
                real_time(stop, limit, pid, pgid, &violations)
            })?;
        }

        if let Some(limit_ms) = cfg.cpu_time_limit_ms() {
            let violations = violations.clone();
            set.spawn("cpu-time watcher", move |stop| {
                cpu_time(stop, limit_ms, pid, pgid, &violations)
            })?;
        }

        if let Some(limit) = cfg.memory_limit_bytes() {
            let violations = violations.clone();
            set.spawn("memory watcher", move |stop| {
                memory(stop, limit, pid, pgid, &violations)
            })?;
        }

        // The usage sampler doubles as the idle enforcer and the statistics
        // writer, so it runs when either is wanted.
        let idle_limit = cfg.idle_limit_secs();
        if idle_limit.is_some() || sink.is_some() {
            let required_load = cfg.required_load;
            set.spawn("usage watcher", move |stop| {
                usage(stop, idle_limit, required_load, cores, pid, pgid, &violations, sink)
            })?;
        }

        Ok(set)
    }

    fn spawn(
        &mut self,
        name: &str,
        body: impl FnOnce(Receiver<Never>) + Send + 'static,
    ) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || body(rx))
            .with_context(|| format!("failed to spawn {}", name))?;
        self.stop_txs.push(tx);
        self.handles.push(handle);
        debug!("{} started", name);
        Ok(())
    }

    /// Closes the stop signal and drains every watcher.
    pub(super) fn stop(mut self) {
        self.stop_txs.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Ticks until the stop signal closes; `on_tick` returns `false` to end the
/// watcher early.
fn tick_loop(stop: &Receiver<Never>, tick: Duration, mut on_tick: impl FnMut() -> bool) {
    loop {
        match stop.recv_timeout(tick) {
            Err(RecvTimeoutError::Timeout) => {
                if !on_tick() {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
            Ok(never) => match never {},
        }
    }
}

fn fire(violations: &SyncSender<Violation>, violation: Violation, pid: Pid, pgid: Pid) {
    warn!("{}", violation);
    if violations.try_send(violation).is_err() {
        debug!("violation channel already occupied, dropping: {}", violation);
    }
    kill::terminate(pid, pgid);
}

/// Ends the sampling quietly once the tracee is gone; anything else is
/// reported but never enforced from here.
fn sample_failed(what: &str, err: &io::Error) {
    if err.kind() != io::ErrorKind::NotFound {
        warn!("failed to sample {}: {}", what, err);
    }
}

fn real_time(stop: Receiver<Never>, limit: Duration, pid: Pid, pgid: Pid, violations: &SyncSender<Violation>) {
    debug!("tracee will be terminated after {:?}", limit);
    match stop.recv_timeout(limit) {
        Err(RecvTimeoutError::Timeout) => fire(violations, Violation::RealTime, pid, pgid),
        Err(RecvTimeoutError::Disconnected) => {}
        Ok(never) => match never {},
    }
}

fn cpu_time(stop: Receiver<Never>, limit_ms: u64, pid: Pid, pgid: Pid, violations: &SyncSender<Violation>) {
    tick_loop(&stop, POLL_TICK, || match procfs::process_stats(pid) {
        Ok(stats) => {
            let consumed_ms = procfs::ticks_to_ms(stats.cpu_ticks);
            if consumed_ms >= limit_ms {
                fire(violations, Violation::CpuTime, pid, pgid);
                return false;
            }
            true
        }
        Err(err) => {
            sample_failed("cpu time", &err);
            false
        }
    })
}

fn memory(stop: Receiver<Never>, limit: u64, pid: Pid, pgid: Pid, violations: &SyncSender<Violation>) {
    tick_loop(&stop, POLL_TICK, || match procfs::process_rss_peak(pid) {
        Ok(peak) => {
            if peak >= limit {
                fire(violations, Violation::Memory, pid, pgid);
                return false;
            }
            true
        }
        Err(err) => {
            sample_failed("memory", &err);
            false
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn usage(
    stop: Receiver<Never>,
    idle_limit_secs: Option<u64>,
    required_load: f64,
    cores: usize,
    pid: Pid,
    pgid: Pid,
    violations: &SyncSender<Violation>,
    mut sink: Option<StatsSink>,
) {
    let mut prev_process = match procfs::process_stats(pid) {
        Ok(stats) => stats.cpu_ticks,
        Err(err) => return sample_failed("initial process time", &err),
    };
    let mut prev_total = match procfs::total_cpu_time() {
        Ok(total) => total,
        Err(err) => return sample_failed("initial total cpu time", &err),
    };

    debug!("tracee is using {} cpu cores", cores);

    let mut idle_streak = 0u64;
    let mut prev_bucket = -1i32;

    tick_loop(&stop, USAGE_TICK, || {
        let total = match procfs::total_cpu_time() {
            Ok(total) => total,
            Err(err) => {
                sample_failed("total cpu time", &err);
                return false;
            }
        };
        let process = match procfs::process_stats(pid) {
            Ok(stats) => stats.cpu_ticks,
            Err(err) => {
                sample_failed("process time", &err);
                return false;
            }
        };

        let total_delta = total.saturating_sub(prev_total);
        let process_delta = process.saturating_sub(prev_process);
        prev_total = total;
        prev_process = process;

        let load = if total_delta == 0 {
            0.0
        } else {
            ((cores as f64 * process_delta as f64) / total_delta as f64).clamp(0.0, 1.0)
        };
        let rss = procfs::process_rss_peak(pid).unwrap_or(0);

        let bucket = (load * 100.0) as i32;
        if bucket != prev_bucket {
            debug!("usage: load {} rss {}", human::load(load), human::memory(rss));
            prev_bucket = bucket;
        }

        if let Some(sink) = &mut sink {
            if let Err(err) = sink.append(load, rss) {
                warn!("failed to append statistics row: {}", err);
            }
        }

        if let Some(limit) = idle_limit_secs {
            if load < required_load {
                idle_streak += 1;
            } else {
                idle_streak = 0;
            }
            if idle_streak >= limit {
                fire(violations, Violation::Idle, pid, pgid);
                return false;
            }
        }

        true
    })
}

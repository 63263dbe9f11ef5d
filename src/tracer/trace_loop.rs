//! The central trace state machine: waits for any descendant, classifies the
//! stop, enforces the process-creation policy and continues the waited pid
//! with `PTRACE_SYSCALL`.

use super::error::{RunnerError, Violation};
use super::Tracee;
use crate::config::Config;
use crate::procfs;

use std::io;
use std::mem::MaybeUninit;

use log::debug;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

pub(super) enum LoopOutcome {
    Exited(i32),
    Signaled(Signal),
}

/// Drives the tracee (and every descendant discovered through trace events)
/// until the tracee ends, a policy is violated or a tracer error occurs.
///
/// Must be called from the thread that spawned the tracee: the kernel binds
/// the tracer role to that thread.
pub(super) fn drive(tracee: &Tracee, cfg: &Config) -> Result<LoopOutcome, RunnerError> {
    let tracee_pid = tracee.pid;

    let options = Options::PTRACE_O_TRACECLONE
        | Options::PTRACE_O_TRACEFORK
        | Options::PTRACE_O_TRACEVFORK
        | Options::PTRACE_O_TRACEVFORKDONE
        | Options::PTRACE_O_TRACEEXEC
        | Options::PTRACE_O_TRACEEXIT
        | Options::PTRACE_O_EXITKILL;

    ptrace::setoptions(tracee_pid, options)
        .map_err(|err| trace_error("ptrace::setoptions", tracee_pid, err))?;
    ptrace::syscall(tracee_pid, None)
        .map_err(|err| trace_error("ptrace::syscall", tracee_pid, err))?;

    let mut current = tracee_pid;
    let mut previous = Pid::from_raw(0);
    let mut level = 0i64;
    let mut iterations = 0i64;

    debug!("starting trace loop (max iterations: {})", cfg.max_iterations);

    loop {
        iterations += 1;
        if cfg.max_iterations > 0 && iterations > cfg.max_iterations {
            return Err(RunnerError::IterationsExhausted {
                limit: cfg.max_iterations,
            });
        }

        let (waited, status, rusage) = wait_any().map_err(|source| RunnerError::Wait {
            pid: current.as_raw(),
            source,
        })?;

        // The rusage returned with the wait status allows limit checks at
        // every stop, before the event is even classified.
        if let Some(limit) = cfg.memory_limit_bytes() {
            let max_rss = (rusage.ru_maxrss as u64).saturating_mul(1024);
            if max_rss >= limit {
                return Err(Violation::Memory.into());
            }
        }
        if let Some(limit_ms) = cfg.cpu_time_limit_ms() {
            let consumed_ms = timeval_ms(rusage.ru_utime) + timeval_ms(rusage.ru_stime);
            if consumed_ms >= limit_ms {
                return Err(Violation::CpuTime.into());
            }
        }

        if waited <= 0 {
            return Err(RunnerError::Tracer(format!("waited pid is {}", waited)));
        }
        let waited = Pid::from_raw(waited);

        if waited != current {
            previous = current;
            current = waited;
            level += 1;
            if log::log_enabled!(log::Level::Debug) {
                debug!(
                    "[{}] current process changed to {} ({}), previous {}, level {}",
                    iterations,
                    current,
                    procfs::process_command(current),
                    previous,
                    level
                );
            }
        }

        let wait_status = WaitStatus::from_raw(current, status)
            .map_err(|err| RunnerError::Tracer(format!("undecodable wait status {}: {}", status, err)))?;

        match wait_status {
            WaitStatus::Exited(pid, code) => {
                if pid == tracee_pid {
                    debug!("tracee exited with code {}", code);
                    return Ok(LoopOutcome::Exited(code));
                }
                debug!("child process {} exited with code {}", pid, code);
                continue;
            }
            WaitStatus::Signaled(pid, signal, _core_dumped) => {
                if pid == tracee_pid {
                    debug!("tracee was signaled: {}", signal);
                    return Ok(LoopOutcome::Signaled(signal));
                }
                debug!("child process {} was signaled: {}", pid, signal);
                continue;
            }
            WaitStatus::Stopped(_, Signal::SIGXCPU) => {
                return Err(Violation::CpuTime.into());
            }
            WaitStatus::Stopped(_, Signal::SIGSEGV) => {
                return Err(Violation::SegmentationFault.into());
            }
            WaitStatus::Stopped(pid, signal) => {
                debug!("[{}] process {} stopped by {}", iterations, pid, signal);
            }
            WaitStatus::PtraceEvent(pid, _, event) => {
                classify_event(pid, event, cfg, &mut level)?;
            }
            other => {
                debug!("[{}] unhandled wait status: {:?}", iterations, other);
            }
        }

        // Exactly one continuation per consumed wait, always for the pid the
        // loop advanced on, always with signal 0.
        ptrace::syscall(current, None)
            .map_err(|err| trace_error("ptrace::syscall", current, err))?;
    }
}

/// Process-creation policy and level bookkeeping for ptrace event stops.
/// Clone, fork, vfork and exec stops fire in the parent before the new child
/// runs, so forbidden creations are caught before they execute anything.
fn classify_event(
    pid: Pid,
    event: i32,
    cfg: &Config,
    level: &mut i64,
) -> Result<(), RunnerError> {
    match event {
        libc::PTRACE_EVENT_CLONE => {
            if !cfg.allow_multithreading {
                return Err(Violation::Cloning.into());
            }
            match ptrace::getevent(pid) {
                Ok(new_pid) => debug!("process {} cloned {}", pid, new_pid),
                Err(err) => debug!("unable to retrieve cloned pid: {}", err),
            }
        }
        libc::PTRACE_EVENT_FORK | libc::PTRACE_EVENT_VFORK | libc::PTRACE_EVENT_EXEC => {
            if !cfg.allow_create_processes {
                return Err(Violation::ProcessCreation.into());
            }
            match ptrace::getevent(pid) {
                Ok(message) => debug!("creation event {} from {}, message {}", event, pid, message),
                Err(err) => debug!("creation event {} from {} ({})", event, pid, err),
            }
        }
        libc::PTRACE_EVENT_VFORK_DONE => {
            debug!("vfork done event from {}", pid);
        }
        libc::PTRACE_EVENT_EXIT => {
            *level -= 1;
            debug!("exit event from {}, level {}", pid, level);
        }
        unknown => {
            debug!("unknown ptrace event {} from {}", unknown, pid);
        }
    }
    Ok(())
}

fn trace_error(op: &'static str, pid: Pid, source: nix::Error) -> RunnerError {
    RunnerError::Trace {
        op,
        pid: pid.as_raw(),
        command: procfs::process_command(pid),
        source,
    }
}

/// `wait4(-1, __WALL)` with the rusage of the waited child.
fn wait_any() -> io::Result<(libc::pid_t, i32, libc::rusage)> {
    let mut status = 0i32;
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();

    loop {
        let ret = unsafe { libc::wait4(-1, &mut status, libc::__WALL, rusage.as_mut_ptr()) };
        if ret >= 0 {
            return Ok((ret, status, unsafe { rusage.assume_init() }));
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            return Err(err);
        }
    }
}

fn timeval_ms(tv: libc::timeval) -> u64 {
    tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000
}

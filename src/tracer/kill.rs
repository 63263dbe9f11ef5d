//! Idempotent, group-wide termination of the tracee and its descendants.

use log::debug;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Kills the tracee, then its whole process group, then reaps whatever is
/// already dead. Safe to call any number of times, from any thread.
pub fn terminate(pid: Pid, pgid: Pid) {
    if let Err(err) = signal::kill(pid, Signal::SIGKILL) {
        debug!("killing tracee {}: {}", pid, err);
    }

    let group = Pid::from_raw(-pgid.as_raw());
    if let Err(err) = signal::kill(group, Signal::SIGKILL) {
        debug!("killing tracee group {}: {}", pgid, err);
    }

    // best-effort reap so no zombie outlives the runner
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::__WALL;
    loop {
        match waitpid(Pid::from_raw(-1), Some(flags)) {
            Ok(WaitStatus::StillAlive) | Err(_) => break,
            Ok(status) => debug!("reaped while terminating: {:?}", status),
        }
    }
}

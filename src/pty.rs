//! Pseudo-terminal re-login fallback: when the invoking user cannot change
//! credentials directly, the runner re-executes itself through
//! `/bin/su <user> -c ...` on a fresh pty, feeding the password on the
//! prompt. `su` only accepts a terminal, which is why a plain pipe won't do.

use crate::config::Config;
use crate::libc_call;

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result};
use log::debug;
use nix::fcntl::{self, OFlag};
use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sys::stat::Mode;
use nix::unistd;

/// Re-runs the current command line under `su` and returns its exit code.
pub fn relogin(cfg: &Config, user: &str) -> Result<i32> {
    let command = strip_credential_args(env::args());
    debug!("moving to a pseudo terminal: /bin/su {} -c {:?}", user, command);

    let master = posix_openpt(OFlag::O_RDWR).context("failed to open the pty master")?;
    grantpt(&master).context("failed to grant the pty slave")?;
    unlockpt(&master).context("failed to unlock the pty slave")?;
    let slave_path = ptsname_r(&master).context("failed to resolve the pty slave")?;

    let slave = fcntl::open(
        slave_path.as_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY,
        Mode::empty(),
    )
    .with_context(|| format!("failed to open the pty slave {}", slave_path))?;

    let mut child = {
        let mut cmd = Command::new("/bin/su");
        cmd.arg(user).arg("-c").arg(&command);
        cmd.stdin(unsafe { Stdio::from_raw_fd(dup(slave)?) });
        cmd.stdout(unsafe { Stdio::from_raw_fd(dup(slave)?) });
        cmd.stderr(unsafe { Stdio::from_raw_fd(dup(slave)?) });
        unsafe {
            cmd.pre_exec(|| {
                // Fresh session with the slave as the controlling terminal.
                libc_call(|| libc::setsid())?;
                libc_call(|| libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0))?;
                libc_call(|| libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL))?;
                Ok(())
            });
        }
        cmd.spawn().context("failed to spawn /bin/su")?
    };
    let _ = unistd::close(slave);

    let mut master = unsafe { File::from_raw_fd(master.into_raw_fd()) };

    // `su` asks for the password first; answer it before pumping output.
    let mut prompt = [0u8; 4096];
    let _ = master.read(&mut prompt)?;
    if let Some(password) = &cfg.password {
        writeln!(master, "{}", password).context("failed to enter the password")?;
    } else {
        writeln!(master).context("failed to answer the password prompt")?;
    }

    let quiet = cfg.quiet;
    let mut reader = master.try_clone().context("failed to clone the pty master")?;
    let pump = thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                // EIO ends the stream once the slave side is gone.
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if !quiet {
                        let _ = io::stdout().write_all(&buf[..n]);
                        let _ = io::stdout().flush();
                    }
                }
            }
        }
    });

    // Forward console input for interactive tracees. The thread ends with
    // the process; there is no way to interrupt a blocking stdin read.
    thread::spawn(move || {
        let mut stdin = io::stdin();
        let mut buf = [0u8; 4096];
        loop {
            match stdin.read(&mut buf) {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    if master.write_all(&buf[..n]).is_err() {
                        return;
                    }
                }
            }
        }
    });

    let status = child.wait().context("failed to wait for /bin/su")?;
    let _ = pump.join();

    Ok(status.code().unwrap_or(1))
}

/// The re-executed command line must not carry the credential flags again.
fn strip_credential_args(args: impl Iterator<Item = String>) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut skip_value = false;
    for arg in args {
        if skip_value {
            skip_value = false;
            continue;
        }
        match arg.as_str() {
            "-l" | "--login" | "-p" | "--password" => skip_value = true,
            _ => kept.push(arg),
        }
    }
    kept.join(" ")
}

/// Reads a raw fd duplicate for handing out to the child's stdio.
fn dup(fd: RawFd) -> Result<RawFd> {
    unistd::dup(fd).context("failed to duplicate the pty slave")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_flags_are_stripped_with_their_values() {
        let args = vec![
            "corral", "-t", "10s", "-l", "judge", "-p", "secret", "./solution",
        ];
        let command = strip_credential_args(args.into_iter().map(str::to_owned));
        assert_eq!(command, "corral -t 10s ./solution");
    }

    #[test]
    fn plain_command_lines_pass_through() {
        let args = vec!["corral", "-x", "/bin/true"];
        let command = strip_credential_args(args.into_iter().map(str::to_owned));
        assert_eq!(command, "corral -x /bin/true");
    }
}

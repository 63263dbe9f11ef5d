//! Forks and execs the tracee: fresh process group, ptrace enabled on the
//! first exec, parent-death signal, stream redirection, optional credential
//! downgrade. Returns once the initial exec stop has been delivered.

use crate::config::Config;
use crate::pipe::{self, PipeRx};
use crate::tracer::Tracee;
use crate::libc_call;

use std::convert::Infallible as Never;
use std::env;
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;
use nix::fcntl::{self, OFlag};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::stat::Mode;
use nix::sys::wait::WaitStatus;
use nix::unistd::{self, Gid, Pid, Uid, User};
use rlimit::Resource;

/// Target uid/gid of a credential downgrade, resolved before any fork.
#[derive(Debug, Clone, Copy)]
pub struct Credentials {
    pub uid: Uid,
    pub gid: Gid,
}

/// Name of the invoking user, as the environment reports it.
pub fn current_user_name() -> String {
    env::var("USER").unwrap_or_default()
}

/// Resolves a user name to its uid/gid.
pub fn lookup_user(name: &str) -> Result<Credentials> {
    let user = User::from_name(name)
        .with_context(|| format!("failed to look up user {:?}", name))?;
    match user {
        Some(user) => Ok(Credentials {
            uid: user.uid,
            gid: user.gid,
        }),
        None => bail!("unknown user: {}", name),
    }
}

/// Spawns the tracee and waits for its initial exec stop.
pub fn spawn(cfg: &Config, credentials: Option<&Credentials>) -> Result<Tracee> {
    let (pipe_tx, pipe_rx) = pipe::create()?;

    match unsafe { unistd::fork() }.context("failed to fork")? {
        unistd::ForkResult::Parent { child } => {
            drop(pipe_tx);
            wait_initial_stop(child, pipe_rx)?;

            let pgid = unistd::getpgid(Some(child))
                .with_context(|| format!("failed to read pgid of {}", child))?;
            debug!("tracee pgid is {}", pgid);

            Ok(Tracee { pid: child, pgid })
        }
        unistd::ForkResult::Child => {
            drop(pipe_rx);
            let err = match run_child(cfg, credentials) {
                Err(err) => err,
                Ok(never) => match never {},
            };
            let _ = pipe_tx.write_error(&err);
            unsafe { libc::_exit(101) }
        }
    }
}

/// The first wait must observe the exec SIGTRAP of the freshly traced child;
/// anything else means the launch went inconsistent.
fn wait_initial_stop(pid: Pid, pipe_rx: PipeRx) -> Result<()> {
    let mut status = 0i32;
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    libc_call(|| unsafe { libc::wait4(pid.as_raw(), &mut status, libc::__WALL, rusage.as_mut_ptr()) })
        .context("failed to wait for the initial stop")?;

    let wait_status = WaitStatus::from_raw(pid, status)
        .context("failed to decode the initial wait status")?;

    match wait_status {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {
            debug!("initial exec stop delivered for pid {}", pid);
            Ok(())
        }
        WaitStatus::Exited(_, code) => match pipe_rx.read_message()? {
            Some(message) => bail!("failed to launch tracee: {}", message),
            None => bail!("tracee exited with code {} before the initial trace stop", code),
        },
        other => bail!("unexpected initial wait status: {:?}", other),
    }
}

fn run_child(cfg: &Config, credentials: Option<&Credentials>) -> Result<Never> {
    unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)).context("failed to create process group")?;
    ptrace::traceme().context("failed to enable tracing")?;

    if let Some(ref stdin) = cfg.input_file {
        redirect_stdin(stdin).context("failed to redirect stdin")?;
    }
    if let Some(ref stdout) = cfg.output_file {
        redirect_stdout(stdout).context("failed to redirect stdout")?;
    }
    if let Some(ref stderr) = cfg.error_file {
        redirect_stderr(stderr).context("failed to redirect stderr")?;
    }

    if let Some(ref dir) = cfg.working_dir {
        unistd::chdir(dir.as_path())
            .with_context(|| format!("failed to enter working directory {}", dir.display()))?;
    }

    // Soft ceiling so the kernel raises SIGXCPU as the in-band backstop of
    // the cpu-time watcher.
    if let Some(limit_ms) = cfg.cpu_time_limit_ms() {
        let secs: u64 = (limit_ms + 999) / 1000;
        Resource::CPU.set(secs, secs).context("failed to set RLIMIT_CPU")?;
    }

    if let Some(credentials) = credentials {
        unistd::setgroups(&[credentials.gid]).context("failed to set groups")?;
        unistd::setgid(credentials.gid).context("failed to set gid")?;
        unistd::setuid(credentials.uid).context("failed to set uid")?;
    }

    // After the credential change: changing uids clears the setting.
    libc_call(|| unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) })
        .context("failed to set parent death signal")?;

    let bin = CString::new(cfg.process_path.as_os_str().as_bytes())
        .context("binary path contains a NUL byte")?;

    let base_name = cfg
        .process_path
        .file_name()
        .unwrap_or_else(|| cfg.process_path.as_os_str());
    let mut argv = Vec::with_capacity(cfg.process_args.len() + 1);
    argv.push(CString::new(base_name.as_bytes()).context("argv contains a NUL byte")?);
    for arg in &cfg.process_args {
        argv.push(CString::new(arg.as_bytes()).context("argv contains a NUL byte")?);
    }

    let mut envp = Vec::new();
    for var in cfg.effective_env() {
        envp.push(CString::new(var).context("environment contains a NUL byte")?);
    }

    unistd::execvpe(&bin, &argv, &envp)
        .with_context(|| format!("failed to exec {}", cfg.process_path.display()))?;
    unreachable!()
}

fn redirect_stdin(path: &Path) -> nix::Result<()> {
    let fd = fcntl::open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty())?;
    unistd::dup2(fd, libc::STDIN_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}

fn redirect_stdout(path: &Path) -> nix::Result<()> {
    let fd = fcntl::open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    unistd::dup2(fd, libc::STDOUT_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}

fn redirect_stderr(path: &Path) -> nix::Result<()> {
    let fd = fcntl::open(
        path,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::from_bits_truncate(0o644),
    )?;
    unistd::dup2(fd, libc::STDERR_FILENO)?;
    unistd::close(fd)?;
    Ok(())
}

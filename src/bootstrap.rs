//! Namespace entry for the supervisor: clones the tracer stage into fresh
//! UTS/IPC/PID/NET (and mount, user) namespaces, prepares the filesystem
//! view and hands over to the tracer core. Carries no policy of its own.

use crate::config::Config;
use crate::launch::Credentials;
use crate::tracer;

use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use log::{debug, error, warn};
use nix::mount::{self, MntFlags, MsFlags};
use nix::sched::{self, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{self, Uid};

const STACK_SIZE: usize = 1024 * 1024;
const SANDBOX_HOSTNAME: &str = "corral";

/// Runs the tracer core inside fresh namespaces and returns its exit code.
pub fn supervise(cfg: &Config, credentials: Option<&Credentials>) -> Result<i32> {
    let host_uid = unistd::getuid();
    let host_gid = unistd::getgid();

    let mut flags = CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC
        | CloneFlags::CLONE_NEWPID
        | CloneFlags::CLONE_NEWNET
        | CloneFlags::CLONE_NEWNS;

    // A credential downgrade needs the real root user; everything else runs
    // behind a single-mapping user namespace.
    let user_ns = credentials.is_none() && !Uid::effective().is_root();
    if user_ns {
        flags |= CloneFlags::CLONE_NEWUSER;
    }

    let (ready_rx, ready_tx) = unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
        .context("failed to create the network readiness pipe")?;

    let mut stack = vec![0u8; STACK_SIZE];
    let child = sched::clone(
        Box::new(|| stage(cfg, credentials, user_ns, host_uid.as_raw(), host_gid.as_raw(), ready_rx, ready_tx)),
        &mut stack,
        flags,
        Some(libc::SIGCHLD),
    )
    .context("failed to clone the supervisor stage")?;
    debug!("supervisor stage cloned as pid {}", child);

    let _ = unistd::close(ready_rx);

    if let Some(helper) = &cfg.netsetgo_path {
        match Command::new(helper)
            .arg("-pid")
            .arg(child.as_raw().to_string())
            .status()
        {
            Ok(status) if status.success() => debug!("network helper finished"),
            Ok(status) => warn!("network helper exited with {}", status),
            Err(err) => warn!("failed to run network helper {}: {}", helper.display(), err),
        }
    }

    let _ = unistd::write(ready_tx, &[1]);
    let _ = unistd::close(ready_tx);

    match waitpid(child, None).context("failed to wait for the supervisor stage")? {
        WaitStatus::Exited(_, code) => Ok(code),
        status => {
            warn!("supervisor stage ended abnormally: {:?}", status);
            Ok(1)
        }
    }
}

/// Entry point of the cloned stage: pid 1 of the new pid namespace.
fn stage(
    cfg: &Config,
    credentials: Option<&Credentials>,
    user_ns: bool,
    host_uid: libc::uid_t,
    host_gid: libc::gid_t,
    ready_rx: RawFd,
    ready_tx: RawFd,
) -> isize {
    let _ = unistd::close(ready_tx);
    match stage_inner(cfg, credentials, user_ns, host_uid, host_gid, ready_rx) {
        Ok(code) => code as isize,
        Err(err) => {
            error!("sandbox bootstrap failed: {:#}", err);
            1
        }
    }
}

fn stage_inner(
    cfg: &Config,
    credentials: Option<&Credentials>,
    user_ns: bool,
    host_uid: libc::uid_t,
    host_gid: libc::gid_t,
    ready_rx: RawFd,
) -> Result<i32> {
    if user_ns {
        write_id_maps(host_uid, host_gid)?;
    }

    unistd::sethostname(SANDBOX_HOSTNAME).context("failed to set hostname")?;

    // Mount changes must stay inside this namespace.
    mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make mounts private")?;

    if let Some(rootfs) = &cfg.rootfs {
        enter_rootfs(rootfs)?;
    }

    mount_proc()?;

    // Block until the parent reports that networking (if any) is up.
    let mut byte = [0u8; 1];
    let _ = unistd::read(ready_rx, &mut byte);
    let _ = unistd::close(ready_rx);

    let verdict = tracer::run(cfg, credentials)?;
    Ok(verdict.exit_code)
}

/// Single-entry uid/gid maps: the stage becomes root of its user namespace.
fn write_id_maps(host_uid: libc::uid_t, host_gid: libc::gid_t) -> Result<()> {
    fs::write("/proc/self/setgroups", "deny").context("failed to deny setgroups")?;
    fs::write("/proc/self/uid_map", format!("0 {} 1\n", host_uid))
        .context("failed to write uid_map")?;
    fs::write("/proc/self/gid_map", format!("0 {} 1\n", host_gid))
        .context("failed to write gid_map")?;
    Ok(())
}

/// Pivots into the configured root filesystem and detaches the old root.
fn enter_rootfs(rootfs: &Path) -> Result<()> {
    mount::mount(
        Some(rootfs),
        rootfs,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .with_context(|| format!("failed to bind mount rootfs {}", rootfs.display()))?;

    let old_root = rootfs.join(".old_root");
    if !old_root.exists() {
        fs::create_dir(&old_root).context("failed to create the old root mount point")?;
    }

    unistd::pivot_root(rootfs, &old_root).context("pivot_root failed")?;
    unistd::chdir("/").context("failed to enter the new root")?;

    mount::umount2("/.old_root", MntFlags::MNT_DETACH).context("failed to detach the old root")?;
    fs::remove_dir("/.old_root").context("failed to remove the old root mount point")?;

    debug!("pivoted into rootfs {}", rootfs.display());
    Ok(())
}

/// A fresh /proc matching the new pid namespace; the proc readers and the
/// tracee's own tooling rely on it.
fn mount_proc() -> Result<()> {
    fs::create_dir_all("/proc").context("failed to create /proc")?;
    mount::mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .context("failed to mount /proc")?;
    Ok(())
}

//! CLOEXEC pipe used to carry a pre-exec failure report from the forked
//! child back to the supervisor. A successful `execve` closes the write end
//! and the parent reads nothing.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::FromRawFd;

use anyhow::{Context, Result};
use nix::fcntl::OFlag;
use nix::unistd;

pub(crate) struct PipeTx(File);

pub(crate) struct PipeRx(File);

pub(crate) fn create() -> Result<(PipeTx, PipeRx)> {
    let (rx, tx) = unistd::pipe2(OFlag::O_CLOEXEC).context("failed to create pipe")?;
    unsafe { Ok((PipeTx(File::from_raw_fd(tx)), PipeRx(File::from_raw_fd(rx)))) }
}

impl PipeTx {
    pub(crate) fn write_error(mut self, err: &anyhow::Error) -> io::Result<()> {
        write!(self.0, "{:#}", err)
    }
}

impl PipeRx {
    /// Reads the child's failure report, `None` when the child exec'd.
    pub(crate) fn read_message(mut self) -> io::Result<Option<String>> {
        let mut message = String::new();
        self.0.read_to_string(&mut message)?;
        if message.is_empty() {
            Ok(None)
        } else {
            Ok(Some(message))
        }
    }
}

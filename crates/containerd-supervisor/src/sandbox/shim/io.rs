//! Opens the stdio paths of a process for the runtime to inherit.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd as _;
use std::os::unix::fs::{FileTypeExt as _, OpenOptionsExt as _};
use std::path::Path;

use nix::fcntl::{FcntlArg, OFlag, fcntl};

use crate::sandbox::Result;
use crate::sandbox::process_state::Stdio;
use crate::sandbox::runtime::Io;

/// Stdio files of the container process, plus what keeps a stdin fifo open.
pub struct StdioFiles {
    pub io: Io,
    /// Write end of the stdin fifo. The process sees EOF on stdin only once this is
    /// dropped and the client closed its own end.
    pub stdin_keepalive: Option<File>,
}

impl StdioFiles {
    pub fn open(stdio: &Stdio) -> Result<Self> {
        let (stdin, stdin_keepalive) = open_stdin(Path::new(&stdio.stdin))?;
        Ok(Self {
            io: Io {
                stdin: Some(stdin),
                stdout: Some(open_output(Path::new(&stdio.stdout))?),
                stderr: Some(open_output(Path::new(&stdio.stderr))?),
            },
            stdin_keepalive,
        })
    }
}

fn open_stdin(path: &Path) -> Result<(File, Option<File>)> {
    let is_fifo = std::fs::metadata(path)?.file_type().is_fifo();
    if !is_fifo {
        return Ok((File::open(path)?, None));
    }

    // a non-blocking open doesn't wait for the client to connect
    let reader = OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    fcntl(reader.as_raw_fd(), FcntlArg::F_SETFL(OFlag::empty()))?;
    let keepalive = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    Ok((reader, Some(keepalive)))
}

fn open_output(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .append(true)
        .open(path)?)
}

//! The `exit` and `control` named pipes shared by the supervisor and a shim.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read as _, Write as _};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;
use std::str::FromStr;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use tokio::io::unix::AsyncFd;

use crate::sandbox::{Error, Result};

pub const EXIT_FIFO: &str = "exit";
pub const CONTROL_FIFO: &str = "control";

/// The supervisor's ends of both pipes.
pub struct ControlPipes {
    pub exit: ExitPipe,
    pub control: ControlPipe,
}

impl ControlPipes {
    /// Creates both fifos in `dir` and opens them.
    pub fn create(dir: &Path) -> Result<Self> {
        for name in [EXIT_FIFO, CONTROL_FIFO] {
            mkfifo(&dir.join(name), Mode::S_IRWXU)
                .map_err(|err| Error::Others(format!("mkfifo {name}: {err}")))?;
        }
        Self::open(dir)
    }

    /// Opens the existing fifos in `dir`, both non-blocking.
    pub fn open(dir: &Path) -> Result<Self> {
        let exit = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(dir.join(EXIT_FIFO))?;
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(dir.join(CONTROL_FIFO))?;
        Ok(Self {
            exit: ExitPipe {
                fd: AsyncFd::new(exit)?,
            },
            control: ControlPipe { file: control },
        })
    }
}

/// Read end of the `exit` fifo. The shim holds the only write end.
pub struct ExitPipe {
    fd: AsyncFd<File>,
}

impl ExitPipe {
    /// Resolves once every writer has closed the pipe, i.e. the shim has exited.
    ///
    /// The kernel does not report a hang-up on a fifo that was opened before any writer
    /// connected, so this does not resolve early for a shim that has not started yet.
    pub async fn closed(&self) -> std::io::Result<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            if guard.ready().is_read_closed() {
                return Ok(());
            }
            let res = guard.try_io(|fd| {
                let mut buf = [0u8; 64];
                (&*fd.get_ref()).read(&mut buf)
            });
            match res {
                Ok(Ok(0)) => return Ok(()),
                Ok(Ok(_)) => continue,
                Ok(Err(err)) if err.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Supervisor side of the `control` fifo.
pub struct ControlPipe {
    file: File,
}

impl ControlPipe {
    pub fn send(&self, msg: ControlMessage) -> std::io::Result<()> {
        (&self.file).write_all(msg.to_string().as_bytes())
    }
}

/// Commands the supervisor can send to a running shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    CloseStdin,
    Resize { width: u32, height: u32 },
}

impl fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMessage::CloseStdin => writeln!(f, "0 0 0"),
            ControlMessage::Resize { width, height } => writeln!(f, "1 {width} {height}"),
        }
    }
}

impl FromStr for ControlMessage {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid control message {line:?}"));
        let fields = line
            .split_whitespace()
            .map(|f| f.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| invalid())?;
        match fields[..] {
            [0, _, _] => Ok(ControlMessage::CloseStdin),
            [1, width, height] => Ok(ControlMessage::Resize { width, height }),
            _ => Err(invalid()),
        }
    }
}

/// Shim side: opens the write end of the `exit` fifo. Blocks until the supervisor holds the read end.
pub fn open_exit_writer(dir: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).open(dir.join(EXIT_FIFO))
}

/// Shim side: opens the `control` fifo for reading. Opened read/write so it never reports EOF.
pub fn open_control_reader(dir: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(dir.join(CONTROL_FIFO))
}

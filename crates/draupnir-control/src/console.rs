//! Local console input for the Control role.
//!
//! Standard input is duplicated and switched to non-blocking mode for as
//! long as the [`ConsoleInput`] lives; the original flags are put back on
//! drop. An interactive terminal is also switched to raw mode so keystrokes
//! reach the remote shell one by one.
//!
//! On a terminal, stdin and stdout usually share one open file description,
//! so stdout turns non-blocking too. [`ConsoleOutput`] writes through
//! [`write_fully`] and waits for the terminal instead of failing.

use std::fs::File;
use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use crossterm::terminal;
use draupnir_core::io::{restore_flags, set_nonblocking, write_fully};
use draupnir_core::{DraupnirError, DraupnirResult};
use nix::fcntl::OFlag;
use tracing::{debug, warn};

/// Restores cooked mode on drop.
#[derive(Debug)]
pub struct RawModeGuard {
    _private: (),
}

impl RawModeGuard {
    pub fn enter() -> DraupnirResult<Self> {
        terminal::enable_raw_mode()
            .map_err(|e| DraupnirError::Config(format!("failed to enable raw terminal mode: {e}")))?;
        Ok(Self { _private: () })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = terminal::disable_raw_mode() {
            warn!(error = %e, "failed to restore terminal mode");
        }
    }
}

/// Non-blocking view of standard input.
#[derive(Debug)]
pub struct ConsoleInput {
    file: File,
    saved_flags: OFlag,
    _raw: Option<RawModeGuard>,
}

impl ConsoleInput {
    /// Take over standard input. Raw mode is only entered when `raw_mode` is
    /// set and stdin is a terminal.
    pub fn stdin(raw_mode: bool) -> DraupnirResult<Self> {
        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        let file = File::from(stdin.as_fd().try_clone_to_owned()?);
        let raw = if raw_mode && interactive {
            Some(RawModeGuard::enter()?)
        } else {
            None
        };
        Self::from_file(file, raw)
    }

    /// Use `file` as the console, without touching terminal modes.
    pub fn from_file(file: File, raw: Option<RawModeGuard>) -> DraupnirResult<Self> {
        let saved_flags = set_nonblocking(file.as_raw_fd())?;
        debug!(raw_mode = raw.is_some(), "console input attached");
        Ok(Self {
            file,
            saved_flags,
            _raw: raw,
        })
    }
}

impl Read for ConsoleInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl AsRawFd for ConsoleInput {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for ConsoleInput {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

impl Drop for ConsoleInput {
    fn drop(&mut self) {
        if let Err(e) = restore_flags(self.file.as_raw_fd(), self.saved_flags) {
            warn!(error = %e, "failed to restore console flags");
        }
    }
}

/// Unbuffered standard output that tolerates a non-blocking descriptor.
#[derive(Debug)]
pub struct ConsoleOutput {
    file: File,
}

impl ConsoleOutput {
    pub fn stdout() -> DraupnirResult<Self> {
        let file = File::from(io::stdout().as_fd().try_clone_to_owned()?);
        Ok(Self::from_file(file))
    }

    pub fn from_file(file: File) -> Self {
        Self { file }
    }
}

impl Write for ConsoleOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        write_fully(&mut self.file, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl AsFd for ConsoleOutput {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

//! Shell processes bound to a pseudo-terminal.
//!
//! Launching happens in two steps so the session can report the terminal
//! device in its banner before the shell starts: [`ShellLauncher::allocate`]
//! opens the PTY pair, [`ShellLauncher::spawn`] starts the child on the slave
//! side. The child becomes a session leader with the slave as its controlling
//! terminal; the parent keeps only the master.

use std::fs::File;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::{Path, PathBuf};

use draupnir_core::io::set_nonblocking;
use draupnir_core::{DraupnirError, DraupnirResult};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtyPair, PtySize};
use tracing::{debug, info, warn};

use crate::config::ShellConfig;

/// Starts a process attached to a terminal slave.
pub trait ShellLauncher {
    /// Open a new PTY pair.
    fn allocate(&self) -> DraupnirResult<PtyPair>;

    /// Start the shell on the slave side of `pair`; the slave is released
    /// in this process once the child holds it.
    fn spawn(&self, pair: PtyPair) -> DraupnirResult<ShellProcess>;
}

/// Launches the configured shell through the platform PTY system.
#[derive(Debug, Clone, Default)]
pub struct PtyShellLauncher {
    config: ShellConfig,
}

impl PtyShellLauncher {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }
}

impl ShellLauncher for PtyShellLauncher {
    fn allocate(&self) -> DraupnirResult<PtyPair> {
        let size = PtySize {
            rows: self.config.rows,
            cols: self.config.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        native_pty_system()
            .openpty(size)
            .map_err(|e| DraupnirError::Process(format!("failed to open PTY: {e}")))
    }

    fn spawn(&self, pair: PtyPair) -> DraupnirResult<ShellProcess> {
        let program = self.config.resolve_program();
        let mut cmd = CommandBuilder::new(&program);
        cmd.env("TERM", &self.config.term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| DraupnirError::Process(format!("failed to spawn {program}: {e}")))?;
        drop(pair.slave);

        let process = ShellProcess::attach(pair.master, child)?;
        info!(
            shell = %program,
            pid = ?process.pid(),
            cols = self.config.cols,
            rows = self.config.rows,
            "shell spawned"
        );
        Ok(process)
    }
}

/// A running shell and the master side of its terminal.
pub struct ShellProcess {
    /// Kept alive so the terminal stays open for the child.
    _master: Box<dyn MasterPty + Send>,
    io: File,
    child: Box<dyn Child + Send + Sync>,
    tty_path: Option<PathBuf>,
    reaped: bool,
}

impl ShellProcess {
    fn attach(
        master: Box<dyn MasterPty + Send>,
        child: Box<dyn Child + Send + Sync>,
    ) -> DraupnirResult<Self> {
        let fd = master
            .as_raw_fd()
            .ok_or_else(|| DraupnirError::Process("PTY master has no descriptor".into()))?;
        // SAFETY: `fd` belongs to `master`, which outlives this borrow.
        let io = File::from(unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned()?);
        set_nonblocking(io.as_raw_fd())?;
        let tty_path = master.tty_name();
        Ok(Self {
            _master: master,
            io,
            child,
            tty_path,
            reaped: false,
        })
    }

    /// Descriptor registered with the readiness multiplexer.
    pub fn raw_fd(&self) -> RawFd {
        self.io.as_raw_fd()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.process_id()
    }

    pub fn tty_path(&self) -> Option<&Path> {
        self.tty_path.as_deref()
    }

    /// Non-blocking handle for reading shell output.
    pub fn output(&mut self) -> &mut File {
        &mut self.io
    }

    /// A second non-blocking handle for writing keystrokes.
    pub fn input(&self) -> DraupnirResult<File> {
        Ok(self.io.try_clone()?)
    }

    /// Stop the shell and reap it. Safe to call more than once.
    pub fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        self.reaped = true;

        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(pid = ?self.pid(), exit_code = status.exit_code(), "shell already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "failed to query shell status"),
        }

        // Hangup first, escalating to a hard kill if the shell lingers.
        if let Err(e) = self.child.kill() {
            debug!(error = %e, "failed to signal shell");
        }
        match self.child.wait() {
            Ok(status) => info!(pid = ?self.pid(), exit_code = status.exit_code(), "shell reaped"),
            Err(e) => warn!(error = %e, "failed to reap shell"),
        }
    }
}

impl Drop for ShellProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for ShellProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShellProcess")
            .field("fd", &self.io.as_raw_fd())
            .field("pid", &self.pid())
            .field("tty_path", &self.tty_path)
            .finish()
    }
}

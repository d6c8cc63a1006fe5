//! Non-blocking I/O helpers shared by both roles.
//!
//! Every handle in the event loop is registered edge-triggered, so a
//! readiness notification fires once per transition. Readers must keep
//! reading until the handle reports `WouldBlock` or end-of-stream; a single
//! read per notification loses data.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

/// Size of the scratch buffer used when draining a handle.
pub const READ_CHUNK: usize = 16 * 1024;

/// Result of one non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were read into the buffer.
    Data(usize),
    /// Nothing more to read until the next readiness notification.
    Drained,
    /// The other side closed the stream.
    Closed,
}

/// How a full drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainEnd {
    Drained,
    Closed,
}

/// Read once, retrying on `EINTR` and mapping `EAGAIN` to [`ReadOutcome::Drained`].
pub fn read_nonblocking<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(ReadOutcome::Closed),
            Ok(n) => return Ok(ReadOutcome::Data(n)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadOutcome::Drained),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Read everything currently buffered on `reader`, handing each chunk to `sink`.
pub fn drain<R, F, E>(reader: &mut R, buf: &mut [u8], mut sink: F) -> Result<DrainEnd, E>
where
    R: Read + ?Sized,
    F: FnMut(&[u8]) -> Result<(), E>,
    E: From<io::Error>,
{
    loop {
        match read_nonblocking(reader, buf)? {
            ReadOutcome::Data(n) => sink(&buf[..n])?,
            ReadOutcome::Drained => return Ok(DrainEnd::Drained),
            ReadOutcome::Closed => return Ok(DrainEnd::Closed),
        }
    }
}

/// Write all of `data` to a non-blocking handle.
///
/// `EINTR` is retried immediately. `EAGAIN` parks the caller in `poll(2)`
/// until the handle is writable again, so a slow peer stalls the calling
/// loop. Any other error, including a zero-length write, is returned.
pub fn write_fully<W: Write + AsFd>(writer: &mut W, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        match writer.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "handle stopped accepting data",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => wait_writable(writer.as_fd())?,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn wait_writable(fd: BorrowedFd<'_>) -> io::Result<()> {
    let mut fds = [PollFd::new(fd, PollFlags::POLLOUT)];
    match poll(&mut fds, PollTimeout::NONE) {
        Ok(_) | Err(Errno::EINTR) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Set `O_NONBLOCK` on `fd`, returning the flags it had before.
pub fn set_nonblocking(fd: RawFd) -> io::Result<OFlag> {
    let previous = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(previous | OFlag::O_NONBLOCK))?;
    Ok(previous)
}

/// Restore file status flags saved by [`set_nonblocking`].
pub fn restore_flags(fd: RawFd, flags: OFlag) -> io::Result<()> {
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

/// Linux reports a PTY master whose slave side is gone as `EIO`, not EOF.
pub fn is_terminal_hangup(e: &io::Error) -> bool {
    e.raw_os_error() == Some(Errno::EIO as i32)
}

//! Event loop of the Control role.
//!
//! A single session: the network socket carries TLS records both ways, the
//! console supplies keystrokes, and decrypted output goes to the local
//! writer. The console is only watched once the channel is Active.
//!
//! When console input ends the session stays open until the Target has been
//! quiet for [`LINGER`], so output of piped commands still comes back.

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use draupnir_core::io::{read_nonblocking, write_fully, ReadOutcome, READ_CHUNK};
use draupnir_core::tls::{TlsCallbacks, TlsChannel};
use draupnir_core::{CredentialStore, DraupnirError, DraupnirResult};
use mio::net::TcpStream;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use nix::errno::Errno;
use rustls::pki_types::ServerName;
use tracing::{debug, info, warn, Span};

use crate::config::ControlConfig;

const NETWORK: Token = Token(0);
const CONSOLE: Token = Token(1);

/// Ctrl-] on the console ends the session locally.
pub const ESCAPE_BYTE: u8 = 0x1d;

/// Quiet period after console EOF before close-notify is sent.
pub const LINGER: Duration = Duration::from_millis(500);

struct ControlLink<O> {
    socket: TcpStream,
    output: O,
}

impl<O: Write> TlsCallbacks for ControlLink<O> {
    fn emit_data(&mut self, data: &[u8]) -> DraupnirResult<()> {
        write_fully(&mut self.socket, data)?;
        Ok(())
    }

    fn record_received(&mut self, data: &[u8]) -> DraupnirResult<()> {
        self.output.write_all(data)?;
        self.output.flush()?;
        Ok(())
    }

    fn session_activated(&mut self) {
        info!("session activated");
    }
}

pub struct ControlConductor<I, O> {
    poll: Poll,
    events: Events,
    channel: TlsChannel<ControlLink<O>>,
    input: I,
    console: ConsoleWatch,
    /// Set once console input ended; pushed back by every network read.
    linger_until: Option<Instant>,
    peer: SocketAddr,
    span: Span,
}

/// How the console is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConsoleWatch {
    /// Not yet registered; waiting for the channel to become Active.
    Pending,
    Registered,
    /// The handle cannot be polled (a regular file); it was drained in full.
    Unpollable,
    /// End of input reached.
    Closed,
}

impl<I: Read + AsRawFd, O: Write> ControlConductor<I, O> {
    /// Connect to the Target and start the handshake.
    pub fn connect(
        config: &ControlConfig,
        credentials: &CredentialStore,
        input: I,
        output: O,
        span: Span,
    ) -> DraupnirResult<Self> {
        let entered = span.enter();
        let client_config = credentials.client_config(&config.tls)?;
        let server_name = ServerName::try_from(config.tls.server_name.clone()).map_err(|e| {
            DraupnirError::Config(format!("invalid server name {:?}: {e}", config.tls.server_name))
        })?;

        let mut socket = connect_socket(&config.peer)?;
        let peer = socket.peer_addr()?;
        info!(target_addr = %config.target, %peer, "connected");

        let poll = Poll::new().map_err(|e| {
            DraupnirError::Socket(format!("cannot create readiness multiplexer: {e}"))
        })?;
        poll.registry()
            .register(&mut socket, NETWORK, Interest::READABLE)
            .map_err(|e| DraupnirError::Socket(format!("cannot register connection: {e}")))?;

        let channel = TlsChannel::client(client_config, server_name, ControlLink { socket, output })?;
        drop(entered);

        Ok(Self {
            poll,
            events: Events::with_capacity(16),
            channel,
            input,
            console: ConsoleWatch::Pending,
            linger_until: None,
            peer,
            span,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.channel.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.channel.is_closed()
    }

    /// Everything the Target sent so far, as written to the output.
    pub fn output(&self) -> &O {
        &self.channel.callbacks().output
    }

    /// Relay until the channel is Closed.
    pub fn run(&mut self) -> DraupnirResult<()> {
        while !self.channel.is_closed() {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Handle one batch of readiness events.
    pub fn turn(&mut self, timeout: Option<Duration>) -> DraupnirResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        let timeout = match self.linger_until {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(remaining, |t| t.min(remaining)))
            }
            None => timeout,
        };
        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(DraupnirError::Socket(format!("readiness wait failed: {e}")));
        }

        let batch: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_error()))
            .collect();
        for (token, error) in batch {
            match token {
                NETWORK => self.on_network_ready(error)?,
                CONSOLE => self.on_console_ready()?,
                _ => {}
            }
            if self.channel.is_closed() {
                return Ok(());
            }
        }

        if self.console == ConsoleWatch::Pending && self.channel.is_active() {
            self.watch_console()?;
        }
        if self.linger_until.is_some_and(|deadline| Instant::now() >= deadline) {
            debug!("target went quiet after console input ended");
            self.linger_until = None;
            return self.channel.close();
        }
        Ok(())
    }

    fn on_network_ready(&mut self, error: bool) -> DraupnirResult<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read_nonblocking(&mut self.channel.callbacks_mut().socket, &mut buf)? {
                ReadOutcome::Data(n) => {
                    if let Some(deadline) = self.linger_until.as_mut() {
                        *deadline = Instant::now() + LINGER;
                    }
                    self.channel.received_data(&buf[..n])?;
                    if self.channel.is_closed() {
                        info!("target closed the session");
                        return Ok(());
                    }
                }
                ReadOutcome::Drained => break,
                ReadOutcome::Closed => {
                    info!("target hung up");
                    self.channel.abort();
                    return Ok(());
                }
            }
        }

        if error {
            let cause = self.channel.callbacks().socket.take_error()?;
            return Err(DraupnirError::Socket(format!(
                "connection failed: {}",
                cause.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
            )));
        }
        Ok(())
    }

    fn on_console_ready(&mut self) -> DraupnirResult<()> {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read_nonblocking(&mut self.input, &mut buf)? {
                ReadOutcome::Data(n) => {
                    let chunk = &buf[..n];
                    if let Some(pos) = chunk.iter().position(|&b| b == ESCAPE_BYTE) {
                        if pos > 0 {
                            self.channel.send(&chunk[..pos])?;
                        }
                        info!("escape received, closing the session");
                        return self.channel.close();
                    }
                    self.channel.send(chunk)?;
                }
                ReadOutcome::Drained => return Ok(()),
                ReadOutcome::Closed => {
                    debug!("console input ended");
                    self.unwatch_console();
                    self.linger_until = Some(Instant::now() + LINGER);
                    return Ok(());
                }
            }
        }
    }

    fn watch_console(&mut self) -> DraupnirResult<()> {
        let fd = self.input.as_raw_fd();
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), CONSOLE, Interest::READABLE)
        {
            Ok(()) => {
                self.console = ConsoleWatch::Registered;
                Ok(())
            }
            // epoll refuses regular files; they never block, so read them through now.
            Err(e) if e.raw_os_error() == Some(Errno::EPERM as i32) => {
                debug!("console input cannot be polled, reading it directly");
                self.console = ConsoleWatch::Unpollable;
                self.on_console_ready()
            }
            Err(e) => Err(DraupnirError::Socket(format!("cannot register console: {e}"))),
        }
    }

    fn unwatch_console(&mut self) {
        if self.console == ConsoleWatch::Registered {
            let fd = self.input.as_raw_fd();
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!(error = %e, "console already gone from the multiplexer");
            }
        }
        self.console = ConsoleWatch::Closed;
    }
}

/// Open a non-blocking connection to the first reachable address.
pub fn connect_socket(addrs: &[SocketAddr]) -> DraupnirResult<TcpStream> {
    let mut last_error = None;
    for addr in addrs {
        match connect_one(*addr) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                warn!(%addr, error = %e, "connect failed");
                last_error = Some(format!("cannot connect to {addr}: {e}"));
            }
        }
    }
    Err(DraupnirError::Socket(
        last_error.unwrap_or_else(|| "no peer address configured".to_string()),
    ))
}

/// Start a non-blocking connect and wait once for it to complete.
fn connect_one(addr: SocketAddr) -> std::io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1);
    poll.registry()
        .register(&mut stream, NETWORK, Interest::WRITABLE)?;
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) if !events.is_empty() => break,
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    poll.registry().deregister(&mut stream)?;

    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    // Fails with ENOTCONN when the connect was refused without a pending error.
    stream.peer_addr()?;
    Ok(stream)
}

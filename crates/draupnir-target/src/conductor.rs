//! Event loop of the Target role.
//!
//! One thread, one readiness multiplexer. Every handle is registered
//! edge-triggered, so each notification is drained to `WouldBlock` before the
//! loop waits again. Each session owns up to two registrations: its socket
//! and, once the shell runs, its terminal master.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use draupnir_core::{CredentialStore, DraupnirError, DraupnirResult};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustls::ServerConfig;
use tracing::{debug, info, info_span, trace, warn, Span};

use crate::config::TargetConfig;
use crate::session::{SessionUpdate, TargetSession};
use crate::shell::{PtyShellLauncher, ShellLauncher};

const LISTENER: Token = Token(0);
const EVENT_CAPACITY: usize = 256;

/// Which handle of a session became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Network,
    Terminal,
}

/// Snapshot of one readiness event, detached from the event buffer.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    hangup: bool,
    error: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            hangup: event.is_read_closed() || event.is_write_closed(),
            error: event.is_error(),
        }
    }
}

pub struct TargetConductor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    server_config: Arc<ServerConfig>,
    launcher: Rc<dyn ShellLauncher>,
    /// Live sessions keyed by their socket's token.
    sessions: HashMap<Token, TargetSession>,
    /// Readiness token -> (owning session, handle kind).
    registry: HashMap<Token, (Token, Route)>,
    next_token: usize,
    span: Span,
}

impl TargetConductor {
    /// Bind, listen and register the listening socket.
    pub fn start(
        config: &TargetConfig,
        credentials: &CredentialStore,
        span: Span,
    ) -> DraupnirResult<Self> {
        let launcher = Rc::new(PtyShellLauncher::new(config.shell.clone()));
        Self::with_launcher(config, credentials, launcher, span)
    }

    pub fn with_launcher(
        config: &TargetConfig,
        credentials: &CredentialStore,
        launcher: Rc<dyn ShellLauncher>,
        span: Span,
    ) -> DraupnirResult<Self> {
        let server_config = credentials.server_config(&config.tls)?;
        let poll = Poll::new().map_err(|e| {
            DraupnirError::Socket(format!("cannot create readiness multiplexer: {e}"))
        })?;

        let mut listener = bind_first(&config.listen)?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(|e| DraupnirError::Socket(format!("cannot register listener: {e}")))?;

        {
            let _enter = span.enter();
            match listener.local_addr() {
                Ok(addr) => info!(%addr, "listening"),
                Err(e) => debug!(error = %e, "listening on an unknown address"),
            }
        }

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            server_config,
            launcher,
            sessions: HashMap::new(),
            registry: HashMap::new(),
            next_token: 1,
            span,
        })
    }

    pub fn local_addr(&self) -> DraupnirResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Handles registered on behalf of sessions (sockets and terminals).
    pub fn registration_count(&self) -> usize {
        self.registry.len()
    }

    /// Serve until a conductor-level failure.
    pub fn run(&mut self) -> DraupnirResult<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// Wait for one batch of readiness events and handle all of them.
    pub fn turn(&mut self, timeout: Option<Duration>) -> DraupnirResult<()> {
        let span = self.span.clone();
        let _enter = span.enter();

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(DraupnirError::Socket(format!("readiness wait failed: {e}")));
        }

        let batch: Vec<Readiness> = self.events.iter().map(Readiness::from).collect();
        for ready in batch {
            self.dispatch(ready)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, ready: Readiness) -> DraupnirResult<()> {
        if ready.token == LISTENER {
            if ready.error {
                let cause = self.listener.take_error().ok().flatten();
                return Err(DraupnirError::Socket(format!(
                    "listening socket failed: {}",
                    cause.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
                )));
            }
            return self.accept_connections();
        }

        let Some(&(key, route)) = self.registry.get(&ready.token) else {
            trace!(token = ?ready.token, "readiness for a retired handle");
            return Ok(());
        };
        let Some(session) = self.sessions.get_mut(&key) else {
            return Ok(());
        };

        let update = match route {
            Route::Network => session.on_network_ready(),
            Route::Terminal => session.on_terminal_ready(),
        };
        match update {
            SessionUpdate::ShellStarted => self.activate_session(key),
            SessionUpdate::Finished => self.teardown(key),
            SessionUpdate::Idle if ready.error || ready.hangup => {
                debug!(token = ?ready.token, ?route, "handle reported hangup");
                self.teardown(key);
            }
            SessionUpdate::Idle => {}
        }
        Ok(())
    }

    /// Accept every pending connection; the listener only signals once per burst.
    fn accept_connections(&mut self) -> DraupnirResult<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = self.admit(stream) {
                        warn!(peer = %addr, error = %e, "failed to set up session");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if matches!(e.kind(), ErrorKind::Interrupted | ErrorKind::ConnectionAborted) => {
                    debug!(error = %e, "transient accept failure");
                }
                Err(e) => return Err(DraupnirError::Socket(format!("accept failed: {e}"))),
            }
        }
    }

    fn admit(&mut self, stream: TcpStream) -> DraupnirResult<()> {
        let peer = match stream.peer_addr() {
            Ok(addr) => Some(addr),
            Err(e) => {
                debug!(error = %e, "peer address unavailable");
                None
            }
        };

        let key = self.allocate_tokens();
        let span = info_span!(parent: &self.span, "session", id = key.0, peer = ?peer);
        let mut session = TargetSession::new(
            stream,
            peer,
            self.server_config.clone(),
            self.launcher.clone(),
            span,
        )?;
        self.poll
            .registry()
            .register(session.socket_mut(), key, Interest::READABLE)
            .map_err(|e| DraupnirError::Socket(format!("cannot register connection: {e}")))?;

        self.registry.insert(key, (key, Route::Network));
        self.sessions.insert(key, session);
        info!(peer = ?peer, sessions = self.sessions.len(), "connection accepted");
        Ok(())
    }

    /// Register a session's terminal once its shell is running.
    fn activate_session(&mut self, key: Token) {
        let Some(fd) = self.sessions.get(&key).and_then(TargetSession::terminal_fd) else {
            return;
        };
        let token = terminal_token(key);
        match self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            Ok(()) => {
                self.registry.insert(token, (key, Route::Terminal));
                debug!(token = ?token, "terminal registered");
            }
            Err(e) => {
                warn!(error = %e, "cannot register terminal");
                self.teardown(key);
            }
        }
    }

    /// Deregister and drop a session. Runs at most once per session.
    fn teardown(&mut self, key: Token) {
        let Some(mut session) = self.sessions.remove(&key) else {
            return;
        };

        self.registry.remove(&key);
        if let Err(e) = self.poll.registry().deregister(session.socket_mut()) {
            debug!(error = %e, "socket already gone from the multiplexer");
        }
        if self.registry.remove(&terminal_token(key)).is_some() {
            if let Some(fd) = session.terminal_fd() {
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    debug!(error = %e, "terminal already gone from the multiplexer");
                }
            }
        }

        session.close();
        let peer = session.peer();
        drop(session);
        info!(peer = ?peer, sessions = self.sessions.len(), "session torn down");
    }

    /// Reserve a token pair: the returned one for the socket, the next for the terminal.
    fn allocate_tokens(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 2;
        token
    }
}

fn terminal_token(key: Token) -> Token {
    Token(key.0 + 1)
}

fn bind_first(addrs: &[SocketAddr]) -> DraupnirResult<TcpListener> {
    let mut last_error = None;
    for addr in addrs {
        match TcpListener::bind(*addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!(%addr, error = %e, "bind failed");
                last_error = Some(format!("cannot listen on {addr}: {e}"));
            }
        }
    }
    Err(DraupnirError::Socket(
        last_error.unwrap_or_else(|| "no listen address configured".to_string()),
    ))
}

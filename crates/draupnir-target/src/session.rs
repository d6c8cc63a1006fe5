//! Per-connection state machine on the Target side.
//!
//! ```text
//! Handshaking --activated--> Active --shell spawned--> ShellRunning
//!      |                       |                            |
//!      +-----------------------+----------------------------+--> Closed
//! ```
//!
//! Every failure is contained here: the session closes itself and reports
//! [`SessionUpdate::Finished`] so the conductor can tear it down while other
//! sessions keep running.

use std::fs::File;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use draupnir_core::io::{is_terminal_hangup, read_nonblocking, write_fully, ReadOutcome, READ_CHUNK};
use draupnir_core::tls::{TlsCallbacks, TlsChannel};
use draupnir_core::DraupnirResult;
use mio::net::TcpStream;
use rustls::ServerConfig;
use tracing::{debug, error, info, trace, warn, Span};

use crate::banner::Banner;
use crate::shell::{ShellLauncher, ShellProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Active,
    ShellRunning,
    Closed,
}

/// What the conductor has to do after a session handled readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionUpdate {
    Idle,
    /// The shell is running; its terminal should be registered for readiness.
    ShellStarted,
    /// The session is Closed and must be torn down.
    Finished,
}

/// Connects the TLS channel to the socket and, once running, the shell's terminal.
struct SessionLink {
    socket: TcpStream,
    terminal: Option<File>,
}

impl TlsCallbacks for SessionLink {
    fn emit_data(&mut self, data: &[u8]) -> DraupnirResult<()> {
        write_fully(&mut self.socket, data)?;
        Ok(())
    }

    fn record_received(&mut self, data: &[u8]) -> DraupnirResult<()> {
        match self.terminal.as_mut() {
            Some(terminal) => write_fully(terminal, data)?,
            None => trace!(bytes = data.len(), "discarding input received before the shell"),
        }
        Ok(())
    }
}

pub struct TargetSession {
    channel: TlsChannel<SessionLink>,
    state: SessionState,
    shell: Option<ShellProcess>,
    launcher: Rc<dyn ShellLauncher>,
    peer: Option<SocketAddr>,
    span: Span,
}

impl TargetSession {
    pub fn new(
        socket: TcpStream,
        peer: Option<SocketAddr>,
        config: Arc<ServerConfig>,
        launcher: Rc<dyn ShellLauncher>,
        span: Span,
    ) -> DraupnirResult<Self> {
        let link = SessionLink {
            socket,
            terminal: None,
        };
        let channel = TlsChannel::server(config, link)?;
        Ok(Self {
            channel,
            state: SessionState::Handshaking,
            shell: None,
            launcher,
            peer,
            span,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.channel.callbacks_mut().socket
    }

    /// Descriptor of the shell's terminal, once the shell is running.
    pub fn terminal_fd(&self) -> Option<RawFd> {
        self.shell.as_ref().map(ShellProcess::raw_fd)
    }

    /// Drain the socket, feeding everything into the TLS channel.
    pub fn on_network_ready(&mut self) -> SessionUpdate {
        let span = self.span.clone();
        let _enter = span.enter();

        let mut buf = [0u8; READ_CHUNK];
        let mut update = SessionUpdate::Idle;
        loop {
            match read_nonblocking(self.socket_mut(), &mut buf) {
                Ok(ReadOutcome::Data(n)) => match self.received_network_data(&buf[..n]) {
                    SessionUpdate::Finished => return SessionUpdate::Finished,
                    SessionUpdate::ShellStarted => update = SessionUpdate::ShellStarted,
                    SessionUpdate::Idle => {}
                },
                Ok(ReadOutcome::Drained) => return update,
                Ok(ReadOutcome::Closed) => {
                    debug!("peer closed the connection");
                    self.channel.abort();
                    self.close();
                    return SessionUpdate::Finished;
                }
                Err(e) => {
                    warn!(error = %e, "socket read failed");
                    self.channel.abort();
                    self.close();
                    return SessionUpdate::Finished;
                }
            }
        }
    }

    /// Feed ciphertext to the channel and advance the state machine.
    pub fn received_network_data(&mut self, data: &[u8]) -> SessionUpdate {
        if self.state == SessionState::Closed {
            return SessionUpdate::Finished;
        }
        let span = self.span.clone();
        let _enter = span.enter();

        if let Err(e) = self.channel.received_data(data) {
            warn!(error = %e, "TLS channel failed");
            self.close();
            return SessionUpdate::Finished;
        }
        if self.channel.is_closed() {
            self.close();
            return SessionUpdate::Finished;
        }
        if self.state == SessionState::Handshaking && self.channel.is_active() {
            self.state = SessionState::Active;
            info!("session activated");
            return self.start_shell();
        }
        SessionUpdate::Idle
    }

    /// Drain shell output and send it to the peer.
    pub fn on_terminal_ready(&mut self) -> SessionUpdate {
        let span = self.span.clone();
        let _enter = span.enter();

        let Some(shell) = self.shell.as_mut() else {
            return SessionUpdate::Idle;
        };
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match read_nonblocking(shell.output(), &mut buf) {
                Ok(ReadOutcome::Data(n)) => {
                    if let Err(e) = self.channel.send(&buf[..n]) {
                        warn!(error = %e, "failed to relay shell output");
                        self.close();
                        return SessionUpdate::Finished;
                    }
                }
                Ok(ReadOutcome::Drained) => return SessionUpdate::Idle,
                Ok(ReadOutcome::Closed) => {
                    info!("shell exited");
                    self.close();
                    return SessionUpdate::Finished;
                }
                Err(e) if is_terminal_hangup(&e) => {
                    info!("shell exited");
                    self.close();
                    return SessionUpdate::Finished;
                }
                Err(e) => {
                    warn!(error = %e, "terminal read failed");
                    self.close();
                    return SessionUpdate::Finished;
                }
            }
        }
    }

    /// Close the channel and stop the shell. A no-op once Closed.
    ///
    /// The socket and terminal descriptors stay open until the session is
    /// dropped, so the conductor can still deregister them.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let span = self.span.clone();
        let _enter = span.enter();

        if let Err(e) = self.channel.close() {
            debug!(error = %e, "close notification not delivered");
        }
        self.channel.callbacks_mut().terminal = None;
        if let Some(shell) = self.shell.as_mut() {
            shell.terminate();
        }
        self.state = SessionState::Closed;
        info!("session closed");
    }

    fn start_shell(&mut self) -> SessionUpdate {
        match self.launch_shell() {
            Ok(()) => {
                self.state = SessionState::ShellRunning;
                SessionUpdate::ShellStarted
            }
            Err(e) => {
                error!(error = %e, "failed to start shell");
                if self.channel.is_active() {
                    let diagnostic = format!("draupnir: {e}\n");
                    if let Err(send_err) = self.channel.send(diagnostic.as_bytes()) {
                        debug!(error = %send_err, "diagnostic not delivered");
                    }
                }
                self.close();
                SessionUpdate::Finished
            }
        }
    }

    fn launch_shell(&mut self) -> DraupnirResult<()> {
        let pair = self.launcher.allocate()?;
        let tty = pair.master.tty_name();
        let banner = Banner::collect(tty.as_deref())?;
        self.channel.send(banner.to_string().as_bytes())?;

        let shell = self.launcher.spawn(pair)?;
        debug!(tty = ?shell.tty_path(), "terminal attached");
        self.channel.callbacks_mut().terminal = Some(shell.input()?);
        self.shell = Some(shell);
        Ok(())
    }
}

impl Drop for TargetSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ShellConfig;
    use crate::shell::PtyShellLauncher;
    use draupnir_core::tls::TlsPolicy;
    use draupnir_core::{CredentialStore, DraupnirError};
    use portable_pty::PtyPair;
    use rustls::pki_types::ServerName;
    use std::io::{ErrorKind, Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    struct FailingLauncher;

    impl ShellLauncher for FailingLauncher {
        fn allocate(&self) -> DraupnirResult<PtyPair> {
            Err(DraupnirError::Process("no terminals left".into()))
        }

        fn spawn(&self, _pair: PtyPair) -> DraupnirResult<ShellProcess> {
            unreachable!("allocation always fails")
        }
    }

    /// Blocking client end of the test connection.
    struct Peer {
        socket: std::net::TcpStream,
        plaintext: Vec<u8>,
    }

    impl TlsCallbacks for Peer {
        fn emit_data(&mut self, data: &[u8]) -> DraupnirResult<()> {
            self.socket.write_all(data)?;
            Ok(())
        }

        fn record_received(&mut self, data: &[u8]) -> DraupnirResult<()> {
            self.plaintext.extend_from_slice(data);
            Ok(())
        }
    }

    fn connect(launcher: Rc<dyn ShellLauncher>) -> (TargetSession, TlsChannel<Peer>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_socket = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client_socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let (server_socket, peer) = listener.accept().unwrap();
        server_socket.set_nonblocking(true).unwrap();

        let store = CredentialStore::embedded().unwrap();
        let policy = TlsPolicy::default();
        let session = TargetSession::new(
            TcpStream::from_std(server_socket),
            Some(peer),
            store.server_config(&policy).unwrap(),
            launcher,
            Span::none(),
        )
        .unwrap();
        let client = TlsChannel::client(
            store.client_config(&policy).unwrap(),
            ServerName::try_from(policy.server_name.clone()).unwrap(),
            Peer {
                socket: client_socket,
                plaintext: Vec::new(),
            },
        )
        .unwrap();
        (session, client)
    }

    /// Read whatever the session sent within the read timeout.
    fn client_poll(client: &mut TlsChannel<Peer>) -> bool {
        let mut buf = [0u8; 16 * 1024];
        match client.callbacks_mut().socket.read(&mut buf) {
            Ok(0) => false,
            Ok(n) => {
                client.received_data(&buf[..n]).unwrap();
                true
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => true,
            Err(e) => panic!("client read failed: {e}"),
        }
    }

    /// Drive both ends until `done` holds or the attempts run out.
    fn drive(
        session: &mut TargetSession,
        client: &mut TlsChannel<Peer>,
        mut done: impl FnMut(&TargetSession, &TlsChannel<Peer>) -> bool,
    ) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        for _ in 0..500 {
            if session.state() != SessionState::Closed {
                updates.push(session.on_network_ready());
                if session.state() == SessionState::ShellRunning {
                    updates.push(session.on_terminal_ready());
                }
            }
            let open = client_poll(client);
            if done(session, client) || !open {
                break;
            }
        }
        updates
    }

    fn sh() -> Rc<dyn ShellLauncher> {
        Rc::new(PtyShellLauncher::new(ShellConfig {
            program: Some("/bin/sh".into()),
            ..Default::default()
        }))
    }

    #[test]
    fn activation_sends_banner_and_starts_shell() {
        let (mut session, mut client) = connect(sh());
        let updates = drive(&mut session, &mut client, |_, c| {
            String::from_utf8_lossy(&c.callbacks().plaintext).contains("Terminal:")
        });
        assert!(updates.contains(&SessionUpdate::ShellStarted));
        assert_eq!(session.state(), SessionState::ShellRunning);
        assert!(session.terminal_fd().is_some());
        let text = String::from_utf8_lossy(&client.callbacks().plaintext).into_owned();
        assert!(text.starts_with("Draupnir target version"));
    }

    #[test]
    fn launch_failure_reports_and_closes() {
        let (mut session, mut client) = connect(Rc::new(FailingLauncher));
        let updates = drive(&mut session, &mut client, |_, c| c.is_closed());
        assert!(updates.contains(&SessionUpdate::Finished));
        assert!(!updates.contains(&SessionUpdate::ShellStarted));
        assert_eq!(session.state(), SessionState::Closed);
        let text = String::from_utf8_lossy(&client.callbacks().plaintext).into_owned();
        assert!(text.contains("no terminals left"), "got {text:?}");
        assert!(client.is_closed());
    }

    #[test]
    fn peer_close_notify_finishes_session() {
        let (mut session, mut client) = connect(sh());
        drive(&mut session, &mut client, |s, _| {
            s.state() == SessionState::ShellRunning
        });

        client.close().unwrap();
        let updates = drive(&mut session, &mut client, |s, _| {
            s.state() == SessionState::Closed
        });
        assert!(updates.contains(&SessionUpdate::Finished));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn close_twice_is_a_no_op() {
        let (mut session, _client) = connect(sh());
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        session.close();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(
            session.received_network_data(b"late"),
            SessionUpdate::Finished
        );
    }
}

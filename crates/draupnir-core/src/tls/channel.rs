//! Per-connection TLS state machine.
//!
//! Wraps a rustls connection used in its sans-I/O form: ciphertext is fed in
//! with [`TlsChannel::received_data`], and everything the engine produces is
//! pushed out through the injected [`TlsCallbacks`].
//!
//! States: Handshaking -> Active -> Closing -> Closed. Application data is
//! refused outside Active, and [`TlsChannel::close`] is a no-op once Closed.
//!
//! rustls treats every alert other than close-notify as fatal, so such an
//! alert is reported to the callbacks and then ends the channel.

use std::io::{Read, Write};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection};
use tracing::{debug, trace, warn};

use super::callbacks::{Alert, AlertAction, EstablishedSession, TlsCallbacks};
use crate::error::{DraupnirError, DraupnirResult};

/// Upper bound on a single plaintext read out of the engine.
const PLAINTEXT_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Handshaking,
    Active,
    Closing,
    Closed,
}

enum Engine {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl Engine {
    fn read_tls(&mut self, rd: &mut dyn Read) -> std::io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.read_tls(rd),
            Engine::Client(conn) => conn.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn Write) -> std::io::Result<usize> {
        match self {
            Engine::Server(conn) => conn.write_tls(wr),
            Engine::Client(conn) => conn.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            Engine::Server(conn) => conn.process_new_packets(),
            Engine::Client(conn) => conn.process_new_packets(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.wants_write(),
            Engine::Client(conn) => conn.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            Engine::Server(conn) => conn.is_handshaking(),
            Engine::Client(conn) => conn.is_handshaking(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            Engine::Server(conn) => conn.reader(),
            Engine::Client(conn) => conn.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            Engine::Server(conn) => conn.writer(),
            Engine::Client(conn) => conn.writer(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            Engine::Server(conn) => conn.send_close_notify(),
            Engine::Client(conn) => conn.send_close_notify(),
        }
    }

    fn established(&self) -> EstablishedSession {
        let (protocol, suite) = match self {
            Engine::Server(conn) => (conn.protocol_version(), conn.negotiated_cipher_suite()),
            Engine::Client(conn) => (conn.protocol_version(), conn.negotiated_cipher_suite()),
        };
        EstablishedSession {
            protocol,
            cipher_suite: suite.map(|s| s.suite()),
        }
    }
}

/// An encrypted channel bound to one connection.
pub struct TlsChannel<C> {
    engine: Engine,
    callbacks: C,
    state: ChannelState,
    peer_closed: bool,
}

impl<C: TlsCallbacks> TlsChannel<C> {
    /// Server side of a freshly accepted connection. Waits for the ClientHello.
    pub fn server(config: Arc<ServerConfig>, callbacks: C) -> DraupnirResult<Self> {
        let conn = ServerConnection::new(config)?;
        Ok(Self {
            engine: Engine::Server(conn),
            callbacks,
            state: ChannelState::Handshaking,
            peer_closed: false,
        })
    }

    /// Client side of a connected socket. The ClientHello is emitted immediately.
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        callbacks: C,
    ) -> DraupnirResult<Self> {
        let conn = ClientConnection::new(config, server_name)?;
        let mut channel = Self {
            engine: Engine::Client(conn),
            callbacks,
            state: ChannelState::Handshaking,
            peer_closed: false,
        };
        channel.flush()?;
        Ok(channel)
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ChannelState::Active
    }

    pub fn is_closed(&self) -> bool {
        self.state == ChannelState::Closed
    }

    pub fn callbacks(&self) -> &C {
        &self.callbacks
    }

    pub fn callbacks_mut(&mut self) -> &mut C {
        &mut self.callbacks
    }

    /// Feed ciphertext read from the peer.
    ///
    /// Decrypted records are handed to [`TlsCallbacks::record_received`];
    /// handshake progress fires `session_established` and `session_activated`
    /// exactly once. A fatal engine error closes the channel and is returned.
    pub fn received_data(&mut self, data: &[u8]) -> DraupnirResult<()> {
        if self.state == ChannelState::Closed {
            debug!(bytes = data.len(), "dropping data received after close");
            return Ok(());
        }

        let mut input = data;
        while !input.is_empty() {
            let consumed = self.engine.read_tls(&mut input)?;
            if consumed == 0 {
                break;
            }

            let io_state = match self.engine.process_new_packets() {
                Ok(io_state) => io_state,
                Err(err) => return Err(self.fail(err)),
            };

            if self.state == ChannelState::Handshaking && !self.engine.is_handshaking() {
                self.state = ChannelState::Active;
                let session = self.engine.established();
                self.callbacks.session_established(&session);
                self.callbacks.session_activated();
            }

            let mut pending = io_state.plaintext_bytes_to_read();
            if pending > 0 {
                let mut buf = vec![0u8; pending.min(PLAINTEXT_CHUNK)];
                while pending > 0 {
                    let want = pending.min(buf.len());
                    let n = self.engine.reader().read(&mut buf[..want])?;
                    if n == 0 {
                        break;
                    }
                    trace!(bytes = n, "TLS record received");
                    self.callbacks.record_received(&buf[..n])?;
                    pending -= n;
                }
            }

            if io_state.peer_has_closed() && !self.peer_closed {
                self.peer_closed = true;
                match self.callbacks.alert(&Alert::CloseNotify) {
                    AlertAction::Close => {
                        // The peer is done with the stream; failing to answer is not an error.
                        if let Err(e) = self.close() {
                            debug!(error = %e, "close notification reply not delivered");
                        }
                        return Ok(());
                    }
                    AlertAction::Ignore => self.state = ChannelState::Closing,
                }
            }
        }

        self.flush()
    }

    /// Encrypt and transmit application data. Only valid while Active.
    pub fn send(&mut self, data: &[u8]) -> DraupnirResult<()> {
        match self.state {
            ChannelState::Active => {}
            ChannelState::Handshaking => {
                return Err(DraupnirError::Protocol(
                    "application data before handshake completion".into(),
                ))
            }
            ChannelState::Closing | ChannelState::Closed => {
                return Err(DraupnirError::Protocol("channel is closed".into()))
            }
        }

        let mut rest = data;
        while !rest.is_empty() {
            let n = self.engine.writer().write(rest)?;
            rest = &rest[n..];
            self.flush()?;
        }
        Ok(())
    }

    /// Send close-notify and move to Closed. Closing twice is a no-op.
    pub fn close(&mut self) -> DraupnirResult<()> {
        if self.state == ChannelState::Closed {
            return Ok(());
        }
        self.state = ChannelState::Closing;
        self.engine.send_close_notify();
        let flushed = self.flush();
        self.state = ChannelState::Closed;
        debug!("TLS channel closed");
        flushed
    }

    /// Move to Closed without emitting anything; the transport is already gone.
    pub fn abort(&mut self) {
        if self.state != ChannelState::Closed {
            debug!("TLS channel aborted");
            self.state = ChannelState::Closed;
        }
    }

    fn flush(&mut self) -> DraupnirResult<()> {
        while self.engine.wants_write() {
            let mut out = Vec::new();
            self.engine.write_tls(&mut out)?;
            trace!(bytes = out.len(), "TLS emit data");
            self.callbacks.emit_data(&out)?;
        }
        Ok(())
    }

    fn fail(&mut self, err: rustls::Error) -> DraupnirError {
        if let rustls::Error::AlertReceived(description) = &err {
            match self.callbacks.alert(&Alert::Received(*description)) {
                AlertAction::Close => self.engine.send_close_notify(),
                AlertAction::Ignore => {}
            }
        } else {
            warn!(error = %err, "TLS engine failure");
        }
        // Deliver the engine's own alert to the peer before giving up.
        if let Err(flush_err) = self.flush() {
            debug!(error = %flush_err, "failed to send TLS alert");
        }
        self.state = ChannelState::Closed;
        err.into()
    }
}

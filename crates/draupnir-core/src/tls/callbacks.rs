//! Callback contract between a [`TlsChannel`](super::TlsChannel) and its owner.
//!
//! The channel runs the protocol engine; everything that touches the outside
//! world (the socket, the terminal, the console) is reached through these
//! callbacks, injected when the channel is constructed.

use rustls::{AlertDescription, CipherSuite, ProtocolVersion};
use tracing::{debug, error};

use crate::error::DraupnirResult;

/// An alert observed on the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alert {
    /// The peer finished its side of the stream cleanly.
    CloseNotify,
    /// Any other alert sent by the peer.
    Received(AlertDescription),
}

/// What the channel should do after an alert was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertAction {
    /// Close the local side gracefully.
    Close,
    /// Keep the channel as the engine left it.
    Ignore,
}

/// Parameters of a completed handshake.
#[derive(Debug, Clone, Copy)]
pub struct EstablishedSession {
    pub protocol: Option<ProtocolVersion>,
    pub cipher_suite: Option<CipherSuite>,
}

/// Callbacks required by the TLS channel.
pub trait TlsCallbacks {
    /// Ciphertext produced by the engine; must reach the peer in full.
    fn emit_data(&mut self, data: &[u8]) -> DraupnirResult<()>;

    /// A decrypted application record from the peer.
    fn record_received(&mut self, data: &[u8]) -> DraupnirResult<()>;

    /// An alert arrived. Close-notify triggers a graceful local close; any
    /// other alert is logged. The engine still ends the channel after it,
    /// [`AlertAction::Close`] only adds a close-notify of our own.
    fn alert(&mut self, alert: &Alert) -> AlertAction {
        match alert {
            Alert::CloseNotify => {
                debug!("TLS close notification received, closing the channel");
                AlertAction::Close
            }
            Alert::Received(description) => {
                error!(alert = ?description, "TLS alert");
                AlertAction::Ignore
            }
        }
    }

    /// The handshake finished.
    fn session_established(&mut self, session: &EstablishedSession) {
        debug!(
            protocol = ?session.protocol,
            cipher_suite = ?session.cipher_suite,
            "TLS session established"
        );
    }

    /// The channel became Active and may carry application data.
    fn session_activated(&mut self) {}
}

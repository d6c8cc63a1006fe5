use thiserror::Error;

/// Errors produced by the draupnir session engine.
#[derive(Debug, Error)]
pub enum DraupnirError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    /// Socket create/bind/listen/connect/accept failures.
    #[error("socket error: {0}")]
    Socket(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS handshake failures, fatal alerts, data sent outside the Active state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// PTY allocation, fork or exec failures.
    #[error("process error: {0}")]
    Process(String),
}

impl From<rustls::Error> for DraupnirError {
    fn from(e: rustls::Error) -> Self {
        DraupnirError::Protocol(e.to_string())
    }
}

impl From<nix::Error> for DraupnirError {
    fn from(e: nix::Error) -> Self {
        DraupnirError::Io(std::io::Error::from(e))
    }
}

pub type DraupnirResult<T> = Result<T, DraupnirError>;

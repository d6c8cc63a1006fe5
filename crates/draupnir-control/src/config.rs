//! Runtime settings for the Control role.

use std::net::SocketAddr;

use draupnir_core::addr;
use draupnir_core::tls::TlsPolicy;
use draupnir_core::DraupnirResult;

#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// The `host:port` the user asked for, kept for log messages.
    pub target: String,
    /// Resolved candidates, tried in order.
    pub peer: Vec<SocketAddr>,
    pub tls: TlsPolicy,
    /// Put an interactive console into raw mode.
    pub raw_mode: bool,
}

impl ControlConfig {
    pub fn for_address(spec: &str) -> DraupnirResult<Self> {
        Ok(Self {
            target: spec.to_string(),
            peer: addr::resolve(spec)?,
            tls: TlsPolicy::default(),
            raw_mode: true,
        })
    }
}

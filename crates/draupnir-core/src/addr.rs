//! `host:port` address resolution.
//!
//! Both roles take their peer as a `host:port` string. The port must be
//! numeric; the host may be a name, an IPv4 literal or a bracketed IPv6
//! literal (`[::1]:19680`).

use std::net::{SocketAddr, ToSocketAddrs};

use tracing::debug;

use crate::error::{DraupnirError, DraupnirResult};

/// Port the Target listens on when `-t` is given without an address.
pub const DEFAULT_PORT: u16 = 19680;

/// Wildcard listen address used by `-t` without an argument.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:19680";

/// Split `host:port` into its host and numeric port.
pub fn split_host_port(address: &str) -> DraupnirResult<(&str, u16)> {
    let malformed =
        || DraupnirError::AddressResolution(format!("\"{address}\" should be in form \"host:port\""));

    let (host, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    let host = match host.strip_prefix('[') {
        Some(inner) => inner.strip_suffix(']').ok_or_else(malformed)?,
        // An unbracketed IPv6 literal leaves a ':' in the host part.
        None if host.contains(':') => return Err(malformed()),
        None => host,
    };
    if host.is_empty() {
        return Err(malformed());
    }

    let port = port
        .parse::<u16>()
        .map_err(|_| DraupnirError::AddressResolution(format!("invalid port in \"{address}\"")))?;
    Ok((host, port))
}

/// Resolve `host:port` into the list of candidate socket addresses.
///
/// The list is never empty on success.
pub fn resolve(address: &str) -> DraupnirResult<Vec<SocketAddr>> {
    let (host, port) = split_host_port(address)?;
    debug!(host, port, "resolving address");

    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| DraupnirError::AddressResolution(format!("failed to get address of {address}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(DraupnirError::AddressResolution(format!(
            "no addresses found for {address}"
        )));
    }
    debug!(count = addrs.len(), "resolved");
    Ok(addrs)
}

//! TLS channel, its callback contract, and the policy both roles share.

mod cache;
mod callbacks;
mod channel;
mod verify;

pub use cache::{CachePolicy, SessionCache};
pub use callbacks::{Alert, AlertAction, EstablishedSession, TlsCallbacks};
pub use channel::{ChannelState, TlsChannel};
pub use verify::ChainValidator;

/// Name the Control side expects in the Target's certificate.
pub const DEFAULT_SERVER_NAME: &str = "draupnir";

/// Settings applied when building engine configurations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPolicy {
    /// Server name sent in the ClientHello and checked against the certificate.
    pub server_name: String,
    /// Number of sessions the Target keeps for resumption.
    pub session_cache_capacity: usize,
    pub cache_policy: CachePolicy,
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            session_cache_capacity: 256,
            cache_policy: CachePolicy::Always,
        }
    }
}

//! Runtime settings for the Target role.

use std::net::SocketAddr;

use draupnir_core::addr::{self, DEFAULT_LISTEN_ADDR};
use draupnir_core::tls::TlsPolicy;
use draupnir_core::DraupnirResult;

pub const DEFAULT_TERM: &str = "xterm-256color";
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// How the shell behind each session is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Explicit shell program. Falls back to `$SHELL`, then `/bin/sh`.
    pub program: Option<String>,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: None,
            term: DEFAULT_TERM.to_string(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl ShellConfig {
    /// The program that will actually be executed.
    pub fn resolve_program(&self) -> String {
        self.program
            .clone()
            .filter(|p| !p.trim().is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.is_empty()))
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Candidate listen addresses, tried in order.
    pub listen: Vec<SocketAddr>,
    pub shell: ShellConfig,
    pub tls: TlsPolicy,
}

impl TargetConfig {
    /// Resolve `host:port` into a config with default shell and TLS settings.
    pub fn for_address(address: &str) -> DraupnirResult<Self> {
        Ok(Self {
            listen: addr::resolve(address)?,
            shell: ShellConfig::default(),
            tls: TlsPolicy::default(),
        })
    }

    /// Listen on the wildcard address and default port.
    pub fn wildcard() -> DraupnirResult<Self> {
        Self::for_address(DEFAULT_LISTEN_ADDR)
    }
}

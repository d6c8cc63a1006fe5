//! Target role: accepts TLS connections and binds each one to a shell on a
//! fresh pseudo-terminal.

pub mod banner;
pub mod config;
pub mod conductor;
pub mod session;
pub mod shell;

pub use conductor::TargetConductor;
pub use config::{ShellConfig, TargetConfig};
pub use session::{SessionState, SessionUpdate, TargetSession};
pub use shell::{PtyShellLauncher, ShellLauncher, ShellProcess};

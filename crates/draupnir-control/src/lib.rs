//! Control role: dials a Target and relays the local console to its shell.

pub mod conductor;
pub mod config;
pub mod console;

pub use conductor::{connect_socket, ControlConductor, ESCAPE_BYTE};
pub use config::ControlConfig;
pub use console::{ConsoleInput, ConsoleOutput, RawModeGuard};

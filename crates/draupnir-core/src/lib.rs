//! Shared building blocks for the draupnir Target and Control roles.

pub mod addr;
pub mod credentials;
pub mod error;
pub mod io;
pub mod tls;

pub use credentials::{CredentialStore, TlsRole};
pub use error::{DraupnirError, DraupnirResult};

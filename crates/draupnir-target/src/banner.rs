//! Greeting sent as the first application payload of every session.

use std::fmt;
use std::path::Path;

use nix::sys::utsname::uname;
use nix::unistd::{geteuid, getuid, Uid, User};

use draupnir_core::DraupnirResult;

/// Host and user identity of the Target, plus the session's terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Banner {
    pub hostname: String,
    pub system: String,
    pub release: String,
    pub machine: String,
    pub real_user: String,
    pub effective_user: String,
    pub tty: Option<String>,
}

impl Banner {
    pub fn collect(tty: Option<&Path>) -> DraupnirResult<Self> {
        let info = uname()?;
        Ok(Self {
            hostname: info.nodename().to_string_lossy().into_owned(),
            system: info.sysname().to_string_lossy().into_owned(),
            release: info.release().to_string_lossy().into_owned(),
            machine: info.machine().to_string_lossy().into_owned(),
            real_user: user_name(getuid()),
            effective_user: user_name(geteuid()),
            tty: tty.map(|p| p.display().to_string()),
        })
    }
}

/// Account name for `uid`, or the numeric id when there is no passwd entry.
fn user_name(uid: Uid) -> String {
    match User::from_uid(uid) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

impl fmt::Display for Banner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Draupnir target version {}", env!("CARGO_PKG_VERSION"))?;
        writeln!(
            f,
            "Running at {} {}/{} {}",
            self.hostname, self.system, self.release, self.machine
        )?;
        writeln!(
            f,
            "User: {} (effective {})",
            self.real_user, self.effective_user
        )?;
        writeln!(f, "Terminal: {}", self.tty.as_deref().unwrap_or("unknown"))
    }
}

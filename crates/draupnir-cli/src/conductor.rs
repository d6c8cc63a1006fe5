//! The role selected at startup.

use std::time::Duration;

use draupnir_control::{ConsoleInput, ConsoleOutput, ControlConductor};
use draupnir_core::{CredentialStore, DraupnirResult};
use draupnir_target::TargetConductor;
use tracing::info_span;

use crate::config::Role;

/// One of the two conductors; both expose the same loop operations.
pub enum Conductor {
    Target(TargetConductor),
    Control(ControlConductor<ConsoleInput, ConsoleOutput>),
}

impl Conductor {
    pub fn start(role: Role, credentials: &CredentialStore) -> DraupnirResult<Self> {
        match role {
            Role::Target(config) => {
                let span = info_span!("target");
                Ok(Self::Target(TargetConductor::start(&config, credentials, span)?))
            }
            Role::Control(config) => {
                let span = info_span!("control", target_addr = %config.target);
                let input = ConsoleInput::stdin(config.raw_mode)?;
                let output = ConsoleOutput::stdout()?;
                let conductor = ControlConductor::connect(&config, credentials, input, output, span)?;
                Ok(Self::Control(conductor))
            }
        }
    }

    /// Run the event loop until the role is done. A Target never is.
    pub fn run(&mut self) -> DraupnirResult<()> {
        while !self.is_done() {
            self.turn(None)?;
        }
        Ok(())
    }

    /// Handle one batch of readiness events.
    pub fn turn(&mut self, timeout: Option<Duration>) -> DraupnirResult<()> {
        match self {
            Conductor::Target(conductor) => conductor.turn(timeout),
            Conductor::Control(conductor) => conductor.turn(timeout),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Conductor::Target(_) => false,
            Conductor::Control(conductor) => conductor.is_closed(),
        }
    }
}

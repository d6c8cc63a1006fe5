//! draupnir — encrypted remote shell.
//!
//! `draupnir -t [host:port]` listens and serves a shell per connection;
//! `draupnir -c host:port` connects and relays the local console.

mod conductor;
mod config;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use draupnir_core::CredentialStore;
use tracing::{error, info};

use crate::conductor::Conductor;
use crate::config::FileConfig;

/// draupnir — encrypted remote shell
#[derive(Debug, Parser)]
#[command(name = "draupnir", version, about = "Encrypted remote shell over TLS")]
pub struct Cli {
    /// Connect to a Target and relay this console (Control mode)
    #[arg(short = 'c', long = "connect", value_name = "HOST:PORT", conflicts_with = "target")]
    pub connect: Option<String>,

    /// Listen for Control connections (Target mode) [default: 0.0.0.0:19680]
    #[arg(short = 't', long = "target", value_name = "HOST:PORT", num_args = 0..=1)]
    pub target: Option<Option<String>>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Config file path [default: ~/.draupnir/config.toml]
    #[arg(long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long = "log-dir", value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    /// PEM certificate replacing the built-in identity
    #[arg(long, value_name = "PEM", requires = "key")]
    pub cert: Option<PathBuf>,

    /// PEM private key matching --cert
    #[arg(long, value_name = "PEM", requires = "cert")]
    pub key: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    let file = match FileConfig::load(&config::config_path(cli.config.as_deref())) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("draupnir: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let verbose = cli.verbose || file.log.verbose;
    let log_dir = cli.log_dir.clone().or_else(|| file.log_dir());
    let _guard = match logging::init(verbose, log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("draupnir: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(&cli, file) {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("terminated: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, file: FileConfig) -> Result<()> {
    let settings = config::resolve(cli, file)?;

    let credentials = match &settings.identity {
        Some((cert, key)) => CredentialStore::from_files(cert, key)
            .with_context(|| format!("failed to load TLS identity from {}", cert.display()))?,
        None => CredentialStore::embedded().context("failed to load built-in TLS identity")?,
    };

    let mut conductor = Conductor::start(settings.role, &credentials)?;
    conductor.run()?;
    Ok(())
}

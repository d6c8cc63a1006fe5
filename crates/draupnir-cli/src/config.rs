//! Configuration at `~/.draupnir/config.toml`, merged with CLI flags.
//!
//! Every section is optional and a missing file means defaults. Flags given
//! on the command line always win over the file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use draupnir_control::ControlConfig;
use draupnir_core::addr::DEFAULT_LISTEN_ADDR;
use draupnir_core::DraupnirError;
use draupnir_target::config::{DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TERM};
use draupnir_target::{ShellConfig, TargetConfig};
use serde::Deserialize;
use tracing::debug;

use crate::Cli;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub tls: TlsSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[target]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSection {
    /// Listen address used by `-t` without a value.
    pub listen: Option<String>,
    pub shell: Option<String>,
    #[serde(default = "default_term")]
    pub term: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            listen: None,
            shell: None,
            term: default_term(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[control]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    /// Name expected in the Target's certificate.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_true")]
    pub raw_mode: bool,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            raw_mode: true,
        }
    }
}

/// `[tls]` section: PEM identity replacing the built-in one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsSection {
    pub cert: Option<String>,
    pub key: Option<String>,
}

/// `[log]` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogSection {
    pub dir: Option<String>,
    #[serde(default)]
    pub verbose: bool,
}

fn default_term() -> String {
    DEFAULT_TERM.to_string()
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}
fn default_server_name() -> String {
    draupnir_core::tls::DEFAULT_SERVER_NAME.to_string()
}
fn default_true() -> bool {
    true
}

impl FileConfig {
    /// Load from `path`, returning defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        self.log.dir.as_deref().map(expand_tilde)
    }
}

/// Which role to run, fully resolved.
#[derive(Debug, Clone)]
pub enum Role {
    Target(TargetConfig),
    Control(ControlConfig),
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub role: Role,
    /// PEM certificate and key paths, when the built-in identity is replaced.
    pub identity: Option<(PathBuf, PathBuf)>,
}

/// Merge CLI flags over the file and resolve addresses.
pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Settings> {
    let mut policy = draupnir_core::tls::TlsPolicy {
        server_name: file.control.server_name.clone(),
        ..Default::default()
    };
    if policy.server_name.trim().is_empty() {
        policy.server_name = default_server_name();
    }

    let role = match (&cli.connect, &cli.target) {
        (Some(peer), None) => {
            let mut config = ControlConfig::for_address(peer)?;
            config.tls = policy;
            config.raw_mode = file.control.raw_mode;
            Role::Control(config)
        }
        (None, Some(listen)) => {
            let listen = listen
                .clone()
                .or(file.target.listen.clone())
                .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
            let mut config = TargetConfig::for_address(&listen)?;
            config.shell = ShellConfig {
                program: file.target.shell.clone(),
                term: file.target.term.clone(),
                cols: file.target.cols,
                rows: file.target.rows,
            };
            config.tls = policy;
            Role::Target(config)
        }
        (Some(_), Some(_)) => {
            return Err(DraupnirError::Config("-c and -t cannot be combined".into()).into())
        }
        (None, None) => {
            return Err(DraupnirError::Config(
                "one of -c HOST:PORT or -t [HOST:PORT] is required".into(),
            )
            .into())
        }
    };

    let identity = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
        _ => match (&file.tls.cert, &file.tls.key) {
            (Some(cert), Some(key)) => Some((expand_tilde(cert), expand_tilde(key))),
            (None, None) => None,
            _ => {
                return Err(DraupnirError::Config(
                    "[tls] cert and key must be given together".into(),
                )
                .into())
            }
        },
    };

    Ok(Settings { role, identity })
}

/// `--config`, or `~/.draupnir/config.toml`.
pub fn config_path(cli: Option<&Path>) -> PathBuf {
    match cli {
        Some(path) => expand_tilde(&path.to_string_lossy()),
        None => dirs::home_dir()
            .unwrap_or_default()
            .join(".draupnir")
            .join("config.toml"),
    }
}

/// Expand a leading `~/` to the user's home directory.
fn expand_tilde(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("draupnir").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn default_file_values() {
        let cfg = FileConfig::default();
        assert_eq!(cfg.target.term, "xterm-256color");
        assert_eq!((cfg.target.cols, cfg.target.rows), (80, 24));
        assert_eq!(cfg.control.server_name, "draupnir");
        assert!(cfg.control.raw_mode);
        assert!(cfg.tls.cert.is_none());
        assert!(!cfg.log.verbose);
    }

    #[test]
    fn parse_full_toml() {
        let toml_str = r#"
[target]
listen = "127.0.0.1:2000"
shell = "/bin/dash"
term = "vt100"
cols = 132
rows = 50

[control]
server_name = "vault"
raw_mode = false

[tls]
cert = "/etc/draupnir/id.crt"
key = "/etc/draupnir/id.key"

[log]
dir = "/var/log/draupnir"
verbose = true
"#;
        let cfg: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.target.listen.as_deref(), Some("127.0.0.1:2000"));
        assert_eq!(cfg.target.shell.as_deref(), Some("/bin/dash"));
        assert_eq!(cfg.target.cols, 132);
        assert_eq!(cfg.control.server_name, "vault");
        assert!(!cfg.control.raw_mode);
        assert_eq!(cfg.log_dir(), Some(PathBuf::from("/var/log/draupnir")));
        assert!(cfg.log.verbose);
    }

    #[test]
    fn parse_partial_toml() {
        let cfg: FileConfig = toml::from_str("[target]\nshell = \"/bin/sh\"\n").unwrap();
        assert_eq!(cfg.target.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(cfg.target.term, "xterm-256color");
        assert_eq!(cfg.control.server_name, "draupnir");
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = FileConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(cfg.target.term, "xterm-256color");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[target\nlisten = 1").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn bare_target_flag_uses_wildcard_default() {
        let settings = resolve(&cli(&["-t"]), FileConfig::default()).unwrap();
        let Role::Target(config) = settings.role else {
            panic!("expected target role");
        };
        assert!(config.listen[0].ip().is_unspecified());
        assert_eq!(config.listen[0].port(), 19680);
    }

    #[test]
    fn bare_target_flag_prefers_file_listen() {
        let mut file = FileConfig::default();
        file.target.listen = Some("127.0.0.1:2000".into());
        file.target.shell = Some("/bin/dash".into());
        let settings = resolve(&cli(&["-t"]), file).unwrap();
        let Role::Target(config) = settings.role else {
            panic!("expected target role");
        };
        assert_eq!(config.listen[0], "127.0.0.1:2000".parse().unwrap());
        assert_eq!(config.shell.program.as_deref(), Some("/bin/dash"));
    }

    #[test]
    fn explicit_target_address_wins() {
        let mut file = FileConfig::default();
        file.target.listen = Some("127.0.0.1:2000".into());
        let settings = resolve(&cli(&["-t", "127.0.0.1:3000"]), file).unwrap();
        let Role::Target(config) = settings.role else {
            panic!("expected target role");
        };
        assert_eq!(config.listen[0].port(), 3000);
    }

    #[test]
    fn connect_flag_selects_control() {
        let mut file = FileConfig::default();
        file.control.raw_mode = false;
        file.control.server_name = "vault".into();
        let settings = resolve(&cli(&["-c", "127.0.0.1:19680"]), file).unwrap();
        let Role::Control(config) = settings.role else {
            panic!("expected control role");
        };
        assert_eq!(config.peer[0], "127.0.0.1:19680".parse().unwrap());
        assert_eq!(config.tls.server_name, "vault");
        assert!(!config.raw_mode);
    }

    #[test]
    fn no_role_is_a_config_error() {
        let err = resolve(&cli(&[]), FileConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DraupnirError>(),
            Some(DraupnirError::Config(_))
        ));
    }

    #[test]
    fn both_roles_are_rejected_by_the_parser() {
        let parsed = Cli::try_parse_from(["draupnir", "-c", "a:1", "-t"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn malformed_address_is_a_resolution_error() {
        let err = resolve(&cli(&["-c", "nowhere"]), FileConfig::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DraupnirError>(),
            Some(DraupnirError::AddressResolution(_))
        ));
    }

    #[test]
    fn cli_identity_overrides_file() {
        let mut file = FileConfig::default();
        file.tls.cert = Some("/file.crt".into());
        file.tls.key = Some("/file.key".into());
        let settings = resolve(
            &cli(&["-t", "127.0.0.1:0", "--cert", "/cli.crt", "--key", "/cli.key"]),
            file,
        )
        .unwrap();
        assert_eq!(
            settings.identity,
            Some((PathBuf::from("/cli.crt"), PathBuf::from("/cli.key")))
        );
    }

    #[test]
    fn half_an_identity_is_rejected() {
        let mut file = FileConfig::default();
        file.tls.cert = Some("/file.crt".into());
        assert!(resolve(&cli(&["-t", "127.0.0.1:0"]), file).is_err());
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_tilde("~/.draupnir/x"), home.join(".draupnir/x"));
        }
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
    }
}

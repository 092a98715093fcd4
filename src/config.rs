use crate::Opt;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

pub const DEFAULT_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 2525;
/// RFC 5321 section 4.5.3.2.7
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PID_FILE: &str = "/tmp/smtp-sink.pid";

/// How a finished DATA transaction is answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Mode {
    #[default]
    Accept,
    Bounce,
    Random,
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Mode::Accept),
            "bounce" => Ok(Mode::Bounce),
            "random" => Ok(Mode::Random),
            other => Err(format!(
                "unknown mode '{}' (expected accept, bounce or random)",
                other
            )),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Accept => "accept",
            Mode::Bounce => "bounce",
            Mode::Random => "random",
        })
    }
}

/// The read-only snapshot every session works from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkConfig {
    /// Bound on every line read.
    pub timeout: Duration,
    /// Pause before answering a finished DATA.
    pub delay: Duration,
    pub mode: Mode,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            delay: Duration::ZERO,
            mode: Mode::Accept,
        }
    }
}

/// Contents of the optional TOML configuration file. Every key is optional;
/// command line flags win over anything set here.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub address: Option<String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub tls_ports: Vec<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub hostname: Option<String>,
    pub timeout: Option<u64>,
    pub delay: Option<u64>,
    pub mode: Option<Mode>,
    pub logs: Option<PathBuf>,
    pub pid_file: Option<PathBuf>,
}

impl FileConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).context("Invalid configuration file")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file: {:?}", path))?;
        Self::parse(&text).with_context(|| format!("In {:?}", path))
    }
}

/// Fully resolved process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub address: String,
    pub ports: Vec<u16>,
    pub tls_ports: Vec<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub hostname: Option<String>,
    pub sink: SinkConfig,
    pub log_file: Option<PathBuf>,
    pub verbose: bool,
    pub daemon: bool,
    pub pid_file: PathBuf,
}

impl Settings {
    /// Loads the file named by `--config` (if any), layers the command line
    /// on top and validates the result.
    pub fn from_opt(opt: &Opt) -> Result<Self> {
        let file = match &opt.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let settings = Self::merge(opt, file);
        settings.validate()?;
        Ok(settings)
    }

    pub fn merge(opt: &Opt, file: FileConfig) -> Self {
        let ports = if !opt.ports.is_empty() {
            opt.ports.clone()
        } else if !file.ports.is_empty() {
            file.ports
        } else if opt.tls_ports.is_empty() && file.tls_ports.is_empty() {
            vec![DEFAULT_PORT]
        } else {
            Vec::new()
        };
        let tls_ports = if !opt.tls_ports.is_empty() {
            opt.tls_ports.clone()
        } else {
            file.tls_ports
        };

        let timeout = opt.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
        let delay = opt.delay.or(file.delay).unwrap_or(0);

        Self {
            address: opt
                .address
                .clone()
                .or(file.address)
                .unwrap_or_else(|| DEFAULT_ADDRESS.to_string()),
            ports,
            tls_ports,
            tls_cert: opt.tls_cert.clone().or(file.tls_cert),
            tls_key: opt.tls_key.clone().or(file.tls_key),
            hostname: opt.hostname.clone().or(file.hostname),
            sink: SinkConfig {
                timeout: Duration::from_secs(timeout),
                delay: Duration::from_secs(delay),
                mode: opt.mode.or(file.mode).unwrap_or_default(),
            },
            log_file: opt.log_file.clone().or(file.logs),
            verbose: opt.verbose,
            daemon: opt.daemon,
            pid_file: opt
                .pid_file
                .clone()
                .or(file.pid_file)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PID_FILE)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sink.timeout.is_zero() {
            bail!("timeout must be greater than zero");
        }
        if self.ports.is_empty() && self.tls_ports.is_empty() {
            bail!("at least one port or TLS port must be configured");
        }
        if !self.tls_ports.is_empty() && (self.tls_cert.is_none() || self.tls_key.is_none()) {
            bail!("TLS ports {:?} need both --tls-cert and --tls-key", self.tls_ports);
        }
        if let Some(hostname) = &self.hostname {
            if hostname.trim().is_empty() || hostname.chars().any(|c| c.is_whitespace()) {
                bail!("invalid hostname {:?}", hostname);
            }
        }
        Ok(())
    }
}

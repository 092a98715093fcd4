mod bounce;
mod commands;
mod config;
mod daemon;
mod error;
mod identity;
mod logging;
mod policy;
mod reply;
mod server;
mod session;

use structopt::StructOpt;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::path::PathBuf;

use crate::config::{Mode, Settings};
use crate::server::SinkServer;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-sink",
    about = "An SMTP server that accepts connections, speaks the protocol and throws every message away"
)]
pub struct Opt {
    /// TOML configuration file; command line flags override its values
    #[structopt(short = "c", long = "config", parse(from_os_str))]
    pub config: Option<PathBuf>,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address")]
    pub address: Option<String>,

    /// Plain listening ports (can be specified multiple times, default: 2525)
    #[structopt(short = "p", long = "port", number_of_values = 1)]
    pub ports: Vec<u16>,

    /// Implicit TLS listening ports (can be specified multiple times)
    #[structopt(long = "tls-port", number_of_values = 1)]
    pub tls_ports: Vec<u16>,

    /// TLS certificate chain (PEM)
    #[structopt(long = "tls-cert", parse(from_os_str))]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key (PEM, PKCS#8 or RSA)
    #[structopt(long = "tls-key", parse(from_os_str))]
    pub tls_key: Option<PathBuf>,

    /// Name announced in the greeting and EHLO reply (default: system host name)
    #[structopt(long = "hostname")]
    pub hostname: Option<String>,

    /// Seconds to wait for a line before answering 421 and closing (default: 300)
    #[structopt(short = "t", long = "timeout")]
    pub timeout: Option<u64>,

    /// Seconds to wait before answering the end of DATA (default: 0)
    #[structopt(long = "delay")]
    pub delay: Option<u64>,

    /// How to answer the end of DATA: accept, bounce or random (default: accept)
    #[structopt(short = "m", long = "mode")]
    pub mode: Option<Mode>,

    /// Log file path (default: stderr)
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log every command and reply
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// PID file written in daemon mode (default: /tmp/smtp-sink.pid)
    #[structopt(long = "pid-file", parse(from_os_str))]
    pub pid_file: Option<PathBuf>,
}

fn main() -> Result<()> {
    let opt = Opt::from_args();
    let settings = Settings::from_opt(&opt)?;

    if settings.daemon {
        if settings.log_file.is_none() {
            eprintln!("[WARNING] Daemon mode without --logs: log output will be lost");
        }
        // Le fork doit avoir lieu avant la création du runtime tokio
        daemon::daemonize(&settings.pid_file)?;
    }

    logging::init(settings.log_file.as_deref(), settings.verbose)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Starting smtp-sink");

    let runtime = tokio::runtime::Runtime::new().context("Failed to start tokio runtime")?;
    runtime.block_on(async move {
        let server = Arc::new(SinkServer::new(settings)?);
        server.run().await
    })
}

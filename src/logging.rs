use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. Events go to stderr, or are appended to
/// `log_file` when one is given. `RUST_LOG` overrides the level.
pub fn init(log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("Failed to create log directory: {:?}", parent))?;
                }
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    installed.map_err(|e| anyhow!("Failed to install log subscriber: {}", e))
}

/// Escapes control and non-ASCII characters so client input cannot forge
/// log lines or mess up a terminal.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\x01'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii() => result.push(c),
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

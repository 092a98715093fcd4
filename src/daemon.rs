use std::path::Path;

/// Detaches from the terminal. Must run before the tokio runtime exists.
#[cfg(unix)]
pub fn daemonize(pid_file: &Path) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(".") // garde le répertoire courant pour les chemins relatifs
        .umask(0o027);

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start daemon mode: {}", e))
}

#[cfg(not(unix))]
pub fn daemonize(_pid_file: &Path) -> anyhow::Result<()> {
    anyhow::bail!("Daemon mode not supported on this platform")
}

#[cfg(unix)]
pub fn daemonize() -> anyhow::Result<()> {
    use daemonize::Daemonize;

    // Keep the working directory so relative certificate and log paths
    // resolve the same way as in the foreground.
    let daemonize = Daemonize::new()
        .pid_file("/tmp/smtp-credtrap.pid")
        .chown_pid_file(true)
        .working_directory(".");

    daemonize
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start daemon mode: {}", e))
}

#[cfg(not(unix))]
pub fn daemonize() -> anyhow::Result<()> {
    anyhow::bail!("Daemon mode is only supported on Unix")
}

mod daemon;

use std::path::Path;

use anyhow::{Context, Result};
use structopt::StructOpt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use smtp_credtrap::{Opt, SmtpHoneypot, TlsContext};

fn main() -> Result<()> {
    let opt = Opt::from_args();

    println!("==========================================");
    println!("SMTP credential trap v{}", env!("CARGO_PKG_VERSION"));
    println!("==========================================");

    // Missing or mismatched TLS material is fatal: STARTTLS is always
    // advertised, so there is nothing sensible to serve without it.
    let tls = TlsContext::from_pem_files(&opt.tls_cert, &opt.tls_key)?;

    // Bind before daemonizing so a busy port is reported on the terminal.
    let listen_addr = opt.listen_addr();
    let listener = std::net::TcpListener::bind(&listen_addr)
        .with_context(|| format!("Failed to bind to {}", listen_addr))?;
    listener.set_nonblocking(true)?;

    if opt.daemon {
        if opt.log_file.is_none() {
            eprintln!("[WARNING] Daemon mode without --logs discards diagnostic output");
        }
        daemon::daemonize()?;
    }

    // The non-blocking log writer owns a thread, so it has to be created
    // after the fork.
    let _guard = init_logging(&opt)?;
    tracing::info!(
        pid = std::process::id(),
        address = %listen_addr,
        hostname = %opt.helo,
        credentials = ?opt.credentials,
        "starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let honeypot = SmtpHoneypot::new(&opt, tls).await?;
        honeypot.run(listener).await
    })
}

fn init_logging(opt: &Opt) -> Result<Option<WorkerGuard>> {
    let default_level = if opt.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let Some(path) = &opt.log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory: {:?}", dir))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("Log path has no file name: {:?}", path))?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

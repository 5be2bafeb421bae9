use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn, Instrument};

use crate::config::{Opt, SessionConfig};
use crate::connection::{Connection, SessionError};
use crate::sink::CredentialLog;
use crate::tls::TlsContext;

/// Accepts connections and runs one session task per client.
pub struct SmtpHoneypot {
    connection: Connection,
    shutdown_grace: Duration,
}

impl SmtpHoneypot {
    /// The TLS context must already be loaded: the listener never starts
    /// without valid certificate material.
    pub async fn new(opt: &Opt, tls: TlsContext) -> Result<Self> {
        let sink = CredentialLog::open(&opt.credentials, Duration::from_secs(opt.sink_timeout))
            .await?;
        info!(path = ?sink.path(), "credential log opened");
        Ok(Self::from_parts(
            opt.session_config(),
            tls,
            Arc::new(sink),
            Duration::from_secs(opt.shutdown_grace),
        ))
    }

    pub fn from_parts(
        config: SessionConfig,
        tls: TlsContext,
        sink: Arc<CredentialLog>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            connection: Connection {
                config: Arc::new(config),
                tls,
                sink,
            },
            shutdown_grace,
        }
    }

    pub fn sink(&self) -> &Arc<CredentialLog> {
        &self.connection.sink
    }

    /// Serves until `shutdown` resolves, then gives in-flight sessions the
    /// grace period before aborting them.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr().context("Listener has no local address")?;
        info!(%local, "waiting for connections");

        tokio::pin!(shutdown);
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = self.connection.clone();
                        sessions.spawn(
                            handle_client(connection, stream, peer)
                                .instrument(tracing::info_span!("session", %peer)),
                        );
                    }
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        time::sleep(Duration::from_millis(100)).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "session task failed");
                    }
                }
            }
        }

        drop(listener);
        info!(in_flight = sessions.len(), "stopped accepting connections");

        let drained = time::timeout(self.shutdown_grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = sessions.len(),
                "grace period elapsed, aborting sessions"
            );
            sessions.shutdown().await;
        }

        info!(
            written = self.connection.sink.written(),
            dropped = self.connection.sink.dropped(),
            "honeypot stopped"
        );
        Ok(())
    }

    /// Serves on an already-bound listener until Ctrl-C or SIGTERM.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        self.serve(listener, shutdown_signal()).await
    }
}

async fn handle_client(connection: Connection, stream: TcpStream, peer: SocketAddr) {
    info!("new connection");
    let _ = stream.set_nodelay(true);
    match connection.run(stream, peer).await {
        Ok(()) => info!("connection closed"),
        Err(SessionError::Tls(err)) => info!(error = %err, "TLS handshake failed, connection closed"),
        Err(err) => info!(error = %err, "connection aborted"),
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("interrupt received, shutting down");
}

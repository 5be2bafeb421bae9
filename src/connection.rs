//! Drives one [`Session`] over a socket: plaintext until STARTTLS, then the
//! same loop again over the TLS stream.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::response::Reply;
use crate::session::{Action, Session, Step};
use crate::sink::CredentialLog;
use crate::tls::TlsContext;

/// Longest line accepted, CRLF included, in commands and in DATA.
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS handshake failed: {0}")]
    Tls(io::Error),

    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
}

enum Outcome {
    Closed,
    StartTls,
}

/// Shared, read-only collaborators handed to every connection.
#[derive(Clone)]
pub struct Connection {
    pub config: Arc<SessionConfig>,
    pub tls: TlsContext,
    pub sink: Arc<CredentialLog>,
}

impl Connection {
    /// Runs the session to completion. The stream is dropped, and so
    /// closed, on every return path.
    pub async fn run<S>(&self, stream: S, peer: SocketAddr) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session::new(peer, self.config.clone());

        if !self.config.banner_delay.is_zero() {
            time::sleep(self.config.banner_delay).await;
        }

        let mut stream = BufReader::new(stream);
        write_reply(&mut stream, &session.greeting()).await?;

        if let Outcome::Closed = self.drive(&mut session, &mut stream).await? {
            let _ = stream.shutdown().await;
            return Ok(());
        }

        // Anything pipelined behind STARTTLS was sent in the clear and
        // must not leak into the encrypted session.
        if !stream.buffer().is_empty() {
            warn!(
                bytes = stream.buffer().len(),
                "discarding plaintext pipelined after STARTTLS"
            );
        }
        let plain = stream.into_inner();

        let handshake = time::timeout(self.config.idle_timeout, self.tls.upgrade(plain)).await;
        let tls_stream = match handshake {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(err)) => {
                session.close();
                return Err(SessionError::Tls(err));
            }
            Err(_) => {
                session.close();
                return Err(SessionError::Tls(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "handshake timed out",
                )));
            }
        };
        session.tls_established();
        info!("TLS session established");

        let mut stream = BufReader::new(tls_stream);
        if let Outcome::StartTls = self.drive(&mut session, &mut stream).await? {
            session.close();
        }
        let _ = stream.shutdown().await;
        Ok(())
    }

    async fn drive<S>(
        &self,
        session: &mut Session,
        stream: &mut BufReader<S>,
    ) -> Result<Outcome, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut line = Vec::with_capacity(512);
        loop {
            line.clear();
            let read = read_line(stream, &mut line, self.config.idle_timeout).await;
            let n = match read {
                Some(result) => result?,
                None => {
                    debug!("idle timeout");
                    let _ = write_reply(stream, &Reply::idle_timeout()).await;
                    session.close();
                    return Ok(Outcome::Closed);
                }
            };

            if n == 0 {
                debug!("client disconnected");
                session.close();
                return Ok(Outcome::Closed);
            }
            if n >= MAX_LINE_LENGTH && !line.ends_with(b"\n") {
                let _ = write_reply(stream, &Reply::line_too_long()).await;
                session.close();
                return Err(SessionError::LineTooLong(MAX_LINE_LENGTH));
            }

            let Step { reply, action } = session.handle_line(strip_line_ending(&line));
            match action {
                Action::Continue => {}
                Action::Capture(attempt) => {
                    if let Err(err) = self.sink.record(attempt, session.peer()).await {
                        error!(
                            error = %err,
                            dropped = self.sink.dropped(),
                            "credential record lost"
                        );
                    }
                }
                Action::StartTls => {
                    if let Some(reply) = &reply {
                        write_reply(stream, reply).await?;
                    }
                    return Ok(Outcome::StartTls);
                }
                Action::Close => {
                    if let Some(reply) = &reply {
                        let _ = write_reply(stream, reply).await;
                    }
                    return Ok(Outcome::Closed);
                }
            }
            if let Some(reply) = &reply {
                write_reply(stream, reply).await?;
            }
        }
    }
}

/// `None` when the idle timeout fired before a full line arrived.
async fn read_line<S>(
    stream: &mut BufReader<S>,
    line: &mut Vec<u8>,
    idle: Duration,
) -> Option<io::Result<usize>>
where
    S: AsyncRead + Unpin,
{
    let mut limited = stream.take(MAX_LINE_LENGTH as u64);
    time::timeout(idle, limited.read_until(b'\n', line)).await.ok()
}

fn strip_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn write_reply<W>(stream: &mut W, reply: &Reply) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug!(reply = %reply, "reply");
    stream.write_all(reply.to_wire().as_bytes()).await?;
    stream.flush().await
}

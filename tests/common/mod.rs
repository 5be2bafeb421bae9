#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use smtp_credtrap::{Connection, CredentialLog, SessionConfig, TlsContext};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;

pub const CERT: &[u8] = include_bytes!("../fixtures/cert.pem");
pub const KEY: &[u8] = include_bytes!("../fixtures/key.pem");
pub const CA: &[u8] = include_bytes!("../fixtures/ca.pem");

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        hostname: "test.local".to_string(),
        idle_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    }
}

pub fn tls_context() -> TlsContext {
    TlsContext::from_pem(CERT, KEY).unwrap()
}

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub connection: Connection,
}

impl Harness {
    pub async fn new(config: SessionConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sink = CredentialLog::open(dir.path().join("credentials.log"), Duration::from_secs(5))
            .await
            .unwrap();
        Self {
            dir,
            connection: Connection {
                config: Arc::new(config),
                tls: tls_context(),
                sink: Arc::new(sink),
            },
        }
    }

    pub fn credentials_path(&self) -> PathBuf {
        self.dir.path().join("credentials.log")
    }

    pub async fn records(&self) -> Vec<serde_json::Value> {
        read_records(&self.credentials_path()).await
    }

    /// Starts a session over an in-memory pipe and returns the client end
    /// plus the server task.
    pub fn connect(
        &self,
        peer: SocketAddr,
    ) -> (
        Client<tokio::io::DuplexStream>,
        tokio::task::JoinHandle<Result<(), smtp_credtrap::SessionError>>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let connection = self.connection.clone();
        let task = tokio::spawn(async move { connection.run(server, peer).await });
        (Client::new(client), task)
    }
}

pub async fn read_records(path: &Path) -> Vec<serde_json::Value> {
    let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
    contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReply {
    pub code: u16,
    pub lines: Vec<String>,
}

pub struct Client<S> {
    stream: BufReader<S>,
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Reads one possibly multi-line reply, or `None` on EOF.
    pub async fn read_reply(&mut self) -> Option<ServerReply> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.ok()?;
            if n == 0 {
                return None;
            }
            let line = line.trim_end_matches(['\r', '\n']);
            let code: u16 = line.get(..3)?.parse().ok()?;
            lines.push(line.get(4..).unwrap_or_default().to_string());
            if line.as_bytes().get(3) != Some(&b'-') {
                return Some(ServerReply { code, lines });
            }
        }
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.get_mut().write_all(data).await?;
        self.stream.get_mut().flush().await
    }

    pub async fn send(&mut self, line: &str) -> Option<ServerReply> {
        self.write_raw(format!("{line}\r\n").as_bytes()).await.ok()?;
        self.read_reply().await
    }

    pub async fn expect(&mut self, line: &str, code: u16) -> ServerReply {
        let reply = self.send(line).await.expect("connection closed");
        assert_eq!(reply.code, code, "unexpected reply to {line:?}: {reply:?}");
        reply
    }

    /// Runs the client half of the handshake after a 220 to STARTTLS.
    pub async fn start_tls(self) -> Client<TlsStream<S>> {
        let stream = self.stream.into_inner();
        let tls = tls_connector()
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap();
        Client::new(tls)
    }
}

pub fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    for der in rustls_pemfile::certs(&mut &CA[..]).unwrap() {
        roots.add(&rustls::Certificate(der)).unwrap();
    }
    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Greeting, EHLO, STARTTLS, handshake and a fresh EHLO.
pub async fn secure_client(
    client: Client<tokio::io::DuplexStream>,
) -> Client<TlsStream<tokio::io::DuplexStream>> {
    let mut client = client;
    let greeting = client.read_reply().await.unwrap();
    assert_eq!(greeting.code, 220);
    let ehlo = client.expect("EHLO test", 250).await;
    assert!(ehlo.lines.iter().any(|l| l == "STARTTLS"));
    assert!(!ehlo.lines.iter().any(|l| l.starts_with("AUTH")));
    client.expect("STARTTLS", 220).await;

    let mut client = client.start_tls().await;
    let ehlo = client.expect("EHLO test", 250).await;
    assert!(ehlo.lines.iter().any(|l| l == "AUTH LOGIN PLAIN"));
    client
}

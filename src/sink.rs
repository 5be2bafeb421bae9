//! Append-only store for captured credentials.
//!
//! Each record is one JSON object on its own line. Records are written with
//! a single `write_all` while holding the file lock, so concurrent sessions
//! never interleave and the file can be tailed while it grows.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::auth::{AuthAttempt, Mechanism};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("credential log write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("credential record could not be serialized: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("credential log write timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialRecord {
    pub timestamp: DateTime<Local>,
    pub peer: SocketAddr,
    pub mechanism: Mechanism,
    pub username: String,
    pub password: String,
    pub malformed: bool,
    pub raw: String,
}

impl CredentialRecord {
    pub fn new(attempt: AuthAttempt, peer: SocketAddr) -> Self {
        Self {
            timestamp: Local::now(),
            peer,
            mechanism: attempt.mechanism,
            raw: String::from_utf8_lossy(&attempt.raw).into_owned(),
            username: attempt.username,
            password: attempt.password,
            malformed: attempt.malformed,
        }
    }

    fn to_line(&self) -> Result<Vec<u8>, SinkError> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

pub struct CredentialLog {
    path: PathBuf,
    file: Mutex<File>,
    write_timeout: Duration,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl CredentialLog {
    pub async fn open(path: impl AsRef<Path>, write_timeout: Duration) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create directory {parent:?}"))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open credential log {path:?}"))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            write_timeout,
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persists one attempt. Waiting for the lock counts against the
    /// write timeout. On failure the record is counted as dropped.
    pub async fn record(&self, attempt: AuthAttempt, peer: SocketAddr) -> Result<(), SinkError> {
        let record = CredentialRecord::new(attempt, peer);
        tracing::warn!(
            peer = %record.peer,
            mechanism = %record.mechanism,
            username = %crate::utils::safe_log_string(&record.username),
            malformed = record.malformed,
            "captured credentials"
        );

        let result = match record.to_line() {
            Ok(line) => self.append(&line).await,
            Err(err) => Err(err),
        };

        match &result {
            Ok(()) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn append(&self, line: &[u8]) -> Result<(), SinkError> {
        let write = async {
            let mut file = self.file.lock().await;
            file.write_all(line).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SinkError::Timeout(self.write_timeout)),
        }
    }

    /// Records persisted since startup.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Records lost to write errors or timeouts since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

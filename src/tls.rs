//! Server-side TLS for the STARTTLS upgrade.

use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use openssl::pkey::PKey;
use openssl::x509::X509;
use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::Item;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;

/// Certificate and key loaded once at startup, then shared read-only by
/// every session. Cloning only bumps a reference count.
#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
}

impl TlsContext {
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read(cert_path)
            .with_context(|| format!("Failed to read certificate: {:?}", cert_path))?;
        let key_pem = std::fs::read(key_path)
            .with_context(|| format!("Failed to read private key: {:?}", key_path))?;
        Self::from_pem(&cert_pem, &key_pem)
            .with_context(|| format!("Invalid TLS material in {:?} / {:?}", cert_path, key_path))
    }

    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_chain = load_certs(cert_pem)?;
        let private_key = load_private_key(key_pem)?;
        check_key_matches(cert_pem, key_pem)?;

        let config = ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| anyhow::anyhow!("Failed to build TLS config: {}", e))?;

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
        })
    }

    /// Runs the server handshake over an already-connected plaintext stream.
    pub async fn upgrade<S>(&self, stream: S) -> io::Result<TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.acceptor.accept(stream).await
    }
}

fn load_certs(pem: &[u8]) -> Result<Vec<Certificate>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|_| anyhow::anyhow!("Failed to parse certificate"))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found");
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKey> {
    let mut reader = BufReader::new(pem);
    loop {
        match rustls_pemfile::read_one(&mut reader)
            .map_err(|_| anyhow::anyhow!("Failed to parse private key"))?
        {
            Some(Item::PKCS8Key(key)) | Some(Item::RSAKey(key)) | Some(Item::ECKey(key)) => {
                return Ok(PrivateKey(key));
            }
            Some(_) => continue,
            None => anyhow::bail!("No private key found"),
        }
    }
}

/// rustls accepts any parseable key, so compare the public halves here.
fn check_key_matches(cert_pem: &[u8], key_pem: &[u8]) -> Result<()> {
    let cert = X509::from_pem(cert_pem).context("Failed to parse certificate")?;
    let key = PKey::private_key_from_pem(key_pem).context("Failed to parse private key")?;
    let cert_key = cert
        .public_key()
        .context("Certificate has no usable public key")?;
    if !cert_key.public_eq(&*key) {
        anyhow::bail!("Private key does not match certificate");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CERT: &[u8] = include_bytes!("../tests/fixtures/cert.pem");
    const KEY: &[u8] = include_bytes!("../tests/fixtures/key.pem");
    const OTHER_KEY: &[u8] = include_bytes!("../tests/fixtures/other-key.pem");

    #[test]
    fn loads_matching_material() {
        assert!(TlsContext::from_pem(CERT, KEY).is_ok());
    }

    #[test]
    fn rejects_mismatched_key() {
        let err = TlsContext::from_pem(CERT, OTHER_KEY).err().unwrap();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn rejects_missing_certificate() {
        assert!(TlsContext::from_pem(b"", KEY).is_err());
        assert!(TlsContext::from_pem(KEY, KEY).is_err());
    }

    #[test]
    fn rejects_missing_key() {
        let err = TlsContext::from_pem(CERT, CERT).err().unwrap();
        assert!(err.to_string().contains("No private key"));
    }

    #[test]
    fn missing_files_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let result = TlsContext::from_pem_files(&dir.path().join("nope.pem"), &dir.path().join("nope.key"));
        assert!(result.is_err());
    }
}

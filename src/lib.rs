//! A submission-port SMTP honeypot.
//!
//! Clients must STARTTLS before AUTH is offered. Every LOGIN or PLAIN
//! exchange is written to the credential log and then answered with an
//! authentication failure. Messages sent through DATA are accepted and
//! discarded.

pub mod auth;
pub mod command;
pub mod config;
pub mod connection;
pub mod honeypot;
pub mod response;
pub mod session;
pub mod sink;
pub mod tls;
pub mod utils;

pub use config::{Opt, SessionConfig};
pub use connection::{Connection, SessionError};
pub use honeypot::SmtpHoneypot;
pub use sink::{CredentialLog, CredentialRecord, SinkError};
pub use tls::TlsContext;

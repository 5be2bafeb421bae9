use std::path::PathBuf;
use std::time::Duration;

use structopt::StructOpt;

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "smtp-credtrap",
    about = "A STARTTLS submission honeypot that captures SMTP AUTH credentials",
    author = "2026, Philippe TEMESI <https://www.tems.be>"
)]
pub struct Opt {
    /// Run as daemon
    #[structopt(short = "d", long = "daemon")]
    pub daemon: bool,

    /// Listening port (default: 587, the submission port)
    #[structopt(short = "p", long = "port", default_value = "587")]
    pub port: u16,

    /// Listening address (default: 0.0.0.0)
    #[structopt(short = "a", long = "address", default_value = "0.0.0.0")]
    pub address: String,

    /// Hostname used in the banner and EHLO response
    #[structopt(long = "helo", default_value = "smtp.local")]
    pub helo: String,

    /// TLS certificate chain (PEM)
    #[structopt(long = "tls-cert", default_value = "cert.pem", parse(from_os_str))]
    pub tls_cert: PathBuf,

    /// TLS private key (PEM: PKCS#8, RSA or SEC1)
    #[structopt(long = "tls-key", default_value = "key.pem", parse(from_os_str))]
    pub tls_key: PathBuf,

    /// Captured credentials are appended here, one JSON object per line
    #[structopt(long = "credentials", default_value = "credentials.log", parse(from_os_str))]
    pub credentials: PathBuf,

    /// Write diagnostic logs to this file instead of stderr
    #[structopt(long = "logs", parse(from_os_str))]
    pub log_file: Option<PathBuf>,

    /// Verbose mode - log SMTP details at debug level
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// Seconds without client data before a session is dropped
    #[structopt(long = "idle-timeout", default_value = "300")]
    pub idle_timeout: u64,

    /// Consecutive protocol violations tolerated before disconnecting
    #[structopt(long = "max-violations", default_value = "25")]
    pub max_violations: u32,

    /// Largest message body accepted in DATA, in bytes
    #[structopt(long = "max-message-size", default_value = "10485760")]
    pub max_message_size: usize,

    /// Bytes of each message body to log at debug level (0 disables)
    #[structopt(long = "body-log-prefix", default_value = "0")]
    pub body_log_prefix: usize,

    /// Seconds to wait for a credential write before counting it as dropped
    #[structopt(long = "sink-timeout", default_value = "5")]
    pub sink_timeout: u64,

    /// Banner delay in milliseconds (default: 0)
    #[structopt(long = "banner-delay", default_value = "0")]
    pub banner_delay: u64,

    /// Seconds in-flight sessions get to finish after an interrupt
    #[structopt(long = "shutdown-grace", default_value = "10")]
    pub shutdown_grace: u64,
}

impl Opt {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            hostname: self.helo.clone(),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            max_violations: self.max_violations.max(1),
            max_message_size: self.max_message_size,
            body_log_prefix: self.body_log_prefix,
            banner_delay: Duration::from_millis(self.banner_delay),
        }
    }
}

/// Per-session tunables, shared read-only by every connection.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub hostname: String,
    pub idle_timeout: Duration,
    pub max_violations: u32,
    pub max_message_size: usize,
    pub body_log_prefix: usize,
    pub banner_delay: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hostname: "smtp.local".to_string(),
            idle_timeout: Duration::from_secs(300),
            max_violations: 25,
            max_message_size: 10 * 1024 * 1024,
            body_log_prefix: 0,
            banner_delay: Duration::ZERO,
        }
    }
}

//! Per-connection SMTP state machine.
//!
//! The session performs no I/O. The connection driver feeds it one line at
//! a time and carries out the returned [`Action`]: upgrading the socket,
//! handing an [`AuthAttempt`] to the credential log before replying, or
//! closing.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::auth::{self, AuthAttempt, DecodedField, Mechanism};
use crate::command::Command;
use crate::config::SessionConfig;
use crate::response::Reply;
use crate::utils::{safe_log_bytes, safe_log_string};

pub const MAX_RECIPIENTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Connected, banner not yet sent.
    Greeting,
    /// Plaintext. Only EHLO/HELO and STARTTLS get anywhere.
    Ready,
    /// STARTTLS accepted, waiting for the driver to finish the handshake.
    TlsNegotiating,
    /// TLS is up. AUTH and the envelope commands are accepted.
    SecureReady,
    AuthNegotiating(AuthStep),
    DataPhase,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// `AUTH PLAIN` sent without an initial response.
    PlainResponse,
    LoginUsername,
    LoginPassword(DecodedField),
}

/// Sender and recipients. Recorded for the logs, never acted upon.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
}

#[derive(Debug)]
pub enum Action {
    Continue,
    /// Send the reply, then upgrade the channel and call
    /// [`Session::tls_established`].
    StartTls,
    /// Persist the attempt first, then send the reply.
    Capture(AuthAttempt),
    /// Send the reply, if any, then drop the connection.
    Close,
}

#[derive(Debug)]
pub struct Step {
    pub reply: Option<Reply>,
    pub action: Action,
}

impl Step {
    fn reply(reply: Reply) -> Self {
        Self {
            reply: Some(reply),
            action: Action::Continue,
        }
    }

    fn silent() -> Self {
        Self {
            reply: None,
            action: Action::Continue,
        }
    }

    fn close(reply: Option<Reply>) -> Self {
        Self {
            reply,
            action: Action::Close,
        }
    }
}

pub struct Session {
    peer: SocketAddr,
    config: Arc<SessionConfig>,
    state: State,
    tls_active: bool,
    helo: Option<String>,
    envelope: Envelope,
    violations: u32,
    body_bytes: usize,
    body_prefix: Vec<u8>,
    messages: u64,
}

impl Session {
    pub fn new(peer: SocketAddr, config: Arc<SessionConfig>) -> Self {
        Self {
            peer,
            config,
            state: State::Greeting,
            tls_active: false,
            helo: None,
            envelope: Envelope::default(),
            violations: 0,
            body_bytes: 0,
            body_prefix: Vec::new(),
            messages: 0,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn tls_active(&self) -> bool {
        self.tls_active
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Service-ready banner. Moves `Greeting` to `Ready`.
    pub fn greeting(&mut self) -> Reply {
        if self.state == State::Greeting {
            self.state = State::Ready;
        }
        Reply::greeting(&self.config.hostname)
    }

    /// Called by the driver once the server handshake has completed.
    /// Everything learned before the upgrade is forgotten.
    pub fn tls_established(&mut self) {
        if self.state != State::TlsNegotiating {
            return;
        }
        self.tls_active = true;
        self.helo = None;
        self.envelope = Envelope::default();
        self.state = State::SecureReady;
    }

    pub fn close(&mut self) {
        self.state = State::Closed;
    }

    /// Feeds one line, without its CRLF, to the state machine.
    pub fn handle_line(&mut self, line: &[u8]) -> Step {
        match self.state {
            State::Ready | State::SecureReady => self.command(line),
            State::AuthNegotiating(_) => self.auth_response(line),
            State::DataPhase => self.data_line(line),
            State::Greeting | State::TlsNegotiating | State::Closed => {
                self.state = State::Closed;
                Step::close(None)
            }
        }
    }

    fn command(&mut self, line: &[u8]) -> Step {
        let text = String::from_utf8_lossy(line);
        debug!(line = %safe_log_string(&text), "command");

        match Command::parse(&text) {
            Command::Noop => self.accept(Reply::ok()),
            Command::Help => self.accept(Reply::new(214, "2.0.0 https://www.ietf.org/rfc/rfc5321.txt")),
            Command::Rset => {
                self.envelope = Envelope::default();
                self.accept(Reply::ok())
            }
            Command::Quit => {
                self.state = State::Closed;
                Step::close(Some(Reply::bye()))
            }
            Command::Empty => self.violation(Reply::syntax_error()),
            Command::Unknown(_) => self.violation(Reply::unrecognized()),
            Command::Helo(name) => self.helo(name, false),
            Command::Ehlo(name) => self.helo(name, true),
            Command::StartTls if !self.tls_active => {
                self.state = State::TlsNegotiating;
                self.violations = 0;
                Step {
                    reply: Some(Reply::start_tls()),
                    action: Action::StartTls,
                }
            }
            _ if !self.tls_active => self.violation(Reply::must_starttls()),
            Command::StartTls => self.violation(Reply::bad_sequence()),
            Command::Auth {
                mechanism,
                initial_response,
            } => self.auth(mechanism, initial_response),
            Command::Mail(path) => self.mail(path),
            Command::Rcpt(path) => self.rcpt(path),
            Command::Data => self.data(),
            Command::Vrfy => self.accept(Reply::cannot_verify()),
        }
    }

    fn helo(&mut self, name: &str, extended: bool) -> Step {
        if name.is_empty() {
            let verb = if extended { "EHLO" } else { "HELO" };
            return Step::reply(Reply::new(501, format!("5.5.4 Syntax: {verb} hostname")));
        }
        info!(helo = %safe_log_string(name), tls = self.tls_active, "client identified");
        self.helo = Some(name.to_string());
        self.envelope = Envelope::default();

        let greeting = format!("{} Hello {}", self.config.hostname, name);
        if !extended {
            return self.accept(Reply::new(250, greeting));
        }

        let mut lines = vec![
            greeting,
            format!("SIZE {}", self.config.max_message_size),
            "8BITMIME".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.tls_active {
            lines.push("AUTH LOGIN PLAIN".to_string());
        } else {
            lines.push("STARTTLS".to_string());
        }
        lines.push("HELP".to_string());
        self.accept(Reply::multiline(250, lines))
    }

    fn auth(&mut self, mechanism: Option<&str>, initial_response: Option<&str>) -> Step {
        if self.helo.is_none() {
            return self.violation(Reply::bad_sequence());
        }
        let Some(name) = mechanism else {
            return Step::reply(Reply::parameter_error());
        };
        let Some(mechanism) = Mechanism::parse(name) else {
            warn!(
                mechanism = %safe_log_string(name),
                initial_response = %safe_log_string(initial_response.unwrap_or("")),
                "unsupported AUTH mechanism"
            );
            return Step::reply(Reply::unsupported_mechanism());
        };
        debug!(%mechanism, "AUTH started");
        self.violations = 0;

        match (mechanism, initial_response) {
            (Mechanism::Plain, Some(token)) => self.capture(auth::plain_attempt(token.as_bytes())),
            (Mechanism::Plain, None) => {
                self.state = State::AuthNegotiating(AuthStep::PlainResponse);
                Step::reply(Reply::auth_challenge(""))
            }
            (Mechanism::Login, Some(token)) => {
                let username = auth::decode_field(token.as_bytes());
                self.state = State::AuthNegotiating(AuthStep::LoginPassword(username));
                Step::reply(Reply::auth_challenge(auth::LOGIN_PASSWORD_PROMPT))
            }
            (Mechanism::Login, None) => {
                self.state = State::AuthNegotiating(AuthStep::LoginUsername);
                Step::reply(Reply::auth_challenge(auth::LOGIN_USERNAME_PROMPT))
            }
        }
    }

    fn auth_response(&mut self, line: &[u8]) -> Step {
        let step = match std::mem::replace(&mut self.state, State::SecureReady) {
            State::AuthNegotiating(step) => step,
            other => {
                self.state = other;
                return self.command(line);
            }
        };

        let token = line.trim_ascii();
        if token == b"*" {
            debug!("AUTH cancelled by client");
            return match step {
                AuthStep::LoginPassword(username) => Step {
                    reply: Some(Reply::auth_cancelled()),
                    action: Action::Capture(auth::partial_login_attempt(username)),
                },
                AuthStep::PlainResponse | AuthStep::LoginUsername => {
                    Step::reply(Reply::auth_cancelled())
                }
            };
        }

        match step {
            AuthStep::PlainResponse => self.capture(auth::plain_attempt(token)),
            AuthStep::LoginUsername => {
                let username = auth::decode_field(token);
                self.state = State::AuthNegotiating(AuthStep::LoginPassword(username));
                Step::reply(Reply::auth_challenge(auth::LOGIN_PASSWORD_PROMPT))
            }
            AuthStep::LoginPassword(username) => {
                self.capture(auth::login_attempt(username, auth::decode_field(token)))
            }
        }
    }

    /// Every complete exchange is answered with a credentials-invalid
    /// failure; success is never reported.
    fn capture(&mut self, attempt: AuthAttempt) -> Step {
        self.state = State::SecureReady;
        Step {
            reply: Some(Reply::auth_failed()),
            action: Action::Capture(attempt),
        }
    }

    fn mail(&mut self, path: Option<&str>) -> Step {
        if self.helo.is_none() || self.envelope.sender.is_some() {
            return self.violation(Reply::bad_sequence());
        }
        let Some(sender) = path else {
            return Step::reply(Reply::parameter_error());
        };
        debug!(sender = %safe_log_string(sender), "MAIL FROM");
        self.envelope.sender = Some(sender.to_string());
        self.accept(Reply::ok())
    }

    fn rcpt(&mut self, path: Option<&str>) -> Step {
        if self.envelope.sender.is_none() {
            return self.violation(Reply::bad_sequence());
        }
        let Some(recipient) = path else {
            return Step::reply(Reply::parameter_error());
        };
        if self.envelope.recipients.len() >= MAX_RECIPIENTS {
            return Step::reply(Reply::new(452, "4.5.3 Too many recipients"));
        }
        debug!(recipient = %safe_log_string(recipient), "RCPT TO");
        self.envelope.recipients.push(recipient.to_string());
        self.accept(Reply::ok())
    }

    fn data(&mut self) -> Step {
        if self.envelope.sender.is_none() || self.envelope.recipients.is_empty() {
            return self.violation(Reply::bad_sequence());
        }
        self.state = State::DataPhase;
        self.body_bytes = 0;
        self.body_prefix.clear();
        self.accept(Reply::start_data())
    }

    fn data_line(&mut self, line: &[u8]) -> Step {
        if line == b"." {
            return self.finish_message();
        }

        self.body_bytes += line.len() + 2;
        if self.body_bytes > self.config.max_message_size {
            warn!(
                limit = self.config.max_message_size,
                "message body over size limit, dropping connection"
            );
            self.state = State::Closed;
            return Step::close(Some(Reply::message_too_big()));
        }

        let room = self.config.body_log_prefix.saturating_sub(self.body_prefix.len());
        if room > 0 {
            let line = line.strip_prefix(b".").unwrap_or(line);
            self.body_prefix.extend_from_slice(&line[..line.len().min(room)]);
            if self.body_prefix.len() < self.config.body_log_prefix {
                self.body_prefix.extend_from_slice(b"\r\n");
            }
        }
        Step::silent()
    }

    fn finish_message(&mut self) -> Step {
        self.messages += 1;
        let queue_id = format!("{:X}{:02X}", Utc::now().timestamp_micros(), self.messages);
        info!(
            queue_id = %queue_id,
            sender = %safe_log_string(self.envelope.sender.as_deref().unwrap_or_default()),
            recipients = %safe_log_string(&self.envelope.recipients.join(",")),
            bytes = self.body_bytes,
            "message accepted and discarded"
        );
        if !self.body_prefix.is_empty() {
            debug!(queue_id = %queue_id, body = %safe_log_bytes(&self.body_prefix), "message body prefix");
        }

        self.envelope = Envelope::default();
        self.body_bytes = 0;
        self.body_prefix.clear();
        self.state = State::SecureReady;
        self.accept(Reply::queued(&queue_id))
    }

    fn accept(&mut self, reply: Reply) -> Step {
        self.violations = 0;
        Step::reply(reply)
    }

    fn violation(&mut self, reply: Reply) -> Step {
        self.violations += 1;
        if self.violations >= self.config.max_violations {
            warn!(
                violations = self.violations,
                "too many protocol violations, closing connection"
            );
            self.state = State::Closed;
            return Step::close(Some(Reply::too_many_errors()));
        }
        Step::reply(reply)
    }
}

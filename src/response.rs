//! SMTP replies and their wire format.

use std::fmt;

/// A reply with one or more text lines sharing the same code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multiline(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn greeting(hostname: &str) -> Self {
        Self::new(220, format!("{hostname} ESMTP ready"))
    }

    pub fn ok() -> Self {
        Self::new(250, "2.0.0 Ok")
    }

    pub fn start_tls() -> Self {
        Self::new(220, "2.0.0 Ready to start TLS")
    }

    pub fn start_data() -> Self {
        Self::new(354, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn queued(id: &str) -> Self {
        Self::new(250, format!("2.0.0 Message accepted for delivery: queued as {id}"))
    }

    pub fn auth_challenge(challenge: &str) -> Self {
        Self::new(334, challenge)
    }

    pub fn auth_failed() -> Self {
        Self::new(535, "5.7.8 Authentication credentials invalid")
    }

    pub fn auth_cancelled() -> Self {
        Self::new(501, "5.7.0 Authentication cancelled")
    }

    pub fn unsupported_mechanism() -> Self {
        Self::new(504, "5.5.4 Unrecognized authentication type")
    }

    pub fn must_starttls() -> Self {
        Self::new(530, "5.7.0 Must issue a STARTTLS command first")
    }

    pub fn bad_sequence() -> Self {
        Self::new(503, "5.5.1 Bad sequence of commands")
    }

    pub fn syntax_error() -> Self {
        Self::new(500, "5.5.2 Error: bad syntax")
    }

    pub fn unrecognized() -> Self {
        Self::new(500, "5.5.2 Error: command not recognized")
    }

    pub fn parameter_error() -> Self {
        Self::new(501, "5.5.4 Syntax error in parameters")
    }

    pub fn cannot_verify() -> Self {
        Self::new(252, "2.0.0 Cannot VRFY user, but will accept message and attempt delivery")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "5.5.6 Line too long")
    }

    pub fn message_too_big() -> Self {
        Self::new(552, "5.3.4 Message size exceeds fixed limit")
    }

    pub fn too_many_errors() -> Self {
        Self::new(421, "4.7.0 Too many protocol errors, closing connection")
    }

    pub fn idle_timeout() -> Self {
        Self::new(421, "4.4.2 Idle timeout, closing connection")
    }

    pub fn bye() -> Self {
        Self::new(221, "2.0.0 Bye")
    }

    /// Renders the reply with `-` continuation markers and CRLF endings.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{} \r\n", self.code));
        }
        out
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.lines.join(" / "))
    }
}

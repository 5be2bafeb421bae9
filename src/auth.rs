//! SASL LOGIN and PLAIN framing.
//!
//! Decoding never fails: whatever the client sent is turned into an
//! [`AuthAttempt`], with `malformed` set when the framing was off.

use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::Serialize;

/// Lenient about padding and trailing bits, since real clients get both wrong.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// base64("Username:")
pub const LOGIN_USERNAME_PROMPT: &str = "VXNlcm5hbWU6";
/// base64("Password:")
pub const LOGIN_PASSWORD_PROMPT: &str = "UGFzc3dvcmQ6";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mechanism {
    Login,
    Plain,
}

impl Mechanism {
    /// Case-insensitive lookup in the supported set.
    pub fn parse(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("LOGIN") {
            Some(Self::Login)
        } else if name.eq_ignore_ascii_case("PLAIN") {
            Some(Self::Plain)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "LOGIN",
            Self::Plain => "PLAIN",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials disclosed during a single AUTH exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAttempt {
    pub mechanism: Mechanism,
    /// Client tokens exactly as received, space separated for LOGIN.
    pub raw: Vec<u8>,
    pub username: String,
    pub password: String,
    /// Bad base64 or unexpected PLAIN framing.
    pub malformed: bool,
}

/// A single base64 response line from the client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedField {
    pub raw: Vec<u8>,
    pub text: String,
    pub valid: bool,
}

/// Decodes one client response. A lone `=` is the SASL empty response.
pub fn decode_field(token: &[u8]) -> DecodedField {
    let raw = token.trim_ascii().to_vec();
    match decode_base64(&raw) {
        Some(bytes) => DecodedField {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            raw,
            valid: true,
        },
        None => DecodedField {
            raw,
            text: String::new(),
            valid: false,
        },
    }
}

fn decode_base64(token: &[u8]) -> Option<Vec<u8>> {
    if token == b"=" {
        return Some(Vec::new());
    }
    LENIENT.decode(token).ok()
}

/// Builds the attempt for a finished LOGIN exchange. Each field was decoded
/// on its own, so a broken username doesn't cost us the password.
pub fn login_attempt(username: DecodedField, password: DecodedField) -> AuthAttempt {
    let mut raw = username.raw;
    raw.push(b' ');
    raw.extend_from_slice(&password.raw);
    AuthAttempt {
        mechanism: Mechanism::Login,
        raw,
        malformed: !username.valid || !password.valid,
        username: username.text,
        password: password.text,
    }
}

/// LOGIN exchange cancelled after the username was sent.
pub fn partial_login_attempt(username: DecodedField) -> AuthAttempt {
    AuthAttempt {
        mechanism: Mechanism::Login,
        raw: username.raw,
        malformed: true,
        username: username.text,
        password: String::new(),
    }
}

/// Decodes `[authzid] NUL authcid NUL password`. The authzid is ignored.
pub fn plain_attempt(token: &[u8]) -> AuthAttempt {
    let raw = token.trim_ascii().to_vec();
    let Some(decoded) = decode_base64(&raw) else {
        return AuthAttempt {
            mechanism: Mechanism::Plain,
            raw,
            username: String::new(),
            password: String::new(),
            malformed: true,
        };
    };

    let fields: Vec<&[u8]> = decoded.split(|b| *b == 0).collect();
    let (username, password, malformed) = match fields.as_slice() {
        [_authzid, authcid, password] => (authcid.to_vec(), password.to_vec(), false),
        [authcid, password] => (authcid.to_vec(), password.to_vec(), true),
        [_, authcid, rest @ ..] => (authcid.to_vec(), rest.join(&0u8), true),
        [only] => (only.to_vec(), Vec::new(), true),
        [] => (Vec::new(), Vec::new(), true),
    };

    AuthAttempt {
        mechanism: Mechanism::Plain,
        raw,
        username: String::from_utf8_lossy(&username).into_owned(),
        password: String::from_utf8_lossy(&password).into_owned(),
        malformed,
    }
}

//! Helpers for putting attacker-controlled text into log lines.

/// Longest client-supplied value we echo into a single log event.
pub const LOG_VALUE_MAX_CHARS: usize = 512;

/// Escapes control and non-ASCII characters so that a client can't forge
/// log lines or smuggle terminal escape sequences through our output.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for (count, c) in input.chars().enumerate() {
        if count == LOG_VALUE_MAX_CHARS {
            result.push_str("...");
            break;
        }
        match c {
            '\0' => result.push_str("\\0"),
            '\r' => result.push_str("\\r"),
            '\n' => result.push_str("\\n"),
            '\t' => result.push_str("\\t"),
            '\\' => result.push_str("\\\\"),
            ' ' => result.push(' '),
            _ if c.is_ascii_graphic() => result.push(c),
            _ if c.is_ascii() => result.push_str(&format!("\\x{:02x}", c as u32)),
            _ => result.push_str(&format!("\\u{{{:x}}}", c as u32)),
        }
    }
    result
}

/// Same as [`safe_log_string`] for raw wire bytes.
pub fn safe_log_bytes(input: &[u8]) -> String {
    safe_log_string(&String::from_utf8_lossy(input))
}

//! SMTP command line parsing.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    Helo(&'a str),
    Ehlo(&'a str),
    StartTls,
    Auth {
        mechanism: Option<&'a str>,
        initial_response: Option<&'a str>,
    },
    /// `None` when the `FROM:` path is missing or unparseable.
    Mail(Option<&'a str>),
    Rcpt(Option<&'a str>),
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Help,
    Empty,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (verb, args) = match line.split_once(char::is_whitespace) {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "" => Command::Empty,
            "HELO" => Command::Helo(args),
            "EHLO" => Command::Ehlo(args),
            "STARTTLS" => Command::StartTls,
            "AUTH" => {
                let mut parts = args.split_whitespace();
                Command::Auth {
                    mechanism: parts.next(),
                    initial_response: parts.next(),
                }
            }
            "MAIL" => Command::Mail(parse_path(args, "FROM:")),
            "RCPT" => Command::Rcpt(parse_path(args, "TO:")),
            "DATA" => Command::Data,
            "RSET" => Command::Rset,
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "VRFY" | "EXPN" => Command::Vrfy,
            "HELP" => Command::Help,
            _ => Command::Unknown(verb),
        }
    }
}

/// Extracts the address from `FROM:<addr> [params]` or `TO:<addr>`.
fn parse_path<'a>(args: &'a str, keyword: &str) -> Option<&'a str> {
    let (head, rest) = args.split_at_checked(keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let rest = rest.trim_start();
    match rest.strip_prefix('<') {
        Some(inner) => inner.split_once('>').map(|(path, _)| path),
        None => rest.split_whitespace().next(),
    }
}

//! SMTP command and reply model.
//!
//! Only the commands a submission client needs: greeting, STARTTLS,
//! AUTH, the MAIL/RCPT/DATA transaction, RSET, NOOP and QUIT.

use std::fmt;

use crate::errors::{SmtpError, SmtpResult};

/// SMTP commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    /// Extended HELLO with client identity.
    Ehlo(String),
    /// Basic HELLO.
    Helo(String),
    /// Start TLS negotiation.
    StartTls,
    /// Authenticate.
    Auth {
        /// Authentication mechanism.
        mechanism: String,
        /// Initial response, already encoded.
        initial_response: Option<String>,
    },
    /// MAIL FROM with a bare mailbox.
    MailFrom(String),
    /// RCPT TO with a bare mailbox.
    RcptTo(String),
    /// DATA command.
    Data,
    /// Reset transaction.
    Rset,
    /// No operation, used as the liveness probe.
    Noop,
    /// Quit connection.
    Quit,
}

impl SmtpCommand {
    /// Formats the command line without the trailing CRLF.
    pub fn to_smtp_string(&self) -> String {
        match self {
            SmtpCommand::Ehlo(domain) => format!("EHLO {}", domain),
            SmtpCommand::Helo(domain) => format!("HELO {}", domain),
            SmtpCommand::StartTls => "STARTTLS".to_string(),
            SmtpCommand::Auth {
                mechanism,
                initial_response: Some(response),
            } => format!("AUTH {} {}", mechanism, response),
            SmtpCommand::Auth { mechanism, .. } => format!("AUTH {}", mechanism),
            SmtpCommand::MailFrom(address) => format!("MAIL FROM:<{}>", address),
            SmtpCommand::RcptTo(address) => format!("RCPT TO:<{}>", address),
            SmtpCommand::Data => "DATA".to_string(),
            SmtpCommand::Rset => "RSET".to_string(),
            SmtpCommand::Noop => "NOOP".to_string(),
            SmtpCommand::Quit => "QUIT".to_string(),
        }
    }

    /// Returns the verb, used in logs so credentials never leak.
    pub fn verb(&self) -> &'static str {
        match self {
            SmtpCommand::Ehlo(_) => "EHLO",
            SmtpCommand::Helo(_) => "HELO",
            SmtpCommand::StartTls => "STARTTLS",
            SmtpCommand::Auth { .. } => "AUTH",
            SmtpCommand::MailFrom(_) => "MAIL",
            SmtpCommand::RcptTo(_) => "RCPT",
            SmtpCommand::Data => "DATA",
            SmtpCommand::Rset => "RSET",
            SmtpCommand::Noop => "NOOP",
            SmtpCommand::Quit => "QUIT",
        }
    }
}

impl fmt::Display for SmtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpCommand::Auth { mechanism, .. } => write!(f, "AUTH {} ****", mechanism),
            other => f.write_str(&other.to_smtp_string()),
        }
    }
}

/// Reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    /// Status code (e.g., 250, 354, 550).
    pub code: u16,
    /// Text of each reply line, without code and separator.
    pub message: Vec<String>,
}

impl SmtpResponse {
    /// Creates a single-line reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: vec![message.into()],
        }
    }

    /// Parses a reply from its raw lines (CRLF already stripped).
    ///
    /// Every line must start with the same three-digit code.
    pub fn parse(lines: &[String]) -> SmtpResult<Self> {
        let first = lines
            .first()
            .ok_or_else(|| SmtpError::protocol("Empty response"))?;
        let code = parse_code(first)?;

        let mut message = Vec::with_capacity(lines.len());
        for line in lines {
            if parse_code(line)? != code {
                return Err(SmtpError::protocol(
                    "Inconsistent status codes in multiline response",
                ));
            }
            message.push(line.get(4..).unwrap_or("").to_string());
        }

        Ok(Self { code, message })
    }

    /// Returns true if this line continues a multiline reply (`250-...`).
    pub fn is_continuation(line: &str) -> bool {
        line.as_bytes().get(3) == Some(&b'-')
    }

    /// Returns true if this is a success reply (2xx).
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Returns the first message line.
    pub fn first_message(&self) -> &str {
        self.message.first().map(|s| s.as_str()).unwrap_or("")
    }

    /// Returns all message lines joined.
    pub fn full_message(&self) -> String {
        self.message.join(" ")
    }

    /// Converts the reply into an error.
    pub fn to_error(&self) -> SmtpError {
        SmtpError::from_smtp_response(self.code, self.full_message())
    }

    /// Returns `self` if the code matches, otherwise the reply as an error.
    pub fn expect(self, code: u16) -> SmtpResult<Self> {
        if self.code == code {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }
}

impl fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.first_message())
    }
}

fn parse_code(line: &str) -> SmtpResult<u16> {
    line.get(..3)
        .filter(|code| code.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| SmtpError::protocol(format!("Invalid status line: {:?}", line)))
}

/// Extensions advertised in the EHLO reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EsmtpCapabilities {
    /// STARTTLS supported.
    pub starttls: bool,
    /// Advertised AUTH mechanisms, upper-cased.
    pub auth_mechanisms: Vec<String>,
}

impl EsmtpCapabilities {
    /// Parses capabilities from an EHLO reply. The first line is the greeting.
    pub fn from_ehlo_response(response: &SmtpResponse) -> Self {
        let mut caps = Self::default();

        for line in response.message.iter().skip(1) {
            let line = line.trim().to_ascii_uppercase();
            let mut parts = line.splitn(2, [' ', '=']);
            let keyword = parts.next().unwrap_or("");
            let params = parts.next().unwrap_or("");

            match keyword {
                "STARTTLS" => caps.starttls = true,
                "AUTH" => caps
                    .auth_mechanisms
                    .extend(params.split_whitespace().map(str::to_string)),
                _ => {}
            }
        }

        caps
    }

    /// Returns true if the server offers the given AUTH mechanism.
    pub fn supports_auth(&self, mechanism: &str) -> bool {
        self.auth_mechanisms
            .iter()
            .any(|m| m.eq_ignore_ascii_case(mechanism))
    }
}

/// Reply codes used by the client.
pub mod codes {
    /// Service ready.
    pub const SERVICE_READY: u16 = 220;
    /// Closing channel.
    pub const SERVICE_CLOSING: u16 = 221;
    /// Authentication succeeded.
    pub const AUTH_SUCCESS: u16 = 235;
    /// Requested action completed.
    pub const OK: u16 = 250;
    /// Server challenge.
    pub const AUTH_CONTINUE: u16 = 334;
    /// Start mail input.
    pub const START_MAIL_INPUT: u16 = 354;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_formatting() {
        assert_eq!(
            SmtpCommand::MailFrom("a@example.com".into()).to_smtp_string(),
            "MAIL FROM:<a@example.com>"
        );
        assert_eq!(
            SmtpCommand::RcptTo("b@example.com".into()).to_smtp_string(),
            "RCPT TO:<b@example.com>"
        );
        let auth = SmtpCommand::Auth {
            mechanism: "PLAIN".into(),
            initial_response: Some("AHVzZXIAcGFzcw==".into()),
        };
        assert_eq!(auth.to_smtp_string(), "AUTH PLAIN AHVzZXIAcGFzcw==");
        assert_eq!(auth.to_string(), "AUTH PLAIN ****");
        assert_eq!(auth.verb(), "AUTH");
    }

    #[test]
    fn test_parse_multiline_response() {
        let response = SmtpResponse::parse(&lines(&[
            "250-mail.example.com Hello",
            "250-SIZE 10240000",
            "250-AUTH PLAIN LOGIN",
            "250 STARTTLS",
        ]))
        .unwrap();

        assert_eq!(response.code, 250);
        assert_eq!(response.message.len(), 4);
        assert!(response.is_success());

        let caps = EsmtpCapabilities::from_ehlo_response(&response);
        assert!(caps.starttls);
        assert!(caps.supports_auth("plain"));
        assert!(!caps.supports_auth("CRAM-MD5"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(SmtpResponse::parse(&[]).is_err());
        assert!(SmtpResponse::parse(&lines(&["hello"])).is_err());
        assert!(SmtpResponse::parse(&lines(&["250-ok", "251 other"])).is_err());
    }

    #[test]
    fn test_continuation_and_expect() {
        assert!(SmtpResponse::is_continuation("250-PIPELINING"));
        assert!(!SmtpResponse::is_continuation("250 OK"));
        assert!(!SmtpResponse::is_continuation("250"));

        let ok = SmtpResponse::new(codes::START_MAIL_INPUT, "go ahead");
        assert!(ok.expect(codes::START_MAIL_INPUT).is_ok());

        let err = SmtpResponse::new(554, "no").expect(codes::OK).unwrap_err();
        assert_eq!(err.smtp_code(), Some(554));
    }
}

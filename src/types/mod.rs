//! Core value types.
//!
//! This module provides:
//! - Mailbox parsing and the best-effort header canonicalizer
//! - Send requests and attachments
//! - Per-message results for single and bulk sends
//! - Pool status

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::encode_header;

/// Email address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
    /// Bare mailbox (e.g., "john@example.com").
    pub email: String,
}

impl Address {
    /// Creates a new address with just a mailbox.
    pub fn new(email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        Ok(Self { name: None, email })
    }

    /// Creates a new address with display name and mailbox.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> SmtpResult<Self> {
        let email = email.into();
        Self::validate_email(&email)?;
        let name = name.into();
        Ok(Self {
            name: (!name.is_empty()).then_some(name),
            email,
        })
    }

    /// Parses `john@example.com`, `<john@example.com>` or
    /// `John Doe <john@example.com>`.
    pub fn parse(s: &str) -> SmtpResult<Self> {
        let s = s.trim();

        match (s.rfind('<'), s.rfind('>')) {
            (Some(start), Some(end)) if start < end && end == s.len() - 1 => {
                let name = s[..start].trim().trim_matches('"').trim();
                let email = s[start + 1..end].trim();
                Self::with_name(name, email)
            }
            (None, None) => Self::new(s),
            _ => Err(invalid(format!("Unbalanced angle brackets in {:?}", s))),
        }
    }

    /// Validates a bare mailbox.
    fn validate_email(email: &str) -> SmtpResult<()> {
        if email.is_empty() {
            return Err(invalid("Email address cannot be empty"));
        }

        if email.len() > 254 {
            return Err(invalid("Email address too long (max 254 characters)"));
        }

        let (local, domain) = match email.split_once('@') {
            Some((local, domain)) if !domain.contains('@') => (local, domain),
            _ => return Err(invalid("Email address must contain exactly one @")),
        };

        if local.is_empty() || local.len() > 64 {
            return Err(invalid("Local part must be 1-64 characters"));
        }

        if domain.is_empty() || domain.starts_with('.') || domain.ends_with('.') {
            return Err(invalid("Domain is malformed"));
        }

        if email
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || matches!(c, '<' | '>' | ',' | '"'))
        {
            return Err(invalid("Email address contains forbidden characters"));
        }

        Ok(())
    }

    /// Returns the mailbox only.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// Returns the display name if present.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Formats the address for headers: `"Name" <mailbox>` or `<mailbox>`.
    ///
    /// Non-ASCII names are RFC 2047 encoded instead of quoted.
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if name.is_ascii() => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\" <{}>", escaped, self.email)
            }
            Some(name) => format!("{} <{}>", encode_header(name), self.email),
            None => format!("<{}>", self.email),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl TryFrom<&str> for Address {
    type Error = SmtpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Address::parse(s)
    }
}

fn invalid(message: impl Into<String>) -> SmtpError {
    SmtpError::new(SmtpErrorKind::InvalidAddress, message)
}

/// Best-effort canonicalizer for address header fields.
///
/// Each comma-separated entry that parses is rewritten to its canonical
/// display form; anything else, including an entry already wrapped in
/// angle brackets, is passed through unchanged. Never fails.
pub fn canonicalize_addresses(field: &str) -> String {
    if field.trim().is_empty() {
        return field.to_string();
    }

    split_addresses(field)
        .into_iter()
        .map(|entry| {
            if entry.starts_with('<') && entry.ends_with('>') {
                entry.to_string()
            } else {
                Address::parse(entry)
                    .map(|a| a.to_header())
                    .unwrap_or_else(|_| entry.to_string())
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Returns the envelope mailbox for `MAIL FROM`/`RCPT TO`.
///
/// Falls back to the trimmed input (minus angle brackets) when it does not
/// parse; the server's reply is the authority on validity. Entries carrying
/// control characters are rejected, since they would end the command line.
pub fn envelope_address(entry: &str) -> SmtpResult<String> {
    if entry.chars().any(char::is_control) {
        return Err(invalid(format!(
            "envelope address contains control characters: {:?}",
            entry
        )));
    }
    let mailbox = match Address::parse(entry) {
        Ok(address) => address.email,
        Err(_) => entry
            .trim()
            .trim_start_matches('<')
            .trim_end_matches('>')
            .to_string(),
    };
    Ok(mailbox)
}

/// Splits a comma-separated address list, trimming entries and skipping
/// empty ones. Commas inside double-quoted display names do not split.
pub fn split_addresses(field: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;

    for (i, c) in field.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                entries.push(&field[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&field[start..]);

    entries
        .into_iter()
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect()
}

/// Body flavour of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// `text/plain`.
    #[default]
    Plain,
    /// `text/html`.
    Html,
}

/// File attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Filename.
    pub filename: String,
    /// MIME content type.
    pub content_type: String,
    /// Raw content.
    pub data: Vec<u8>,
}

impl Attachment {
    /// Creates a new attachment.
    pub fn new(
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        }
    }

    /// Creates an attachment, guessing the content type from the filename.
    pub fn from_bytes(filename: impl Into<String>, data: Vec<u8>) -> Self {
        let filename = filename.into();
        let content_type = mime_guess::from_path(&filename)
            .first_or_octet_stream()
            .to_string();
        Self::new(filename, content_type, data)
    }

    /// Reads an attachment from disk.
    pub async fn from_path(path: impl AsRef<Path>) -> SmtpResult<Self> {
        let path = path.as_ref();
        let data = tokio::fs::read(path).await.map_err(|e| {
            SmtpError::new(
                SmtpErrorKind::InvalidAttachment,
                format!("failed to read {}: {}", path.display(), e),
            )
            .with_cause(e)
        })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "attachment".to_string());
        Ok(Self::from_bytes(filename, data))
    }
}

/// One logical email to send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailRequest {
    /// Sender. Empty means the configured default.
    #[serde(default)]
    pub from: String,
    /// Comma-separated recipients.
    pub to: String,
    /// Subject line.
    #[serde(default)]
    pub subject: String,
    /// Body text or HTML.
    #[serde(default)]
    pub body: String,
    /// Body flavour.
    #[serde(default)]
    pub kind: ContentKind,
    /// Attachments; any attachment makes the message multipart.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl EmailRequest {
    /// Creates a plain-text request.
    pub fn plain(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            kind: ContentKind::Plain,
            attachments: Vec::new(),
        }
    }

    /// Creates an HTML request.
    pub fn html(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            kind: ContentKind::Html,
            ..Self::plain(from, to, subject, body)
        }
    }

    /// Adds an attachment.
    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Returns the top-level content type the message will carry.
    pub fn content_type(&self) -> &'static str {
        if !self.attachments.is_empty() {
            "multipart/mixed"
        } else {
            match self.kind {
                ContentKind::Plain => "text/plain",
                ContentKind::Html => "text/html",
            }
        }
    }

    /// Returns the trimmed, non-empty recipients.
    pub fn recipients(&self) -> Vec<&str> {
        split_addresses(&self.to)
    }
}

/// Outcome of one send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailResult {
    /// True if the server accepted the message.
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Response for a single send.
pub type EmailResponse = EmailResult;

impl EmailResult {
    /// A successful outcome.
    pub fn sent() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    /// A failed outcome.
    pub fn failed(error: impl fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

impl From<&SmtpResult<()>> for EmailResult {
    fn from(outcome: &SmtpResult<()>) -> Self {
        match outcome {
            Ok(()) => Self::sent(),
            Err(e) => Self::failed(e),
        }
    }
}

/// A failed single send: the caller-facing response plus the error.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct DeliveryFailure {
    /// Response with `success == false`.
    pub response: EmailResponse,
    /// The error that ended the send.
    #[source]
    pub error: SmtpError,
}

impl From<SmtpError> for DeliveryFailure {
    fn from(error: SmtpError) -> Self {
        Self {
            response: EmailResult::failed(&error),
            error,
        }
    }
}

/// Ordered results of a bulk send, one per request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkSendResponse {
    /// `results[i]` belongs to `requests[i]`.
    pub results: Vec<EmailResult>,
}

impl BulkSendResponse {
    /// Number of results.
    pub fn total(&self) -> usize {
        self.results.len()
    }

    /// Number of successful sends.
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    /// Number of failed sends.
    pub fn failed(&self) -> usize {
        self.total() - self.succeeded()
    }

    /// Returns true if the batch was non-empty and nothing was sent.
    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.succeeded() == 0
    }
}

/// Connection pool status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Maximum idle connections.
    pub capacity: usize,
    /// Idle connections.
    pub idle: usize,
    /// Connections currently lent out.
    pub borrowed: usize,
    /// Whether the pool is initialized.
    pub initialized: bool,
}

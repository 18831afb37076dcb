//! Message composition.
//!
//! Turns a logical email into the DATA payload:
//! - Plain: `text/plain; charset=UTF-8` header block and body
//! - HTML: adds `MIME-Version` and `text/html; charset=UTF-8`
//! - Multipart: `multipart/mixed` with the text part first, then one
//!   base64 part per attachment wrapped at 76 columns (RFC 2045)
//!
//! Output always uses CRLF line endings. Composition never fails; address
//! fields go through the best-effort canonicalizer.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use uuid::Uuid;

use crate::types::{canonicalize_addresses, Attachment, ContentKind, EmailRequest};

/// Maximum encoded line length for base64 bodies.
pub const BASE64_LINE_LENGTH: usize = 76;

/// MIME content types written by the composer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentType {
    /// Plain text.
    TextPlain,
    /// HTML content.
    TextHtml,
    /// Multipart mixed (body + attachments).
    MultipartMixed(String),
}

impl ContentType {
    /// Returns the header value.
    pub fn header_value(&self) -> String {
        match self {
            ContentType::TextPlain => "text/plain; charset=UTF-8".to_string(),
            ContentType::TextHtml => "text/html; charset=UTF-8".to_string(),
            ContentType::MultipartMixed(boundary) => {
                format!("multipart/mixed; boundary=\"{}\"", boundary)
            }
        }
    }
}

/// Renders emails into wire bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageComposer;

impl MessageComposer {
    /// Creates a composer.
    pub fn new() -> Self {
        Self
    }

    /// Composes a request, using `from` as the effective sender.
    pub fn compose_request(&self, request: &EmailRequest, from: &str) -> Vec<u8> {
        self.compose(
            request.kind,
            from,
            &request.to,
            &request.subject,
            &request.body,
            &request.attachments,
        )
    }

    /// Composes a message. Attachments force `multipart/mixed` with a fresh
    /// random boundary; otherwise the output depends only on the inputs.
    pub fn compose(
        &self,
        kind: ContentKind,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
    ) -> Vec<u8> {
        if attachments.is_empty() {
            self.compose_single(kind, from, to, subject, body)
        } else {
            self.compose_multipart(from, to, subject, body, attachments, &generate_boundary())
        }
    }

    fn compose_single(
        &self,
        kind: ContentKind,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Vec<u8> {
        let mut output = Vec::with_capacity(body.len() + 256);
        write_address_headers(&mut output, from, to, subject);

        let content_type = match kind {
            ContentKind::Plain => ContentType::TextPlain,
            ContentKind::Html => {
                write_header(&mut output, "MIME-Version", "1.0");
                ContentType::TextHtml
            }
        };
        write_header(&mut output, "Content-Type", &content_type.header_value());
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&normalize_line_endings(body.as_bytes()));

        output
    }

    /// Composes a multipart message with the given boundary.
    pub fn compose_multipart(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        attachments: &[Attachment],
        boundary: &str,
    ) -> Vec<u8> {
        let encoded_size: usize = attachments.iter().map(|a| a.data.len() * 4 / 3 + 256).sum();
        let mut output = Vec::with_capacity(body.len() + encoded_size + 512);

        write_address_headers(&mut output, from, to, subject);
        write_header(&mut output, "MIME-Version", "1.0");
        write_header(
            &mut output,
            "Content-Type",
            &ContentType::MultipartMixed(boundary.to_string()).header_value(),
        );
        output.extend_from_slice(b"\r\n");

        // Text part
        write_boundary(&mut output, boundary);
        write_header(&mut output, "Content-Type", &ContentType::TextPlain.header_value());
        output.extend_from_slice(b"\r\n");
        output.extend_from_slice(&normalize_line_endings(body.as_bytes()));
        output.extend_from_slice(b"\r\n\r\n");

        for attachment in attachments {
            write_boundary(&mut output, boundary);
            write_attachment(&mut output, attachment);
            output.extend_from_slice(b"\r\n");
        }

        output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
        output
    }
}

fn write_address_headers(output: &mut Vec<u8>, from: &str, to: &str, subject: &str) {
    write_header(output, "From", &canonicalize_addresses(from));
    write_header(output, "To", &canonicalize_addresses(to));
    write_header(output, "Subject", &encode_header(subject));
}

fn write_header(output: &mut Vec<u8>, name: &str, value: &str) {
    output.extend_from_slice(name.as_bytes());
    output.extend_from_slice(b": ");
    output.extend_from_slice(sanitize_header_value(value).as_bytes());
    output.extend_from_slice(b"\r\n");
}

fn write_boundary(output: &mut Vec<u8>, boundary: &str) {
    output.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
}

fn write_attachment(output: &mut Vec<u8>, attachment: &Attachment) {
    let filename = encode_header(&attachment.filename).replace('"', "'");
    write_header(output, "Content-Type", &attachment.content_type);
    write_header(output, "Content-Transfer-Encoding", "base64");
    write_header(
        output,
        "Content-Disposition",
        &format!("attachment; filename=\"{}\"", filename),
    );
    output.extend_from_slice(b"\r\n");

    let encoded = BASE64.encode(&attachment.data);
    for line in encoded.as_bytes().chunks(BASE64_LINE_LENGTH) {
        output.extend_from_slice(line);
        output.extend_from_slice(b"\r\n");
    }
}

/// Header values are single-line; CR and LF become spaces.
fn sanitize_header_value(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 2047 encodes a header value if it contains non-ASCII or control
/// characters; otherwise returns it unchanged.
pub fn encode_header(value: &str) -> String {
    if value.chars().all(|c| c.is_ascii() && !c.is_control()) {
        return value.to_string();
    }

    format!("=?UTF-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

/// Generates a random boundary token.
pub fn generate_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

/// Converts bare LF to CRLF, leaving existing CRLF untouched.
pub fn normalize_line_endings(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len() + input.len() / 32);
    let mut previous = 0u8;

    for &byte in input {
        if byte == b'\n' && previous != b'\r' {
            output.push(b'\r');
        }
        output.push(byte);
        previous = byte;
    }

    output
}

/// Prepares a composed message for the DATA phase: CRLF line endings,
/// dot-stuffing, and the `CRLF.CRLF` terminator.
pub fn prepare_data_content(message: &[u8]) -> Vec<u8> {
    let normalized = normalize_line_endings(message);
    let mut output = Vec::with_capacity(normalized.len() + 64);
    let mut at_line_start = true;

    for &byte in &normalized {
        if at_line_start && byte == b'.' {
            output.push(b'.');
        }
        output.push(byte);
        at_line_start = byte == b'\n';
    }

    if !output.ends_with(b"\r\n") {
        output.extend_from_slice(b"\r\n");
    }
    output.extend_from_slice(b".\r\n");

    output
}

//! Error types for the mail dispatch client.
//!
//! Every failure is an [`SmtpError`] carrying a fine-grained [`SmtpErrorKind`].
//! Kinds roll up into the five-way [`ErrorCategory`] taxonomy the delivery
//! engine reasons about: connect failures, pool exhaustion, transaction
//! failures, cancellation and retry exhaustion.

use std::fmt;
use thiserror::Error;

/// Result type for mail dispatch operations.
pub type SmtpResult<T> = Result<T, SmtpError>;

/// Error kinds categorizing different failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SmtpErrorKind {
    // Connection establishment
    /// TCP dial was refused or failed.
    ConnectionRefused,
    /// Dial or handshake exceeded the connect timeout.
    ConnectTimeout,
    /// TLS handshake failed.
    TlsHandshakeFailed,
    /// Server rejected or does not offer STARTTLS.
    StarttlsNotSupported,
    /// Server rejected the credentials.
    CredentialsInvalid,
    /// A connection failed its liveness probe and could not be replaced.
    ConnectionUnhealthy,

    // Protocol transaction
    /// Connection dropped mid-conversation.
    ConnectionReset,
    /// Reply could not be parsed.
    InvalidResponse,
    /// Reply code did not match the expected one.
    UnexpectedResponse,
    /// Server is closing the channel (421).
    ServerShutdown,
    /// MAIL FROM was rejected.
    SenderRejected,
    /// RCPT TO was rejected.
    RecipientRejected,
    /// DATA command or payload was rejected.
    DataRejected,
    /// Message exceeds the server's size limit.
    MessageTooLarge,
    /// Reading a reply timed out.
    ReadTimeout,
    /// Writing a command timed out.
    WriteTimeout,
    /// An address could not be parsed.
    InvalidAddress,
    /// An attachment could not be loaded.
    InvalidAttachment,

    // Pool
    /// No idle connection was available.
    PoolExhausted,
    /// The pool has not been initialized or was torn down.
    PoolNotInitialized,

    // Control flow
    /// The caller cancelled the operation.
    Cancelled,
    /// Every retry attempt failed.
    RetriesExhausted,

    /// Configuration is invalid.
    ConfigurationInvalid,
    /// Unknown or internal error.
    Unknown,
}

impl SmtpErrorKind {
    /// Returns the taxonomy category for this kind.
    pub fn category(&self) -> ErrorCategory {
        match self {
            SmtpErrorKind::ConnectionRefused
            | SmtpErrorKind::ConnectTimeout
            | SmtpErrorKind::TlsHandshakeFailed
            | SmtpErrorKind::StarttlsNotSupported
            | SmtpErrorKind::CredentialsInvalid
            | SmtpErrorKind::ConnectionUnhealthy => ErrorCategory::Connect,

            SmtpErrorKind::PoolExhausted | SmtpErrorKind::PoolNotInitialized => {
                ErrorCategory::NoConnectionAvailable
            }

            SmtpErrorKind::Cancelled => ErrorCategory::Cancelled,
            SmtpErrorKind::RetriesExhausted => ErrorCategory::Exhausted,
            SmtpErrorKind::ConfigurationInvalid => ErrorCategory::Configuration,

            SmtpErrorKind::ConnectionReset
            | SmtpErrorKind::InvalidResponse
            | SmtpErrorKind::UnexpectedResponse
            | SmtpErrorKind::ServerShutdown
            | SmtpErrorKind::SenderRejected
            | SmtpErrorKind::RecipientRejected
            | SmtpErrorKind::DataRejected
            | SmtpErrorKind::MessageTooLarge
            | SmtpErrorKind::ReadTimeout
            | SmtpErrorKind::WriteTimeout
            | SmtpErrorKind::InvalidAddress
            | SmtpErrorKind::InvalidAttachment
            | SmtpErrorKind::Unknown => ErrorCategory::Transaction,
        }
    }
}

impl fmt::Display for SmtpErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmtpErrorKind::ConnectionRefused => write!(f, "Connection refused"),
            SmtpErrorKind::ConnectTimeout => write!(f, "Connect timeout"),
            SmtpErrorKind::TlsHandshakeFailed => write!(f, "TLS handshake failed"),
            SmtpErrorKind::StarttlsNotSupported => write!(f, "STARTTLS not supported"),
            SmtpErrorKind::CredentialsInvalid => write!(f, "Invalid credentials"),
            SmtpErrorKind::ConnectionUnhealthy => write!(f, "Connection unhealthy"),
            SmtpErrorKind::ConnectionReset => write!(f, "Connection reset"),
            SmtpErrorKind::InvalidResponse => write!(f, "Invalid server response"),
            SmtpErrorKind::UnexpectedResponse => write!(f, "Unexpected response"),
            SmtpErrorKind::ServerShutdown => write!(f, "Server shutting down"),
            SmtpErrorKind::SenderRejected => write!(f, "Sender rejected"),
            SmtpErrorKind::RecipientRejected => write!(f, "Recipient rejected"),
            SmtpErrorKind::DataRejected => write!(f, "Message data rejected"),
            SmtpErrorKind::MessageTooLarge => write!(f, "Message too large"),
            SmtpErrorKind::ReadTimeout => write!(f, "Read timeout"),
            SmtpErrorKind::WriteTimeout => write!(f, "Write timeout"),
            SmtpErrorKind::InvalidAddress => write!(f, "Invalid address"),
            SmtpErrorKind::InvalidAttachment => write!(f, "Invalid attachment"),
            SmtpErrorKind::PoolExhausted => write!(f, "No connection available"),
            SmtpErrorKind::PoolNotInitialized => write!(f, "Connection pool not initialized"),
            SmtpErrorKind::Cancelled => write!(f, "Cancelled"),
            SmtpErrorKind::RetriesExhausted => write!(f, "Retries exhausted"),
            SmtpErrorKind::ConfigurationInvalid => write!(f, "Invalid configuration"),
            SmtpErrorKind::Unknown => write!(f, "Unknown error"),
        }
    }
}

/// Coarse error taxonomy used by the delivery engine and dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Dial, TLS or authentication failure.
    Connect,
    /// The pool had nothing to lend.
    NoConnectionAvailable,
    /// Sender, recipient or data phase failure.
    Transaction,
    /// Caller cancellation. Never retried.
    Cancelled,
    /// All attempts used; wraps the last attempt's error.
    Exhausted,
    /// Invalid configuration.
    Configuration,
}

/// Phase of connection establishment in which a connect error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectPhase {
    /// TCP dial.
    Dial,
    /// TLS handshake (implicit or after STARTTLS).
    TlsHandshake,
    /// Server greeting.
    Greeting,
    /// EHLO/HELO exchange.
    Hello,
    /// STARTTLS command.
    StartTls,
    /// AUTH exchange.
    Authentication,
}

impl fmt::Display for ConnectPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectPhase::Dial => "dial",
            ConnectPhase::TlsHandshake => "tls handshake",
            ConnectPhase::Greeting => "greeting",
            ConnectPhase::Hello => "hello",
            ConnectPhase::StartTls => "starttls",
            ConnectPhase::Authentication => "authentication",
        };
        f.write_str(name)
    }
}

/// Mail dispatch error with detailed information.
#[derive(Error, Debug)]
pub struct SmtpError {
    kind: SmtpErrorKind,
    message: String,
    smtp_code: Option<u16>,
    phase: Option<ConnectPhase>,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl SmtpError {
    /// Creates a new error.
    pub fn new(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            smtp_code: None,
            phase: None,
            cause: None,
        }
    }

    /// Sets the SMTP reply code.
    pub fn with_smtp_code(mut self, code: u16) -> Self {
        self.smtp_code = Some(code);
        self
    }

    /// Tags the error with the connection phase that failed.
    pub fn with_phase(mut self, phase: ConnectPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    /// Sets the underlying cause.
    pub fn with_cause<E: std::error::Error + Send + Sync + 'static>(mut self, cause: E) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Prefixes the message with context, keeping kind, code and cause.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{}: {}", context, self.message);
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> SmtpErrorKind {
        self.kind
    }

    /// Returns the taxonomy category.
    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the SMTP reply code if available.
    pub fn smtp_code(&self) -> Option<u16> {
        self.smtp_code
    }

    /// Returns the connection phase for connect errors.
    pub fn phase(&self) -> Option<ConnectPhase> {
        self.phase
    }

    /// Returns true if this is a caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.kind == SmtpErrorKind::Cancelled
    }

    // Convenience constructors

    /// Creates a connect error for the given phase.
    pub fn connect(kind: SmtpErrorKind, phase: ConnectPhase, message: impl Into<String>) -> Self {
        Self::new(kind, message).with_phase(phase)
    }

    /// Creates a TLS handshake error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::connect(SmtpErrorKind::TlsHandshakeFailed, ConnectPhase::TlsHandshake, message)
    }

    /// Creates an authentication error.
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::connect(SmtpErrorKind::CredentialsInvalid, ConnectPhase::Authentication, message)
    }

    /// Creates a protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::InvalidResponse, message)
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(SmtpErrorKind::ConfigurationInvalid, message)
    }

    /// Creates a pool error.
    pub fn pool(kind: SmtpErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message)
    }

    /// Creates the cancellation error.
    pub fn cancelled() -> Self {
        Self::new(SmtpErrorKind::Cancelled, "operation cancelled by caller")
    }

    /// Wraps the final attempt's error after every attempt failed.
    pub fn exhausted(attempts: u32, last: SmtpError) -> Self {
        Self::new(
            SmtpErrorKind::RetriesExhausted,
            format!("all {} send attempts failed, last error: {}", attempts, last),
        )
        .with_cause(last)
    }

    /// Creates an error from an SMTP reply.
    pub fn from_smtp_response(code: u16, message: impl Into<String>) -> Self {
        let kind = match code {
            421 => SmtpErrorKind::ServerShutdown,
            500..=503 => SmtpErrorKind::InvalidResponse,
            530 | 535 => SmtpErrorKind::CredentialsInvalid,
            550 | 551 | 553 => SmtpErrorKind::RecipientRejected,
            552 => SmtpErrorKind::MessageTooLarge,
            _ => SmtpErrorKind::UnexpectedResponse,
        };
        Self::new(kind, message).with_smtp_code(code)
    }

    /// Re-kinds a reply error for the transaction step that produced it.
    ///
    /// Size and shutdown replies keep their specific kind.
    pub fn in_step(mut self, kind: SmtpErrorKind) -> Self {
        if !matches!(
            self.kind,
            SmtpErrorKind::MessageTooLarge
                | SmtpErrorKind::ServerShutdown
                | SmtpErrorKind::ConnectionReset
                | SmtpErrorKind::ReadTimeout
                | SmtpErrorKind::WriteTimeout
        ) {
            self.kind = kind;
        }
        self
    }
}

impl fmt::Display for SmtpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.kind)?;
        if let Some(phase) = self.phase {
            write!(f, "[{}] ", phase)?;
        }
        f.write_str(&self.message)?;
        if let Some(code) = self.smtp_code {
            write!(f, " (SMTP {})", code)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_categories() {
        assert_eq!(SmtpErrorKind::ConnectTimeout.category(), ErrorCategory::Connect);
        assert_eq!(SmtpErrorKind::CredentialsInvalid.category(), ErrorCategory::Connect);
        assert_eq!(
            SmtpErrorKind::PoolExhausted.category(),
            ErrorCategory::NoConnectionAvailable
        );
        assert_eq!(SmtpErrorKind::RecipientRejected.category(), ErrorCategory::Transaction);
        assert_eq!(SmtpErrorKind::Cancelled.category(), ErrorCategory::Cancelled);
    }

    #[test]
    fn test_smtp_error_from_response() {
        let err = SmtpError::from_smtp_response(535, "Authentication failed");
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert_eq!(err.smtp_code(), Some(535));

        let err = SmtpError::from_smtp_response(421, "Service unavailable");
        assert_eq!(err.kind(), SmtpErrorKind::ServerShutdown);
    }

    #[test]
    fn test_in_step_keeps_specific_kinds() {
        let err =
            SmtpError::from_smtp_response(552, "too big").in_step(SmtpErrorKind::DataRejected);
        assert_eq!(err.kind(), SmtpErrorKind::MessageTooLarge);

        let err = SmtpError::from_smtp_response(550, "no such user")
            .in_step(SmtpErrorKind::SenderRejected);
        assert_eq!(err.kind(), SmtpErrorKind::SenderRejected);
        assert_eq!(err.smtp_code(), Some(550));
    }

    #[test]
    fn test_connect_error_display_includes_phase() {
        let err = SmtpError::tls("bad certificate");
        assert_eq!(err.phase(), Some(ConnectPhase::TlsHandshake));
        assert_eq!(err.to_string(), "TLS handshake failed: [tls handshake] bad certificate");
    }

    #[test]
    fn test_exhausted_wraps_last_error() {
        let last = SmtpError::from_smtp_response(451, "try later").context("failed to set sender");
        let err = SmtpError::exhausted(3, last);

        assert_eq!(err.category(), ErrorCategory::Exhausted);
        assert!(err.message().starts_with("all 3 send attempts failed"));
        let source = err.source().unwrap().downcast_ref::<SmtpError>().unwrap();
        assert_eq!(source.smtp_code(), Some(451));
        assert!(source.message().starts_with("failed to set sender"));
    }
}

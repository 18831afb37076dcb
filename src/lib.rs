//! # Mail Dispatch Library
//!
//! A pooled, retrying SMTP client with:
//! - Transport security (STARTTLS, implicit TLS) and AUTH PLAIN/LOGIN
//! - An all-or-nothing connection pool with liveness probes
//! - Message composition for plain, HTML and multipart messages
//! - Bulk dispatch under a concurrency ceiling with ordered results
//! - Fire-and-forget delivery logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_mail_dispatch::{CancellationToken, EmailRequest, SmtpClient, SmtpConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SmtpConfig::builder()
//!         .host("smtp.example.com")
//!         .port(587)
//!         .credentials("user@example.com", "password")
//!         .build()?;
//!
//!     let client = SmtpClient::new(config).await?;
//!     let cancel = CancellationToken::new();
//!
//!     let request = EmailRequest::plain(
//!         "sender@example.com",
//!         "recipient@example.com",
//!         "Hello from Rust!",
//!         "This is a test email.",
//!     );
//!     let response = client.deliver(&cancel, request).await?;
//!     println!("sent: {}", response.success);
//!
//!     client.disconnect().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod config;
pub mod errors;
pub mod types;

// Protocol layer
pub mod protocol;

// Transport layer
pub mod auth;
pub mod pool;
pub mod transport;

// Message composition
pub mod mime;

// Delivery
pub mod bulk;
pub mod client;

// Delivery logging and observability
pub mod logging;
pub mod observability;

// Mocks for testing
pub mod mocks;

// Re-exports for convenience
pub use auth::{AuthMethod, Credentials};
pub use bulk::{BulkDispatcher, MailSender};
pub use client::{SmtpClient, SmtpClientBuilder};
pub use config::{SmtpConfig, SmtpConfigBuilder, TransportMode};
pub use errors::{ConnectPhase, ErrorCategory, SmtpError, SmtpErrorKind, SmtpResult};
pub use logging::{EmailLog, EmailLogRepository, EmailLogger, LogStoreError, MemoryLogRepository};
pub use mime::{ContentType, MessageComposer};
pub use observability::{init_tracing, LogFormat, MetricsSnapshot, SmtpMetrics};
pub use pool::ConnectionPool;
pub use protocol::{EsmtpCapabilities, SmtpCommand, SmtpResponse};
pub use transport::{Connection, ConnectionFactory, SmtpTransport, TcpConnectionFactory};
pub use types::{
    Address, Attachment, BulkSendResponse, ContentKind, DeliveryFailure, EmailRequest,
    EmailResponse, EmailResult, PoolStatus,
};
pub use tokio_util::sync::CancellationToken;

//! Configuration types for the mail dispatch client.
//!
//! [`SmtpConfig`] is built once, validated, and never mutated afterwards.
//! It covers:
//! - Server address and transport mode (plain, implicit TLS, STARTTLS)
//! - Credentials
//! - Connection pool capacity
//! - Retry policy and bulk concurrency ceiling

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{SmtpError, SmtpResult};

/// Default SMTP port (submission with STARTTLS).
pub const DEFAULT_PORT: u16 = 587;

/// Default timeout for dialing and handshakes.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a single command round-trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 5;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default pause between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Default bulk concurrency ceiling.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

/// Default EmailLog queue depth.
pub const DEFAULT_LOG_QUEUE_CAPACITY: usize = 1024;

/// How the connection to the server is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Cleartext for the whole session.
    Plain,
    /// Upgrade with STARTTLS after the greeting (default).
    #[default]
    StartTls,
    /// TLS from the first byte (port 465).
    ImplicitTls,
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// SMTP server hostname.
    pub host: String,
    /// SMTP server port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Authentication username.
    #[serde(default)]
    pub username: Option<String>,
    /// Authentication password (serialization skipped for security).
    #[serde(skip)]
    pub password: Option<SecretString>,
    /// Sender used when a request leaves `from` empty.
    #[serde(default)]
    pub default_from: Option<String>,
    /// Transport security mode.
    #[serde(default)]
    pub transport_mode: TransportMode,
    /// Verify the server certificate chain and name.
    #[serde(default)]
    pub verify_certificate: bool,
    /// Name presented for SNI and verification. Defaults to `host`.
    #[serde(default)]
    pub tls_server_name: Option<String>,
    /// Timeout for dial and handshake.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Timeout for one command/reply round-trip.
    #[serde(default = "default_command_timeout", with = "humantime_serde")]
    pub command_timeout: Duration,
    /// Pooled connections. Zero selects single-connection mode.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Retries after the first attempt.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Pause before each retry.
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Bulk concurrency ceiling.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Depth of the EmailLog hand-off queue.
    #[serde(default = "default_log_queue_capacity")]
    pub log_queue_capacity: usize,
    /// Client identifier for EHLO.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> Duration {
    DEFAULT_CONNECT_TIMEOUT
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_retry_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_log_queue_capacity() -> usize {
    DEFAULT_LOG_QUEUE_CAPACITY
}

impl SmtpConfig {
    /// Creates a new configuration builder.
    pub fn builder() -> SmtpConfigBuilder {
        SmtpConfigBuilder::default()
    }

    /// Creates a configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SMTP_HOST` (required): server hostname
    /// - `SMTP_PORT`: server port
    /// - `SMTP_USERNAME` / `SMTP_PASSWORD`: credentials
    /// - `SMTP_FROM`: default sender
    /// - `SMTP_USE_STARTTLS`: `true`, `1` or `yes` selects STARTTLS, anything else plain
    /// - `SMTP_USE_TLS`: same values, selects implicit TLS (wins over STARTTLS)
    /// - `SMTP_POOL_SIZE`, `SMTP_RETRY_ATTEMPTS`, `SMTP_MAX_CONCURRENT`: integers
    /// - `SMTP_RETRY_DELAY`: human-readable duration such as `2s`
    pub fn from_env() -> SmtpResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a configuration from an arbitrary key lookup using the
    /// `SMTP_*` variable names of [`SmtpConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> SmtpResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup("SMTP_HOST")
            .ok_or_else(|| SmtpError::configuration("SMTP_HOST environment variable not set"))?;

        let mut builder = SmtpConfigBuilder::new().host(host);

        if let Some(port) = lookup("SMTP_PORT") {
            builder = builder.port(parse_var("SMTP_PORT", &port)?);
        }
        if let Some(username) = lookup("SMTP_USERNAME") {
            builder = builder.username(username);
        }
        if let Some(password) = lookup("SMTP_PASSWORD") {
            builder = builder.password(password);
        }
        if let Some(from) = lookup("SMTP_FROM") {
            builder = builder.default_from(from);
        }
        if let Some(flag) = lookup("SMTP_USE_STARTTLS") {
            builder = builder.transport_mode(if is_truthy(&flag) {
                TransportMode::StartTls
            } else {
                TransportMode::Plain
            });
        }
        if lookup("SMTP_USE_TLS").is_some_and(|flag| is_truthy(&flag)) {
            builder = builder.transport_mode(TransportMode::ImplicitTls);
        }
        if let Some(size) = lookup("SMTP_POOL_SIZE") {
            builder = builder.pool_size(parse_var("SMTP_POOL_SIZE", &size)?);
        }
        if let Some(attempts) = lookup("SMTP_RETRY_ATTEMPTS") {
            builder = builder.retry_attempts(parse_var("SMTP_RETRY_ATTEMPTS", &attempts)?);
        }
        if let Some(delay) = lookup("SMTP_RETRY_DELAY") {
            let delay = humantime::parse_duration(&delay).map_err(|e| {
                SmtpError::configuration(format!("SMTP_RETRY_DELAY is not a duration: {}", e))
            })?;
            builder = builder.retry_delay(delay);
        }
        if let Some(max) = lookup("SMTP_MAX_CONCURRENT") {
            builder = builder.max_concurrent(parse_var("SMTP_MAX_CONCURRENT", &max)?);
        }

        builder.build()
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SmtpResult<()> {
        if self.host.trim().is_empty() {
            return Err(SmtpError::configuration("Host is required"));
        }

        if self.port == 0 {
            return Err(SmtpError::configuration("Port must be non-zero"));
        }

        if self.username.is_some() != self.password.is_some() {
            return Err(SmtpError::configuration(
                "username and password must be configured together",
            ));
        }

        if self.connect_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(SmtpError::configuration("timeouts must be non-zero"));
        }

        if self.max_concurrent == 0 {
            return Err(SmtpError::configuration("max_concurrent must be positive"));
        }

        if self.log_queue_capacity == 0 {
            return Err(SmtpError::configuration("log_queue_capacity must be positive"));
        }

        Ok(())
    }

    /// Returns the full server address.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true if authentication is configured.
    pub fn has_auth(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Returns the client identifier for EHLO.
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or("localhost")
    }

    /// Returns the TLS server name.
    pub fn server_name(&self) -> &str {
        self.tls_server_name.as_deref().unwrap_or(&self.host)
    }

    /// Returns true if the client keeps a single connection instead of a pool.
    pub fn is_single_connection(&self) -> bool {
        self.pool_size == 0
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> SmtpResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| {
            SmtpError::configuration(format!("{} has an invalid value: {:?}", name, value))
        })
}

/// Builder for [`SmtpConfig`].
#[derive(Debug)]
pub struct SmtpConfigBuilder {
    host: Option<String>,
    port: u16,
    username: Option<String>,
    password: Option<SecretString>,
    default_from: Option<String>,
    transport_mode: TransportMode,
    verify_certificate: bool,
    tls_server_name: Option<String>,
    connect_timeout: Duration,
    command_timeout: Duration,
    pool_size: usize,
    retry_attempts: u32,
    retry_delay: Duration,
    max_concurrent: usize,
    log_queue_capacity: usize,
    client_id: Option<String>,
}

impl Default for SmtpConfigBuilder {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            username: None,
            password: None,
            default_from: None,
            transport_mode: TransportMode::default(),
            verify_certificate: false,
            tls_server_name: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            log_queue_capacity: DEFAULT_LOG_QUEUE_CAPACITY,
            client_id: None,
        }
    }
}

impl SmtpConfigBuilder {
    /// Creates a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the SMTP server host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sets the SMTP server port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets plain credentials.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Sets the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(SecretString::new(password.into()));
        self
    }

    /// Sets the default sender.
    pub fn default_from(mut self, from: impl Into<String>) -> Self {
        self.default_from = Some(from.into());
        self
    }

    /// Sets the transport mode.
    pub fn transport_mode(mut self, mode: TransportMode) -> Self {
        self.transport_mode = mode;
        self
    }

    /// Sets whether to verify server certificates.
    pub fn verify_certificate(mut self, verify: bool) -> Self {
        self.verify_certificate = verify;
        self
    }

    /// Overrides the TLS server name.
    pub fn tls_server_name(mut self, name: impl Into<String>) -> Self {
        self.tls_server_name = Some(name.into());
        self
    }

    /// Sets connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets command timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Sets the pool size. Zero selects single-connection mode.
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Sets the number of retries after the first attempt.
    pub fn retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the pause before each retry.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Disables retries.
    pub fn no_retry(mut self) -> Self {
        self.retry_attempts = 0;
        self
    }

    /// Sets the bulk concurrency ceiling.
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the EmailLog queue depth.
    pub fn log_queue_capacity(mut self, capacity: usize) -> Self {
        self.log_queue_capacity = capacity;
        self
    }

    /// Sets the client identifier for EHLO.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> SmtpResult<SmtpConfig> {
        let config = SmtpConfig {
            host: self.host.ok_or_else(|| SmtpError::configuration("Host is required"))?,
            port: self.port,
            username: self.username,
            password: self.password,
            default_from: self.default_from.filter(|from| !from.trim().is_empty()),
            transport_mode: self.transport_mode,
            verify_certificate: self.verify_certificate,
            tls_server_name: self.tls_server_name,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            pool_size: self.pool_size,
            retry_attempts: self.retry_attempts,
            retry_delay: self.retry_delay,
            max_concurrent: self.max_concurrent,
            log_queue_capacity: self.log_queue_capacity,
            client_id: self.client_id,
        };

        config.validate()?;
        Ok(config)
    }
}

// Humantime serde support
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

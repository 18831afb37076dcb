//! Plaintext SMTP authentication.
//!
//! PLAIN (RFC 4616) is used whenever the server advertises it or
//! advertises nothing at all; LOGIN is the fallback for servers that
//! only offer it. Both are only safe over TLS or a trusted network.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use crate::protocol::EsmtpCapabilities;

/// Supported authentication mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethod {
    /// AUTH PLAIN with an initial response.
    Plain,
    /// AUTH LOGIN challenge/response.
    Login,
}

impl AuthMethod {
    /// Returns the SASL mechanism name.
    pub fn mechanism_name(&self) -> &'static str {
        match self {
            AuthMethod::Plain => "PLAIN",
            AuthMethod::Login => "LOGIN",
        }
    }

    /// Picks the mechanism to use against the advertised capabilities.
    pub fn select(caps: &EsmtpCapabilities) -> Self {
        if !caps.supports_auth("PLAIN") && caps.supports_auth("LOGIN") {
            AuthMethod::Login
        } else {
            AuthMethod::Plain
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mechanism_name())
    }
}

/// Username and password for the AUTH exchange.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: SecretString,
}

impl Credentials {
    /// Creates credentials.
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            username: username.into(),
            password,
        }
    }

    /// Returns the username.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Returns the base64 PLAIN initial response (`\0user\0pass`).
    pub fn plain_initial_response(&self) -> String {
        BASE64.encode(format!("\0{}\0{}", self.username, self.password.expose_secret()))
    }

    /// Returns the base64 LOGIN username response.
    pub fn login_username(&self) -> String {
        BASE64.encode(&self.username)
    }

    /// Returns the base64 LOGIN password response.
    pub fn login_password(&self) -> String {
        BASE64.encode(self.password.expose_secret())
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

//! Transport layer: live protocol sessions and the factory that opens them.
//!
//! [`SmtpTransport`] is the seam the pool and delivery engine work against.
//! [`TcpConnectionFactory`] opens real sessions: dial, optional implicit TLS,
//! greeting, EHLO, optional STARTTLS, optional AUTH. A failure in any phase
//! drops the socket before the error is returned, so no half-open session
//! escapes the factory.

use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::auth::{AuthMethod, Credentials};
use crate::config::{SmtpConfig, TransportMode};
use crate::errors::{ConnectPhase, SmtpError, SmtpErrorKind, SmtpResult};
use crate::mime::prepare_data_content;
use crate::protocol::{codes, EsmtpCapabilities, SmtpCommand, SmtpResponse};

/// A live, exclusively owned protocol session.
pub type Connection = Box<dyn SmtpTransport>;

/// One protocol session bound to one socket.
#[async_trait]
pub trait SmtpTransport: Send + Sync + fmt::Debug {
    /// Sends a command and reads its reply.
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse>;

    /// Writes a composed message as the DATA payload and reads the final reply.
    ///
    /// Dot-stuffing and the terminating `.` line are applied here.
    async fn send_data(&mut self, message: &[u8]) -> SmtpResult<SmtpResponse>;

    /// Returns true if the session runs over TLS.
    fn is_tls(&self) -> bool;

    /// Returns a process-unique session id for logs.
    fn id(&self) -> u64;

    /// Liveness probe (NOOP).
    async fn health_check(&mut self) -> SmtpResult<()> {
        let response = self.send_command(&SmtpCommand::Noop).await?;
        if response.is_success() {
            Ok(())
        } else {
            Err(SmtpError::new(
                SmtpErrorKind::ConnectionUnhealthy,
                format!("Health check failed: {}", response),
            ))
        }
    }

    /// Ends the session with QUIT.
    async fn close(&mut self) -> SmtpResult<()> {
        self.send_command(&SmtpCommand::Quit)
            .await?
            .expect(codes::SERVICE_CLOSING)
            .map(|_| ())
    }
}

/// Opens new sessions.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Opens, secures and authenticates one session.
    async fn create(&self) -> SmtpResult<Connection>;
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a fresh session id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Factory for TCP sessions configured by [`SmtpConfig`].
#[derive(Clone)]
pub struct TcpConnectionFactory {
    config: Arc<SmtpConfig>,
    tls: TlsConnector,
}

impl fmt::Debug for TcpConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnectionFactory")
            .field("address", &self.config.address())
            .field("mode", &self.config.transport_mode)
            .field("verify_certificate", &self.config.verify_certificate)
            .finish()
    }
}

impl TcpConnectionFactory {
    /// Creates a factory, building the TLS client configuration once.
    pub fn new(config: Arc<SmtpConfig>) -> SmtpResult<Self> {
        if config.transport_mode != TransportMode::Plain {
            rustls::pki_types::ServerName::try_from(config.server_name().to_string()).map_err(
                |_| {
                    SmtpError::configuration(format!(
                        "Invalid TLS server name: {}",
                        config.server_name()
                    ))
                },
            )?;
        }
        let tls = tls::connector(config.verify_certificate);
        Ok(Self { config, tls })
    }
}

#[async_trait]
impl ConnectionFactory for TcpConnectionFactory {
    async fn create(&self) -> SmtpResult<Connection> {
        let transport = TcpTransport::connect(&self.config, &self.tls).await?;
        Ok(Box::new(transport))
    }
}

/// Stream type that can be plain TCP or TLS.
enum TransportStream {
    Plain(BufReader<TcpStream>),
    Tls(Box<BufReader<TlsStream<TcpStream>>>),
}

impl TransportStream {
    /// Runs the TLS handshake over the underlying socket.
    ///
    /// Bytes buffered before the handshake are discarded.
    async fn into_tls(
        self,
        connector: &TlsConnector,
        server_name: &str,
        handshake_timeout: Duration,
    ) -> SmtpResult<Self> {
        let tcp = match self {
            TransportStream::Plain(reader) => reader.into_inner(),
            tls @ TransportStream::Tls(_) => return Ok(tls),
        };

        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|_| SmtpError::tls(format!("Invalid server name: {}", server_name)))?;

        let stream = timeout(handshake_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| {
                SmtpError::connect(
                    SmtpErrorKind::ConnectTimeout,
                    ConnectPhase::TlsHandshake,
                    "TLS handshake timed out",
                )
            })?
            .map_err(|e| SmtpError::tls(format!("TLS handshake failed: {}", e)).with_cause(e))?;

        Ok(TransportStream::Tls(Box::new(BufReader::new(stream))))
    }
}

/// TCP session with optional TLS.
pub struct TcpTransport {
    id: u64,
    stream: TransportStream,
    command_timeout: Duration,
    host: String,
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl TcpTransport {
    /// Opens a fully negotiated session.
    pub async fn connect(config: &SmtpConfig, tls: &TlsConnector) -> SmtpResult<Self> {
        let address = config.address();

        let tcp = timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                SmtpError::connect(
                    SmtpErrorKind::ConnectTimeout,
                    ConnectPhase::Dial,
                    format!("Connect to {} timed out", address),
                )
            })?
            .map_err(|e| map_dial_error(e, &address))?;
        tcp.set_nodelay(true).ok();

        let mut stream = TransportStream::Plain(BufReader::new(tcp));
        if config.transport_mode == TransportMode::ImplicitTls {
            stream = stream
                .into_tls(tls, config.server_name(), config.connect_timeout)
                .await?;
        }

        let mut transport = Self {
            id: next_session_id(),
            stream,
            command_timeout: config.command_timeout,
            host: config.host.clone(),
        };

        transport
            .read_response()
            .await
            .and_then(|greeting| greeting.expect(codes::SERVICE_READY))
            .map_err(|e| e.with_phase(ConnectPhase::Greeting).context("failed to read greeting"))?;

        let mut caps = transport.hello(config.client_id()).await?;

        if config.transport_mode == TransportMode::StartTls {
            if !caps.starttls {
                return Err(SmtpError::connect(
                    SmtpErrorKind::StarttlsNotSupported,
                    ConnectPhase::StartTls,
                    format!("{} does not offer STARTTLS", address),
                ));
            }
            transport
                .send_command(&SmtpCommand::StartTls)
                .await
                .and_then(|r| r.expect(codes::SERVICE_READY))
                .map_err(|e| {
                    SmtpError::connect(
                        SmtpErrorKind::StarttlsNotSupported,
                        ConnectPhase::StartTls,
                        format!("failed to start TLS: {}", e),
                    )
                    .with_cause(e)
                })?;
            transport = transport.upgraded(tls, config).await?;
            caps = transport.hello(config.client_id()).await?;
        }

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            let credentials = Credentials::new(username.clone(), password.clone());
            transport.authenticate(&credentials, &caps).await?;
        }

        info!(
            session = transport.id,
            address = %address,
            tls = transport.is_tls(),
            authenticated = config.has_auth(),
            "SMTP session established"
        );
        Ok(transport)
    }

    async fn upgraded(self, tls: &TlsConnector, config: &SmtpConfig) -> SmtpResult<Self> {
        let Self {
            id,
            stream,
            command_timeout,
            host,
        } = self;
        let stream = stream
            .into_tls(tls, config.server_name(), config.connect_timeout)
            .await?;
        Ok(Self {
            id,
            stream,
            command_timeout,
            host,
        })
    }

    /// EHLO, falling back to HELO for servers without ESMTP.
    async fn hello(&mut self, client_id: &str) -> SmtpResult<EsmtpCapabilities> {
        let ehlo = self
            .send_command(&SmtpCommand::Ehlo(client_id.to_string()))
            .await
            .map_err(|e| e.with_phase(ConnectPhase::Hello))?;
        if ehlo.is_success() {
            return Ok(EsmtpCapabilities::from_ehlo_response(&ehlo));
        }

        debug!(session = self.id, code = ehlo.code, "EHLO rejected, falling back to HELO");
        self.send_command(&SmtpCommand::Helo(client_id.to_string()))
            .await
            .and_then(|r| r.expect(codes::OK))
            .map_err(|e| e.with_phase(ConnectPhase::Hello).context("HELO rejected"))?;
        Ok(EsmtpCapabilities::default())
    }

    async fn authenticate(
        &mut self,
        credentials: &Credentials,
        caps: &EsmtpCapabilities,
    ) -> SmtpResult<()> {
        let method = AuthMethod::select(caps);
        debug!(session = self.id, mechanism = %method, "Authenticating");

        let result = match method {
            AuthMethod::Plain => self
                .send_command(&SmtpCommand::Auth {
                    mechanism: method.mechanism_name().to_string(),
                    initial_response: Some(credentials.plain_initial_response()),
                })
                .await
                .and_then(|r| r.expect(codes::AUTH_SUCCESS)),
            AuthMethod::Login => self.login(credentials).await,
        };

        result.map(|_| ()).map_err(|e| {
            SmtpError::authentication(format!("SMTP authentication failed: {}", e)).with_cause(e)
        })
    }

    async fn login(&mut self, credentials: &Credentials) -> SmtpResult<SmtpResponse> {
        self.send_command(&SmtpCommand::Auth {
            mechanism: AuthMethod::Login.mechanism_name().to_string(),
            initial_response: None,
        })
        .await?
        .expect(codes::AUTH_CONTINUE)?;
        self.send_line(&credentials.login_username())
            .await?
            .expect(codes::AUTH_CONTINUE)?;
        self.send_line(&credentials.login_password())
            .await?
            .expect(codes::AUTH_SUCCESS)
    }

    async fn send_line(&mut self, line: &str) -> SmtpResult<SmtpResponse> {
        let data = format!("{}\r\n", line);
        self.write(data.as_bytes()).await?;
        self.read_response().await
    }

    async fn write(&mut self, data: &[u8]) -> SmtpResult<()> {
        match &mut self.stream {
            TransportStream::Plain(stream) => {
                write_all(stream.get_mut(), data, self.command_timeout).await
            }
            TransportStream::Tls(stream) => {
                write_all(stream.get_mut(), data, self.command_timeout).await
            }
        }
    }

    async fn read_response(&mut self) -> SmtpResult<SmtpResponse> {
        let response = match &mut self.stream {
            TransportStream::Plain(stream) => read_reply(stream, self.command_timeout).await?,
            TransportStream::Tls(stream) => {
                read_reply(stream.as_mut(), self.command_timeout).await?
            }
        };

        debug!(
            session = self.id,
            code = response.code,
            message = %response.first_message(),
            "Received SMTP response"
        );
        Ok(response)
    }
}

#[async_trait]
impl SmtpTransport for TcpTransport {
    async fn send_command(&mut self, command: &SmtpCommand) -> SmtpResult<SmtpResponse> {
        debug!(session = self.id, command = %command, "Sending SMTP command");
        let line = format!("{}\r\n", command.to_smtp_string());
        self.write(line.as_bytes()).await?;
        self.read_response().await
    }

    async fn send_data(&mut self, message: &[u8]) -> SmtpResult<SmtpResponse> {
        let payload = prepare_data_content(message);
        debug!(session = self.id, bytes = payload.len(), "Writing message data");
        self.write(&payload).await?;
        self.read_response().await
    }

    fn is_tls(&self) -> bool {
        matches!(self.stream, TransportStream::Tls(_))
    }

    fn id(&self) -> u64 {
        self.id
    }
}

fn map_dial_error(error: io::Error, address: &str) -> SmtpError {
    let kind = match error.kind() {
        io::ErrorKind::TimedOut => SmtpErrorKind::ConnectTimeout,
        _ => SmtpErrorKind::ConnectionRefused,
    };
    SmtpError::connect(
        kind,
        ConnectPhase::Dial,
        format!("failed to connect to {}: {}", address, error),
    )
    .with_cause(error)
}

/// Reads lines until a reply without the continuation marker arrives.
async fn read_reply<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    read_timeout: Duration,
) -> SmtpResult<SmtpResponse> {
    let mut lines = Vec::new();

    loop {
        let mut raw = Vec::new();
        let read = timeout(read_timeout, reader.read_until(b'\n', &mut raw))
            .await
            .map_err(|_| SmtpError::new(SmtpErrorKind::ReadTimeout, "Read timed out"))?
            .map_err(|e| {
                SmtpError::new(SmtpErrorKind::ConnectionReset, format!("Read error: {}", e))
                    .with_cause(e)
            })?;

        if read == 0 {
            return Err(SmtpError::new(
                SmtpErrorKind::ConnectionReset,
                "Server closed connection",
            ));
        }

        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
        let more = SmtpResponse::is_continuation(&line);
        lines.push(line);

        if !more {
            return SmtpResponse::parse(&lines);
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
    write_timeout: Duration,
) -> SmtpResult<()> {
    let io = async {
        writer.write_all(data).await?;
        writer.flush().await
    };

    timeout(write_timeout, io)
        .await
        .map_err(|_| SmtpError::new(SmtpErrorKind::WriteTimeout, "Write timed out"))?
        .map_err(|e| {
            SmtpError::new(SmtpErrorKind::ConnectionReset, format!("Write error: {}", e))
                .with_cause(e)
        })
}

/// rustls client configuration.
mod tls {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
    use std::sync::Arc;
    use tokio_rustls::TlsConnector;

    /// Builds a connector that either verifies against the webpki roots
    /// or accepts any certificate.
    pub(super) fn connector(verify_certificate: bool) -> TlsConnector {
        let config = if verify_certificate {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        } else {
            let algorithms =
                rustls::crypto::ring::default_provider().signature_verification_algorithms;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { algorithms }))
                .with_no_client_auth()
        };
        TlsConnector::from(Arc::new(config))
    }

    /// Skips chain and name checks but still checks handshake signatures.
    #[derive(Debug)]
    struct AcceptAnyCertificate {
        algorithms: WebPkiSupportedAlgorithms,
    }

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serves one scripted session: writes the greeting, then for each
    /// expected line prefix reads a line and writes the canned reply.
    async fn scripted_server(
        script: Vec<(&'static str, &'static str)>,
    ) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut reader = BufReader::new(read);
            write.write_all(b"220 mx.test ESMTP ready\r\n").await.unwrap();

            for (expected, reply) in script {
                let mut line = String::new();
                reader.read_line(&mut line).await.unwrap();
                assert!(line.starts_with(expected), "expected {expected:?}, got {line:?}");
                write.write_all(reply.as_bytes()).await.unwrap();
            }

            let mut rest = Vec::new();
            let _ = reader.read_to_end(&mut rest).await;
            rest
        });

        (port, handle)
    }

    fn plain_config(port: u16) -> SmtpConfig {
        SmtpConfig::builder()
            .host("127.0.0.1")
            .port(port)
            .transport_mode(TransportMode::Plain)
            .credentials("user", "pass")
            .connect_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_plain_session_with_auth_plain() {
        let (port, server) = scripted_server(vec![
            ("EHLO localhost", "250-mx.test\r\n250-AUTH PLAIN LOGIN\r\n250 SIZE 1000\r\n"),
            ("AUTH PLAIN AHVzZXIAcGFzcw==", "235 2.7.0 ok\r\n"),
            ("MAIL FROM:<a@example.com>", "250 ok\r\n"),
            ("QUIT", "221 bye\r\n"),
        ])
        .await;

        let factory = TcpConnectionFactory::new(Arc::new(plain_config(port))).unwrap();
        let mut conn = factory.create().await.unwrap();
        assert!(!conn.is_tls());

        let reply = conn
            .send_command(&SmtpCommand::MailFrom("a@example.com".into()))
            .await
            .unwrap();
        assert_eq!(reply.code, 250);
        conn.close().await.unwrap();
        drop(conn);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_helo_fallback() {
        let (port, server) = scripted_server(vec![
            ("EHLO", "502 command not implemented\r\n"),
            ("HELO localhost", "250 mx.test\r\n"),
            ("AUTH PLAIN", "235 ok\r\n"),
        ])
        .await;

        let factory = TcpConnectionFactory::new(Arc::new(plain_config(port))).unwrap();
        assert!(factory.create().await.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_is_connect_error() {
        let (port, server) = scripted_server(vec![
            ("EHLO", "250-mx.test\r\n250 AUTH LOGIN\r\n"),
            ("AUTH LOGIN", "334 VXNlcm5hbWU6\r\n"),
            ("dXNlcg==", "334 UGFzc3dvcmQ6\r\n"),
            ("cGFzcw==", "535 5.7.8 bad credentials\r\n"),
        ])
        .await;

        let factory = TcpConnectionFactory::new(Arc::new(plain_config(port))).unwrap();
        let err = factory.create().await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::CredentialsInvalid);
        assert_eq!(err.phase(), Some(ConnectPhase::Authentication));

        // Socket was dropped, so the server sees EOF.
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_data_is_dot_stuffed_on_the_wire() {
        let (port, server) = scripted_server(vec![
            ("EHLO", "250 mx.test\r\n"),
            ("AUTH PLAIN", "235 ok\r\n"),
            ("DATA", "354 go ahead\r\n"),
        ])
        .await;

        let factory = TcpConnectionFactory::new(Arc::new(plain_config(port))).unwrap();
        let mut conn = factory.create().await.unwrap();
        conn.send_command(&SmtpCommand::Data).await.unwrap();

        // The script ends after DATA, so no reply comes; the server keeps
        // everything written until the socket closes.
        let message = b"Subject: x\r\n\r\n.hidden\nline";
        let _ = timeout(Duration::from_millis(200), conn.send_data(message)).await;
        drop(conn);

        let received = server.await.unwrap();
        assert_eq!(received, prepare_data_content(message));
        assert!(received.ends_with(b"\r\n..hidden\r\nline\r\n.\r\n"));
    }

    #[tokio::test]
    async fn test_dial_failure_is_tagged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let factory = TcpConnectionFactory::new(Arc::new(plain_config(port))).unwrap();
        let err = factory.create().await.unwrap_err();
        assert_eq!(err.phase(), Some(ConnectPhase::Dial));
        assert_eq!(err.category(), crate::errors::ErrorCategory::Connect);
    }

    fn unauthenticated_config(port: u16, mode: TransportMode) -> SmtpConfig {
        SmtpConfig::builder()
            .host("127.0.0.1")
            .port(port)
            .transport_mode(mode)
            .pool_size(1)
            .no_retry()
            .connect_timeout(Duration::from_secs(2))
            .command_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_starttls_refused_drops_session() {
        let (port, server) = scripted_server(vec![
            ("EHLO localhost", "250-mx.test\r\n250 STARTTLS\r\n"),
            ("STARTTLS", "454 4.7.0 TLS not available\r\n"),
        ])
        .await;

        let config = unauthenticated_config(port, TransportMode::StartTls);
        let factory = TcpConnectionFactory::new(Arc::new(config)).unwrap();
        let err = factory.create().await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert_eq!(err.phase(), Some(ConnectPhase::StartTls));
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_starttls_not_advertised_is_not_attempted() {
        let (port, server) = scripted_server(vec![("EHLO localhost", "250 mx.test\r\n")]).await;

        let config = unauthenticated_config(port, TransportMode::StartTls);
        let factory = TcpConnectionFactory::new(Arc::new(config)).unwrap();
        let err = factory.create().await.unwrap_err();

        assert_eq!(err.kind(), SmtpErrorKind::StarttlsNotSupported);
        assert_eq!(err.phase(), Some(ConnectPhase::StartTls));
        assert!(server.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_implicit_tls_against_plain_server_fails_handshake() {
        let (port, server) = scripted_server(Vec::new()).await;

        let config = unauthenticated_config(port, TransportMode::ImplicitTls);
        let factory = TcpConnectionFactory::new(Arc::new(config)).unwrap();
        let err = factory.create().await.unwrap_err();

        assert_eq!(err.phase(), Some(ConnectPhase::TlsHandshake));
        // The server only ever saw a ClientHello record.
        let received = server.await.unwrap();
        assert_eq!(received.first(), Some(&0x16));
    }

    #[tokio::test]
    async fn test_line_breaks_in_recipient_never_reach_the_wire() {
        let (port, server) = scripted_server(vec![
            ("EHLO localhost", "250 mx.test\r\n"),
            ("QUIT", "221 bye\r\n"),
        ])
        .await;

        let config = unauthenticated_config(port, TransportMode::Plain);
        let client = crate::client::SmtpClient::new(config).await.unwrap();
        client.connect().await.unwrap();

        let err = client
            .send(
                &tokio_util::sync::CancellationToken::new(),
                "a@example.com",
                "x@y.com>\r\nRCPT TO:<evil@z.com",
                "Hi",
                "body",
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::InvalidAddress);

        // The next line the server reads must be QUIT, not MAIL or RCPT.
        client.disconnect().await.unwrap();
        drop(client);
        assert!(server.await.unwrap().is_empty());
    }

    #[test]
    fn test_connector_builds_in_both_modes() {
        let _ = tls::connector(true);
        let _ = tls::connector(false);
    }

    #[tokio::test]
    async fn test_read_reply_multiline() {
        let mut input: &[u8] = b"250-first\r\n250-second\r\n250 last\r\n";
        let reply = read_reply(&mut input, Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.message, vec!["first", "second", "last"]);

        let mut closed: &[u8] = b"";
        let err = read_reply(&mut closed, Duration::from_secs(1)).await.unwrap_err();
        assert_eq!(err.kind(), SmtpErrorKind::ConnectionReset);
    }
}

//! Mail dispatch client.
//!
//! [`SmtpClient`] owns the connection source (a pool, or one directly held
//! connection when the pool size is zero) and runs the delivery loop:
//! - connect on first use
//! - per attempt: check cancellation, wait the retry delay, borrow a
//!   connection, compose, run the transaction, give the connection back
//! - wrap the last error once every attempt has failed
//!
//! [`SmtpClient::deliver`] and [`SmtpClient::send_bulk`] additionally hand an
//! [`EmailLog`] to the configured repository for every request.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bulk::{BulkDispatcher, MailSender};
use crate::config::SmtpConfig;
use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::logging::{EmailLog, EmailLogRepository, EmailLogger};
use crate::mime::MessageComposer;
use crate::observability::{SmtpMetrics, Timer};
use crate::pool::ConnectionPool;
use crate::protocol::{codes, SmtpCommand};
use crate::transport::{Connection, ConnectionFactory, TcpConnectionFactory};
use crate::types::{
    envelope_address, Attachment, BulkSendResponse, DeliveryFailure, EmailRequest, EmailResponse,
    EmailResult, PoolStatus,
};

enum ConnectionSource {
    Single(Mutex<Option<Connection>>),
    Pooled(ConnectionPool),
}

/// Pooled, retrying mail client.
pub struct SmtpClient {
    config: Arc<SmtpConfig>,
    factory: Arc<dyn ConnectionFactory>,
    source: ConnectionSource,
    connect_lock: Mutex<()>,
    composer: MessageComposer,
    dispatcher: BulkDispatcher,
    logger: Option<EmailLogger>,
    metrics: Arc<SmtpMetrics>,
}

impl fmt::Debug for SmtpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpClient")
            .field("address", &self.config.address())
            .field("pool_size", &self.config.pool_size)
            .field("retry_attempts", &self.config.retry_attempts)
            .field("logging", &self.logger.is_some())
            .finish()
    }
}

impl SmtpClient {
    /// Creates a client that dials real servers and keeps no EmailLog.
    pub async fn new(config: SmtpConfig) -> SmtpResult<Self> {
        Self::builder().config(config).build().await
    }

    /// Creates a builder.
    pub fn builder() -> SmtpClientBuilder {
        SmtpClientBuilder::default()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }

    /// Returns the metrics collector.
    pub fn metrics(&self) -> &Arc<SmtpMetrics> {
        &self.metrics
    }

    /// Opens the pool (or the single connection) unless already open.
    ///
    /// Pool bring-up is all or nothing. Concurrent callers are serialized.
    pub async fn connect(&self) -> SmtpResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected().await {
            return Ok(());
        }

        match &self.source {
            ConnectionSource::Pooled(pool) => pool.initialize(self.config.pool_size).await?,
            ConnectionSource::Single(slot) => {
                let conn = self.factory.create().await?;
                self.metrics.record_connection_created();
                let previous = slot.lock().await.replace(conn);
                if let Some(mut previous) = previous {
                    let _ = previous.close().await;
                    self.metrics.record_connection_closed();
                }
            }
        }

        info!(address = %self.config.address(), "Connected");
        Ok(())
    }

    /// Sends QUIT on every idle connection and forgets them.
    ///
    /// Returns the last QUIT error, if any.
    pub async fn disconnect(&self) -> SmtpResult<()> {
        let _guard = self.connect_lock.lock().await;
        let result = match &self.source {
            ConnectionSource::Pooled(pool) => pool.teardown().await,
            ConnectionSource::Single(slot) => {
                let conn = slot.lock().await.take();
                match conn {
                    Some(mut conn) => {
                        let result = conn.close().await;
                        self.metrics.record_connection_closed();
                        result
                    }
                    None => Ok(()),
                }
            }
        };
        info!(address = %self.config.address(), "Disconnected");
        result
    }

    /// Returns true once connected and until disconnected.
    ///
    /// For a pool this means initialized, not that an idle connection is free.
    pub async fn is_connected(&self) -> bool {
        match &self.source {
            ConnectionSource::Pooled(pool) => pool.is_initialized().await,
            // Locked means a transaction holds the connection.
            ConnectionSource::Single(slot) => match slot.try_lock() {
                Ok(conn) => conn.is_some(),
                Err(_) => true,
            },
        }
    }

    /// Returns the pool status. In single-connection mode capacity is one.
    pub async fn pool_status(&self) -> PoolStatus {
        match &self.source {
            ConnectionSource::Pooled(pool) => pool.status().await,
            ConnectionSource::Single(slot) => match slot.try_lock() {
                Ok(conn) => PoolStatus {
                    capacity: 1,
                    idle: usize::from(conn.is_some()),
                    borrowed: 0,
                    initialized: conn.is_some(),
                },
                Err(_) => PoolStatus {
                    capacity: 1,
                    idle: 0,
                    borrowed: 1,
                    initialized: true,
                },
            },
        }
    }

    /// Sends a plain-text message.
    pub async fn send(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> SmtpResult<()> {
        self.send_with_retry(cancel, &EmailRequest::plain(from, to, subject, body))
            .await
    }

    /// Sends an HTML message.
    pub async fn send_html(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> SmtpResult<()> {
        self.send_with_retry(cancel, &EmailRequest::html(from, to, subject, body))
            .await
    }

    /// Sends a multipart message with a plain-text part and attachments.
    pub async fn send_with_attachments(
        &self,
        cancel: &CancellationToken,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
        attachments: Vec<Attachment>,
    ) -> SmtpResult<()> {
        let request = EmailRequest {
            attachments,
            ..EmailRequest::plain(from, to, subject, body)
        };
        self.send_with_retry(cancel, &request).await
    }

    /// Sends one request and records an [`EmailLog`].
    ///
    /// On failure the returned [`DeliveryFailure`] carries both the
    /// `success == false` response and the error.
    pub async fn deliver(
        &self,
        cancel: &CancellationToken,
        request: EmailRequest,
    ) -> Result<EmailResponse, DeliveryFailure> {
        match self.dispatch(cancel, &request).await {
            Ok(()) => Ok(EmailResponse::sent()),
            Err(error) => Err(DeliveryFailure::from(error)),
        }
    }

    /// Sends a batch under the `max_concurrent` ceiling.
    ///
    /// Per-request failures are reported in the results. The call itself
    /// fails only if the initial connection cannot be established.
    pub async fn send_bulk(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        requests: Vec<EmailRequest>,
    ) -> SmtpResult<BulkSendResponse> {
        if requests.is_empty() {
            return Ok(BulkSendResponse::default());
        }
        if !cancel.is_cancelled() && !self.is_connected().await {
            self.connect()
                .await
                .map_err(|e| e.context("bulk send could not connect"))?;
        }

        Ok(self
            .dispatcher
            .dispatch(Arc::clone(self), cancel, requests)
            .await)
    }

    /// Runs the retry loop for one request.
    ///
    /// Makes `retry_attempts + 1` attempts at most. Cancellation is checked
    /// before each attempt and during the delay between attempts.
    pub async fn send_with_retry(
        &self,
        cancel: &CancellationToken,
        request: &EmailRequest,
    ) -> SmtpResult<()> {
        if cancel.is_cancelled() {
            self.metrics.record_cancellation();
            return Err(SmtpError::cancelled());
        }

        let from = self.sender_for(request)?;
        let recipients = request.recipients();
        if recipients.is_empty() {
            return Err(SmtpError::new(
                SmtpErrorKind::InvalidAddress,
                "request has no recipients",
            ));
        }
        let sender = envelope_address(from)?;
        let envelope = recipients
            .iter()
            .map(|r| envelope_address(r))
            .collect::<SmtpResult<Vec<_>>>()?;

        if !self.is_connected().await {
            self.connect()
                .await
                .map_err(|e| e.context("failed to connect"))?;
        }

        let attempts = self.config.retry_attempts.saturating_add(1);
        let timer = Timer::start("send_with_retry");
        let mut last_error = None;

        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                self.metrics.record_cancellation();
                return Err(SmtpError::cancelled());
            }
            if attempt > 0 {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        self.metrics.record_cancellation();
                        return Err(SmtpError::cancelled());
                    }
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            self.metrics.record_attempt(attempt);
            let payload = self.composer.compose_request(request, from);
            match self.attempt(&sender, &envelope, &payload).await {
                Ok(()) => {
                    info!(
                        to = %request.to,
                        attempt = attempt + 1,
                        bytes = payload.len(),
                        duration_ms = timer.stop().as_millis() as u64,
                        "Email sent"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        to = %request.to,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        error = %e,
                        "Send attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .unwrap_or_else(|| SmtpError::new(SmtpErrorKind::Unknown, "no attempt was made"));
        Err(SmtpError::exhausted(attempts, last))
    }

    fn sender_for<'a>(&'a self, request: &'a EmailRequest) -> SmtpResult<&'a str> {
        let from = request.from.trim();
        if !from.is_empty() {
            return Ok(from);
        }
        self.config
            .default_from
            .as_deref()
            .ok_or_else(|| {
                SmtpError::new(
                    SmtpErrorKind::InvalidAddress,
                    "request has no sender and no default sender is configured",
                )
            })
    }

    async fn dispatch(&self, cancel: &CancellationToken, request: &EmailRequest) -> SmtpResult<()> {
        let outcome = self.send_with_retry(cancel, request).await;
        match &outcome {
            Ok(()) => self.metrics.record_send_success(),
            Err(_) => self.metrics.record_send_failure(),
        }

        if let Some(logger) = &self.logger {
            let from = self.sender_for(request).unwrap_or(request.from.as_str());
            logger.record(EmailLog::from_outcome(request, from, &EmailResult::from(&outcome)));
        }
        outcome
    }

    async fn attempt(
        &self,
        sender: &str,
        recipients: &[String],
        payload: &[u8],
    ) -> SmtpResult<()> {
        match &self.source {
            ConnectionSource::Pooled(pool) => {
                let mut conn = pool.acquire().await?;
                let result = transact(&mut conn, sender, recipients, payload).await;
                if let Err(e) = &result {
                    reset_after_failure(&mut conn, e).await;
                }
                pool.release(conn).await;
                result
            }
            ConnectionSource::Single(slot) => {
                let mut slot = slot.lock().await;
                let conn = self.ensure_single(&mut slot).await?;
                let result = transact(conn, sender, recipients, payload).await;
                if let Err(e) = &result {
                    reset_after_failure(conn, e).await;
                }
                result
            }
        }
    }

    /// Returns the held connection, replacing it if missing or dead.
    async fn ensure_single<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> SmtpResult<&'a mut Connection> {
        if let Some(conn) = slot.as_mut() {
            if let Err(e) = conn.health_check().await {
                warn!(session = conn.id(), error = %e, "Dead connection found, replacing");
                self.metrics.record_dead_connection();
                self.metrics.record_connection_closed();
                *slot = None;
            }
        }

        if slot.is_none() {
            let conn = self.factory.create().await?;
            self.metrics.record_connection_created();
            *slot = Some(conn);
        }

        slot.as_mut()
            .ok_or_else(|| SmtpError::pool(SmtpErrorKind::PoolNotInitialized, "no connection held"))
    }
}

#[async_trait]
impl MailSender for SmtpClient {
    async fn send_one(&self, cancel: &CancellationToken, request: &EmailRequest) -> EmailResult {
        EmailResult::from(&self.dispatch(cancel, request).await)
    }
}

/// Runs MAIL, RCPT for each recipient, DATA and the payload.
///
/// Addresses must already be envelope mailboxes.
async fn transact(
    conn: &mut Connection,
    sender: &str,
    recipients: &[String],
    payload: &[u8],
) -> SmtpResult<()> {
    let reply = conn
        .send_command(&SmtpCommand::MailFrom(sender.to_string()))
        .await
        .map_err(|e| e.context("failed to set sender"))?;
    if !reply.is_success() {
        return Err(reply
            .to_error()
            .in_step(SmtpErrorKind::SenderRejected)
            .context("failed to set sender"));
    }

    for recipient in recipients {
        let context = format!("failed to add recipient {}", recipient);
        let reply = conn
            .send_command(&SmtpCommand::RcptTo(recipient.clone()))
            .await
            .map_err(|e| e.context(&context))?;
        if !reply.is_success() {
            return Err(reply
                .to_error()
                .in_step(SmtpErrorKind::RecipientRejected)
                .context(&context));
        }
    }

    let reply = conn
        .send_command(&SmtpCommand::Data)
        .await
        .map_err(|e| e.context("failed to open data writer"))?;
    if reply.code != codes::START_MAIL_INPUT {
        return Err(reply
            .to_error()
            .in_step(SmtpErrorKind::DataRejected)
            .context("failed to open data writer"));
    }

    let reply = conn
        .send_data(payload)
        .await
        .map_err(|e| e.context("failed to write email data"))?;
    if !reply.is_success() {
        return Err(reply
            .to_error()
            .in_step(SmtpErrorKind::DataRejected)
            .context("failed to write email data"));
    }

    debug!(session = conn.id(), recipients = recipients.len(), "Transaction complete");
    Ok(())
}

/// Best-effort RSET so the next borrower starts from a clean transaction.
async fn reset_after_failure(conn: &mut Connection, error: &SmtpError) {
    if matches!(
        error.kind(),
        SmtpErrorKind::ConnectionReset | SmtpErrorKind::ReadTimeout | SmtpErrorKind::WriteTimeout
    ) {
        return;
    }
    if let Err(e) = conn.send_command(&SmtpCommand::Rset).await {
        debug!(session = conn.id(), error = %e, "RSET after failed transaction failed");
    }
}

/// Builder for [`SmtpClient`].
#[derive(Default)]
pub struct SmtpClientBuilder {
    config: Option<SmtpConfig>,
    factory: Option<Arc<dyn ConnectionFactory>>,
    log_repository: Option<Arc<dyn EmailLogRepository>>,
    metrics: Option<Arc<SmtpMetrics>>,
}

impl fmt::Debug for SmtpClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpClientBuilder")
            .field("config", &self.config)
            .field("factory", &self.factory)
            .field("log_repository", &self.log_repository)
            .finish()
    }
}

impl SmtpClientBuilder {
    /// Sets the configuration.
    pub fn config(mut self, config: SmtpConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the TCP factory, e.g. with a mock.
    pub fn connection_factory(mut self, factory: Arc<dyn ConnectionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets where [`EmailLog`] records are persisted.
    pub fn log_repository(mut self, repository: Arc<dyn EmailLogRepository>) -> Self {
        self.log_repository = Some(repository);
        self
    }

    /// Shares a metrics collector with the caller.
    pub fn metrics(mut self, metrics: Arc<SmtpMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds the client. Does not connect.
    pub async fn build(self) -> SmtpResult<SmtpClient> {
        let config = self
            .config
            .ok_or_else(|| SmtpError::configuration("Configuration is required"))?;
        config.validate()?;
        let config = Arc::new(config);

        let factory: Arc<dyn ConnectionFactory> = match self.factory {
            Some(factory) => factory,
            None => Arc::new(TcpConnectionFactory::new(Arc::clone(&config))?),
        };
        let metrics = self.metrics.unwrap_or_default();

        let source = if config.is_single_connection() {
            ConnectionSource::Single(Mutex::new(None))
        } else {
            ConnectionSource::Pooled(ConnectionPool::new(
                Arc::clone(&factory),
                config.pool_size,
                Arc::clone(&metrics),
            ))
        };

        let logger = self.log_repository.map(|repository| {
            EmailLogger::spawn(repository, config.log_queue_capacity, Arc::clone(&metrics))
        });

        Ok(SmtpClient {
            dispatcher: BulkDispatcher::new(config.max_concurrent, Arc::clone(&metrics)),
            config,
            factory,
            source,
            connect_lock: Mutex::new(()),
            composer: MessageComposer::new(),
            logger,
            metrics,
        })
    }
}

//! Fire-and-forget EmailLog hand-off.
//!
//! Every finished single send produces one [`EmailLog`]. The sender pushes it
//! onto a bounded queue and moves on; a worker task drains the queue into an
//! [`EmailLogRepository`]. Persistence failures are logged and never reach
//! the sender.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::observability::SmtpMetrics;
use crate::types::{EmailRequest, EmailResult};

/// Deadline for persisting one record.
pub const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Audit record of one send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailLog {
    /// Record id.
    pub id: Uuid,
    /// Sender as requested.
    pub from: String,
    /// Recipient field as requested.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// `text/plain`, `text/html` or `multipart/mixed`.
    pub content_type: String,
    /// Whether the server accepted the message.
    pub success: bool,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the send finished.
    pub sent_at: DateTime<Utc>,
    /// When the record was built.
    pub created_at: DateTime<Utc>,
}

impl EmailLog {
    /// Builds the record for a finished send.
    pub fn from_outcome(request: &EmailRequest, from: &str, outcome: &EmailResult) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            from: from.to_string(),
            to: request.to.clone(),
            subject: request.subject.clone(),
            content_type: request.content_type().to_string(),
            success: outcome.success,
            error: outcome.error.clone(),
            sent_at: now,
            created_at: now,
        }
    }
}

/// Error from a log store.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// The store did not answer within [`SAVE_TIMEOUT`].
    #[error("saving email log timed out after {0:?}")]
    Timeout(Duration),
    /// The store rejected the record.
    #[error("log store error: {0}")]
    Backend(String),
}

/// Persists [`EmailLog`] records.
#[async_trait]
pub trait EmailLogRepository: Send + Sync + fmt::Debug {
    /// Saves one record.
    async fn save_log(&self, log: EmailLog) -> Result<(), LogStoreError>;
}

/// Handle to the hand-off queue and its worker.
#[derive(Debug)]
pub struct EmailLogger {
    sender: mpsc::Sender<EmailLog>,
    worker: JoinHandle<()>,
    metrics: Arc<SmtpMetrics>,
}

impl EmailLogger {
    /// Starts a worker draining a queue of `capacity` records into `repository`.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn spawn(
        repository: Arc<dyn EmailLogRepository>,
        capacity: usize,
        metrics: Arc<SmtpMetrics>,
    ) -> Self {
        let (sender, mut receiver) = mpsc::channel::<EmailLog>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(log) = receiver.recv().await {
                let id = log.id;
                let outcome = tokio::time::timeout(SAVE_TIMEOUT, repository.save_log(log))
                    .await
                    .unwrap_or(Err(LogStoreError::Timeout(SAVE_TIMEOUT)));
                match outcome {
                    Ok(()) => debug!(log_id = %id, "Email log saved"),
                    Err(e) => warn!(log_id = %id, error = %e, "Failed to save email log"),
                }
            }
        });

        Self {
            sender,
            worker,
            metrics,
        }
    }

    /// Queues a record without waiting. A full queue drops it.
    pub fn record(&self, log: EmailLog) {
        if let Err(e) = self.sender.try_send(log) {
            let reason = match e {
                mpsc::error::TrySendError::Full(_) => "queue full",
                mpsc::error::TrySendError::Closed(_) => "worker stopped",
            };
            warn!(reason, "Dropping email log");
            self.metrics.record_log_dropped();
        }
    }

    /// Closes the queue and waits for queued records to be saved.
    pub async fn shutdown(self) {
        drop(self.sender);
        if let Err(e) = self.worker.await {
            warn!(error = %e, "Email log worker ended abnormally");
        }
    }
}

/// In-memory [`EmailLogRepository`].
#[derive(Debug, Default)]
pub struct MemoryLogRepository {
    logs: Mutex<Vec<EmailLog>>,
    saved: Notify,
}

impl MemoryLogRepository {
    /// Creates an empty repository.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the saved records in save order.
    pub fn logs(&self) -> Vec<EmailLog> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Waits until at least `count` records are saved or `limit` elapses.
    pub async fn wait_for(&self, count: usize, limit: Duration) -> Vec<EmailLog> {
        let _ = tokio::time::timeout(limit, async {
            loop {
                let notified = self.saved.notified();
                if self.logs().len() >= count {
                    break;
                }
                notified.await;
            }
        })
        .await;
        self.logs()
    }
}

#[async_trait]
impl EmailLogRepository for MemoryLogRepository {
    async fn save_log(&self, log: EmailLog) -> Result<(), LogStoreError> {
        self.logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(log);
        self.saved.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    mock! {
        pub Repository {}

        #[async_trait]
        impl EmailLogRepository for Repository {
            async fn save_log(&self, log: EmailLog) -> Result<(), LogStoreError>;
        }
    }

    impl fmt::Debug for MockRepository {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("MockRepository").finish_non_exhaustive()
        }
    }

    #[derive(Debug)]
    struct StuckRepository;

    #[async_trait]
    impl EmailLogRepository for StuckRepository {
        async fn save_log(&self, _log: EmailLog) -> Result<(), LogStoreError> {
            std::future::pending().await
        }
    }

    fn sample(success: bool) -> EmailLog {
        let request = EmailRequest::html("a@example.com", "b@example.com", "Hi", "<p>x</p>");
        let outcome = if success {
            EmailResult::sent()
        } else {
            EmailResult::failed("boom")
        };
        EmailLog::from_outcome(&request, "a@example.com", &outcome)
    }

    #[test]
    fn test_from_outcome() {
        let log = sample(false);
        assert_eq!(log.content_type, "text/html");
        assert!(!log.success);
        assert_eq!(log.error.as_deref(), Some("boom"));
        assert_eq!(log.sent_at, log.created_at);

        let json = serde_json::to_value(sample(true)).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["subject"], "Hi");
    }

    #[tokio::test]
    async fn test_records_reach_repository() {
        let repo = MemoryLogRepository::new();
        let logger = EmailLogger::spawn(repo.clone(), 8, Arc::new(SmtpMetrics::new()));

        logger.record(sample(true));
        logger.record(sample(false));
        logger.shutdown().await;

        let logs = repo.logs();
        assert_eq!(logs.len(), 2);
        assert!(logs[0].success);
        assert!(!logs[1].success);
    }

    #[tokio::test]
    async fn test_store_failure_is_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut repository = MockRepository::new();
        let counter = Arc::clone(&calls);
        repository.expect_save_log().returning(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(LogStoreError::Backend("database unavailable".into()))
        });

        let logger = EmailLogger::spawn(Arc::new(repository), 8, Arc::new(SmtpMetrics::new()));
        logger.record(sample(true));
        logger.record(sample(false));
        logger.shutdown().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_queue_drops_without_blocking() {
        let metrics = Arc::new(SmtpMetrics::new());
        let logger = EmailLogger::spawn(Arc::new(StuckRepository), 1, metrics.clone());

        for _ in 0..5 {
            logger.record(sample(true));
        }

        assert!(metrics.snapshot().logs_dropped >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_store_times_out() {
        let logger = EmailLogger::spawn(Arc::new(StuckRepository), 4, Arc::new(SmtpMetrics::new()));
        logger.record(sample(true));
        logger.record(sample(true));

        // Each save gives up after the deadline, so the worker drains.
        logger.shutdown().await;
    }
}

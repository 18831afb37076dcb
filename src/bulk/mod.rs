//! Bulk dispatch under a concurrency ceiling.
//!
//! Each request runs on its own task once it holds a semaphore permit. The
//! results come back in request order whatever order the tasks finish in.

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::SmtpError;
use crate::observability::SmtpMetrics;
use crate::types::{BulkSendResponse, EmailRequest, EmailResult};

/// Sends one request to a terminal outcome.
#[async_trait]
pub trait MailSender: Send + Sync + 'static {
    /// Runs the full retry loop for `request`. Failures are reported in the result.
    async fn send_one(&self, cancel: &CancellationToken, request: &EmailRequest) -> EmailResult;
}

/// Fans a batch out over at most `max_concurrent` tasks.
#[derive(Debug, Clone)]
pub struct BulkDispatcher {
    max_concurrent: usize,
    metrics: Arc<SmtpMetrics>,
}

impl BulkDispatcher {
    /// Creates a dispatcher. A ceiling of zero is treated as one.
    pub fn new(max_concurrent: usize, metrics: Arc<SmtpMetrics>) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            metrics,
        }
    }

    /// Returns the concurrency ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Sends every request and returns once each has a result.
    ///
    /// `results[i]` belongs to `requests[i]`. A request still waiting for a
    /// slot when `cancel` fires reports a cancellation failure; requests
    /// already sending finish their current transaction.
    pub async fn dispatch<S: MailSender>(
        &self,
        sender: Arc<S>,
        cancel: &CancellationToken,
        requests: Vec<EmailRequest>,
    ) -> BulkSendResponse {
        let total = requests.len();
        self.metrics.record_bulk_batch();
        info!(total, max_concurrent = self.max_concurrent, "Dispatching bulk batch");

        let gate = Arc::new(Semaphore::new(self.max_concurrent));
        let handles: Vec<_> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| {
                let gate = Arc::clone(&gate);
                let sender = Arc::clone(&sender);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(index, "Cancelled while waiting for a slot");
                            return EmailResult::failed(SmtpError::cancelled());
                        }
                        permit = gate.acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => return EmailResult::failed(SmtpError::cancelled()),
                        },
                    };
                    sender.send_one(&cancel, &request).await
                })
            })
            .collect();

        let results = join_all(handles)
            .await
            .into_iter()
            .enumerate()
            .map(|(index, joined)| {
                joined.unwrap_or_else(|e| {
                    warn!(index, error = %e, "Bulk send task failed");
                    EmailResult::failed(format!("send task failed: {}", e))
                })
            })
            .collect();

        let response = BulkSendResponse { results };
        info!(
            total,
            succeeded = response.succeeded(),
            failed = response.failed(),
            "Bulk batch finished"
        );
        response
    }
}

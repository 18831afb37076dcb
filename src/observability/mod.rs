//! Observability for mail dispatch.
//!
//! Structured logging goes through `tracing`; [`init_tracing`] installs a
//! subscriber for binaries and tests that want output. [`SmtpMetrics`] keeps
//! process-local counters that a caller can snapshot.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Output format for [`init_tracing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Installs a global subscriber filtered by `RUST_LOG` (default `info`).
///
/// # Errors
///
/// Returns an error if a global subscriber is already set.
pub fn init_tracing(format: LogFormat) -> Result<(), tracing_subscriber::util::TryInitError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
    }
}

/// Counters for sends and connections.
#[derive(Debug, Default)]
pub struct SmtpMetrics {
    emails_sent: AtomicU64,
    emails_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    cancellations: AtomicU64,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    dead_connections: AtomicU64,
    bulk_batches: AtomicU64,
    logs_dropped: AtomicU64,
}

impl SmtpMetrics {
    /// Creates a zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an accepted message.
    pub fn record_send_success(&self) {
        self.emails_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a send that ended in failure.
    pub fn record_send_failure(&self) {
        self.emails_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one transaction attempt; attempts after the first also count as retries.
    pub fn record_attempt(&self, attempt: u32) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if attempt > 0 {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a send stopped by cancellation.
    pub fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session opened.
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session closed or discarded.
    pub fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a session that failed its liveness probe.
    pub fn record_dead_connection(&self) {
        self.dead_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a bulk batch.
    pub fn record_bulk_batch(&self) {
        self.bulk_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an EmailLog record dropped because the queue was full.
    pub fn record_log_dropped(&self) {
        self.logs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            emails_failed: self.emails_failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            dead_connections: self.dead_connections.load(Ordering::Relaxed),
            bulk_batches: self.bulk_batches.load(Ordering::Relaxed),
            logs_dropped: self.logs_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Counters at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Messages accepted.
    pub emails_sent: u64,
    /// Sends that failed.
    pub emails_failed: u64,
    /// Transaction attempts.
    pub attempts: u64,
    /// Attempts after the first.
    pub retries: u64,
    /// Sends stopped by cancellation.
    pub cancellations: u64,
    /// Sessions opened.
    pub connections_created: u64,
    /// Sessions closed or discarded.
    pub connections_closed: u64,
    /// Sessions that failed the liveness probe.
    pub dead_connections: u64,
    /// Bulk batches dispatched.
    pub bulk_batches: u64,
    /// EmailLog records dropped.
    pub logs_dropped: u64,
}

impl MetricsSnapshot {
    /// Returns the share of finished sends that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.emails_sent + self.emails_failed;
        if total == 0 {
            1.0
        } else {
            self.emails_sent as f64 / total as f64
        }
    }

    /// Sessions currently open, as far as the counters know.
    pub fn open_connections(&self) -> u64 {
        self.connections_created.saturating_sub(self.connections_closed)
    }
}

/// Measures how long an operation took.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    name: &'static str,
}

impl Timer {
    /// Starts a timer.
    pub fn start(name: &'static str) -> Self {
        Self {
            start: Instant::now(),
            name,
        }
    }

    /// Returns the elapsed time.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stops the timer, logging the duration at debug level.
    pub fn stop(self) -> Duration {
        let elapsed = self.start.elapsed();
        tracing::debug!(
            timer = self.name,
            duration_ms = elapsed.as_millis() as u64,
            "Timer stopped"
        );
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let metrics = SmtpMetrics::new();

        metrics.record_send_success();
        metrics.record_send_success();
        metrics.record_send_failure();
        metrics.record_attempt(0);
        metrics.record_attempt(1);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.emails_sent, 2);
        assert_eq!(snapshot.emails_failed, 1);
        assert_eq!(snapshot.attempts, 2);
        assert_eq!(snapshot.retries, 1);
        assert!((snapshot.success_rate() - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_open_connections() {
        let metrics = SmtpMetrics::new();
        metrics.record_connection_created();
        metrics.record_connection_created();
        metrics.record_connection_closed();

        assert_eq!(metrics.snapshot().open_connections(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = SmtpMetrics::new();
        metrics.record_dead_connection();
        metrics.record_log_dropped();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["dead_connections"], 1);
        assert_eq!(json["logs_dropped"], 1);
        assert_eq!(json["emails_sent"], 0);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::start("test");
        std::thread::sleep(Duration::from_millis(10));
        assert!(timer.stop() >= Duration::from_millis(10));
    }
}

//! Bounded pool of live sessions.
//!
//! The idle set sits behind one lock that is held only while the set is
//! read or changed. Dialing, probing and QUIT all happen with the lock
//! released. A borrowed [`Connection`] belongs to the borrower until it is
//! handed back with [`ConnectionPool::release`].

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::{SmtpError, SmtpErrorKind, SmtpResult};
use crate::observability::SmtpMetrics;
use crate::transport::{Connection, ConnectionFactory};
use crate::types::PoolStatus;

#[derive(Debug, Default)]
struct PoolState {
    initialized: bool,
    idle: VecDeque<Connection>,
    borrowed: usize,
}

/// Pool of idle sessions opened by a [`ConnectionFactory`].
#[derive(Debug)]
pub struct ConnectionPool {
    factory: Arc<dyn ConnectionFactory>,
    capacity: usize,
    state: Mutex<PoolState>,
    metrics: Arc<SmtpMetrics>,
}

impl ConnectionPool {
    /// Creates an empty, uninitialized pool.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        capacity: usize,
        metrics: Arc<SmtpMetrics>,
    ) -> Self {
        Self {
            factory,
            capacity,
            state: Mutex::new(PoolState::default()),
            metrics,
        }
    }

    /// Returns the idle capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Opens `n` sessions and installs them as the idle set.
    ///
    /// All or nothing: if any creation fails, the sessions opened so far are
    /// closed and the pool stays uninitialized. Sessions previously idle are
    /// replaced and closed.
    pub async fn initialize(&self, n: usize) -> SmtpResult<()> {
        let mut created: Vec<Connection> = Vec::with_capacity(n);

        for index in 0..n {
            match self.factory.create().await {
                Ok(conn) => {
                    self.metrics.record_connection_created();
                    created.push(conn);
                }
                Err(e) => {
                    warn!(
                        failed = index + 1,
                        opened = created.len(),
                        error = %e,
                        "Pool initialization failed, closing opened connections"
                    );
                    let _ = self.close_all(created).await;
                    return Err(e.context(format!(
                        "failed to initialize connection pool, connection {} failed",
                        index + 1
                    )));
                }
            }
        }

        let previous = {
            let mut state = self.state.lock().await;
            state.initialized = true;
            std::mem::replace(&mut state.idle, created.into())
        };
        let _ = self.close_all(previous).await;

        info!(size = n, "Connection pool initialized");
        Ok(())
    }

    /// Borrows an idle session, probing it first.
    ///
    /// A session that fails the probe is discarded and replaced by a new one;
    /// if the replacement cannot be opened, that error is returned.
    pub async fn acquire(&self) -> SmtpResult<Connection> {
        let mut conn = {
            let mut state = self.state.lock().await;
            if !state.initialized {
                return Err(SmtpError::pool(
                    SmtpErrorKind::PoolNotInitialized,
                    "connection pool is not initialized",
                ));
            }
            let conn = state.idle.pop_front().ok_or_else(|| {
                SmtpError::pool(
                    SmtpErrorKind::PoolExhausted,
                    "no connections available in the pool",
                )
            })?;
            state.borrowed += 1;
            conn
        };

        match conn.health_check().await {
            Ok(()) => Ok(conn),
            Err(probe_error) => {
                warn!(
                    session = conn.id(),
                    error = %probe_error,
                    "Dead connection found, replacing"
                );
                self.metrics.record_dead_connection();
                drop(conn);
                self.metrics.record_connection_closed();

                match self.factory.create().await {
                    Ok(replacement) => {
                        self.metrics.record_connection_created();
                        Ok(replacement)
                    }
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        state.borrowed = state.borrowed.saturating_sub(1);
                        Err(e.context("failed to replace dead connection"))
                    }
                }
            }
        }
    }

    /// Returns a borrowed session to the idle set.
    ///
    /// If the set is already full or the pool was torn down, the session is
    /// closed instead. Never waits for a free slot.
    pub async fn release(&self, conn: Connection) {
        let surplus = {
            let mut state = self.state.lock().await;
            state.borrowed = state.borrowed.saturating_sub(1);
            if state.initialized && state.idle.len() < self.capacity {
                state.idle.push_back(conn);
                None
            } else {
                Some(conn)
            }
        };

        if let Some(mut conn) = surplus {
            debug!(session = conn.id(), "Closing surplus connection");
            let _ = conn.close().await;
            self.metrics.record_connection_closed();
        }
    }

    /// Closes every idle session and marks the pool uninitialized.
    ///
    /// Returns the last QUIT error, if any. Borrowed sessions are closed
    /// when they are released.
    pub async fn teardown(&self) -> SmtpResult<()> {
        let idle = {
            let mut state = self.state.lock().await;
            state.initialized = false;
            std::mem::take(&mut state.idle)
        };

        let count = idle.len();
        let result = self.close_all(idle).await;
        info!(closed = count, "Connection pool torn down");
        result
    }

    /// Returns true if the pool is initialized.
    pub async fn is_initialized(&self) -> bool {
        self.state.lock().await.initialized
    }

    /// Returns a snapshot of the pool.
    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            capacity: self.capacity,
            idle: state.idle.len(),
            borrowed: state.borrowed,
            initialized: state.initialized,
        }
    }

    async fn close_all(&self, connections: impl IntoIterator<Item = Connection>) -> SmtpResult<()> {
        let mut last_error = None;
        for mut conn in connections {
            if let Err(e) = conn.close().await {
                debug!(session = conn.id(), error = %e, "QUIT failed");
                last_error = Some(e);
            }
            self.metrics.record_connection_closed();
        }
        last_error.map_or(Ok(()), Err)
    }
}

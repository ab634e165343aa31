//! Ordered persistence queue.
//!
//! A single FIFO drained by one writer task. A record that fails to write
//! stays at the head and is retried before anything newer; ordering is
//! never violated and nothing is dropped. Depth beyond the pressure
//! threshold is loud but non-fatal.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::models::PersistRecord;
use crate::persist::Database;
use crate::supervisor::Shutdown;

/// Queue depth beyond which the service is falling behind the market.
pub const PRESSURE_THRESHOLD: usize = 5;

/// Bounded retry delay after a failed write.
const WRITE_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Idle poll bound so shutdown is never missed.
const IDLE_WAIT: Duration = Duration::from_millis(500);

#[derive(Default)]
pub struct PersistQueue {
    inner: Mutex<VecDeque<PersistRecord>>,
    notify: Notify,
}

impl PersistQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a record and signal the writer.
    pub fn push(&self, record: PersistRecord) {
        let depth = {
            let mut queue = self.inner.lock();
            queue.push_back(record);
            queue.len()
        };
        if depth > PRESSURE_THRESHOLD {
            error!(depth, "persistence queue backing up");
        }
        self.notify.notify_one();
    }

    /// Clone of the head record, if any.
    pub fn head(&self) -> Option<PersistRecord> {
        self.inner.lock().front().cloned()
    }

    /// Drop the head record after a successful write.
    pub fn pop_head(&self) {
        self.inner.lock().pop_front();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Wait for the next push signal.
    pub async fn signalled(&self) {
        self.notify.notified().await;
    }
}

/// Drain the queue while the service runs, then to completion on shutdown.
///
/// On a write failure during shutdown the remaining records are left in
/// place (head first) rather than spinning forever against a dead
/// database.
pub async fn run_writer(queue: Arc<PersistQueue>, db: Arc<Database>, shutdown: Shutdown) {
    info!("persistence writer started");
    loop {
        match queue.head() {
            Some(record) => match db.write(&record).await {
                Ok(()) => {
                    queue.pop_head();
                    debug!(kind = record.kind(), "record persisted");
                }
                Err(e) => {
                    warn!(
                        kind = record.kind(),
                        error = %e,
                        "database write failed; record stays at queue head"
                    );
                    if shutdown.is_stopped() {
                        error!(
                            queued = queue.len(),
                            "shutting down with unpersisted records at queue head"
                        );
                        break;
                    }
                    tokio::select! {
                        _ = queue.signalled() => {}
                        _ = sleep(WRITE_RETRY_DELAY) => {}
                    }
                }
            },
            None => {
                if shutdown.is_stopped() {
                    break;
                }
                tokio::select! {
                    _ = queue.signalled() => {}
                    _ = sleep(IDLE_WAIT) => {}
                }
            }
        }
    }
    info!("persistence writer stopped");
}

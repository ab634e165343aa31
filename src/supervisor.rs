//! Market-hours supervision and cooperative shutdown.
//!
//! Two long-running loops: the realtime loop runs the aggregator inside
//! market hours, the backfill loop runs full daily passes while markets
//! are closed. One process-wide [`Shutdown`] flag stops everything; each
//! loop finishes its current iteration and releases sockets, shared
//! memory, and database handles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::{BrokerSession, SessionConfig};
use crate::calendar;
use crate::config::{AppConfig, BACKFILL_CLIENT_ID, REALTIME_CLIENT_ID};
use crate::daily::{DailyBackfillDriver, DailyConfig};
use crate::persist::{queue, Database, PersistQueue};
use crate::realtime::{AggregatorConfig, RealTimeAggregator};

/// Cooperative stop flag plus wakeup. Cheap to clone into every task;
/// all timed waits return promptly once stop is requested.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(watch::channel(false).0),
        }
    }

    pub fn request_stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `delay`, returning early (true) when stop was requested.
    pub async fn sleep_or_stop(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = sleep(delay) => false,
            _ = self.wait_stopped() => true,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Which halves of the service to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Realtime,
    Daily,
    Both,
}

pub struct Supervisor {
    cfg: AppConfig,
    db: Arc<Database>,
    queue: Arc<PersistQueue>,
    shutdown: Shutdown,
}

impl Supervisor {
    pub fn new(cfg: AppConfig, db: Arc<Database>) -> Self {
        Self {
            cfg,
            db,
            queue: Arc::new(PersistQueue::new()),
            shutdown: Shutdown::new(),
        }
    }

    /// Handle for the signal handler.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Run until stop is requested, then drain the persistence queue.
    pub async fn run(&self, mode: RunMode) -> Result<()> {
        info!(?mode, "supervisor starting");

        let writer = tokio::spawn(queue::run_writer(
            self.queue.clone(),
            self.db.clone(),
            self.shutdown.clone(),
        ));

        let mut loops = Vec::new();
        if matches!(mode, RunMode::Realtime | RunMode::Both) {
            loops.push(tokio::spawn(realtime_loop(
                self.cfg.clone(),
                self.queue.clone(),
                self.shutdown.clone(),
            )));
        }
        if matches!(mode, RunMode::Daily | RunMode::Both) {
            loops.push(tokio::spawn(backfill_loop(
                self.cfg.clone(),
                self.db.clone(),
                self.queue.clone(),
                self.shutdown.clone(),
            )));
        }

        for task in loops {
            let _ = task.await;
        }
        // Loops are done; the writer drains whatever is still queued.
        let _ = writer.await;

        info!("supervisor stopped");
        Ok(())
    }
}

/// Realtime half: wait for the open, aggregate until the close, repeat.
async fn realtime_loop(cfg: AppConfig, queue: Arc<PersistQueue>, shutdown: Shutdown) {
    info!(symbol = %cfg.realtime_symbol, "realtime supervisor loop started");
    while !shutdown.is_stopped() {
        let wait = calendar::seconds_until_open(Utc::now());
        if wait > 0 {
            // Re-check in bounded chunks so stop stays responsive.
            let chunk = wait.min(60) as u64;
            if shutdown.sleep_or_stop(Duration::from_secs(chunk)).await {
                break;
            }
            continue;
        }

        info!("market open; starting realtime aggregation");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session_cfg =
            SessionConfig::new(&cfg.gateway.host, cfg.gateway.port, REALTIME_CLIENT_ID);
        let session = BrokerSession::new(session_cfg, events_tx);
        if !session.connect(3, Duration::from_secs(2)).await {
            warn!("gateway connect failed; retrying shortly");
            if shutdown.sleep_or_stop(Duration::from_secs(30)).await {
                break;
            }
            continue;
        }
        session.start_flow_monitor(Duration::from_secs(5), Duration::from_secs(60));

        let aggregator = RealTimeAggregator::new(
            AggregatorConfig::for_symbol(&cfg.realtime_symbol),
            queue.clone(),
        );

        // Session-scoped stop: trips at market close or on global stop.
        let session_stop = Shutdown::new();
        let closer = {
            let session_stop = session_stop.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let secs = calendar::seconds_until_close(Utc::now());
                    if secs <= 0 {
                        break;
                    }
                    if shutdown
                        .sleep_or_stop(Duration::from_secs(secs.min(60) as u64))
                        .await
                    {
                        break;
                    }
                }
                session_stop.request_stop();
            })
        };

        if let Err(e) = aggregator.run(&session, events_rx, &session_stop).await {
            error!(error = %e, "realtime aggregator exited with error");
        }
        session_stop.request_stop();
        let _ = closer.await;
        session.disconnect().await;
        info!("realtime aggregation stopped for the session");
    }
    info!("realtime supervisor loop stopped");
}

/// Backfill half: one full pass per hour while markets are closed.
async fn backfill_loop(
    cfg: AppConfig,
    db: Arc<Database>,
    queue: Arc<PersistQueue>,
    shutdown: Shutdown,
) {
    info!(symbols = ?cfg.daily_symbols, "backfill supervisor loop started");
    while !shutdown.is_stopped() {
        if calendar::is_market_open(Utc::now()) {
            let secs = calendar::seconds_until_close(Utc::now()).max(60) as u64;
            if shutdown
                .sleep_or_stop(Duration::from_secs(secs.min(600)))
                .await
            {
                break;
            }
            continue;
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let session_cfg =
            SessionConfig::new(&cfg.gateway.host, cfg.gateway.port, BACKFILL_CLIENT_ID);
        let session = BrokerSession::new(session_cfg, events_tx);
        if session.connect(3, Duration::from_secs(2)).await {
            let mut driver = DailyBackfillDriver::new(
                DailyConfig::new(cfg.daily_symbols.clone(), cfg.incremental),
                db.clone(),
                queue.clone(),
            );
            if let Err(e) = driver.run_pass(&session, &mut events_rx, &shutdown).await {
                warn!(error = %e, "daily backfill pass failed");
            }
            session.disconnect().await;
        } else {
            warn!("gateway connect failed for backfill session");
        }

        if shutdown.sleep_or_stop(Duration::from_secs(3600)).await {
            break;
        }
    }
    info!("backfill supervisor loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_wakes_all_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_stopped());

        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_stopped().await;
            true
        });

        shutdown.request_stop();
        assert!(shutdown.is_stopped());
        assert!(tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn sleep_or_stop_returns_early_on_stop() {
        let shutdown = Shutdown::new();
        let sleeper = shutdown.clone();
        let handle =
            tokio::spawn(async move { sleeper.sleep_or_stop(Duration::from_secs(60)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request_stop();
        let stopped = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(stopped);
    }

    #[tokio::test]
    async fn sleep_or_stop_completes_when_not_stopped() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.sleep_or_stop(Duration::from_millis(5)).await);
    }
}

//! Broker gateway session.
//!
//! Owns the TCP socket, the reader pump, and the connect / reconnect /
//! backoff policy. Decoded callbacks are delivered in arrival order on an
//! unbounded channel; consumers re-issue their subscriptions when they see
//! [`SessionEvent::Reconnected`].
//!
//! State machine:
//! Disconnected -> Connecting -> Connected -> Running <-> Degraded
//! -> Closing -> Disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::protocol::{self, Contract, ErrorKind, GatewayEvent, GatewayRequest};

/// Session-level event stream delivered to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A decoded gateway callback, in arrival order.
    Gateway(GatewayEvent),
    /// The session re-established its socket; subscriptions must be
    /// re-issued by the consumer.
    Reconnected,
}

/// Lifecycle of one gateway session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Degraded,
    Closing,
}

/// Tunables for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i64,
    /// TCP dial bound.
    pub connect_timeout: Duration,
    /// Bound on waiting for the first NextValidId after Connect.
    pub first_id_timeout: Duration,
    /// First rate-limit backoff; doubles per hit.
    pub rate_limit_initial: Duration,
    /// Rate-limit backoff ceiling.
    pub rate_limit_cap: Duration,
    /// First reconnect delay; doubles per failed attempt.
    pub reconnect_initial: Duration,
    /// Reconnect delay ceiling.
    pub reconnect_cap: Duration,
}

impl SessionConfig {
    pub fn new(host: &str, port: u16, client_id: i64) -> Self {
        Self {
            host: host.to_string(),
            port,
            client_id,
            connect_timeout: Duration::from_secs(10),
            first_id_timeout: Duration::from_secs(30),
            rate_limit_initial: Duration::from_secs(1),
            rate_limit_cap: Duration::from_secs(300),
            reconnect_initial: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(300),
        }
    }
}

/// Session counters for monitoring. Relaxed ordering; these are
/// diagnostics, not control flow.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub connects_attempted: AtomicU64,
    pub connects_succeeded: AtomicU64,
    pub reconnections: AtomicU64,
    pub rate_limit_hits: AtomicU64,
    pub stale_data_events: AtomicU64,
    pub frames_decoded: AtomicU64,
    pub decode_failures: AtomicU64,
}

impl SessionMetrics {
    #[inline]
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// One-line summary for the session-closed log.
    pub fn summary(&self) -> String {
        format!(
            "connects={}/{} reconnects={} rate_limits={} stale={} frames={} decode_errors={}",
            self.connects_succeeded.load(Ordering::Relaxed),
            self.connects_attempted.load(Ordering::Relaxed),
            self.reconnections.load(Ordering::Relaxed),
            self.rate_limit_hits.load(Ordering::Relaxed),
            self.stale_data_events.load(Ordering::Relaxed),
            self.frames_decoded.load(Ordering::Relaxed),
            self.decode_failures.load(Ordering::Relaxed),
        )
    }
}

#[derive(Debug)]
struct RateGate {
    next_allowed: Option<Instant>,
    backoff: Duration,
}

struct Inner {
    cfg: SessionConfig,
    state: RwLock<SessionState>,
    stop_tx: watch::Sender<bool>,
    /// Socket writes go through here; this is the client lock.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Generation counter so a superseded pump cannot trigger reconnects.
    reader_gen: AtomicU64,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    next_id_tx: watch::Sender<Option<i64>>,
    rate: Mutex<RateGate>,
    /// Retryable in-flight requests by req_id, for rate-limit re-sends.
    pending: Mutex<HashMap<i64, GatewayRequest>>,
    reconnecting: AtomicBool,
    monitoring: AtomicBool,
    /// Arrival time of the last decoded frame, for staleness detection.
    last_event: Mutex<Instant>,
    metrics: SessionMetrics,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one gateway session. Cheap to clone.
#[derive(Clone)]
pub struct BrokerSession {
    inner: Arc<Inner>,
}

impl BrokerSession {
    pub fn new(cfg: SessionConfig, events_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (next_id_tx, _) = watch::channel(None);
        let rate = RateGate {
            next_allowed: None,
            backoff: cfg.rate_limit_initial,
        };
        Self {
            inner: Arc::new(Inner {
                cfg,
                state: RwLock::new(SessionState::Disconnected),
                stop_tx,
                writer: tokio::sync::Mutex::new(None),
                reader_gen: AtomicU64::new(0),
                events_tx,
                next_id_tx,
                rate: Mutex::new(rate),
                pending: Mutex::new(HashMap::new()),
                reconnecting: AtomicBool::new(false),
                monitoring: AtomicBool::new(false),
                last_event: Mutex::new(Instant::now()),
                metrics: SessionMetrics::default(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.inner.state.write();
        if *state != next {
            debug!(from = ?*state, to = ?next, client_id = self.inner.cfg.client_id, "session state");
            *state = next;
        }
    }

    fn is_stopped(&self) -> bool {
        *self.inner.stop_tx.borrow()
    }

    /// Establish the session: dial, announce the client id, pump callbacks,
    /// and wait for the first valid id. Returns false after `max_retries`
    /// failed attempts spaced `retry_delay` apart.
    pub async fn connect(&self, max_retries: u32, retry_delay: Duration) -> bool {
        for attempt in 1..=max_retries {
            if self.is_stopped() {
                break;
            }
            self.set_state(SessionState::Connecting);
            match self.establish().await {
                Ok(first_id) => {
                    self.set_state(SessionState::Running);
                    info!(
                        attempt,
                        first_id,
                        client_id = self.inner.cfg.client_id,
                        "gateway session running"
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        attempt,
                        max_retries,
                        error = %e,
                        "gateway connect attempt failed"
                    );
                    self.drop_socket().await;
                    if attempt < max_retries {
                        sleep(retry_delay).await;
                    }
                }
            }
        }
        self.set_state(SessionState::Disconnected);
        false
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.inner.metrics
    }

    /// One connect attempt: dial + Connect frame + first-id wait.
    async fn establish(&self) -> Result<i64> {
        SessionMetrics::bump(&self.inner.metrics.connects_attempted);
        let addr = (self.inner.cfg.host.clone(), self.inner.cfg.port);
        let stream = timeout(self.inner.cfg.connect_timeout, TcpStream::connect(addr))
            .await
            .context("gateway dial timed out")?
            .context("gateway dial failed")?;
        let (read_half, write_half) = stream.into_split();

        *self.inner.writer.lock().await = Some(write_half);
        self.inner.next_id_tx.send_replace(None);
        let gen = self.inner.reader_gen.fetch_add(1, Ordering::SeqCst) + 1;
        self.spawn_pump(read_half, gen);
        self.set_state(SessionState::Connected);

        self.send_raw(&GatewayRequest::Connect {
            client_id: self.inner.cfg.client_id,
        })
        .await?;

        let mut rx = self.inner.next_id_tx.subscribe();
        let id_ref = timeout(
            self.inner.cfg.first_id_timeout,
            rx.wait_for(|v| v.is_some()),
        )
        .await
        .context("timed out waiting for the first valid id")?
        .context("session closed while waiting for the first valid id")?;
        SessionMetrics::bump(&self.inner.metrics.connects_succeeded);
        *self.inner.last_event.lock() = Instant::now();
        Ok((*id_ref).unwrap_or(0))
    }

    /// Watch for stalled data flow while Running; a stretch of silence
    /// longer than `stale_after` forces a reconnect. One monitor per
    /// session.
    pub fn start_flow_monitor(&self, check_interval: Duration, stale_after: Duration) {
        if self.inner.monitoring.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                if session.sleep_or_stop(check_interval).await {
                    break;
                }
                if session.state() != SessionState::Running {
                    continue;
                }
                let silent_for = {
                    let last = session.inner.last_event.lock();
                    last.elapsed()
                };
                if silent_for > stale_after {
                    SessionMetrics::bump(&session.inner.metrics.stale_data_events);
                    warn!(
                        silent_secs = silent_for.as_secs_f64(),
                        "no gateway data; forcing reconnect"
                    );
                    session.set_state(SessionState::Degraded);
                    session.begin_reconnect();
                }
            }
            session.inner.monitoring.store(false, Ordering::SeqCst);
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Subscribe the L1 trade-tick stream.
    pub async fn request_l1(&self, req_id: i64, contract: &Contract) -> Result<()> {
        self.send(&GatewayRequest::MarketData {
            req_id,
            contract: contract.clone(),
        })
        .await
    }

    /// Subscribe the L2 depth stream.
    pub async fn request_l2(&self, req_id: i64, contract: &Contract, depth_rows: u32) -> Result<()> {
        self.send(&GatewayRequest::MarketDepth {
            req_id,
            contract: contract.clone(),
            rows: depth_rows,
            smart_depth: true,
        })
        .await
    }

    /// Request historical bars ending at `end_datetime`.
    #[allow(clippy::too_many_arguments)]
    pub async fn request_historical(
        &self,
        req_id: i64,
        contract: &Contract,
        end_datetime: &str,
        duration: &str,
        bar_size: &str,
        what_to_show: &str,
        use_rth: bool,
    ) -> Result<()> {
        self.send(&GatewayRequest::HistoricalData {
            req_id,
            contract: contract.clone(),
            end_datetime: end_datetime.to_string(),
            duration: duration.to_string(),
            bar_size: bar_size.to_string(),
            what_to_show: what_to_show.to_string(),
            use_rth,
            format_date: 1,
        })
        .await
    }

    pub async fn cancel(&self, req_id: i64) -> Result<()> {
        self.send(&GatewayRequest::Cancel { req_id }).await
    }

    /// Close the session: stop flag, notify waiters, close the socket,
    /// join every task.
    pub async fn disconnect(&self) {
        self.set_state(SessionState::Closing);
        self.inner.stop_tx.send_replace(true);
        self.drop_socket().await;

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.set_state(SessionState::Disconnected);
        info!(
            client_id = self.inner.cfg.client_id,
            stats = %self.inner.metrics.summary(),
            "gateway session closed"
        );
    }

    async fn drop_socket(&self) {
        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Send a request through the rate gate.
    async fn send(&self, request: &GatewayRequest) -> Result<()> {
        loop {
            let wait = {
                let gate = self.inner.rate.lock();
                let now = Instant::now();
                gate.next_allowed.filter(|t| *t > now).map(|t| t - now)
            };
            match wait {
                Some(delay) => sleep(delay).await,
                None => break,
            }
        }
        self.send_raw(request).await
    }

    async fn send_raw(&self, request: &GatewayRequest) -> Result<()> {
        let line = protocol::encode(request).context("failed to encode gateway request")?;
        {
            let mut guard = self.inner.writer.lock().await;
            let writer = guard
                .as_mut()
                .ok_or_else(|| anyhow!("gateway socket not connected"))?;
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }

        match request {
            GatewayRequest::MarketData { req_id, .. }
            | GatewayRequest::MarketDepth { req_id, .. }
            | GatewayRequest::HistoricalData { req_id, .. } => {
                self.inner.pending.lock().insert(*req_id, request.clone());
            }
            GatewayRequest::Cancel { req_id } => {
                self.inner.pending.lock().remove(req_id);
            }
            GatewayRequest::Connect { .. } => {}
        }
        Ok(())
    }

    fn spawn_pump(&self, read_half: OwnedReadHalf, gen: u64) {
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            let mut stop_rx = session.inner.stop_tx.subscribe();
            let mut lost = false;
            loop {
                tokio::select! {
                    _ = stop_rx.wait_for(|s| *s) => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if session.inner.reader_gen.load(Ordering::SeqCst) != gen {
                                break;
                            }
                            session.handle_line(&line);
                        }
                        Ok(None) => {
                            lost = true;
                            break;
                        }
                        Err(e) => {
                            debug!(error = %e, "gateway socket read error");
                            lost = true;
                            break;
                        }
                    },
                }
            }

            let current = session.inner.reader_gen.load(Ordering::SeqCst) == gen;
            if lost && current && !session.is_stopped() {
                warn!("gateway connection lost; scheduling reconnect");
                session.set_state(SessionState::Degraded);
                session.begin_reconnect();
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn handle_line(&self, line: &str) {
        *self.inner.last_event.lock() = Instant::now();
        let event = match protocol::decode_event(line) {
            Ok(event) => event,
            Err(e) => {
                SessionMetrics::bump(&self.inner.metrics.decode_failures);
                warn!(error = %e, "unrecognized gateway frame");
                return;
            }
        };
        SessionMetrics::bump(&self.inner.metrics.frames_decoded);

        match &event {
            GatewayEvent::NextValidId { id } => {
                debug!(id, "next valid id");
                self.inner.next_id_tx.send_replace(Some(*id));
            }
            GatewayEvent::Error { id, code, message } => {
                self.handle_gateway_error(*id, *code, message.as_str());
            }
            _ => {}
        }

        let _ = self.inner.events_tx.send(SessionEvent::Gateway(event));
    }

    fn handle_gateway_error(&self, id: i64, code: i32, msg: &str) {
        match ErrorKind::classify(code) {
            ErrorKind::ConnectionLost => {
                warn!(code, msg, "gateway reports connection lost");
                self.set_state(SessionState::Degraded);
                self.begin_reconnect();
            }
            ErrorKind::ConnectionRestored => {
                info!(code, msg, "gateway connection restored");
                if self.state() == SessionState::Degraded {
                    self.set_state(SessionState::Running);
                }
                self.reset_rate_gate();
            }
            ErrorKind::RateLimited => {
                self.schedule_rate_retry(id);
            }
            ErrorKind::Informational => debug!(code, msg, "gateway notice"),
            ErrorKind::Degraded => warn!(code, msg, "gateway data farm degraded"),
            kind if kind.abandons_request() => {
                error!(id, code, msg, "gateway rejected request; abandoning");
                self.inner.pending.lock().remove(&id);
            }
            ErrorKind::NotConnected => warn!(id, code, msg, "gateway not connected"),
            _ => warn!(id, code, msg, "gateway warning"),
        }
    }

    fn reset_rate_gate(&self) {
        let mut gate = self.inner.rate.lock();
        gate.next_allowed = None;
        gate.backoff = self.inner.cfg.rate_limit_initial;
    }

    /// Double the backoff, gate all sends, and re-send the rate-limited
    /// request after the wait.
    fn schedule_rate_retry(&self, req_id: i64) {
        SessionMetrics::bump(&self.inner.metrics.rate_limit_hits);
        let wait = {
            let mut gate = self.inner.rate.lock();
            let wait = gate.backoff;
            gate.next_allowed = Some(Instant::now() + wait);
            gate.backoff = (wait * 2).min(self.inner.cfg.rate_limit_cap);
            wait
        };
        warn!(req_id, delay_secs = wait.as_secs_f64(), "gateway rate limit; backing off");

        let Some(request) = self.inner.pending.lock().get(&req_id).cloned() else {
            return;
        };
        let session = self.clone();
        let handle = tokio::spawn(async move {
            if session.sleep_or_stop(wait).await {
                return;
            }
            if let Err(e) = session.send(&request).await {
                warn!(req_id, error = %e, "rate-limited request re-send failed");
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    fn begin_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.clone();
        let handle = tokio::spawn(async move {
            let mut delay = session.inner.cfg.reconnect_initial;
            loop {
                if session.is_stopped() {
                    break;
                }
                session.drop_socket().await;
                info!(delay_secs = delay.as_secs_f64(), "gateway reconnect attempt");
                match session.establish().await {
                    Ok(first_id) => {
                        session.set_state(SessionState::Running);
                        session.inner.pending.lock().clear();
                        session.reset_rate_gate();
                        SessionMetrics::bump(&session.inner.metrics.reconnections);
                        let _ = session.inner.events_tx.send(SessionEvent::Reconnected);
                        info!(first_id, "gateway session reconnected");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "gateway reconnect failed");
                        if session.sleep_or_stop(delay).await {
                            break;
                        }
                        delay = (delay * 2).min(session.inner.cfg.reconnect_cap);
                    }
                }
            }
            session.inner.reconnecting.store(false, Ordering::SeqCst);
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Sleep, returning early (true) when the session is stopping.
    async fn sleep_or_stop(&self, delay: Duration) -> bool {
        let mut stop_rx = self.inner.stop_tx.subscribe();
        tokio::select! {
            _ = sleep(delay) => false,
            _ = stop_rx.wait_for(|s| *s) => true,
        }
    }
}

//! One relay, one cycle: drain a time range through the window splitter
//!
//! A session opens a connection, then loops: pop a window, wait for the
//! rate limiter, query, hand parsed events to the sink in batches, and feed
//! the reply size back to the splitter. It ends `Drained` only when every
//! window was resolved and every batch was accepted by the sink; that is the
//! sole outcome that lets the coordinator advance the relay's watermark.
//!
//! Shutdown is checked between windows. Budget expiry and hard cancellation
//! interrupt the session at whatever it is awaiting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelaySettings;
use crate::error::{SinkError, TransportError};
use crate::rate_limit::RateLimiter;
use crate::sink::EventSink;
use crate::splitter::{Resolution, WindowSplitter};
use crate::transport::{QueryResponse, RelayConnection, RelayConnector, WindowQuery};
use crate::types::{Event, EventBatch, Relay, RelayId, Timestamp, Window};

/// Everything needed to run one session
#[derive(Debug, Clone)]
pub struct SessionJob {
    pub relay: Relay,
    /// Inclusive range to cover: `[watermark, cycle end]`
    pub target: Window,
    pub settings: RelaySettings,
}

/// Cancellation shared by every session of a cycle
#[derive(Debug, Clone, Default)]
pub struct SessionControl {
    /// Stop taking new windows; finish the current one
    pub shutdown: CancellationToken,
    /// Stop immediately
    pub cancel: CancellationToken,
}

impl SessionControl {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Why a session stopped before draining its range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    BudgetExceeded,
    /// Transport failed and retries ran out, or the failure was permanent
    Transport(String),
    Shutdown,
    Cancelled,
    /// Shutdown arrived before the session started
    NotStarted,
}

impl fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbandonReason::BudgetExceeded => write!(f, "budget exceeded"),
            AbandonReason::Transport(e) => write!(f, "transport: {}", e),
            AbandonReason::Shutdown => write!(f, "shutdown"),
            AbandonReason::Cancelled => write!(f, "cancelled"),
            AbandonReason::NotStarted => write!(f, "not started"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Every window resolved and every batch stored
    Drained,
    Abandoned(AbandonReason),
    /// The sink kept rejecting writes
    SinkFailed(String),
}

impl SessionOutcome {
    pub fn is_drained(&self) -> bool {
        matches!(self, SessionOutcome::Drained)
    }

    /// Short label used in summaries
    pub fn label(&self) -> &'static str {
        match self {
            SessionOutcome::Drained => "drained",
            SessionOutcome::Abandoned(_) => "abandoned",
            SessionOutcome::SinkFailed(_) => "sink-failed",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::Drained => write!(f, "drained"),
            SessionOutcome::Abandoned(reason) => write!(f, "abandoned ({})", reason),
            SessionOutcome::SinkFailed(e) => write!(f, "sink failed: {}", e),
        }
    }
}

/// Counters collected while a session runs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub connects: u32,
    pub queries: u32,
    pub retries: u32,
    pub windows_resolved: usize,
    pub windows_abandoned: usize,
    pub items_received: usize,
    pub malformed: usize,
    /// Events handed to the sink, duplicates included
    pub delivered: usize,
    /// Events the sink reported as new
    pub stored: usize,
    pub possibly_incomplete: Vec<Window>,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub relay: RelayId,
    pub target: Window,
    pub outcome: SessionOutcome,
    pub stats: SessionStats,
    pub elapsed: Duration,
}

impl SessionReport {
    /// Report for a session that never ran
    pub fn not_started(job: &SessionJob) -> Self {
        Self {
            relay: job.relay.id.clone(),
            target: job.target,
            outcome: SessionOutcome::Abandoned(AbandonReason::NotStarted),
            stats: SessionStats::default(),
            elapsed: Duration::ZERO,
        }
    }

    /// Watermark this session proved, if any
    pub fn confirmed_until(&self) -> Option<Timestamp> {
        self.outcome.is_drained().then_some(self.target.until)
    }
}

/// Harvests one relay for one cycle
pub struct PeerSession {
    relay: Relay,
    target: Window,
    settings: RelaySettings,
    connector: Arc<dyn RelayConnector>,
    sink: Arc<dyn EventSink>,
    splitter: WindowSplitter,
    limiter: RateLimiter,
    conn: Option<Box<dyn RelayConnection>>,
    batch: EventBatch,
    stats: SessionStats,
}

impl PeerSession {
    pub fn new(job: SessionJob, connector: Arc<dyn RelayConnector>, sink: Arc<dyn EventSink>) -> Self {
        let SessionJob {
            relay,
            target,
            settings,
        } = job;
        Self {
            splitter: WindowSplitter::new(target, settings.result_cap, settings.min_window_secs),
            limiter: RateLimiter::new(relay.id.clone(), settings.min_interval),
            batch: EventBatch::new(relay.id.clone()),
            relay,
            target,
            settings,
            connector,
            sink,
            conn: None,
            stats: SessionStats::default(),
        }
    }

    /// Run to completion, budget expiry or cancellation
    pub async fn run(mut self, control: &SessionControl) -> SessionReport {
        let started = Instant::now();
        let budget_deadline = started + self.settings.budget;
        debug!(relay = %self.relay.id, target = %self.target, "Session started");

        let outcome = tokio::select! {
            biased;
            _ = control.cancel.cancelled() => SessionOutcome::Abandoned(AbandonReason::Cancelled),
            _ = tokio::time::sleep_until(budget_deadline) => {
                SessionOutcome::Abandoned(AbandonReason::BudgetExceeded)
            }
            outcome = self.drain(&control.shutdown) => outcome,
        };

        if let SessionOutcome::Abandoned(reason) = &outcome {
            self.stats.windows_abandoned += self.splitter.abandon();
            // Whatever was parsed is still valid; keep it unless cancelled.
            if *reason != AbandonReason::Cancelled && !self.batch.is_empty() {
                let grace = self.settings.query_timeout;
                tokio::select! {
                    _ = control.cancel.cancelled() => {}
                    _ = tokio::time::sleep(grace) => {}
                    _ = self.flush_once() => {}
                }
            }
        }
        self.disconnect().await;
        self.stats.possibly_incomplete = self.splitter.possibly_incomplete().to_vec();

        let report = SessionReport {
            relay: self.relay.id.clone(),
            target: self.target,
            outcome,
            stats: self.stats,
            elapsed: started.elapsed(),
        };
        info!(
            relay = %report.relay,
            outcome = %report.outcome,
            queries = report.stats.queries,
            stored = report.stats.stored,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Session finished"
        );
        report
    }

    async fn drain(&mut self, shutdown: &CancellationToken) -> SessionOutcome {
        while let Some(window) = self.splitter.next_window() {
            if shutdown.is_cancelled() {
                self.stats.windows_abandoned += 1;
                return SessionOutcome::Abandoned(AbandonReason::Shutdown);
            }

            let response = match self.query_with_retry(window).await {
                Ok(r) => r,
                Err(e) => {
                    self.stats.windows_abandoned += 1;
                    warn!(relay = %self.relay.id, %window, error = %e, "Giving up on relay");
                    return SessionOutcome::Abandoned(AbandonReason::Transport(e.to_string()));
                }
            };

            let received = response.received();
            let oldest = match self.accept(window, response).await {
                Ok(oldest) => oldest,
                Err(e) => return SessionOutcome::SinkFailed(e.to_string()),
            };

            match self.splitter.resolve(window, received, oldest) {
                Resolution::Covered => {
                    debug!(relay = %self.relay.id, %window, received, "Window covered");
                }
                Resolution::Narrowed(next) => {
                    debug!(relay = %self.relay.id, %window, received, narrowed = next.len(), "Window saturated");
                }
                Resolution::AcceptedIncomplete(_) => {}
            }
            self.stats.windows_resolved = self.splitter.resolved();
        }

        match self.flush().await {
            Ok(()) => SessionOutcome::Drained,
            Err(e) => SessionOutcome::SinkFailed(e.to_string()),
        }
    }

    /// Parse a reply into the pending batch, returning the oldest in-window
    /// timestamp seen
    async fn accept(
        &mut self,
        window: Window,
        response: QueryResponse,
    ) -> Result<Option<Timestamp>, SinkError> {
        self.stats.items_received += response.received();
        self.stats.malformed += response.garbled;

        let mut oldest: Option<Timestamp> = None;
        for raw in &response.items {
            match Event::parse(raw) {
                Ok(event) => {
                    let ts = event.timestamp();
                    if window.contains(ts) {
                        oldest = Some(oldest.map_or(ts, |o| o.min(ts)));
                    }
                    self.batch.push(event);
                    if self.batch.len() >= self.settings.batch_size {
                        self.flush().await?;
                    }
                }
                Err(e) => {
                    self.stats.malformed += 1;
                    debug!(relay = %self.relay.id, error = %e, "Dropping malformed item");
                }
            }
        }
        Ok(oldest)
    }

    async fn query_with_retry(&mut self, window: Window) -> Result<QueryResponse, TransportError> {
        let query = WindowQuery {
            window,
            limit: self.settings.result_cap,
        };
        let policy = self.settings.query_retry;
        let attempt = policy
            .run_with(
                &mut *self,
                |session| Box::pin(session.query_attempt(query)),
                TransportError::is_transient,
            )
            .await;
        self.stats.retries += attempt.retries;
        attempt.result
    }

    /// One query. A failed exchange leaves the stream in an unknown state,
    /// so the connection is dropped and the next attempt reconnects.
    async fn query_attempt(&mut self, query: WindowQuery) -> Result<QueryResponse, TransportError> {
        let result = self.query_once(&query).await;
        if result.is_err() {
            self.disconnect().await;
        }
        result
    }

    async fn query_once(&mut self, query: &WindowQuery) -> Result<QueryResponse, TransportError> {
        if self.conn.is_none() {
            self.stats.connects += 1;
            let conn = self
                .connector
                .connect(&self.relay, self.settings.connect_timeout)
                .await?;
            self.conn = Some(conn);
        }
        self.limiter.wait().await;
        self.stats.queries += 1;
        match self.conn.as_mut() {
            Some(conn) => conn.query(query, self.settings.query_timeout).await,
            None => Err(TransportError::Reset("connection lost".into())),
        }
    }

    /// Hand the pending batch to the sink, retrying transient failures
    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let mut batch = self.batch.take();
        batch.observed_at = Timestamp::now();
        let sink = &self.sink;
        let batch_ref = &batch;
        let attempt = self
            .settings
            .sink_retry
            .run(
                || async move { sink.insert_batch(batch_ref).await },
                |e: &SinkError| !matches!(e, SinkError::Closed),
            )
            .await;
        match attempt.result {
            Ok(stored) => {
                self.stats.delivered += batch.len();
                self.stats.stored += stored;
                Ok(())
            }
            Err(e) => {
                warn!(relay = %self.relay.id, events = batch.len(), retries = attempt.retries, error = %e, "Sink rejected batch");
                Err(e)
            }
        }
    }

    /// Single attempt used when the session is already being abandoned
    async fn flush_once(&mut self) {
        let batch = self.batch.take();
        match self.sink.insert_batch(&batch).await {
            Ok(stored) => {
                self.stats.delivered += batch.len();
                self.stats.stored += stored;
            }
            Err(e) => {
                debug!(relay = %self.relay.id, error = %e, "Dropping partial batch of abandoned session");
            }
        }
    }

    async fn disconnect(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }
}

//! Cycle scheduling, watermark commits and shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SyncCoordinator                                                │
//! │  ├── directory: RelayDirectory     snapshot of relays per cycle │
//! │  ├── watermarks: WatermarkStore    start of each relay's range  │
//! │  ├── Distributor                                                │
//! │  │   └── worker × N ── SessionPool ── PeerSession × M           │
//! │  ├── reports: mpsc<SessionReport>  drained ⇒ watermark commit   │
//! │  └── event_tx: broadcast<SyncEvent>                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A watermark only moves after the session for that relay reported it
//! drained its whole range and the sink accepted every batch. Everything
//! else (budget, deadline, shutdown, transport or sink failure) leaves it
//! where it was, so the next cycle re-covers the same span.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::distributor::Distributor;
use super::events::{CycleState, SyncEvent};
use super::session::{SessionControl, SessionJob, SessionReport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::sink::{RelayDirectory, SinkFactory, WatermarkStore};
use crate::transport::RelayConnector;
use crate::types::{CycleId, Relay, RelayId, Timestamp, Window};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of one cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: CycleId,
    pub started_at: Timestamp,
    /// Upper bound of every session's range
    pub cycle_end: Timestamp,
    pub state: CycleState,
    pub sessions: Vec<SessionReport>,
    /// Watermarks committed by this cycle
    pub committed: BTreeMap<RelayId, Timestamp>,
    pub elapsed: Duration,
}

impl CycleReport {
    pub fn drained(&self) -> usize {
        self.sessions.iter().filter(|s| s.outcome.is_drained()).count()
    }

    /// Relays whose watermark did not move
    pub fn incomplete(&self) -> Vec<&SessionReport> {
        self.sessions.iter().filter(|s| !s.outcome.is_drained()).collect()
    }

    pub fn stored(&self) -> usize {
        self.sessions.iter().map(|s| s.stats.stored).sum()
    }

    pub fn session(&self, relay: &RelayId) -> Option<&SessionReport> {
        self.sessions.iter().find(|s| &s.relay == relay)
    }
}

/// Runs harvesting cycles over every eligible relay
///
/// # Example
///
/// ```ignore
/// let coordinator = SyncCoordinator::new(config, directory, watermarks, sinks, connector)?;
/// let mut events = coordinator.subscribe();
///
/// let stop = coordinator.shutdown_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     stop.cancel();
/// });
///
/// coordinator.run().await?;
/// ```
pub struct SyncCoordinator {
    config: SyncConfig,
    directory: Arc<dyn RelayDirectory>,
    watermarks: Arc<dyn WatermarkStore>,
    sinks: Arc<dyn SinkFactory>,
    connector: Arc<dyn RelayConnector>,
    state: RwLock<CycleState>,
    event_tx: broadcast::Sender<SyncEvent>,
    shutdown: CancellationToken,
}

impl SyncCoordinator {
    /// Create a coordinator; fails if the configuration is invalid
    pub fn new(
        config: SyncConfig,
        directory: Arc<dyn RelayDirectory>,
        watermarks: Arc<dyn WatermarkStore>,
        sinks: Arc<dyn SinkFactory>,
        connector: Arc<dyn RelayConnector>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            config,
            directory,
            watermarks,
            sinks,
            connector,
            state: RwLock::new(CycleState::Idle),
            event_tx,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self) -> CycleState {
        *self.state.read()
    }

    /// Token that stops the coordinator when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask running sessions to stop after their current window
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    fn set_state(&self, state: CycleState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            debug!(from = %previous, to = %state, "State changed");
            let _ = self.event_tx.send(SyncEvent::StateChanged { state });
        }
    }

    /// Run cycles until shutdown
    ///
    /// A cycle that cannot start is logged and retried at the next interval.
    pub async fn run(&self) -> SyncResult<()> {
        info!(
            interval_ms = self.config.cycle_interval_ms,
            workers = self.config.workers,
            sessions_per_worker = self.config.sessions_per_worker,
            "Coordinator running"
        );
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let next = Instant::now() + self.config.cycle_interval();

            match self.run_cycle().await {
                Ok(report) if report.state == CycleState::Stopped => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Cycle failed to start");
                    let _ = self.event_tx.send(SyncEvent::CycleFailed {
                        message: e.to_string(),
                    });
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep_until(next) => {}
            }
        }
        self.set_state(CycleState::Stopped);
        info!("Coordinator stopped");
        Ok(())
    }

    /// Run a single cycle to completion
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        {
            let mut state = self.state.write();
            match *state {
                CycleState::Idle => *state = CycleState::Running,
                CycleState::Stopped | CycleState::Stopping => {
                    return Err(SyncError::InvalidOperation("coordinator is stopped".into()))
                }
                other => {
                    return Err(SyncError::InvalidOperation(format!(
                        "cannot start a cycle while {}",
                        other
                    )))
                }
            }
        }
        let _ = self.event_tx.send(SyncEvent::StateChanged {
            state: CycleState::Running,
        });

        let cycle = CycleId::new();
        let span = tracing::info_span!("cycle", %cycle);
        let jobs = match self.plan(cycle).instrument(span.clone()).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.set_state(CycleState::Idle);
                return Err(e);
            }
        };

        let report = self.execute(cycle, jobs).instrument(span).await;

        let _ = self.event_tx.send(SyncEvent::CycleFinished {
            cycle,
            state: report.state,
        });
        if report.state != CycleState::Stopped {
            self.set_state(CycleState::Idle);
        }
        Ok(report)
    }

    /// Snapshot the directory and compute each relay's range
    async fn plan(&self, cycle: CycleId) -> SyncResult<Vec<SessionJob>> {
        let relays = self.load_relays().await?;

        let now = Timestamp::now();
        let default_since = now.saturating_sub(self.config.default_lookback());
        let mut jobs = Vec::with_capacity(relays.len());
        for (relay, watermark) in relays {
            let since = watermark.unwrap_or(default_since);
            let target = Window::new(since.min(now), now);
            jobs.push(SessionJob {
                settings: self.config.relay_settings(&relay),
                relay,
                target,
            });
        }

        info!(relays = jobs.len(), cycle_end = %now, "Cycle planned");
        let _ = self.event_tx.send(SyncEvent::CycleStarted {
            cycle,
            relays: jobs.len(),
        });
        Ok(jobs)
    }

    async fn execute(&self, cycle: CycleId, jobs: Vec<SessionJob>) -> CycleReport {
        let started = Instant::now();
        let started_at = Timestamp::now();
        let cycle_end = jobs.first().map(|j| j.target.until).unwrap_or(started_at);
        let expected = jobs.len();

        let control = SessionControl {
            shutdown: self.shutdown.child_token(),
            cancel: CancellationToken::new(),
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        let workers = Distributor::from_config(&self.config).dispatch(
            jobs,
            self.connector.clone(),
            self.sinks.clone(),
            control.clone(),
            tx,
        );

        let deadline = started + self.config.cycle_deadline();
        let mut grace_deadline: Option<Instant> = None;
        let mut deadline_hit = false;
        let mut sessions = Vec::with_capacity(expected);
        let mut committed = BTreeMap::new();

        loop {
            tokio::select! {
                report = rx.recv() => match report {
                    Some(report) => {
                        if let Some(until) = self.commit(&report).await {
                            committed.insert(report.relay.clone(), until);
                        }
                        let _ = self.event_tx.send(SyncEvent::SessionFinished {
                            cycle,
                            relay: report.relay.clone(),
                            outcome: report.outcome.clone(),
                        });
                        sessions.push(report);
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !deadline_hit => {
                    deadline_hit = true;
                    warn!(
                        finished = sessions.len(),
                        expected,
                        "Cycle deadline reached; cancelling remaining sessions"
                    );
                    control.cancel.cancel();
                }
                _ = self.shutdown.cancelled(), if grace_deadline.is_none() => {
                    self.set_state(CycleState::Stopping);
                    grace_deadline = Some(Instant::now() + self.config.shutdown_grace());
                }
                _ = sleep_until_opt(grace_deadline), if grace_deadline.is_some() && !control.cancel.is_cancelled() => {
                    warn!("Shutdown grace expired; cancelling sessions");
                    control.cancel.cancel();
                }
            }
        }

        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Worker task failed");
            }
        }

        let state = if grace_deadline.is_some() {
            CycleState::Stopped
        } else if deadline_hit || sessions.len() < expected {
            CycleState::Partial
        } else {
            CycleState::Completed
        };
        self.set_state(state);

        let report = CycleReport {
            cycle,
            started_at,
            cycle_end,
            state,
            sessions,
            committed,
            elapsed: started.elapsed(),
        };
        info!(
            state = %report.state,
            relays = expected,
            drained = report.drained(),
            stored = report.stored(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Cycle finished"
        );
        report
    }

    /// Eligible relays with their stored watermarks
    ///
    /// Directory and watermark stores are synchronous, so they are read on
    /// the blocking pool.
    async fn load_relays(&self) -> SyncResult<Vec<(Relay, Option<Timestamp>)>> {
        let directory = self.directory.clone();
        let watermarks = self.watermarks.clone();
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> SyncResult<Vec<(Relay, Option<Timestamp>)>> {
            let relays = directory.list_eligible()?;
            config.validate_relays(&relays)?;
            relays
                .into_iter()
                .map(|relay| -> SyncResult<(Relay, Option<Timestamp>)> {
                    let watermark = watermarks.get(&relay.id)?;
                    Ok((relay, watermark))
                })
                .collect()
        })
        .await
        .map_err(|e| SyncError::Directory(format!("planning task failed: {}", e)))?
    }

    /// Advance the relay's watermark if its session proved coverage
    async fn commit(&self, report: &SessionReport) -> Option<Timestamp> {
        let until = report.confirmed_until()?;
        let watermarks = self.watermarks.clone();
        let relay = report.relay.clone();
        let written = tokio::task::spawn_blocking(move || watermarks.set(&relay, until))
            .await
            .map_err(|e| SyncError::Storage(format!("watermark task failed: {}", e)))
            .and_then(|r| r);
        match written {
            Ok(()) => {
                debug!(relay = %report.relay, %until, "Watermark committed");
                let _ = self.event_tx.send(SyncEvent::WatermarkCommitted {
                    relay: report.relay.clone(),
                    until,
                });
                Some(until)
            }
            Err(e) => {
                error!(relay = %report.relay, error = %e, "Failed to commit watermark");
                None
            }
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

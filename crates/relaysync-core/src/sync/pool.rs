//! Bounded set of concurrent sessions inside one worker
//!
//! Every job becomes a task, but a task only opens its connection after it
//! holds one of `limit` semaphore permits, so a worker never has more than
//! `limit` relay connections open. Starts are staggered by a random delay to
//! spread connection setup.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn, Instrument};

use super::session::{PeerSession, SessionControl, SessionJob, SessionReport};
use crate::sink::EventSink;
use crate::transport::RelayConnector;

/// Totals for one worker's share of a cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub worker: usize,
    pub started: usize,
    pub not_started: usize,
    /// Session tasks that panicked
    pub crashed: usize,
}

pub struct SessionPool {
    worker: usize,
    limit: usize,
    stagger: (Duration, Duration),
}

impl SessionPool {
    pub fn new(worker: usize, limit: usize, stagger: (Duration, Duration)) -> Self {
        let (lo, hi) = stagger;
        Self {
            worker,
            limit: limit.max(1),
            stagger: (lo.min(hi), hi.max(lo)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn stagger_delay(&self) -> Duration {
        let (lo, hi) = self.stagger;
        if hi <= lo {
            return lo;
        }
        let ms = rand::rng().random_range(lo.as_millis() as u64..=hi.as_millis() as u64);
        Duration::from_millis(ms)
    }

    /// Run every job, sending one report per job to `reports`
    ///
    /// Returns once all sessions have finished. The sink is not closed here;
    /// the caller owns it.
    pub async fn run(
        &self,
        jobs: Vec<SessionJob>,
        connector: Arc<dyn RelayConnector>,
        sink: Arc<dyn EventSink>,
        control: SessionControl,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> PoolSummary {
        let permits = Arc::new(Semaphore::new(self.limit));
        let mut tasks = JoinSet::new();
        let mut summary = PoolSummary {
            worker: self.worker,
            ..PoolSummary::default()
        };

        for job in jobs {
            let delay = self.stagger_delay();
            let permits = permits.clone();
            let connector = connector.clone();
            let sink = sink.clone();
            let control = control.clone();
            let reports = reports.clone();
            let span = tracing::info_span!("relay_session", worker = self.worker, relay = %job.relay.id);

            tasks.spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = control.shutdown.cancelled() => None,
                        _ = control.cancel.cancelled() => None,
                        permit = async {
                            tokio::time::sleep(delay).await;
                            permits.acquire_owned().await.ok()
                        } => permit,
                    };

                    // Shutdown may land while the permit is being granted.
                    let Some(_permit) = permit.filter(|_| !control.shutdown.is_cancelled()) else {
                        debug!("Shutdown before session start");
                        let _ = reports.send(SessionReport::not_started(&job));
                        return false;
                    };

                    let report = PeerSession::new(job, connector, sink).run(&control).await;
                    let _ = reports.send(report);
                    true
                }
                .instrument(span),
            );
        }
        drop(reports);

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => summary.started += 1,
                Ok(false) => summary.not_started += 1,
                Err(e) => {
                    summary.crashed += 1;
                    warn!(worker = self.worker, error = %e, "Session task failed");
                }
            }
        }
        summary
    }
}

//! Shards a cycle's sessions across workers
//!
//! Each worker is an independent task with its own sink handle and its own
//! `SessionPool`. Workers share nothing but the report channel and the
//! cycle's cancellation tokens, so a slow or failing relay only occupies a
//! slot in one worker's pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info_span, Instrument};

use super::pool::{PoolSummary, SessionPool};
use super::session::{SessionControl, SessionJob, SessionReport};
use crate::config::SyncConfig;
use crate::sink::SinkFactory;
use crate::transport::RelayConnector;

pub struct Distributor {
    workers: usize,
    sessions_per_worker: usize,
    stagger: (Duration, Duration),
}

impl Distributor {
    pub fn new(workers: usize, sessions_per_worker: usize, stagger: (Duration, Duration)) -> Self {
        Self {
            workers: workers.max(1),
            sessions_per_worker: sessions_per_worker.max(1),
            stagger,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.workers,
            config.sessions_per_worker,
            config.stagger_range(),
        )
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Round-robin jobs into at most `workers` non-empty shards
    pub fn shard(&self, jobs: Vec<SessionJob>) -> Vec<Vec<SessionJob>> {
        let mut shards: Vec<Vec<SessionJob>> = (0..self.workers).map(|_| Vec::new()).collect();
        for (i, job) in jobs.into_iter().enumerate() {
            shards[i % self.workers].push(job);
        }
        shards.retain(|s| !s.is_empty());
        shards
    }

    /// Start one worker per shard
    ///
    /// A worker whose sink cannot be opened reports every job in its shard
    /// as not started.
    pub fn dispatch(
        &self,
        jobs: Vec<SessionJob>,
        connector: Arc<dyn RelayConnector>,
        sinks: Arc<dyn SinkFactory>,
        control: SessionControl,
        reports: mpsc::UnboundedSender<SessionReport>,
    ) -> Vec<JoinHandle<PoolSummary>> {
        self.shard(jobs)
            .into_iter()
            .enumerate()
            .map(|(worker, shard)| {
                let pool = SessionPool::new(worker, self.sessions_per_worker, self.stagger);
                let connector = connector.clone();
                let sinks = sinks.clone();
                let control = control.clone();
                let reports = reports.clone();
                let span = info_span!("worker", worker);

                tokio::spawn(
                    async move {
                        debug!(sessions = shard.len(), "Worker started");
                        let sink = match sinks.open(worker) {
                            Ok(sink) => sink,
                            Err(e) => {
                                error!(error = %e, "Failed to open sink");
                                let not_started = shard.len();
                                for job in &shard {
                                    let _ = reports.send(SessionReport::not_started(job));
                                }
                                return PoolSummary {
                                    worker,
                                    not_started,
                                    ..PoolSummary::default()
                                };
                            }
                        };

                        let summary = pool
                            .run(shard, connector, sink.clone(), control, reports)
                            .await;
                        sink.close().await;
                        debug!(?summary, "Worker finished");
                        summary
                    }
                    .instrument(span),
                )
            })
            .collect()
    }
}

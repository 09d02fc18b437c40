//! In-memory implementations of every engine seam
//!
//! `MemoryConnector` simulates relays that hold a fixed event set and
//! truncate replies at their result cap, newest first, the way real relays
//! do. It can also hang, fail, or send garbage, and it records every query
//! and the number of simultaneously open connections so tests can assert on
//! completeness, pacing and concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::{SinkError, SyncError, SyncResult, TransportError};
use crate::sink::{EventSink, RelayDirectory, SinkFactory, WatermarkStore};
use crate::transport::{QueryResponse, RelayConnection, RelayConnector, WindowQuery};
use crate::types::{Event, EventBatch, Relay, RelayId, Timestamp, Window};

// ═══════════════════════════════════════════════════════════════════════════
// Sink
// ═══════════════════════════════════════════════════════════════════════════

/// Idempotent sink that remembers event ids
#[derive(Default)]
pub struct MemorySink {
    ids: Mutex<HashSet<String>>,
    calls: AtomicUsize,
    delivered: AtomicUsize,
    failures_left: AtomicUsize,
    fail_always: Mutex<bool>,
    closed: AtomicUsize,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` writes
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn fail_always(&self, on: bool) {
        *self.fail_always.lock() = on;
    }

    /// Distinct ids stored so far
    pub fn ids(&self) -> HashSet<String> {
        self.ids.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.lock().is_empty()
    }

    /// Number of insert_batch calls, successful or not
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Events handed over, duplicates included
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSink for MemorySink {
    async fn insert_batch(&self, batch: &EventBatch) -> Result<usize, SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if *self.fail_always.lock() {
            return Err(SinkError::Write("sink unavailable".into()));
        }
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SinkError::Write("injected failure".into()));
        }
        self.delivered.fetch_add(batch.len(), Ordering::SeqCst);
        let mut ids = self.ids.lock();
        Ok(batch
            .events
            .iter()
            .filter(|e| ids.insert(e.id.clone()))
            .count())
    }

    async fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Factory handing every worker the same memory sink
pub struct MemorySinkFactory {
    sink: Arc<MemorySink>,
    opened: AtomicUsize,
}

impl MemorySinkFactory {
    pub fn new(sink: Arc<MemorySink>) -> Self {
        Self {
            sink,
            opened: AtomicUsize::new(0),
        }
    }

    /// Handles opened so far (one per worker per cycle)
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, _worker: usize) -> SyncResult<Arc<dyn EventSink>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(self.sink.clone())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Watermarks and directory
// ═══════════════════════════════════════════════════════════════════════════

/// Monotonic in-memory watermark store
#[derive(Default)]
pub struct MemoryWatermarks {
    marks: Mutex<HashMap<RelayId, Timestamp>>,
}

impl MemoryWatermarks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl WatermarkStore for MemoryWatermarks {
    fn get(&self, relay: &RelayId) -> SyncResult<Option<Timestamp>> {
        Ok(self.marks.lock().get(relay).copied())
    }

    fn set(&self, relay: &RelayId, until: Timestamp) -> SyncResult<()> {
        let mut marks = self.marks.lock();
        let entry = marks.entry(relay.clone()).or_insert(until);
        if until > *entry {
            *entry = until;
        }
        Ok(())
    }

    fn list(&self) -> SyncResult<Vec<(RelayId, Timestamp)>> {
        let mut out: Vec<_> = self
            .marks
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        out.sort();
        Ok(out)
    }
}

/// Fixed relay list
#[derive(Default)]
pub struct MemoryDirectory {
    relays: Mutex<Vec<Relay>>,
    unreadable: Mutex<bool>,
}

impl MemoryDirectory {
    pub fn new(relays: Vec<Relay>) -> Arc<Self> {
        Arc::new(Self {
            relays: Mutex::new(relays),
            unreadable: Mutex::new(false),
        })
    }

    /// Make `list_eligible` fail, as an unreachable directory would
    pub fn set_unreadable(&self, on: bool) {
        *self.unreadable.lock() = on;
    }

    pub fn replace(&self, relays: Vec<Relay>) {
        *self.relays.lock() = relays;
    }
}

impl RelayDirectory for MemoryDirectory {
    fn list_eligible(&self) -> SyncResult<Vec<Relay>> {
        if *self.unreadable.lock() {
            return Err(SyncError::Directory("directory unreadable".into()));
        }
        Ok(self
            .relays
            .lock()
            .iter()
            .filter(|r| r.is_enabled())
            .cloned()
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Relays
// ═══════════════════════════════════════════════════════════════════════════

/// Behaviour of one simulated relay
#[derive(Debug, Clone, Default)]
pub struct MemoryRelay {
    events: Vec<Event>,
    /// The relay's own cap, applied on top of the requested limit
    cap: Option<usize>,
    hang: bool,
    connect_failures: usize,
    query_failures: usize,
    garbage_per_query: usize,
    latency: Duration,
}

impl MemoryRelay {
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn with_cap(mut self, cap: usize) -> Self {
        self.cap = Some(cap);
        self
    }

    /// Accept connections but never answer queries
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Refuse the first `n` connection attempts
    pub fn failing_connects(mut self, n: usize) -> Self {
        self.connect_failures = n;
        self
    }

    /// Reset the first `n` queries
    pub fn failing_queries(mut self, n: usize) -> Self {
        self.query_failures = n;
        self
    }

    /// Prepend `n` malformed payloads to every reply
    pub fn with_garbage(mut self, n: usize) -> Self {
        self.garbage_per_query = n;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn answer(&self, query: &WindowQuery) -> QueryResponse {
        let limit = self.cap.map_or(query.limit, |c| c.min(query.limit));
        let mut matching: Vec<&Event> = self
            .events
            .iter()
            .filter(|e| query.window.contains(e.timestamp()))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut items: Vec<serde_json::Value> = (0..self.garbage_per_query)
            .map(|i| serde_json::json!({ "garbage": i }))
            .collect();
        let room = limit.saturating_sub(items.len());
        items.extend(matching.into_iter().take(room).map(Event::to_value));
        items.truncate(limit);

        QueryResponse {
            items,
            garbled: 0,
            exhausted: true,
        }
    }
}

/// One observed query
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRecord {
    pub relay: RelayId,
    pub at: Instant,
    pub window: Window,
    pub limit: usize,
}

#[derive(Default)]
struct Shared {
    relays: Mutex<HashMap<RelayId, MemoryRelay>>,
    queries: Mutex<Vec<QueryRecord>>,
    connects: AtomicUsize,
    live: AtomicUsize,
    peak: AtomicUsize,
}

/// Connector over a set of simulated relays
#[derive(Clone, Default)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: impl Into<RelayId>, relay: MemoryRelay) {
        self.shared.relays.lock().insert(id.into(), relay);
    }

    /// Every query issued so far, in order
    pub fn queries(&self) -> Vec<QueryRecord> {
        self.shared.queries.lock().clone()
    }

    pub fn queries_for(&self, relay: &RelayId) -> Vec<QueryRecord> {
        self.shared
            .queries
            .lock()
            .iter()
            .filter(|q| &q.relay == relay)
            .cloned()
            .collect()
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Connections currently open
    pub fn live_connections(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Most connections ever open at once
    pub fn peak_connections(&self) -> usize {
        self.shared.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(
        &self,
        relay: &Relay,
        _timeout: Duration,
    ) -> Result<Box<dyn RelayConnection>, TransportError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let refused = {
            let mut relays = self.shared.relays.lock();
            match relays.get_mut(&relay.id) {
                None => true,
                Some(r) if r.connect_failures > 0 => {
                    r.connect_failures -= 1;
                    true
                }
                Some(_) => false,
            }
        };
        if refused {
            return Err(TransportError::Connect {
                addr: relay.id.to_string(),
                reason: "connection refused".into(),
            });
        }

        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            relay: relay.id.clone(),
            shared: self.shared.clone(),
            open: true,
        }))
    }
}

struct MemoryConnection {
    relay: RelayId,
    shared: Arc<Shared>,
    open: bool,
}

impl MemoryConnection {
    fn release(&mut self) {
        if self.open {
            self.open = false;
            self.shared.live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl RelayConnection for MemoryConnection {
    async fn query(
        &mut self,
        query: &WindowQuery,
        timeout: Duration,
    ) -> Result<QueryResponse, TransportError> {
        self.shared.queries.lock().push(QueryRecord {
            relay: self.relay.clone(),
            at: Instant::now(),
            window: query.window,
            limit: query.limit,
        });

        let behaviour = {
            let mut relays = self.shared.relays.lock();
            let relay = relays
                .get_mut(&self.relay)
                .ok_or_else(|| TransportError::Reset("relay vanished".into()))?;
            if relay.query_failures > 0 {
                relay.query_failures -= 1;
                return Err(TransportError::Reset("injected reset".into()));
            }
            relay.clone()
        };

        let work = async {
            if behaviour.hang {
                std::future::pending::<()>().await;
            }
            if !behaviour.latency.is_zero() {
                tokio::time::sleep(behaviour.latency).await;
            }
            behaviour.answer(query)
        };
        tokio::time::timeout(timeout, work)
            .await
            .map_err(|_| TransportError::Timeout("query"))
    }

    async fn close(&mut self) {
        self.release();
    }
}

/// `count` events spread one per second starting at `start`
pub fn spread_events(count: u64, start: u64) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event::build(
                "a1".repeat(32),
                start + i,
                1,
                vec![],
                format!("event {}", i),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_relay_truncates_newest_first() {
        let connector = MemoryConnector::new();
        connector.add("r:1", MemoryRelay::new(spread_events(20, 100)));
        let mut conn = connector
            .connect(&Relay::new("r:1"), Duration::from_secs(1))
            .await
            .unwrap();

        let query = WindowQuery {
            window: Window::new(100, 119),
            limit: 5,
        };
        let resp = conn.query(&query, Duration::from_secs(1)).await.unwrap();
        let stamps: Vec<u64> = resp
            .items
            .iter()
            .map(|v| v["created_at"].as_u64().unwrap())
            .collect();
        assert_eq!(stamps, vec![119, 118, 117, 116, 115]);
    }

    #[tokio::test]
    async fn test_live_connection_accounting() {
        let connector = MemoryConnector::new();
        connector.add("r:1", MemoryRelay::new(vec![]));
        let relay = Relay::new("r:1");

        let mut a = connector.connect(&relay, Duration::from_secs(1)).await.unwrap();
        let b = connector.connect(&relay, Duration::from_secs(1)).await.unwrap();
        assert_eq!(connector.live_connections(), 2);

        a.close().await;
        drop(b);
        assert_eq!(connector.live_connections(), 0);
        assert_eq!(connector.peak_connections(), 2);
    }

    #[tokio::test]
    async fn test_unknown_relay_refuses() {
        let connector = MemoryConnector::new();
        let err = connector
            .connect(&Relay::new("nowhere:1"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_memory_sink_counts_duplicates() {
        let sink = MemorySink::new();
        let mut batch = EventBatch::new(RelayId::new("r:1"));
        for e in spread_events(3, 0) {
            batch.push(e);
        }
        assert_eq!(sink.insert_batch(&batch).await.unwrap(), 3);
        assert_eq!(sink.insert_batch(&batch).await.unwrap(), 0);
        assert_eq!(sink.delivered(), 6);
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_memory_watermarks_are_monotonic() {
        let marks = MemoryWatermarks::new();
        let relay = RelayId::new("r:1");
        marks.set(&relay, Timestamp(10)).unwrap();
        marks.set(&relay, Timestamp(5)).unwrap();
        assert_eq!(marks.get(&relay).unwrap(), Some(Timestamp(10)));
    }
}

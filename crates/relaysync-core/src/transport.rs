//! Relay transport seam
//!
//! The engine depends on four operations only: connect, submit a bounded
//! range query, drain the reply up to the backlog-exhausted signal, close.
//! `RelayConnector` and `RelayConnection` capture exactly that so the
//! session logic runs unchanged over TCP, a proxy, or the in-memory relay
//! used in tests.
//!
//! ```text
//! client                         relay
//!   │ ["REQ", sub, {since,until,limit}] ─▶
//!   │ ◀─ ["EVENT", sub, {...}]   (0..=limit)
//!   │ ◀─ ["EOSE", sub]           backlog exhausted
//!   │ ["CLOSE", sub] ─▶
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::types::{Relay, Window};

pub mod frame;
pub mod socks;
pub mod tcp;

pub use frame::{ClientFrame, Filter, RelayFrame};
pub use tcp::TcpConnector;

/// One bounded range query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuery {
    pub window: Window,
    pub limit: usize,
}

impl WindowQuery {
    pub fn filter(&self) -> Filter {
        Filter {
            since: self.window.since.0,
            until: self.window.until.0,
            limit: self.limit,
        }
    }
}

/// Everything a relay sent for one query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResponse {
    /// Raw event payloads, unvalidated
    pub items: Vec<serde_json::Value>,
    /// Frames that could not be decoded at all
    pub garbled: usize,
    /// The relay sent its backlog-exhausted signal (false on early close)
    pub exhausted: bool,
}

impl QueryResponse {
    /// Items the relay spent its cap on, decodable or not
    pub fn received(&self) -> usize {
        self.items.len() + self.garbled
    }
}

/// Opens connections to relays
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(
        &self,
        relay: &Relay,
        timeout: Duration,
    ) -> Result<Box<dyn RelayConnection>, TransportError>;
}

/// An open connection to one relay
#[async_trait]
pub trait RelayConnection: Send {
    /// Submit `query` and collect the reply until the backlog is exhausted
    /// or the relay ends the stream
    async fn query(
        &mut self,
        query: &WindowQuery,
        timeout: Duration,
    ) -> Result<QueryResponse, TransportError>;

    async fn close(&mut self);
}

/// Split `host:port`
pub(crate) fn split_addr(addr: &str) -> Result<(&str, u16), TransportError> {
    let bad = || TransportError::Connect {
        addr: addr.to_string(),
        reason: "expected host:port".to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(bad)?;
    let port = port.parse::<u16>().map_err(|_| bad())?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(bad());
    }
    Ok((host, port))
}

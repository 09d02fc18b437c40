//! Line-framed relay transport over TCP, optionally through a SOCKS5 proxy

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, trace};

use super::frame::{ClientFrame, RelayFrame};
use super::{socks, split_addr, QueryResponse, RelayConnection, RelayConnector, WindowQuery};
use crate::error::TransportError;
use crate::types::{Relay, TransportClass};

/// Largest frame accepted from a relay
const MAX_FRAME_BYTES: usize = 1 << 20;

/// Dials relays over TCP
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    proxy_addr: Option<String>,
}

impl TcpConnector {
    pub fn new(proxy_addr: Option<String>) -> Self {
        Self { proxy_addr }
    }

    async fn open(&self, relay: &Relay) -> Result<TcpStream, TransportError> {
        let addr = relay.id.as_str();
        let connect_err = |reason: String| TransportError::Connect {
            addr: addr.to_string(),
            reason,
        };

        match relay.transport {
            TransportClass::Direct => TcpStream::connect(addr)
                .await
                .map_err(|e| connect_err(e.to_string())),
            TransportClass::Proxied => {
                let proxy = self
                    .proxy_addr
                    .as_deref()
                    .ok_or_else(|| TransportError::Proxy("no proxy configured".into()))?;
                let (host, port) = split_addr(addr)?;
                let mut stream = TcpStream::connect(proxy)
                    .await
                    .map_err(|e| TransportError::Proxy(format!("{}: {}", proxy, e)))?;
                socks::connect(&mut stream, host, port).await?;
                Ok(stream)
            }
        }
    }
}

#[async_trait]
impl RelayConnector for TcpConnector {
    async fn connect(
        &self,
        relay: &Relay,
        timeout: Duration,
    ) -> Result<Box<dyn RelayConnection>, TransportError> {
        let stream = tokio::time::timeout(timeout, self.open(relay))
            .await
            .map_err(|_| TransportError::Timeout("connect"))??;
        let _ = stream.set_nodelay(true);
        debug!(relay = %relay.id, transport = %relay.transport, "Relay connected");
        Ok(Box::new(TcpConnection {
            framed: Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_BYTES)),
            next_sub: 0,
            open: true,
        }))
    }
}

/// An open line-framed relay connection
pub struct TcpConnection {
    framed: Framed<TcpStream, LinesCodec>,
    next_sub: u64,
    open: bool,
}

impl TcpConnection {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        self.framed
            .send(frame.encode())
            .await
            .map_err(|e| TransportError::Reset(e.to_string()))
    }

    async fn collect(&mut self, sub_id: &str) -> Result<QueryResponse, TransportError> {
        let mut resp = QueryResponse::default();
        loop {
            let line = match self.framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(e)) => return Err(TransportError::Reset(e.to_string())),
                None => {
                    // Relay hung up before EOSE: what arrived is the answer.
                    self.open = false;
                    return Ok(resp);
                }
            };
            match RelayFrame::decode(&line) {
                Ok(RelayFrame::Event { sub_id: s, event }) if s == sub_id => {
                    resp.items.push(event)
                }
                Ok(RelayFrame::Eose { sub_id: s }) if s == sub_id => {
                    resp.exhausted = true;
                    return Ok(resp);
                }
                Ok(RelayFrame::Closed { sub_id: s, reason }) if s == sub_id => {
                    return Err(TransportError::Refused(reason));
                }
                Ok(RelayFrame::Notice(msg)) => debug!(notice = %msg, "Relay notice"),
                Ok(other) => trace!(?other, "Frame for another subscription"),
                Err(e) => {
                    trace!(error = %e, "Garbled frame");
                    resp.garbled += 1;
                }
            }
        }
    }
}

#[async_trait]
impl RelayConnection for TcpConnection {
    async fn query(
        &mut self,
        query: &WindowQuery,
        timeout: Duration,
    ) -> Result<QueryResponse, TransportError> {
        if !self.open {
            return Err(TransportError::Reset("connection closed by relay".into()));
        }
        self.next_sub += 1;
        let sub_id = format!("rs{}", self.next_sub);

        let exchange = async {
            self.send(ClientFrame::Req {
                sub_id: sub_id.clone(),
                filter: query.filter(),
            })
            .await?;
            let resp = self.collect(&sub_id).await?;
            if self.open {
                self.send(ClientFrame::Close {
                    sub_id: sub_id.clone(),
                })
                .await?;
            }
            Ok(resp)
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // A half-read reply leaves the stream unusable.
                self.open = false;
                Err(TransportError::Timeout("query"))
            }
        }
    }

    async fn close(&mut self) {
        self.open = false;
        let _ = SinkExt::<String>::close(&mut self.framed).await;
    }
}

//! Cycles over real sockets
//!
//! A local relay speaks the line-framed protocol and truncates every reply
//! at its own cap, newest first. The engine harvests it directly and through
//! a minimal SOCKS5 proxy.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relaysync_core::transport::frame::{ClientFrame, RelayFrame};
use relaysync_core::{
    CycleState, Event, Relay, RelayId, Storage, SyncConfig, SyncCoordinator, TcpConnector,
    Timestamp, TransportClass, WatermarkStore,
};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};

// ============================================================================
// Local relay and proxy
// ============================================================================

async fn serve_relay(events: Arc<Vec<Event>>, cap: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let events = events.clone();
            tokio::spawn(async move {
                let mut framed = Framed::new(stream, LinesCodec::new());
                while let Some(Ok(line)) = framed.next().await {
                    let Ok(ClientFrame::Req { sub_id, filter }) = ClientFrame::decode(&line) else {
                        continue;
                    };
                    let mut matching: Vec<&Event> = events
                        .iter()
                        .filter(|e| e.created_at >= filter.since && e.created_at <= filter.until)
                        .collect();
                    matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                    for e in matching.into_iter().take(filter.limit.min(cap)) {
                        let frame = RelayFrame::Event {
                            sub_id: sub_id.clone(),
                            event: e.to_value(),
                        };
                        if framed.send(frame.encode()).await.is_err() {
                            return;
                        }
                    }
                    if framed.send(RelayFrame::Eose { sub_id }.encode()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

/// No-auth SOCKS5 proxy that only supports CONNECT
async fn serve_proxy() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        while let Ok((mut client, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut greeting = [0u8; 2];
                client.read_exact(&mut greeting).await.unwrap();
                let mut methods = vec![0u8; greeting[1] as usize];
                client.read_exact(&mut methods).await.unwrap();
                client.write_all(&[5, 0]).await.unwrap();

                let mut head = [0u8; 4];
                client.read_exact(&mut head).await.unwrap();
                let host = match head[3] {
                    1 => {
                        let mut ip = [0u8; 4];
                        client.read_exact(&mut ip).await.unwrap();
                        std::net::Ipv4Addr::from(ip).to_string()
                    }
                    3 => {
                        let len = client.read_u8().await.unwrap();
                        let mut name = vec![0u8; len as usize];
                        client.read_exact(&mut name).await.unwrap();
                        String::from_utf8(name).unwrap()
                    }
                    other => panic!("unsupported address type {}", other),
                };
                let port = client.read_u16().await.unwrap();

                let mut upstream = TcpStream::connect((host.as_str(), port)).await.unwrap();
                client
                    .write_all(&[5, 0, 0, 1, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
            });
        }
    });
    addr
}

fn recent_events(n: u64) -> Vec<Event> {
    let start = Timestamp::now().0 - 3_000;
    (0..n)
        .map(|i| {
            Event::build(
                "e4".repeat(32),
                start + i * 7,
                1,
                vec![vec!["t".into(), "sync".into()]],
                format!("note {}", i),
            )
        })
        .collect()
}

fn config() -> SyncConfig {
    SyncConfig {
        workers: 2,
        sessions_per_worker: 2,
        stagger_min_ms: 0,
        stagger_max_ms: 10,
        min_request_interval_ms: 5,
        default_lookback_secs: 5_000,
        result_cap: 25,
        ..SyncConfig::default()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn test_direct_relays_drained_over_tcp() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(temp.path().join("relaysync.redb")).unwrap();
    let events = Arc::new(recent_events(150));
    let first = serve_relay(events.clone(), 20).await;
    let second = serve_relay(Arc::new(events[50..].to_vec()), 20).await;
    storage.save_relay(&Relay::new(first.clone()).with_result_cap(20)).unwrap();
    storage.save_relay(&Relay::new(second.clone()).with_result_cap(20)).unwrap();

    let store = Arc::new(storage.clone());
    let coordinator = SyncCoordinator::new(
        config(),
        store.clone(),
        store.clone(),
        store,
        Arc::new(TcpConnector::default()),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.state, CycleState::Completed);
    assert_eq!(report.drained(), 2);
    assert_eq!(storage.count_events().unwrap(), 150);
    for addr in [first, second] {
        assert_eq!(
            storage.get(&RelayId::new(addr)).unwrap(),
            Some(report.cycle_end)
        );
    }
}

#[tokio::test]
async fn test_proxied_relay_drained_through_socks() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(temp.path().join("relaysync.redb")).unwrap();
    let relay_addr = serve_relay(Arc::new(recent_events(60)), 15).await;
    let proxy_addr = serve_proxy().await;
    storage
        .save_relay(
            &Relay::new(relay_addr.clone())
                .with_transport(TransportClass::Proxied)
                .with_result_cap(15),
        )
        .unwrap();

    let config = SyncConfig {
        proxy_addr: Some(proxy_addr.clone()),
        ..config()
    };
    let store = Arc::new(storage.clone());
    let coordinator = SyncCoordinator::new(
        config,
        store.clone(),
        store.clone(),
        store,
        Arc::new(TcpConnector::new(Some(proxy_addr))),
    )
    .unwrap();
    let report = coordinator.run_cycle().await.unwrap();

    assert_eq!(report.drained(), 1);
    assert_eq!(storage.count_events().unwrap(), 60);
    let session = report.session(&RelayId::new(relay_addr)).unwrap();
    assert!(session.stats.queries >= 4);
}

#[tokio::test]
async fn test_unreachable_relay_keeps_watermark() {
    let temp = TempDir::new().unwrap();
    let storage = Storage::new(temp.path().join("relaysync.redb")).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap().to_string();
    drop(listener);
    storage.save_relay(&Relay::new(dead.clone())).unwrap();

    let mut config = config();
    config.query_retry.base_delay_ms = 10;
    let store = Arc::new(storage.clone());
    let coordinator = SyncCoordinator::new(
        config,
        store.clone(),
        store.clone(),
        store,
        Arc::new(TcpConnector::default()),
    )
    .unwrap();
    let report = tokio::time::timeout(Duration::from_secs(30), coordinator.run_cycle())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.drained(), 0);
    assert_eq!(storage.get(&RelayId::new(dead)).unwrap(), None);
}

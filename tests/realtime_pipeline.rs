//! Realtime pipeline wired end to end: fake gateway -> session ->
//! aggregator -> queue + shared-memory mirror.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stockflow_backend::broker::protocol::{GatewayEvent, GatewayRequest};
use stockflow_backend::broker::{BrokerSession, SessionConfig, SessionEvent};
use stockflow_backend::models::{CombinedBar, PersistRecord};
use stockflow_backend::persist::{shm, PersistQueue};
use stockflow_backend::realtime::{AggregatorConfig, RealTimeAggregator};

/// Gateway double for the realtime path: handshake, then one scripted
/// minute of L1 ticks and depth events once both subscriptions arrive.
async fn spawn_gateway() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();
        let mut l1_req = None;
        let mut l2_req = None;

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(request) = serde_json::from_str::<GatewayRequest>(line.trim()) else {
                continue;
            };
            match request {
                GatewayRequest::Connect { .. } => {
                    send(&mut write, &GatewayEvent::NextValidId { id: 1 }).await;
                }
                GatewayRequest::MarketData { req_id, .. } => l1_req = Some(req_id),
                GatewayRequest::MarketDepth { req_id, .. } => l2_req = Some(req_id),
                _ => {}
            }

            if l1_req.is_none() || l2_req.is_none() {
                continue;
            }
            if let (Some(l1), Some(l2)) = (l1_req.take(), l2_req.take()) {
                for (price, size) in [(100.0, 10.0), (101.5, 20.0), (99.5, 5.0), (100.5, 15.0)] {
                    send(
                        &mut write,
                        &GatewayEvent::TickPrice {
                            req_id: l1,
                            field: 4,
                            price,
                        },
                    )
                    .await;
                    send(
                        &mut write,
                        &GatewayEvent::TickSize {
                            req_id: l1,
                            field: 5,
                            size,
                        },
                    )
                    .await;
                }
                send(
                    &mut write,
                    &GatewayEvent::MarketDepth {
                        req_id: l2,
                        position: 0,
                        operation: 0,
                        side: 0,
                        price: 100.0,
                        size: 30.0,
                    },
                )
                .await;
                send(
                    &mut write,
                    &GatewayEvent::MarketDepth {
                        req_id: l2,
                        position: 1,
                        operation: 0,
                        side: 1,
                        price: 101.0,
                        size: 40.0,
                    },
                )
                .await;
            }
        }
    });
    port
}

async fn send(write: &mut tokio::net::tcp::OwnedWriteHalf, event: &GatewayEvent) {
    let line = serde_json::to_string(event).unwrap();
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
}

#[tokio::test]
async fn scripted_minute_flows_to_queue_and_mirror() {
    let port = spawn_gateway().await;
    let shm_dir = tempfile::tempdir().unwrap();

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = BrokerSession::new(SessionConfig::new("127.0.0.1", port, 0), events_tx);
    assert!(session.connect(3, Duration::from_millis(20)).await);

    let queue = Arc::new(PersistQueue::new());
    let mut cfg = AggregatorConfig::for_symbol("SPY");
    cfg.shm_dir = Some(shm_dir.path().to_path_buf());
    let aggregator = RealTimeAggregator::new(cfg, queue.clone());
    aggregator.open_shared_memory().unwrap();

    let contract = stockflow_backend::broker::Contract::stock("SPY");
    session.request_l1(1, &contract).await.unwrap();
    session.request_l2(2, &contract, 60).await.unwrap();

    // Pump the scripted events into the aggregator: 8 L1 + 2 L2 callbacks
    // (the NextValidId handshake also arrives on this channel).
    let mut market_events = 0;
    while market_events < 10 {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("gateway script stalled")
            .expect("session channel closed");
        if let SessionEvent::Gateway(ev) = event {
            match ev {
                GatewayEvent::TickPrice { .. }
                | GatewayEvent::TickSize { .. }
                | GatewayEvent::MarketDepth { .. } => {
                    aggregator.handle_gateway_event(&ev);
                    market_events += 1;
                }
                _ => {}
            }
        }
    }

    let bar = aggregator
        .finalize_minute("2024-03-15 12:01:00")
        .expect("complete minute must emit a bar");

    assert_eq!(bar.l1.open, 100.0);
    assert_eq!(bar.l1.high, 101.5);
    assert_eq!(bar.l1.low, 99.5);
    assert_eq!(bar.l1.close, 100.5);
    assert_eq!(bar.l1.volume, 50.0);
    assert!((bar.features.buy_sell_ratio - 0.75).abs() < 1e-9);
    assert!((bar.features.depth_change + 10.0).abs() < 1e-9);

    // Histogram volume conservation across buckets.
    assert!((bar.l2.total_volume() - 70.0).abs() < 1e-9);

    // Queue head is the bar; the mirror holds its JSON, parseable back to
    // identical numeric fields.
    match queue.head() {
        Some(PersistRecord::Minute(queued)) => assert_eq!(queued, bar),
        other => panic!("unexpected queue head: {other:?}"),
    }
    let payload = shm::read_payload(&shm_dir.path().join(shm::REGION_NAME)).unwrap();
    let mirrored: CombinedBar = serde_json::from_str(&payload).unwrap();
    assert_eq!(mirrored, bar);

    aggregator.close_shared_memory();
    session.disconnect().await;
}

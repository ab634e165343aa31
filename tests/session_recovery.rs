//! Mid-minute gateway loss: the session reconnects, subscriptions are
//! re-issued, and the rollover still emits a bar built from everything
//! received on both sides of the gap.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use stockflow_backend::broker::protocol::{GatewayEvent, GatewayRequest};
use stockflow_backend::broker::{BrokerSession, Contract, SessionConfig, SessionEvent};
use stockflow_backend::persist::PersistQueue;
use stockflow_backend::realtime::{AggregatorConfig, RealTimeAggregator};

async fn send(write: &mut OwnedWriteHalf, event: &GatewayEvent) {
    let line = serde_json::to_string(event).unwrap();
    let _ = write.write_all(line.as_bytes()).await;
    let _ = write.write_all(b"\n").await;
}

fn tick_pair(req_id: i64, price: f64, size: f64) -> [GatewayEvent; 2] {
    [
        GatewayEvent::TickPrice {
            req_id,
            field: 4,
            price,
        },
        GatewayEvent::TickSize {
            req_id,
            field: 5,
            size,
        },
    ]
}

/// Handshake one accepted connection and wait for both subscriptions.
async fn accept_and_subscribe(
    listener: &TcpListener,
) -> (
    BufReader<tokio::net::tcp::OwnedReadHalf>,
    OwnedWriteHalf,
    i64,
    i64,
) {
    let (stream, _) = listener.accept().await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let (mut l1, mut l2) = (None, None);
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        match serde_json::from_str::<GatewayRequest>(line.trim()).unwrap() {
            GatewayRequest::Connect { .. } => {
                send(&mut write, &GatewayEvent::NextValidId { id: 1 }).await;
            }
            GatewayRequest::MarketData { req_id, .. } => l1 = Some(req_id),
            GatewayRequest::MarketDepth { req_id, .. } => l2 = Some(req_id),
            _ => {}
        }
        if let (Some(l1), Some(l2)) = (l1, l2) {
            return (reader, write, l1, l2);
        }
    }
}

#[tokio::test]
async fn bar_survives_mid_minute_disconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = tokio::spawn(async move {
        // Session one: two trades, then a connection-lost error and a
        // dropped socket.
        let (_reader, mut write, l1, _l2) = accept_and_subscribe(&listener).await;
        for event in tick_pair(l1, 100.0, 10.0)
            .into_iter()
            .chain(tick_pair(l1, 101.5, 20.0))
        {
            send(&mut write, &event).await;
        }
        send(
            &mut write,
            &GatewayEvent::Error {
                id: 0,
                code: 1100,
                message: "Connectivity between IB and Trader Workstation has been lost".into(),
            },
        )
        .await;
        drop(write);
        drop(_reader);

        // Session two: the reconnected client re-subscribes and receives
        // the rest of the minute.
        let (_reader2, mut write2, l1, l2) = accept_and_subscribe(&listener).await;
        for event in tick_pair(l1, 99.5, 5.0)
            .into_iter()
            .chain(tick_pair(l1, 100.5, 15.0))
        {
            send(&mut write2, &event).await;
        }
        send(
            &mut write2,
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
            &mut write2,
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
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let mut session_cfg = SessionConfig::new("127.0.0.1", port, 0);
    session_cfg.reconnect_initial = Duration::from_millis(20);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let session = BrokerSession::new(session_cfg, events_tx);
    assert!(session.connect(3, Duration::from_millis(20)).await);

    let queue = Arc::new(PersistQueue::new());
    let shm_dir = tempfile::tempdir().unwrap();
    let mut cfg = AggregatorConfig::for_symbol("SPY");
    cfg.shm_dir = Some(shm_dir.path().to_path_buf());
    let aggregator = RealTimeAggregator::new(cfg, queue.clone());

    let contract = Contract::stock("SPY");
    session.request_l1(1, &contract).await.unwrap();
    session.request_l2(2, &contract, 60).await.unwrap();

    // Pump until the full scripted minute (8 ticks + 2 depth events) has
    // arrived, re-subscribing when the session reconnects.
    let mut market_events = 0;
    let mut saw_reconnect = false;
    while market_events < 10 {
        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .expect("gateway script stalled")
            .expect("session channel closed");
        match event {
            SessionEvent::Reconnected => {
                saw_reconnect = true;
                session.request_l1(1, &contract).await.unwrap();
                session.request_l2(2, &contract, 60).await.unwrap();
            }
            SessionEvent::Gateway(ev) => match ev {
                GatewayEvent::TickPrice { .. }
                | GatewayEvent::TickSize { .. }
                | GatewayEvent::MarketDepth { .. } => {
                    aggregator.handle_gateway_event(&ev);
                    market_events += 1;
                }
                _ => {}
            },
        }
    }
    assert!(saw_reconnect);

    // The rollover sees the union of both halves of the minute.
    let bar = aggregator
        .finalize_minute("2024-03-15 12:01:00")
        .expect("bar must be emitted from partial data");
    assert_eq!(bar.l1.open, 100.0);
    assert_eq!(bar.l1.high, 101.5);
    assert_eq!(bar.l1.low, 99.5);
    assert_eq!(bar.l1.close, 100.5);
    assert_eq!(bar.l1.volume, 50.0);
    assert!(bar.l1.is_valid());

    assert!(session.metrics().reconnections.load(std::sync::atomic::Ordering::Relaxed) >= 1);

    session.disconnect().await;
    server.await.unwrap();
}

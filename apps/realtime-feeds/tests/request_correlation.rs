//! Request Correlation Integration Tests
//!
//! Correlated requests, message fan-out and heartbeat liveness over a real
//! WebSocket connection.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;

use common::{MockServer, ServerConnection, fast_settings, wait_for_status};
use realtime_feeds::{
    ConnectionStatus, ControllerConfig, FeedClient, FeedKind, FeedSettings, MarketData,
    RequestError, RequestOptions, UnreadCount,
};

async fn connected(
    server: &mut MockServer,
    feed: FeedKind,
    settings: FeedSettings,
) -> (FeedClient, ServerConnection) {
    let config = ControllerConfig::new(feed, server.ws_url("/ws/test"), settings);
    let client = FeedClient::websocket(config, None);
    client.connect().await.unwrap();
    let conn = server.next_connection().await;
    (client, conn)
}

#[tokio::test]
async fn test_request_reply_also_reaches_handlers() {
    let mut server = MockServer::start().await;
    let account = FeedKind::Trading {
        account_id: "acct-1".to_string(),
    };
    let (client, mut conn) = connected(&mut server, account, fast_settings()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let exact = Arc::clone(&seen);
    let _orders = client.register_handler("orders", move |m| {
        exact.lock().unwrap().push(format!("orders:{}", m.id.clone().unwrap_or_default()));
    });
    let any = Arc::clone(&seen);
    let _all = client.register_handler("*", move |m| {
        any.lock().unwrap().push(format!("*:{}", m.msg_type));
    });

    let requester = client.clone();
    let request = tokio::spawn(async move {
        requester
            .send_request("get_orders", json!({"status": "open"}))
            .await
    });

    let frame = conn.recv().await;
    assert_eq!(frame["type"], "get_orders");
    assert_eq!(frame["data"]["status"], "open");
    assert!(frame["timestamp"].is_i64());
    let id = frame["id"].as_str().unwrap().to_string();

    conn.send(&json!({"type": "orders", "id": id, "data": [{"order_id": "o-1"}]}));

    let reply = request.await.unwrap().unwrap();
    assert_eq!(reply.payload[0]["order_id"], "o-1");
    assert_eq!(
        *seen.lock().unwrap(),
        vec![format!("orders:{id}"), "*:orders".to_string()]
    );

    client.disconnect().await;
}

#[tokio::test]
async fn test_request_times_out_with_caller_id() {
    let mut server = MockServer::start().await;
    let (client, mut conn) =
        connected(&mut server, FeedKind::Notifications, fast_settings()).await;

    let started = tokio::time::Instant::now();
    let err = client
        .send_request_with(
            "mark_read",
            json!({"id": "n-1"}),
            RequestOptions::default()
                .with_id("abc")
                .with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(matches!(err, RequestError::Timeout { ref id, .. } if id == "abc"));
    assert_eq!(conn.recv().await["id"], "abc");

    // A late reply is dispatched but settles nothing.
    let late = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&late);
    let _late = client.register_handler("mark_read", move |_| *counter.lock().unwrap() += 1);
    conn.send(&json!({"type": "mark_read", "id": "abc", "data": {}}));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*late.lock().unwrap(), 1);
    let snapshot = client.snapshot().await.unwrap();
    assert!(!snapshot.is_pending("abc"));
    assert_eq!(client.status().state, ConnectionStatus::Connected);

    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_rejects_pending_requests() {
    let mut server = MockServer::start().await;
    let (client, mut conn) =
        connected(&mut server, FeedKind::Notifications, fast_settings()).await;

    let requester = client.clone();
    let request = tokio::spawn(async move { requester.send_request("slow", json!({})).await });
    conn.recv().await;

    client.disconnect().await;

    assert_eq!(request.await.unwrap().unwrap_err(), RequestError::ConnectionClosed);
    let err = client.send_request("slow", json!({})).await.unwrap_err();
    assert_eq!(err, RequestError::NotConnected);
}

#[tokio::test]
async fn test_connection_loss_rejects_pending_requests() {
    let mut server = MockServer::start().await;
    let (client, mut conn) =
        connected(&mut server, FeedKind::Notifications, fast_settings()).await;

    let requester = client.clone();
    let request = tokio::spawn(async move { requester.send_request("slow", json!({})).await });
    conn.recv().await;
    drop(conn);

    assert!(matches!(
        request.await.unwrap().unwrap_err(),
        RequestError::ConnectionLost(_)
    ));

    // The controller comes back on its own.
    let _again = server.next_connection().await;
    wait_for_status(client.status_watch(), |s| s.state == ConnectionStatus::Connected).await;
    client.disconnect().await;
}

#[tokio::test]
async fn test_typed_payloads_reach_handlers() {
    let mut server = MockServer::start().await;
    let (client, conn) = connected(&mut server, FeedKind::MarketData, fast_settings()).await;

    let quotes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&quotes);
    let _quotes = client.register_handler("quotes", move |m| {
        if let Some(Ok(MarketData::Quote(quote))) = m.market_data() {
            sink.lock().unwrap().push(quote.spread().to_string());
        }
    });

    conn.send(&json!({
        "type": "market_data",
        "data": {
            "data_type": "quotes",
            "symbol": "BTC/USD",
            "bid_price": "64000.00",
            "ask_price": "64000.50"
        }
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*quotes.lock().unwrap(), vec!["0.50".to_string()]);
    client.disconnect().await;
}

#[tokio::test]
async fn test_batched_frames_dispatch_in_order() {
    let mut server = MockServer::start().await;
    let (client, conn) = connected(&mut server, FeedKind::Notifications, fast_settings()).await;

    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&counts);
    let _unread = client.register_handler("unread_count", move |m| {
        let unread: UnreadCount = m.decode_payload().unwrap();
        sink.lock().unwrap().push(unread.count);
    });

    conn.send(&json!([
        {"type": "unread_count", "data": {"count": 3}},
        {"type": "unread_count", "data": {"count": 2}}
    ]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*counts.lock().unwrap(), vec![3, 2]);
    client.disconnect().await;
}

#[tokio::test]
async fn test_market_data_reaches_type_and_data_type_handlers() {
    let mut server = MockServer::start().await;
    let (client, conn) = connected(&mut server, FeedKind::MarketData, fast_settings()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    for key in ["quotes", "*", "market_data"] {
        let sink = Arc::clone(&seen);
        let _handler = client.register_handler(key, move |_| sink.lock().unwrap().push(key));
    }

    conn.send(&json!({
        "type": "market_data",
        "data_type": "quotes",
        "data": {"symbol": "AAPL", "bid_price": "189.10", "ask_price": "189.12"}
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*seen.lock().unwrap(), vec!["market_data", "quotes", "*"]);
    client.disconnect().await;
}

#[tokio::test]
async fn test_malformed_batch_element_is_dropped_alone() {
    let mut server = MockServer::start().await;
    let (client, conn) = connected(&mut server, FeedKind::Notifications, fast_settings()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _all = client.register_handler("*", move |m| sink.lock().unwrap().push(m.msg_type.clone()));

    conn.send(&json!([
        {"type": "notification", "data": {"id": "n-1"}},
        {"data": {}},
        {"type": "unread_count", "data": {"count": 4}}
    ]));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec!["notification".to_string(), "unread_count".to_string()]
    );
    assert_eq!(client.status().state, ConnectionStatus::Connected);
    client.disconnect().await;
}

#[tokio::test]
async fn test_unanswered_heartbeat_forces_reconnect() {
    let mut server = MockServer::start().await;
    let mut settings = fast_settings();
    settings.heartbeat_interval = Duration::from_millis(200);
    settings.heartbeat_timeout = Duration::from_millis(200);
    let (client, mut conn) = connected(&mut server, FeedKind::MarketData, settings).await;

    let ping = conn.recv_any().await;
    assert_eq!(ping["type"], "ping");

    let _second = server.next_connection().await;
    assert_eq!(server.accepted(), 2);
    client.disconnect().await;
}

#[tokio::test]
async fn test_answered_heartbeat_keeps_connection() {
    let mut server = MockServer::start().await;
    let mut settings = fast_settings();
    settings.heartbeat_interval = Duration::from_millis(100);
    settings.heartbeat_timeout = Duration::from_millis(300);
    let (client, mut conn) = connected(&mut server, FeedKind::MarketData, settings).await;

    for _ in 0..5 {
        let ping = conn.recv_any().await;
        assert_eq!(ping["type"], "ping");
        conn.send(&json!({"type": "pong", "id": ping["id"]}));
    }

    assert_eq!(server.accepted(), 1);
    assert_eq!(client.status().state, ConnectionStatus::Connected);
    client.disconnect().await;
}

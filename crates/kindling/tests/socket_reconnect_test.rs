//! Socket supervision: heartbeats, reconnection, and lifecycle callbacks.

mod support;

use kindling::{events, CloseEvent, Payload, Socket, SocketOptions, HEARTBEAT_TOPIC};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use support::{mock_connector, refusing_connector, until};

#[tokio::test(start_paused = true)]
async fn connect_is_idempotent_and_fires_open_callbacks() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    let opens = Arc::new(AtomicU32::new(0));
    socket.on_open({
        let opens = opens.clone();
        move || {
            opens.fetch_add(1, Ordering::SeqCst);
        }
    });

    socket.connect();
    socket.connect();

    let _server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;
    assert_eq!(opens.load(Ordering::SeqCst), 1);
    assert!(accepts.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_clean_and_never_reconnects() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    let closes = Arc::new(parking_lot::Mutex::new(Vec::<CloseEvent>::new()));
    socket.on_close({
        let closes = closes.clone();
        move |event| {
            closes.lock().push(event.clone());
        }
    });

    socket.connect();
    let _server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;

    socket.disconnect();
    assert!(!socket.is_connected());
    {
        let closes = closes.lock();
        assert_eq!(closes.len(), 1);
        assert!(closes[0].was_clean);
    }

    // well past every reconnect backoff entry: nothing re-dials
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(accepts.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn reconnects_after_the_server_drops_and_rejoins_channels() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    let closes = Arc::new(parking_lot::Mutex::new(Vec::<CloseEvent>::new()));
    socket.on_close({
        let closes = closes.clone();
        move |event| {
            closes.lock().push(event.clone());
        }
    });

    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;

    let channel = socket.channel("room:lobby", Payload::default());
    channel.join(None).unwrap();
    let first_join = server.next_message().await;
    server.reply(&first_join, "ok", json!({}));
    until(|| channel.is_joined()).await;

    drop(server);

    // the drop is an unclean close, so the backoff re-dials
    let mut server = accepts.recv().await.expect("reconnect");
    until(|| socket.is_connected()).await;
    assert!(closes.lock().iter().any(|event| !event.was_clean));

    // the errored channel rejoins under a fresh join generation
    let second_join = server.next_message().await;
    assert_eq!(second_join.event, events::JOIN);
    assert_ne!(second_join.msg_ref, first_join.msg_ref);
    server.reply(&second_join, "ok", json!({}));
    until(|| channel.is_joined()).await;
}

#[tokio::test(start_paused = true)]
async fn heartbeats_flow_on_the_system_topic() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default()
            .connector(connector)
            .heartbeat_interval(Duration::from_millis(100)),
    );

    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;

    let first = server.next_message().await;
    assert_eq!(first.topic, HEARTBEAT_TOPIC);
    assert_eq!(first.event, events::HEARTBEAT);
    assert!(first.msg_ref.is_some());
    server.reply(&first, "ok", json!({}));

    // the answered heartbeat keeps the connection alive for the next tick
    let second = server.next_message().await;
    assert_eq!(second.event, events::HEARTBEAT);
    assert_ne!(second.msg_ref, first.msg_ref);
    assert!(socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn an_unanswered_heartbeat_forces_a_reconnect() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default()
            .connector(connector)
            .heartbeat_interval(Duration::from_millis(100)),
    );
    let closes = Arc::new(parking_lot::Mutex::new(Vec::<CloseEvent>::new()));
    socket.on_close({
        let closes = closes.clone();
        move |event| {
            closes.lock().push(event.clone());
        }
    });

    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;

    let heartbeat = server.next_message().await;
    assert_eq!(heartbeat.event, events::HEARTBEAT);

    // leave it unanswered: the next tick treats the connection as stale
    let _replacement = accepts.recv().await.expect("reconnect");
    assert!(closes
        .lock()
        .iter()
        .any(|event| !event.was_clean && event.reason == "heartbeat timeout"));
}

#[tokio::test(start_paused = true)]
async fn failed_connection_attempts_retry_under_backoff() {
    let (connector, attempts) = refusing_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    let errors = Arc::new(AtomicU32::new(0));
    socket.on_error({
        let errors = errors.clone();
        move |_error| {
            errors.fetch_add(1, Ordering::SeqCst);
        }
    });

    socket.connect();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // initial dial plus backoff retries at 10ms, 50ms, 100ms, ...
    let dialed = attempts.load(Ordering::SeqCst);
    assert!(dialed >= 3, "expected repeated dials, got {dialed}");
    assert_eq!(errors.load(Ordering::SeqCst), dialed);
    assert!(!socket.is_connected());
}

#[tokio::test(start_paused = true)]
async fn message_callbacks_observe_inbound_traffic() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    let seen = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    socket.on_message({
        let seen = seen.clone();
        move |message| {
            seen.lock().push(message.event.clone());
        }
    });

    socket.connect();
    let server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;

    server.send(&kindling::Message {
        join_ref: None,
        msg_ref: None,
        topic: "anywhere".to_string(),
        event: "announcement".to_string(),
        payload: Payload::Json(json!({"text": "hi"})),
    });
    until(|| !seen.lock().is_empty()).await;
    assert_eq!(seen.lock().as_slice(), ["announcement"]);
}

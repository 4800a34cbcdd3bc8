//! Stateful presence tracking across join generations.

mod support;

use kindling::{Message, Payload, Presence, PresenceOptions, Socket, SocketOptions};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::{mock_connector, until, ServerSide};

fn presence_message(topic: &str, event: &str, payload: Value) -> Message {
    Message {
        join_ref: None,
        msg_ref: None,
        topic: topic.to_string(),
        event: event.to_string(),
        payload: Payload::Json(payload),
    }
}

async fn joined_channel(
    socket: &Socket,
    server: &mut ServerSide,
    topic: &str,
) -> kindling::Channel {
    let channel = socket.channel(topic, Payload::default());
    channel.join(None).unwrap();
    let join_message = server.next_message().await;
    server.reply(&join_message, "ok", json!({}));
    until(|| channel.is_joined()).await;
    channel
}

#[tokio::test(start_paused = true)]
async fn diffs_queue_until_the_first_snapshot_then_replay_in_order() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;
    let channel = joined_channel(&socket, &mut server, "room:lobby").await;

    let presence = Presence::new(&channel, PresenceOptions::default());
    let joins = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let leaves = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    presence.on_join({
        let joins = joins.clone();
        move |key, _current, _joined| joins.lock().push(key.to_string())
    });
    presence.on_leave({
        let leaves = leaves.clone();
        move |key, _current, _left| leaves.lock().push(key.to_string())
    });

    assert!(presence.in_pending_sync_state());

    // a diff racing ahead of the snapshot is queued, not applied
    server.send(&presence_message(
        "room:lobby",
        "presence_diff",
        json!({"joins": {"u2": {"metas": [{"id": 2, "phx_ref": "2"}]}}, "leaves": {}}),
    ));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(presence.state().is_empty());

    // the snapshot applies, then the queued diff replays on top of it
    server.send(&presence_message(
        "room:lobby",
        "presence_state",
        json!({"u1": {"metas": [{"id": 1, "phx_ref": "1"}]}}),
    ));
    until(|| presence.state().len() == 2).await;
    assert!(!presence.in_pending_sync_state());
    {
        let mut seen = joins.lock().clone();
        seen.sort();
        assert_eq!(seen, vec!["u1", "u2"]);
    }

    // later diffs apply immediately
    server.send(&presence_message(
        "room:lobby",
        "presence_diff",
        json!({"joins": {}, "leaves": {"u2": {"metas": [{"id": 2, "phx_ref": "2"}]}}}),
    ));
    until(|| presence.state().len() == 1).await;
    assert!(presence.state().contains_key("u1"));
    assert_eq!(leaves.lock().as_slice(), ["u2"]);
}

#[tokio::test(start_paused = true)]
async fn a_new_join_generation_reenters_the_pending_state() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;
    let channel = joined_channel(&socket, &mut server, "room:lobby").await;

    let presence = Presence::new(&channel, PresenceOptions::default());
    server.send(&presence_message(
        "room:lobby",
        "presence_state",
        json!({"u1": {"metas": [{"id": 1, "phx_ref": "1"}]}}),
    ));
    until(|| !presence.state().is_empty()).await;
    assert!(!presence.in_pending_sync_state());

    // the connection drops; the rejoin starts a new generation
    drop(server);
    let mut server = accepts.recv().await.expect("reconnect");
    let rejoin = server.next_message().await;
    server.reply(&rejoin, "ok", json!({}));
    until(|| channel.is_joined()).await;

    assert!(presence.in_pending_sync_state());

    // a fresh snapshot reconciles the old state away
    server.send(&presence_message(
        "room:lobby",
        "presence_state",
        json!({"u3": {"metas": [{"id": 3, "phx_ref": "3"}]}}),
    ));
    until(|| presence.state().contains_key("u3")).await;
    assert_eq!(presence.state().len(), 1);
    assert!(!presence.in_pending_sync_state());
}

#[tokio::test(start_paused = true)]
async fn list_by_projects_the_tracked_entries() {
    let (connector, mut accepts) = mock_connector();
    let socket = Socket::new(
        "ws://test.host/socket",
        SocketOptions::default().connector(connector),
    );
    socket.connect();
    let mut server = accepts.recv().await.expect("connection");
    until(|| socket.is_connected()).await;
    let channel = joined_channel(&socket, &mut server, "room:lobby").await;

    let presence = Presence::new(&channel, PresenceOptions::default());
    server.send(&presence_message(
        "room:lobby",
        "presence_state",
        json!({
            "u1": {"metas": [{"name": "ada", "phx_ref": "1"}]},
            "u2": {"metas": [{"name": "lin", "phx_ref": "2"}]},
        }),
    ));
    until(|| presence.state().len() == 2).await;

    let mut names: Vec<String> = presence.list_by(|_key, entry| {
        entry.metas[0]["name"].as_str().unwrap_or_default().to_string()
    });
    names.sort();
    assert_eq!(names, vec!["ada", "lin"]);
}

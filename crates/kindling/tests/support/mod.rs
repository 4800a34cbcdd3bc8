//! Shared in-memory transport and helpers for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use kindling::{
    events, serializer, BoxTransport, Message, Payload, RawMessage, Transport,
    TransportConnector, TransportError,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The server half of a mock connection. Dropping it closes the transport
/// under the client.
pub struct ServerSide {
    pub from_client: mpsc::UnboundedReceiver<RawMessage>,
    pub to_client: mpsc::UnboundedSender<RawMessage>,
}

impl ServerSide {
    /// Receive and decode the next client frame.
    pub async fn next_message(&mut self) -> Message {
        let raw = self.from_client.recv().await.expect("client frame");
        serializer::decode(&raw).expect("decodable frame")
    }

    /// Encode and deliver a message to the client.
    pub fn send(&self, message: &Message) {
        let raw = serializer::encode(message).expect("encodable frame");
        let _ = self.to_client.send(raw);
    }

    /// Reply to a client message with the given status.
    pub fn reply(&self, incoming: &Message, status: &str, response: Value) {
        self.send(&Message {
            join_ref: incoming.join_ref.clone(),
            msg_ref: incoming.msg_ref.clone(),
            topic: incoming.topic.clone(),
            event: events::REPLY.to_string(),
            payload: Payload::Json(json!({"status": status, "response": response})),
        });
    }
}

struct MockTransport {
    outgoing: mpsc::UnboundedSender<RawMessage>,
    incoming: mpsc::UnboundedReceiver<RawMessage>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
        self.outgoing
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError> {
        Ok(self.incoming.recv().await)
    }

    async fn close(&mut self) {}
}

/// A connector whose connections surface as [`ServerSide`] handles on the
/// returned acceptor.
pub fn mock_connector() -> (TransportConnector, mpsc::UnboundedReceiver<ServerSide>) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let connector: TransportConnector = Arc::new(move |_url| {
        let accept_tx = accept_tx.clone();
        Box::pin(async move {
            let (client_tx, client_rx) = mpsc::unbounded_channel();
            let (server_tx, server_rx) = mpsc::unbounded_channel();
            accept_tx
                .send(ServerSide {
                    from_client: client_rx,
                    to_client: server_tx,
                })
                .map_err(|_| TransportError::Connect("acceptor gone".to_string()))?;
            Ok(Box::new(MockTransport {
                outgoing: client_tx,
                incoming: server_rx,
            }) as BoxTransport)
        })
    });
    (connector, accept_rx)
}

/// A connector that refuses every attempt, counting them.
pub fn refusing_connector() -> (TransportConnector, Arc<AtomicU32>) {
    let attempts = Arc::new(AtomicU32::new(0));
    let connector: TransportConnector = Arc::new({
        let attempts = attempts.clone();
        move |_url| {
            attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err::<BoxTransport, TransportError>(TransportError::Connect(
                    "refused".to_string(),
                ))
            })
        }
    });
    (connector, attempts)
}

/// Poll a condition, yielding 1ms of (paused) time per attempt. Panics if
/// the condition never holds within two seconds of virtual time.
pub async fn until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never became true");
}

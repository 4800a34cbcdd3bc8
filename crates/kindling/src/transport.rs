//! Pluggable transport boundary.
//!
//! The socket drives a single persistent connection through the [`Transport`]
//! trait and obtains new connections from a [`TransportConnector`] stored in
//! its options, so tests can inject in-memory transports. The default
//! connector (behind the `websocket` feature) speaks WebSocket.

use crate::error::TransportError;
use crate::message::RawMessage;
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// A single persistent, bidirectional connection.
#[async_trait]
pub trait Transport: Send {
    /// Send one frame.
    async fn send(&mut self, message: RawMessage) -> Result<(), TransportError>;

    /// Receive the next frame. `Ok(None)` means the peer closed the
    /// connection.
    async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self);
}

/// A transport behind the pluggable boundary.
pub type BoxTransport = Box<dyn Transport>;

/// The in-flight result of a connection attempt.
pub type ConnectFuture = Pin<Box<dyn Future<Output = Result<BoxTransport, TransportError>> + Send>>;

/// Factory invoked with the resolved endpoint URL on every (re)connect
/// attempt.
pub type TransportConnector = Arc<dyn Fn(String) -> ConnectFuture + Send + Sync>;

#[cfg(feature = "websocket")]
pub use websocket::connector as websocket_connector;

/// WebSocket transport via `tokio-tungstenite`.
#[cfg(feature = "websocket")]
pub mod websocket {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

    /// A connection over a client WebSocket stream.
    pub struct WebSocketTransport {
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    }

    /// The default connector: dial the endpoint as a WebSocket client.
    pub fn connector() -> TransportConnector {
        Arc::new(|url| {
            Box::pin(async move {
                let (stream, _response) = tokio_tungstenite::connect_async(url)
                    .await
                    .map_err(TransportError::from)?;
                Ok::<BoxTransport, TransportError>(Box::new(WebSocketTransport { stream }))
            })
        })
    }

    #[async_trait]
    impl Transport for WebSocketTransport {
        async fn send(&mut self, message: RawMessage) -> Result<(), TransportError> {
            let frame = match message {
                RawMessage::Text(text) => WsMessage::Text(text),
                RawMessage::Binary(bytes) => WsMessage::Binary(bytes),
            };
            self.stream.send(frame).await.map_err(TransportError::from)
        }

        async fn recv(&mut self) -> Result<Option<RawMessage>, TransportError> {
            while let Some(frame) = self.stream.next().await {
                match frame? {
                    WsMessage::Text(text) => return Ok(Some(RawMessage::Text(text))),
                    WsMessage::Binary(bytes) => return Ok(Some(RawMessage::Binary(bytes))),
                    WsMessage::Close(_) => return Ok(None),
                    // ping/pong are handled by the library
                    WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => continue,
                }
            }
            Ok(None)
        }

        async fn close(&mut self) {
            let _ = self.stream.close(None).await;
        }
    }
}

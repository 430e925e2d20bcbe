//! Transport Channel
//!
//! One duplex WebSocket connection per search session. The transport
//! serializes outgoing request frames, deserializes inbound frames, and
//! forwards them in strict arrival order. Unexpected disconnection is
//! signaled as a `Lost` event; the session surfaces it as a terminal error
//! on every open output stream. No reconnection is attempted here: search
//! state on the backend is not assumed resumable mid-stream.
//!
//! The session consumes a [`TransportFactory`] rather than credentials:
//! callers hand in a pre-authenticated factory (the provided
//! [`WsTransportFactory`] attaches a Bearer token to the handshake).

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::ClientConfig;

use super::error::{SearchError, SearchResult};
use super::frames::{RequestFrame, ServerFrame};

/// Channel capacity for each direction of a transport
const CHANNEL_CAPACITY: usize = 64;

/// Inbound transport events, in strict arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A successfully parsed backend frame
    Frame(ServerFrame),
    /// An inbound message that could not be parsed
    Malformed { detail: String },
    /// The connection is gone; no further events follow
    Lost { reason: String },
}

/// A connected duplex channel to the search backend
#[derive(Debug)]
pub struct TransportChannel {
    /// Outgoing request frames
    pub outbound: mpsc::Sender<RequestFrame>,
    /// Incoming events, one per inbound message
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Produces connected, pre-authenticated transport channels
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establish one connection to the backend
    async fn connect(&self) -> SearchResult<TransportChannel>;
}

/// WebSocket transport factory
pub struct WsTransportFactory {
    url: String,
    bearer_token: Option<String>,
}

impl WsTransportFactory {
    /// Create a factory dialing the given WebSocket URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bearer_token: None,
        }
    }

    /// Build a factory from client configuration
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            url: config.websocket_url(),
            bearer_token: config.api.auth_token.clone(),
        }
    }

    /// Attach a Bearer token to the connection handshake
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    async fn connect(&self) -> SearchResult<TransportChannel> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SearchError::connection(format!("invalid URL {}: {}", self.url, e)))?;

        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| SearchError::connection(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SearchError::connection(format!("failed to connect: {}", e)))?;

        let connection_id = Uuid::new_v4().to_string();
        tracing::debug!(connection_id = %connection_id, url = %self.url, "transport connected");

        let (write, read) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::channel::<RequestFrame>(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        tokio::spawn(reader_task(read, inbound_tx, connection_id.clone()));
        tokio::spawn(writer_task(write, outbound_rx, connection_id));

        Ok(TransportChannel {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Forwards inbound WebSocket messages as transport events, preserving
/// arrival order. Ends after a `Lost` event or when the session drops its
/// receiver.
async fn reader_task(
    mut read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    tx: mpsc::Sender<TransportEvent>,
    connection_id: String,
) {
    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let event = match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(frame) => TransportEvent::Frame(frame),
                    Err(e) => TransportEvent::Malformed {
                        detail: e.to_string(),
                    },
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let event = TransportEvent::Malformed {
                    detail: "unexpected binary frame".to_string(),
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                tracing::debug!(connection_id = %connection_id, "backend closed the connection");
                let _ = tx
                    .send(TransportEvent::Lost {
                        reason: "connection closed by backend".to_string(),
                    })
                    .await;
                break;
            }
            Some(Ok(_)) => {
                // Ping/pong, handled by the protocol layer
            }
            Some(Err(e)) => {
                tracing::debug!(connection_id = %connection_id, error = %e, "transport receive error");
                let _ = tx
                    .send(TransportEvent::Lost {
                        reason: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

/// Serializes request frames onto the socket. Sends a close frame once the
/// session drops its sender.
async fn writer_task(
    mut write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    mut rx: mpsc::Receiver<RequestFrame>,
    connection_id: String,
) {
    while let Some(frame) = rx.recv().await {
        match serde_json::to_string(&frame) {
            Ok(json) => {
                if write.send(Message::Text(json)).await.is_err() {
                    tracing::debug!(connection_id = %connection_id, "transport send failed, stopping writer");
                    return;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize request frame");
            }
        }
    }
    let _ = write.send(Message::Close(None)).await;
}

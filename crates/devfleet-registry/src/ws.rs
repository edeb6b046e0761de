//! WebSocket transport for the registry heartbeat.
//!
//! Endpoint: `ws://<registry>/websocket/heartbeat`. All messages are JSON text
//! frames carrying a `command` field (`handshake`, `update`, `ping`).

use std::time::Duration;

use async_trait::async_trait;
use devfleet_core::DeviceUpdate;
use futures::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{RegistryError, Result};
use crate::transport::{Handshake, RegistryConnector, RegistryLink, Session};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outgoing protocol messages.
#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum ClientMessage<'a> {
    Handshake(&'a Handshake),
    Update {
        platform: &'a str,
        #[serde(flatten)]
        update: &'a DeviceUpdate,
    },
    Ping,
}

/// Registry's reply to a handshake.
#[derive(Debug, Deserialize)]
struct HandshakeReply {
    success: bool,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

/// Connector dialling the registry's heartbeat WebSocket.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
    connect_timeout: Duration,
}

impl WsConnector {
    /// Create a connector for a registry at `host:port`.
    #[must_use]
    pub fn new(registry_addr: &str) -> Self {
        Self {
            url: format!("ws://{registry_addr}/websocket/heartbeat"),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// The WebSocket URL this connector dials.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn dial(&self, handshake: &Handshake) -> Result<WsLink> {
        let (mut stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RegistryError::Transport(format!("connect {} failed: {e}", self.url)))?;

        let hello = serde_json::to_string(&ClientMessage::Handshake(handshake))?;
        stream
            .send(Message::Text(hello))
            .await
            .map_err(|e| RegistryError::Transport(format!("handshake send failed: {e}")))?;

        let reply = read_text(&mut stream).await?;
        let reply: HandshakeReply = serde_json::from_str(&reply)?;
        if !reply.success {
            return Err(RegistryError::HandshakeRejected(
                reply.description.unwrap_or_else(|| "no reason given".to_string()),
            ));
        }
        let id = reply
            .id
            .ok_or_else(|| RegistryError::Protocol("handshake reply without id".to_string()))?;

        Ok(WsLink {
            stream,
            session: Session::new(id),
        })
    }
}

#[async_trait]
impl RegistryConnector for WsConnector {
    async fn connect(&self, handshake: &Handshake) -> Result<Box<dyn RegistryLink>> {
        let link = tokio::time::timeout(self.connect_timeout, self.dial(handshake))
            .await
            .map_err(|_| RegistryError::Transport(format!("connect {} timed out", self.url)))??;

        tracing::debug!(url = %self.url, session = %link.session.id, "Registry handshake complete");
        Ok(Box::new(link))
    }
}

/// Read frames until a text frame arrives.
async fn read_text(stream: &mut WsStream) -> Result<String> {
    while let Some(frame) = stream.next().await {
        match frame.map_err(|e| RegistryError::Transport(format!("read failed: {e}")))? {
            Message::Text(text) => return Ok(text),
            Message::Close(_) => break,
            _ => {}
        }
    }
    Err(RegistryError::Protocol(
        "connection closed during handshake".to_string(),
    ))
}

/// An open heartbeat WebSocket.
struct WsLink {
    stream: WsStream,
    session: Session,
}

impl WsLink {
    async fn send_json(&mut self, message: &ClientMessage<'_>) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| RegistryError::Transport(format!("send failed: {e}")))
    }

    /// Consume frames that are already buffered without waiting for more.
    /// Surfaces a closed socket that would otherwise go unnoticed.
    fn drain_incoming(&mut self) -> Result<()> {
        while let Some(frame) = self.stream.next().now_or_never() {
            match frame {
                None | Some(Ok(Message::Close(_))) => {
                    return Err(RegistryError::Transport(
                        "registry closed the connection".to_string(),
                    ));
                }
                Some(Err(e)) => {
                    return Err(RegistryError::Transport(format!("read failed: {e}")));
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::trace!(message = %text, "Registry message");
                }
                Some(Ok(_)) => {}
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryLink for WsLink {
    fn session(&self) -> &Session {
        &self.session
    }

    async fn send_update(&mut self, platform: &str, update: &DeviceUpdate) -> Result<()> {
        self.send_json(&ClientMessage::Update { platform, update })
            .await
    }

    async fn ping(&mut self) -> Result<()> {
        self.drain_incoming()?;
        self.send_json(&ClientMessage::Ping).await
    }
}

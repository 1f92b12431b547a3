//! Bidirectional text transports a session runs over

use std::borrow::Cow;

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use tokio::sync::mpsc;

/// A text-frame connection to one client.
///
/// `recv` must be cancel safe: the session polls it alongside the active
/// generation and drops it when a stream event wins.
#[async_trait]
pub trait SessionTransport: Send {
    /// Next text frame, or `None` once the client is gone.
    async fn recv(&mut self) -> Option<String>;

    async fn send(&mut self, text: String) -> anyhow::Result<()>;

    async fn close(&mut self, code: u16, reason: &'static str);
}

pub struct WsTransport {
    socket: WebSocket,
}

impl WsTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl SessionTransport for WsTransport {
    async fn recv(&mut self) -> Option<String> {
        loop {
            match self.socket.recv().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) => return None,
                // Pings are answered by axum; binary frames are not part of the protocol
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(error = %e, "WebSocket receive failed");
                    return None;
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.socket.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        if let Err(e) = self.socket.send(Message::Close(Some(frame))).await {
            tracing::debug!(error = %e, "Failed to send close frame");
        }
    }
}

/// What an in-process client observes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

/// In-process transport backed by channels, for embedding and tests
pub struct ChannelTransport {
    inbound: mpsc::Receiver<String>,
    outbound: mpsc::Sender<Frame>,
}

/// Client end of a [`ChannelTransport`]
pub struct ChannelClient {
    pub sender: mpsc::Sender<String>,
    pub frames: mpsc::Receiver<Frame>,
}

impl ChannelTransport {
    pub fn pair(buffer: usize) -> (Self, ChannelClient) {
        let (in_tx, in_rx) = mpsc::channel(buffer.max(1));
        let (out_tx, out_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                inbound: in_rx,
                outbound: out_tx,
            },
            ChannelClient {
                sender: in_tx,
                frames: out_rx,
            },
        )
    }
}

#[async_trait]
impl SessionTransport for ChannelTransport {
    async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    async fn send(&mut self, text: String) -> anyhow::Result<()> {
        self.outbound
            .send(Frame::Text(text))
            .await
            .map_err(|_| anyhow::anyhow!("client went away"))
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let _ = self
            .outbound
            .send(Frame::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

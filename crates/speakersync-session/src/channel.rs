//! Message channel to the time reference server

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use speakersync_core::config::RetryPolicy;
use speakersync_core::sync::protocol::{ClientMessage, ProtocolError, ServerMessage};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Channel failures
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Could not connect to {url} after {attempts} attempts: {reason}")]
    Connect {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Channel closed by peer")]
    Closed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Bidirectional JSON message stream
///
/// `next_message` must be cancel-safe: dropping its future before completion
/// loses no message. `None` means the peer closed the channel.
#[async_trait]
pub trait MessageChannel: Send {
    async fn connect(&mut self, url: &str) -> Result<(), ChannelError>;

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError>;

    async fn next_message(&mut self) -> Option<Result<ServerMessage, ChannelError>>;

    async fn close(&mut self);
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket channel with bounded reconnect attempts
pub struct WsChannel {
    retry: RetryPolicy,
    socket: Option<Socket>,
}

impl WsChannel {
    pub fn new(retry: RetryPolicy) -> Self {
        Self { retry, socket: None }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}

#[async_trait]
impl MessageChannel for WsChannel {
    async fn connect(&mut self, url: &str) -> Result<(), ChannelError> {
        self.close().await;

        let attempts = self.retry.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match tokio_tungstenite::connect_async(url).await {
                Ok((socket, _response)) => {
                    tracing::info!(url, attempt, "channel_connected");
                    self.socket = Some(socket);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(url, attempt, error = %e, "channel_connect_failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(ChannelError::Connect {
            url: url.to_string(),
            attempts,
            reason: last_error,
        })
    }

    async fn send(&mut self, message: &ClientMessage) -> Result<(), ChannelError> {
        let socket = self.socket.as_mut().ok_or(ChannelError::NotConnected)?;
        let json = message.to_json()?;
        socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))
    }

    async fn next_message(&mut self) -> Option<Result<ServerMessage, ChannelError>> {
        let socket = self.socket.as_mut()?;
        loop {
            match socket.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(ServerMessage::parse(text.as_str()).map_err(ChannelError::from));
                }
                Ok(Message::Binary(_)) => {
                    return Some(Err(ProtocolError::NonTextFrame.into()));
                }
                Ok(Message::Close(_)) => return None,
                // Ping/pong are answered by tungstenite
                Ok(_) => continue,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
            tracing::debug!("channel_closed");
        }
    }
}

use async_trait::async_trait;
use thiserror::Error;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("connection failed: {0}")]
    Closed(String),
}

/// Dials the room event service.
///
/// Each successful call yields one logical connection. The gateway redials
/// through the same transport whenever a connection drops.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> TransportResult<Self::Conn>;
}

/// A single live connection to the event service.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Sends one text frame. Fire-and-forget, there is no ack.
    async fn send(&mut self, frame: String) -> TransportResult<()>;

    /// Receives the next text frame. `None` means the peer closed cleanly.
    async fn recv(&mut self) -> Option<TransportResult<String>>;
}

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{Connection, Transport, TransportError, TransportResult};

/// Connects to the room event service over a websocket.
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

pub struct WsConnection {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    type Conn = WsConnection;

    async fn connect(&self) -> TransportResult<Self::Conn> {
        let (inner, _) = connect_async(self.url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        Ok(WsConnection { inner })
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, frame: String) -> TransportResult<()> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|err| TransportError::Send(err.to_string()))
    }

    async fn recv(&mut self) -> Option<TransportResult<String>> {
        while let Some(message) = self.inner.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(_)) => return None,
                // Pings and pongs are handled by the socket itself.
                Ok(_) => continue,
                Err(err) => return Some(Err(TransportError::Closed(err.to_string()))),
            }
        }

        None
    }
}

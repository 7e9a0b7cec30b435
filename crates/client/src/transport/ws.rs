// WebSocket transport backed by tokio-tungstenite.
//
// Each frame is one JSON text message. Malformed inbound frames are
// logged and skipped rather than tearing down the channel.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use tandem_common::protocol::Envelope;

use super::{Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
}

impl WsTransport {
    pub fn new() -> Self {
        Self { stream: None }
    }
}

impl Transport for WsTransport {
    async fn open(&mut self, url: &str) -> Result<(), TransportError> {
        let (stream, _response) =
            connect_async(url).await.map_err(|e| TransportError::Connection(e.to_string()))?;
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, frame: &Envelope) -> Result<(), TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        let text = frame.encode()?;
        stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Envelope>, TransportError> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Text(text))) => match Envelope::decode(text.as_str()) {
                    Ok(envelope) => return Ok(Some(envelope)),
                    Err(error) => {
                        warn!(%error, "skipping malformed frame");
                    }
                },
                Some(Ok(WsMessage::Ping(payload))) => {
                    let _ = stream.send(WsMessage::Pong(payload)).await;
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Binary(_))) => {
                    debug!("ignoring unexpected binary frame");
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Ok(WsMessage::Frame(_))) => {}
                Some(Err(e)) => return Err(TransportError::Connection(e.to_string())),
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.close(None).await;
        }
    }
}

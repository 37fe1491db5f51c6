#![forbid(unsafe_code)]

// Connection capability and its WebSocket implementation.

use anyhow::{bail, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;

/// Bidirectional byte-frame transport owned by exactly one
/// participant. Writes are internally serialised so concurrent
/// broadcasts cannot interleave partial frames.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, data: &[u8]) -> Result<()>;
    async fn read(&self) -> Result<Vec<u8>>;
    async fn close(&self);
}

pub struct WsConnection {
    writer: Mutex<SplitSink<WebSocket, WsMessage>>,
    reader: Mutex<SplitStream<WebSocket>>,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (writer, reader) = socket.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&self, data: &[u8]) -> Result<()> {
        let text = String::from_utf8(data.to_vec())?;
        let mut writer = self.writer.lock().await;
        writer.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(WsMessage::Binary(data))) => return Ok(data),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => bail!("connection closed by peer"),
                Some(Err(e)) => return Err(e.into()),
                None => bail!("connection closed"),
            }
        }
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.send(WsMessage::Close(None)).await;
        let _ = writer.close().await;
    }
}

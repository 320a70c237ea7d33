use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ChannelError;

use super::{ChatChannel, ChatConnector};

/// WebSocket connector for the relay's per-room chat endpoint.
#[derive(Clone)]
pub struct WsConnector {
    config: Arc<ClientConfig>,
}

impl WsConnector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChatConnector for WsConnector {
    async fn connect(&self, room_id: &str) -> Result<ChatChannel, ChannelError> {
        let url = self.config.chat_socket_url(room_id)?;
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        info!("Chat socket open for {}", room_id);

        let (mut write, mut read) = stream.split();
        let (outgoing, mut out_rx) = mpsc::channel::<String>(64);
        let (in_tx, incoming) = mpsc::channel::<String>(256);

        let writer_room = room_id.to_string();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("Chat send failed for {}: {}", writer_room, e);
                    break;
                }
            }
            let _ = write.close().await;
            debug!("Chat writer for {} finished", writer_room);
        });

        let reader_room = room_id.to_string();
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Chat socket error for {}: {}", reader_room, e);
                        break;
                    }
                }
            }
            debug!("Chat reader for {} finished", reader_room);
        });

        Ok(ChatChannel { outgoing, incoming })
    }
}

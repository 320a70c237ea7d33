//! Chat subscriptions: one real-time channel per open room or private
//! conversation, each hydrated from history and reconnected on its own.

pub mod manager;
pub mod protocol;
pub mod registry;
pub mod socket;
mod subscription;
pub mod view;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelError;

pub use manager::ChatManager;
pub use protocol::{conversation_id, ClientFrame, ServerFrame};
pub use registry::{ChatWindow, ChatWindows};
pub use socket::WsConnector;
pub use view::{RoomView, ViewChange, ViewScope};

/// Identifies one open conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum ChatKey {
    Room(String),
    /// Keyed by the other participant's user id.
    Private(String),
}

impl fmt::Display for ChatKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChatKey::Room(id) => write!(f, "room {}", id),
            ChatKey::Private(peer) => write!(f, "private chat with {}", peer),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    /// Dropped unexpectedly; retrying on a fixed interval.
    Reconnecting,
    Closed,
}

/// An open text channel. Dropping `outgoing` closes the socket; `incoming`
/// ends when the remote side goes away.
pub struct ChatChannel {
    pub outgoing: mpsc::Sender<String>,
    pub incoming: mpsc::Receiver<String>,
}

/// Opens the real-time channel for one room.
#[async_trait]
pub trait ChatConnector: Send + Sync {
    async fn connect(&self, room_id: &str) -> Result<ChatChannel, ChannelError>;
}

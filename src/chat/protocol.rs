use serde::{Deserialize, Serialize};

use crate::models::{ChatMessage, MessageType, ModerationNotice, ModerationRequest, OnlineUser};

/// Frames this client writes to a chat socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage {
        content: String,
        message_type: MessageType,
        #[serde(skip_serializing_if = "Option::is_none")]
        tip_amount: Option<u32>,
    },
    PrivateMessage {
        recipient_id: String,
        content: String,
    },
    Typing {
        is_typing: bool,
    },
    ModerationAction(ModerationRequest),
}

/// Frames the relay pushes, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ChatMessage {
        message: ChatMessage,
    },
    PrivateMessage {
        message: ChatMessage,
    },
    /// Full presence snapshot.
    OnlineUsers {
        #[serde(default)]
        users: Vec<OnlineUser>,
    },
    UserConnected {
        user_id: String,
        #[serde(default)]
        username: String,
    },
    UserDisconnected {
        user_id: String,
        #[serde(default)]
        username: String,
    },
    Typing {
        user_id: String,
        #[serde(default)]
        username: String,
        is_typing: bool,
    },
    MessageDeleted {
        message_id: String,
        #[serde(default)]
        deleted_by: Option<String>,
    },
    ModerationAction(ModerationNotice),
    Error {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::ChatMessage { .. } => "chat_message",
            ServerFrame::PrivateMessage { .. } => "private_message",
            ServerFrame::OnlineUsers { .. } => "online_users",
            ServerFrame::UserConnected { .. } => "user_connected",
            ServerFrame::UserDisconnected { .. } => "user_disconnected",
            ServerFrame::Typing { .. } => "typing",
            ServerFrame::MessageDeleted { .. } => "message_deleted",
            ServerFrame::ModerationAction(_) => "moderation_action",
            ServerFrame::Error { .. } => "error",
            ServerFrame::Unknown => "unknown",
        }
    }
}

/// Room id shared by both participants of a private conversation.
pub fn conversation_id(a: &str, b: &str) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("private_{}_{}", lo, hi)
}

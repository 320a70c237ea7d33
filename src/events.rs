use serde::Serialize;
use tokio::sync::broadcast;

use crate::chat::{ChannelStatus, ChatKey};
use crate::media::{ConnectionState, QualityPreset, StreamStatus, TrackKind};
use crate::models::{ChatMessage, ModerationNotice, OnlineUser};

/// Transport-agnostic client events.
/// Emitted by the stream and chat managers, consumed by whatever UI sits on top.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum AppEvent {
    // Broadcaster
    StreamStatusChanged { status: StreamStatus },
    StreamStarted { session_id: String, quality: QualityPreset },
    StreamStopped { session_id: Option<String> },
    StreamQualityChanged { quality: QualityPreset },
    ViewerJoined { viewer_id: String },
    ViewerStateChanged { viewer_id: String, state: ConnectionState },
    ViewerLeft { viewer_id: String },
    ViewerError { viewer_id: String, message: String },
    QualityRequested { viewer_id: String, quality: QualityPreset },
    // Viewer
    ConnectionStateChanged { broadcaster_id: String, state: ConnectionState },
    RemoteTrackAdded { broadcaster_id: String, kind: TrackKind, track_id: String },
    StreamFailed { broadcaster_id: String, reason: String },
    // Chat
    ChatStatusChanged { chat: ChatKey, status: ChannelStatus },
    ChatHistoryLoaded { chat: ChatKey, count: usize },
    ChatMessageReceived { chat: ChatKey, message: ChatMessage },
    PresenceChanged { chat: ChatKey, users: Vec<OnlineUser> },
    TypingChanged { chat: ChatKey, user_id: String, username: String, is_typing: bool },
    ChatMessageDeleted { chat: ChatKey, message_id: String, deleted_by: Option<String> },
    ModerationApplied { chat: ChatKey, notice: ModerationNotice },
    ChatErrorReported { chat: ChatKey, message: String },
    /// A private message for a conversation with no open window.
    PrivateMessageNotification { from_user_id: String, from_username: String, message: ChatMessage },
}

pub type EventSender = broadcast::Sender<AppEvent>;
pub type EventReceiver = broadcast::Receiver<AppEvent>;

pub fn create_event_bus() -> (EventSender, EventReceiver) {
    broadcast::channel(256)
}

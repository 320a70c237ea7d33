pub mod client;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::models::ChatMessage;

pub use client::BackendClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Public,
    Private,
}

/// Session bookkeeping and live status on the streaming backend.
#[async_trait]
pub trait StreamingBackend: Send + Sync {
    /// Returns the session id issued by the backend.
    async fn create_session(&self, model_id: &str, session_type: SessionType) -> Result<String, ApiError>;
    async fn end_session(&self, session_id: &str) -> Result<(), ApiError>;
    async fn update_model_status(&self, is_live: bool, is_available: bool) -> Result<(), ApiError>;
}

/// The REST half of chat: history pages and message removal.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Most recent `limit` messages older than `before`, oldest first.
    async fn chat_history(
        &self,
        room_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ApiError>;

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================
// Identity
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Viewer,
    Model,
    Admin,
}

/// Who this client is signed in as.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub username: String,
    pub role: Role,
    /// Public room owned by this user when they are a model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_room_id: Option<String>,
}

impl UserIdentity {
    /// Client-side check mirroring the relay's moderation rule: admins
    /// everywhere, models only in their own room.
    pub fn can_moderate(&self, room_id: &str) -> bool {
        match self.role {
            Role::Admin => true,
            Role::Model => self.model_room_id.as_deref() == Some(room_id),
            Role::Viewer => false,
        }
    }
}

// ============================================================
// Chat messages
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Tip,
    Private,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    pub sender_id: String,
    #[serde(default)]
    pub sender_username: String,
    #[serde(default)]
    pub sender_role: Role,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tip_amount: Option<u32>,
    #[serde(default, skip_serializing)]
    pub is_deleted: bool,
}

impl ChatMessage {
    pub fn is_tip(&self) -> bool {
        self.message_type == MessageType::Tip && self.tip_amount.is_some_and(|t| t > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: Role,
}

// ============================================================
// Moderation
// ============================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModerationKind {
    Mute,
    Kick,
    Ban,
    DeleteMessage,
}

/// A moderation request sent by a model or admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub target_user_id: String,
    pub action_type: ModerationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// A moderation action broadcast by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationNotice {
    pub action_type: String,
    pub target_user_id: String,
    #[serde(default)]
    pub moderator: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
}

/// The relay emits naive ISO-8601 timestamps (no offset) that are UTC.
/// Accept both those and RFC 3339.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&dt.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Ok(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
    }
}

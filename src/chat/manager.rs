use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

use crate::error::{ChatError, ValidationError};
use crate::events::AppEvent;
use crate::models::{ChatMessage, MessageType, ModerationRequest, OnlineUser};
use crate::state::ClientContext;

use super::protocol::{conversation_id, ClientFrame};
use super::subscription::{lock, publish, Registry, SubShared, Subscription};
use super::view::{RoomView, ViewScope};
use super::{ChannelStatus, ChatKey};

/// Owns every open chat subscription for this client.
///
/// Cheap to clone; all clones share the same subscriptions. Dropping the
/// last clone closes everything.
#[derive(Clone)]
pub struct ChatManager {
    ctx: ClientContext,
    registry: Arc<Registry>,
}

impl ChatManager {
    pub fn new(ctx: ClientContext) -> Self {
        Self {
            ctx,
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns false when the room was already open.
    pub fn open_room(&self, room_id: &str) -> bool {
        self.open(
            ChatKey::Room(room_id.to_string()),
            room_id.to_string(),
            ViewScope::Room(room_id.to_string()),
        )
    }

    pub fn close_room(&self, room_id: &str) {
        self.close(&ChatKey::Room(room_id.to_string()));
    }

    /// Open the conversation with `peer_user_id`. Returns false when it
    /// was already open.
    pub fn open_private(&self, peer_user_id: &str) -> bool {
        self.open(
            ChatKey::Private(peer_user_id.to_string()),
            conversation_id(self.ctx.user_id(), peer_user_id),
            ViewScope::Private {
                peer_id: peer_user_id.to_string(),
            },
        )
    }

    pub fn close_private(&self, peer_user_id: &str) {
        self.close(&ChatKey::Private(peer_user_id.to_string()));
    }

    fn open(&self, key: ChatKey, socket_room: String, scope: ViewScope) -> bool {
        let mut registry = lock(&self.registry);
        if registry.contains_key(&key) {
            debug!("{} already open", key);
            return false;
        }
        let subscription = Subscription::open(
            &self.ctx,
            key.clone(),
            socket_room,
            scope,
            Arc::downgrade(&self.registry),
        );
        registry.insert(key, subscription);
        true
    }

    fn close(&self, key: &ChatKey) {
        let removed = lock(&self.registry).remove(key);
        if let Some(subscription) = removed {
            subscription.close(&self.ctx);
        }
    }

    pub fn close_all(&self) {
        let drained: Vec<_> = lock(&self.registry).drain().map(|(_, sub)| sub).collect();
        for subscription in drained {
            subscription.close(&self.ctx);
        }
    }

    fn shared(&self, key: &ChatKey) -> Result<Arc<SubShared>, ChatError> {
        lock(&self.registry)
            .get(key)
            .map(|sub| sub.shared.clone())
            .ok_or_else(|| ChatError::NotOpen(key.to_string()))
    }

    pub fn send_message(&self, room_id: &str, content: &str) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        self.shared(&ChatKey::Room(room_id.to_string()))?
            .send(&ClientFrame::ChatMessage {
                content: content.to_string(),
                message_type: MessageType::Text,
                tip_amount: None,
            })
    }

    /// A tip may carry an empty note; the amount must be positive.
    pub fn send_tip(&self, room_id: &str, content: &str, tip_amount: u32) -> Result<(), ChatError> {
        if tip_amount == 0 {
            return Err(ValidationError::InvalidTipAmount.into());
        }
        self.shared(&ChatKey::Room(room_id.to_string()))?
            .send(&ClientFrame::ChatMessage {
                content: content.trim().to_string(),
                message_type: MessageType::Tip,
                tip_amount: Some(tip_amount),
            })
    }

    /// The relay only delivers to the recipient, so the sent message is
    /// added to our own view here.
    pub fn send_private_message(&self, peer_user_id: &str, content: &str) -> Result<(), ChatError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ValidationError::EmptyMessage.into());
        }
        let shared = self.shared(&ChatKey::Private(peer_user_id.to_string()))?;
        shared.send(&ClientFrame::PrivateMessage {
            recipient_id: peer_user_id.to_string(),
            content: content.to_string(),
        })?;

        let identity = &self.ctx.config.identity;
        let echo = ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: None,
            sender_id: identity.user_id.clone(),
            sender_username: identity.username.clone(),
            sender_role: identity.role,
            content: content.to_string(),
            created_at: Utc::now(),
            message_type: MessageType::Private,
            tip_amount: None,
            is_deleted: false,
        };
        let change = lock(&shared.view).push_local(echo);
        publish(&self.ctx, &shared.key, change.into_iter().collect());
        Ok(())
    }

    /// Announce typing in a room. A `true` is withdrawn automatically once
    /// `typing_quiet` passes without another call.
    pub fn set_typing(&self, room_id: &str, is_typing: bool) -> Result<(), ChatError> {
        let shared = self.shared(&ChatKey::Room(room_id.to_string()))?;
        shared.send(&ClientFrame::Typing { is_typing })?;

        if !is_typing {
            shared.arm_typing_timer(None);
            return Ok(());
        }
        let quiet = self.ctx.config.typing_quiet;
        let target = Arc::downgrade(&shared);
        shared.arm_typing_timer(Some(tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            if let Some(shared) = target.upgrade() {
                let _ = shared.send(&ClientFrame::Typing { is_typing: false });
            }
        })));
        Ok(())
    }

    /// Ask the backend to delete a message shown in one of the open chats.
    /// The message disappears once the relay broadcasts the deletion.
    pub async fn delete_message(&self, message_id: &str) -> Result<(), ChatError> {
        let found = {
            let registry = lock(&self.registry);
            registry.values().find_map(|sub| {
                lock(&sub.shared.view)
                    .find_message(message_id)
                    .map(|m| (sub.shared.key.clone(), m.sender_id.clone()))
            })
        };
        let Some((key, sender_id)) = found else {
            return Err(ValidationError::UnknownMessage(message_id.to_string()).into());
        };

        let identity = &self.ctx.config.identity;
        let own = sender_id == identity.user_id;
        let allowed = match &key {
            ChatKey::Room(room_id) => own || identity.can_moderate(room_id),
            ChatKey::Private(_) => own,
        };
        if !allowed {
            return Err(ChatError::Forbidden("delete this message"));
        }

        self.ctx.chat_backend.delete_message(message_id).await?;
        info!("Requested deletion of {} in {}", message_id, key);
        Ok(())
    }

    /// Send a moderation action (mute, kick, ban, delete) to a room.
    pub fn moderate(&self, room_id: &str, request: ModerationRequest) -> Result<(), ChatError> {
        let shared = self.shared(&ChatKey::Room(room_id.to_string()))?;
        if !self.ctx.config.identity.can_moderate(room_id) {
            return Err(ChatError::Forbidden("moderate this room"));
        }
        shared.send(&ClientFrame::ModerationAction(request))
    }

    /// Fetch the page before the oldest shown message. Returns how many
    /// messages were added.
    pub async fn load_earlier(&self, room_id: &str) -> Result<usize, ChatError> {
        let shared = self.shared(&ChatKey::Room(room_id.to_string()))?;
        let before = lock(&shared.view).oldest_timestamp();
        let page = self
            .ctx
            .chat_backend
            .chat_history(&shared.socket_room, self.ctx.config.history_limit, before)
            .await?;

        // Closed while the page was in flight.
        match self.shared(&shared.key) {
            Ok(current) if Arc::ptr_eq(&current, &shared) => {}
            _ => return Ok(0),
        }
        let added = lock(&shared.view).prepend_older(page);
        self.ctx.emit(AppEvent::ChatHistoryLoaded {
            chat: shared.key.clone(),
            count: added,
        });
        Ok(added)
    }

    /// Resolve once `key`'s channel is connected, or fail with
    /// `NotConnected` after `within`.
    pub async fn wait_connected(&self, key: &ChatKey, within: Duration) -> Result<(), ChatError> {
        let mut events = self.ctx.event_tx.subscribe();
        let wait = async {
            loop {
                match self.shared(key) {
                    Ok(shared) if shared.status() == ChannelStatus::Connected => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
                match events.recv().await {
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return Err(ChatError::NotConnected(key.to_string())),
                }
            }
        };
        tokio::time::timeout(within, wait)
            .await
            .unwrap_or_else(|_| Err(ChatError::NotConnected(key.to_string())))
    }

    pub fn is_open(&self, key: &ChatKey) -> bool {
        lock(&self.registry).contains_key(key)
    }

    pub fn open_chats(&self) -> Vec<ChatKey> {
        lock(&self.registry).keys().cloned().collect()
    }

    pub fn status(&self, key: &ChatKey) -> Option<ChannelStatus> {
        self.shared(key).ok().map(|s| s.status())
    }

    pub fn messages(&self, key: &ChatKey) -> Vec<ChatMessage> {
        self.read_view(key, |view| view.messages().to_vec())
            .unwrap_or_default()
    }

    pub fn online_users(&self, key: &ChatKey) -> Vec<OnlineUser> {
        self.read_view(key, |view| view.online_users().to_vec())
            .unwrap_or_default()
    }

    pub fn typing_users(&self, key: &ChatKey) -> Vec<String> {
        self.read_view(key, RoomView::typing_users).unwrap_or_default()
    }

    fn read_view<R>(&self, key: &ChatKey, read: impl FnOnce(&RoomView) -> R) -> Option<R> {
        let shared = self.shared(key).ok()?;
        let view = lock(&shared.view);
        Some(read(&view))
    }
}

//! Client-side state of one chat window as a pure reducer over relay frames.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};

use crate::models::{ChatMessage, ModerationNotice, OnlineUser, Role};

use super::protocol::ServerFrame;

/// Which frames a view accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewScope {
    Room(String),
    Private { peer_id: String },
}

/// What changed after applying a frame; turned into events by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Appended(ChatMessage),
    Presence(Vec<OnlineUser>),
    Typing {
        user_id: String,
        username: String,
        is_typing: bool,
    },
    Deleted {
        message_id: String,
        deleted_by: Option<String>,
    },
    Moderation(ModerationNotice),
    Error(String),
}

#[derive(Debug, Clone)]
pub struct RoomView {
    scope: ViewScope,
    self_id: String,
    messages: Vec<ChatMessage>,
    /// Live messages that arrived before history; appended after it.
    pending: Vec<ChatMessage>,
    hydrated: bool,
    ids: HashSet<String>,
    online: Vec<OnlineUser>,
    typing: BTreeMap<String, String>,
}

impl RoomView {
    pub fn new(scope: ViewScope, self_id: impl Into<String>) -> Self {
        Self {
            scope,
            self_id: self_id.into(),
            messages: Vec::new(),
            pending: Vec::new(),
            hydrated: false,
            ids: HashSet::new(),
            online: Vec::new(),
            typing: BTreeMap::new(),
        }
    }

    pub fn scope(&self) -> &ViewScope {
        &self.scope
    }

    pub fn is_hydrated(&self) -> bool {
        self.hydrated
    }

    /// Messages in display order. Empty until history has loaded.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn online_users(&self) -> &[OnlineUser] {
        &self.online
    }

    /// Usernames currently typing, ordered by user id.
    pub fn typing_users(&self) -> Vec<String> {
        self.typing.values().cloned().collect()
    }

    pub fn find_message(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages
            .iter()
            .chain(self.pending.iter())
            .find(|m| m.id == message_id)
    }

    pub fn oldest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.messages.first().map(|m| m.created_at)
    }

    /// Install the first history page, then release queued live messages
    /// behind it. Returns the released messages.
    pub fn hydrate(&mut self, mut history: Vec<ChatMessage>) -> Vec<ChatMessage> {
        history.retain(|m| !m.is_deleted && self.accepts(m));
        history.sort_by_key(|m| m.created_at);

        self.messages.clear();
        self.ids.clear();
        for message in history {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        self.release_pending()
    }

    /// History could not be loaded; show live messages anyway.
    pub fn hydrate_failed(&mut self) -> Vec<ChatMessage> {
        self.release_pending()
    }

    fn release_pending(&mut self) -> Vec<ChatMessage> {
        self.hydrated = true;
        let mut released = Vec::new();
        for message in std::mem::take(&mut self.pending) {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message.clone());
                released.push(message);
            }
        }
        released
    }

    /// Put an older page in front of what is shown. Returns how many
    /// messages were new.
    pub fn prepend_older(&mut self, mut older: Vec<ChatMessage>) -> usize {
        older.retain(|m| !m.is_deleted && self.accepts(m));
        older.sort_by_key(|m| m.created_at);
        let mut fresh = Vec::with_capacity(older.len());
        for message in older {
            if self.ids.insert(message.id.clone()) {
                fresh.push(message);
            }
        }
        let added = fresh.len();
        fresh.append(&mut self.messages);
        self.messages = fresh;
        added
    }

    /// A message this client sent and the relay will not echo back.
    pub fn push_local(&mut self, message: ChatMessage) -> Option<ViewChange> {
        self.accept(message)
    }

    fn accepts(&self, message: &ChatMessage) -> bool {
        match &self.scope {
            ViewScope::Room(room_id) => message
                .room_id
                .as_deref()
                .map_or(true, |r| r == room_id),
            ViewScope::Private { peer_id } => {
                message.sender_id == *peer_id || message.sender_id == self.self_id
            }
        }
    }

    fn accept(&mut self, message: ChatMessage) -> Option<ViewChange> {
        if self.ids.contains(&message.id) || self.pending.iter().any(|m| m.id == message.id) {
            return None;
        }
        if !self.hydrated {
            self.pending.push(message);
            return None;
        }
        self.ids.insert(message.id.clone());
        self.messages.push(message.clone());
        Some(ViewChange::Appended(message))
    }

    pub fn apply(&mut self, frame: ServerFrame) -> Vec<ViewChange> {
        match frame {
            ServerFrame::ChatMessage { message } => {
                if !matches!(self.scope, ViewScope::Room(_)) || !self.accepts(&message) {
                    return Vec::new();
                }
                self.accept(message).into_iter().collect()
            }
            ServerFrame::PrivateMessage { message } => {
                if !matches!(self.scope, ViewScope::Private { .. }) || !self.accepts(&message) {
                    return Vec::new();
                }
                self.accept(message).into_iter().collect()
            }
            ServerFrame::OnlineUsers { users } => {
                self.online = users;
                self.typing.retain(|id, _| self.online.iter().any(|u| &u.user_id == id));
                vec![ViewChange::Presence(self.online.clone())]
            }
            ServerFrame::UserConnected { user_id, username } => {
                if self.online.iter().any(|u| u.user_id == user_id) {
                    return Vec::new();
                }
                self.online.push(OnlineUser {
                    user_id,
                    username,
                    role: Role::Viewer,
                });
                vec![ViewChange::Presence(self.online.clone())]
            }
            ServerFrame::UserDisconnected { user_id, .. } => {
                let before = self.online.len();
                self.online.retain(|u| u.user_id != user_id);
                self.typing.remove(&user_id);
                if self.online.len() == before {
                    return Vec::new();
                }
                vec![ViewChange::Presence(self.online.clone())]
            }
            ServerFrame::Typing {
                user_id,
                username,
                is_typing,
            } => {
                if user_id == self.self_id {
                    return Vec::new();
                }
                if is_typing {
                    self.typing.insert(user_id.clone(), username.clone());
                } else {
                    self.typing.remove(&user_id);
                }
                vec![ViewChange::Typing {
                    user_id,
                    username,
                    is_typing,
                }]
            }
            ServerFrame::MessageDeleted {
                message_id,
                deleted_by,
            } => {
                let before = self.messages.len() + self.pending.len();
                self.messages.retain(|m| m.id != message_id);
                self.pending.retain(|m| m.id != message_id);
                if self.messages.len() + self.pending.len() == before {
                    return Vec::new();
                }
                vec![ViewChange::Deleted {
                    message_id,
                    deleted_by,
                }]
            }
            ServerFrame::ModerationAction(notice) => vec![ViewChange::Moderation(notice)],
            ServerFrame::Error { message } => vec![ViewChange::Error(message)],
            ServerFrame::Unknown => Vec::new(),
        }
    }
}

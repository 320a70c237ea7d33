//! Which chat windows a front end has open, independent of their sockets.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use serde::Serialize;

use super::ChatKey;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatWindow {
    pub key: ChatKey,
    /// Model name for rooms, recipient name for private chats.
    pub title: String,
    pub visible: bool,
}

/// Open windows keyed by conversation, remembering the order they were
/// opened in.
#[derive(Debug, Clone, Default)]
pub struct ChatWindows {
    windows: HashMap<ChatKey, ChatWindow>,
    order: Vec<ChatKey>,
}

impl ChatWindows {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or re-show) the window for a public room.
    pub fn open_room(&mut self, room_id: &str, model_name: &str) -> bool {
        self.open(ChatKey::Room(room_id.to_string()), model_name)
    }

    pub fn open_private(&mut self, peer_user_id: &str, peer_name: &str) -> bool {
        self.open(ChatKey::Private(peer_user_id.to_string()), peer_name)
    }

    /// Returns true when a new window was created.
    fn open(&mut self, key: ChatKey, title: &str) -> bool {
        match self.windows.entry(key) {
            Entry::Occupied(mut open) => {
                open.get_mut().visible = true;
                false
            }
            Entry::Vacant(slot) => {
                self.order.push(slot.key().clone());
                let key = slot.key().clone();
                slot.insert(ChatWindow {
                    key,
                    title: title.to_string(),
                    visible: true,
                });
                true
            }
        }
    }

    pub fn close(&mut self, key: &ChatKey) -> bool {
        if self.windows.remove(key).is_none() {
            return false;
        }
        self.order.retain(|k| k != key);
        true
    }

    /// Flip visibility without closing. Returns the new visibility, or
    /// `None` when no such window is open.
    pub fn toggle(&mut self, key: &ChatKey) -> Option<bool> {
        let window = self.windows.get_mut(key)?;
        window.visible = !window.visible;
        Some(window.visible)
    }

    /// Returns the keys that were open so their subscriptions can be closed.
    pub fn close_all(&mut self) -> Vec<ChatKey> {
        self.windows.clear();
        std::mem::take(&mut self.order)
    }

    pub fn is_open(&self, key: &ChatKey) -> bool {
        self.windows.contains_key(key)
    }

    pub fn is_visible(&self, key: &ChatKey) -> bool {
        self.windows.get(key).is_some_and(|w| w.visible)
    }

    pub fn title(&self, key: &ChatKey) -> Option<&str> {
        self.windows.get(key).map(|w| w.title.as_str())
    }

    /// Open windows, oldest first.
    pub fn windows(&self) -> Vec<&ChatWindow> {
        self.order.iter().filter_map(|k| self.windows.get(k)).collect()
    }
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ChatError;
use crate::events::AppEvent;
use crate::models::MessageType;
use crate::state::ClientContext;

use super::protocol::{ClientFrame, ServerFrame};
use super::view::{RoomView, ViewChange, ViewScope};
use super::{ChannelStatus, ChatKey};

/// Open subscriptions keyed by conversation. At most one entry per key.
pub(crate) type Registry = Mutex<HashMap<ChatKey, Subscription>>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// State shared between the manager and a subscription's tasks.
pub(crate) struct SubShared {
    pub key: ChatKey,
    /// Room id the socket and history are addressed by.
    pub socket_room: String,
    pub view: Mutex<RoomView>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    status: Mutex<ChannelStatus>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SubShared {
    pub fn status(&self) -> ChannelStatus {
        *lock(&self.status)
    }

    fn set_status(&self, ctx: &ClientContext, status: ChannelStatus) {
        let mut current = lock(&self.status);
        if *current == status {
            return;
        }
        *current = status;
        drop(current);
        ctx.emit(AppEvent::ChatStatusChanged {
            chat: self.key.clone(),
            status,
        });
    }

    /// Write one frame. Never queued: a channel that is not up rejects it.
    pub fn send(&self, frame: &ClientFrame) -> Result<(), ChatError> {
        let text = serde_json::to_string(frame).map_err(|_| ChatError::SendFailed(self.key.to_string()))?;
        let outgoing = lock(&self.outgoing);
        let Some(tx) = outgoing.as_ref() else {
            return Err(ChatError::NotConnected(self.key.to_string()));
        };
        tx.try_send(text).map_err(|e| {
            warn!("Send on {} failed: {}", self.key, e);
            ChatError::SendFailed(self.key.to_string())
        })
    }

    /// Replace the typing auto-clear timer.
    pub fn arm_typing_timer(&self, timer: Option<JoinHandle<()>>) {
        let previous = std::mem::replace(&mut *lock(&self.typing_timer), timer);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// One open room or private conversation and the tasks that serve it.
pub(crate) struct Subscription {
    pub shared: Arc<SubShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn open(
        ctx: &ClientContext,
        key: ChatKey,
        socket_room: String,
        scope: ViewScope,
        registry: Weak<Registry>,
    ) -> Self {
        let shared = Arc::new(SubShared {
            key,
            socket_room,
            view: Mutex::new(RoomView::new(scope, ctx.user_id())),
            outgoing: Mutex::new(None),
            status: Mutex::new(ChannelStatus::Closed),
            typing_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        info!("Opening {}", shared.key);

        let tasks = vec![
            tokio::spawn(hydrate(ctx.clone(), shared.clone())),
            tokio::spawn(run_channel(ctx.clone(), shared.clone(), registry)),
        ];
        Self { shared, tasks }
    }

    /// Stop every task now, clearing our typing indicator on the way out.
    pub fn close(self, ctx: &ClientContext) {
        let typing = lock(&self.shared.typing_timer).take();
        if let Some(timer) = typing {
            timer.abort();
            let _ = self.shared.send(&ClientFrame::Typing { is_typing: false });
        }
        self.shared.closed.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        lock(&self.shared.outgoing).take();
        self.shared.set_status(ctx, ChannelStatus::Closed);
        info!("Closed {}", self.shared.key);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
        if let Some(timer) = lock(&self.shared.typing_timer).take() {
            timer.abort();
        }
    }
}

async fn hydrate(ctx: ClientContext, shared: Arc<SubShared>) {
    let page = ctx
        .chat_backend
        .chat_history(&shared.socket_room, ctx.config.history_limit, None)
        .await;
    if shared.is_closed() {
        return;
    }

    let (count, released) = {
        let mut view = lock(&shared.view);
        match page {
            Ok(history) => {
                let released = view.hydrate(history);
                (view.messages().len() - released.len(), released)
            }
            Err(e) => {
                warn!("History for {} unavailable: {}", shared.key, e);
                (0, view.hydrate_failed())
            }
        }
    };
    debug!("{} hydrated with {} messages", shared.key, count);

    ctx.emit(AppEvent::ChatHistoryLoaded {
        chat: shared.key.clone(),
        count,
    });
    for message in released {
        ctx.emit(AppEvent::ChatMessageReceived {
            chat: shared.key.clone(),
            message,
        });
    }
}

/// Keep the socket up for as long as the subscription lives, retrying on a
/// fixed interval after every drop or failed attempt.
async fn run_channel(ctx: ClientContext, shared: Arc<SubShared>, registry: Weak<Registry>) {
    let mut first = true;
    loop {
        shared.set_status(
            &ctx,
            if first {
                ChannelStatus::Connecting
            } else {
                ChannelStatus::Reconnecting
            },
        );
        first = false;

        match ctx.chat_connector.connect(&shared.socket_room).await {
            Ok(channel) => {
                let mut incoming = channel.incoming;
                *lock(&shared.outgoing) = Some(channel.outgoing);
                shared.set_status(&ctx, ChannelStatus::Connected);

                while let Some(text) = incoming.recv().await {
                    dispatch(&ctx, &shared, &registry, &text);
                }

                lock(&shared.outgoing).take();
                warn!("{} dropped, reconnecting", shared.key);
            }
            Err(e) => warn!("{} connect failed: {}", shared.key, e),
        }

        shared.set_status(&ctx, ChannelStatus::Reconnecting);
        tokio::time::sleep(ctx.config.reconnect_interval).await;
    }
}

fn dispatch(ctx: &ClientContext, shared: &Arc<SubShared>, registry: &Weak<Registry>, text: &str) {
    let frame = match serde_json::from_str::<ServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Unreadable frame on {}: {}", shared.key, e);
            return;
        }
    };

    match frame {
        ServerFrame::PrivateMessage { mut message } => {
            message.message_type = MessageType::Private;
            route_private(ctx, registry, ServerFrame::PrivateMessage { message });
        }
        ServerFrame::Unknown => debug!("Ignoring unknown frame on {}", shared.key),
        frame => {
            let changes = lock(&shared.view).apply(frame);
            publish(ctx, &shared.key, changes);
        }
    }
}

/// The relay delivers private messages on whichever socket the recipient
/// opened last, so they are routed by sender rather than by channel.
fn route_private(ctx: &ClientContext, registry: &Weak<Registry>, frame: ServerFrame) {
    let ServerFrame::PrivateMessage { message } = frame else {
        return;
    };
    let key = ChatKey::Private(message.sender_id.clone());
    let target = match registry.upgrade() {
        Some(registry) => {
            let open = lock(&registry);
            open.get(&key).map(|sub| sub.shared.clone())
        }
        None => None,
    };

    match target {
        Some(target) => {
            let changes = lock(&target.view).apply(ServerFrame::PrivateMessage { message });
            publish(ctx, &target.key, changes);
        }
        None => ctx.emit(AppEvent::PrivateMessageNotification {
            from_user_id: message.sender_id.clone(),
            from_username: message.sender_username.clone(),
            message,
        }),
    }
}

pub(crate) fn publish(ctx: &ClientContext, key: &ChatKey, changes: Vec<ViewChange>) {
    for change in changes {
        let chat = key.clone();
        let event = match change {
            ViewChange::Appended(message) => AppEvent::ChatMessageReceived { chat, message },
            ViewChange::Presence(users) => AppEvent::PresenceChanged { chat, users },
            ViewChange::Typing {
                user_id,
                username,
                is_typing,
            } => AppEvent::TypingChanged {
                chat,
                user_id,
                username,
                is_typing,
            },
            ViewChange::Deleted {
                message_id,
                deleted_by,
            } => AppEvent::ChatMessageDeleted {
                chat,
                message_id,
                deleted_by,
            },
            ViewChange::Moderation(notice) => AppEvent::ModerationApplied { chat, notice },
            ViewChange::Error(message) => {
                warn!("Relay error on {}: {}", key, message);
                AppEvent::ChatErrorReported { chat, message }
            }
        };
        ctx.emit(event);
    }
}

use std::sync::Arc;

use crate::api::{ChatBackend, StreamingBackend};
use crate::chat::ChatConnector;
use crate::config::ClientConfig;
use crate::events::EventSender;
use crate::media::{MediaSource, PeerConnectionFactory};
use crate::signaling::SignalingTransport;

/// Shared handles cloned into every manager. Each seam is a trait object so
/// the managers run unchanged against the real backend or test doubles.
#[derive(Clone)]
pub struct ClientContext {
    pub config: Arc<ClientConfig>,
    pub streaming: Arc<dyn StreamingBackend>,
    pub chat_backend: Arc<dyn ChatBackend>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn MediaSource>,
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub chat_connector: Arc<dyn ChatConnector>,
    pub event_tx: EventSender,
}

impl ClientContext {
    pub fn user_id(&self) -> &str {
        &self.config.identity.user_id
    }

    /// Publish to the event bus. Having no subscribers is not an error.
    pub fn emit(&self, event: crate::events::AppEvent) {
        let _ = self.event_tx.send(event);
    }
}

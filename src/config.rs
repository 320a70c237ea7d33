use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::models::UserIdentity;

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:8001";

/// Everything the managers need to reach the backend and pace their timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub backend_url: String,
    /// Bearer token for REST calls and chat sockets.
    pub token: String,
    pub identity: UserIdentity,
    pub ice_servers: Vec<String>,
    /// How often the signaling inbox is polled.
    pub poll_interval: Duration,
    /// How long a viewer waits for the broadcaster's answer.
    pub answer_timeout: Duration,
    /// Fixed delay between chat reconnect attempts.
    pub reconnect_interval: Duration,
    /// Typing is cleared after this long without a keystroke.
    pub typing_quiet: Duration,
    pub history_limit: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            token: String::new(),
            identity: UserIdentity::default(),
            ice_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            poll_interval: Duration::from_secs(1),
            answer_timeout: Duration::from_secs(30),
            reconnect_interval: Duration::from_secs(3),
            typing_quiet: Duration::from_secs(2),
            history_limit: 50,
        }
    }
}

impl ClientConfig {
    /// Root of the REST API, e.g. `http://localhost:8001/api`.
    pub fn api_base(&self) -> String {
        format!("{}/api", self.backend_url.trim_end_matches('/'))
    }

    /// Chat socket for one room: `ws(s)://host/api/chat/ws/chat/{room}?token=…`.
    pub fn chat_socket_url(&self, room_id: &str) -> Result<Url, ChannelError> {
        let mut url = Url::parse(&self.backend_url)
            .map_err(|e| ChannelError::Connect(format!("bad backend url: {}", e)))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::Connect(format!("cannot use {} for sockets", url)))?;
        url.path_segments_mut()
            .map_err(|_| ChannelError::Connect("backend url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["api", "chat", "ws", "chat", room_id]);
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }

    /// Capture is only allowed when signaling stays on a secure or local
    /// origin.
    pub fn is_secure_context(&self) -> bool {
        let Ok(url) = Url::parse(&self.backend_url) else {
            return false;
        };
        if url.scheme() == "https" {
            return true;
        }
        matches!(
            url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
        )
    }
}

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use livecast_lib::api::{ChatBackend, SessionType, StreamingBackend};
use livecast_lib::chat::{ChatChannel, ChatConnector};
use livecast_lib::config::ClientConfig;
use livecast_lib::error::{ApiError, ChannelError, MediaAccessError, PeerError};
use livecast_lib::events::{create_event_bus, AppEvent, EventReceiver};
use livecast_lib::media::peer::{ConnectionState, PeerConnection, PeerConnectionFactory, PeerEvent};
use livecast_lib::media::{LocalMedia, LocalTrack, MediaSource, QualityPreset, TrackKind, TrackSource};
use livecast_lib::models::{ChatMessage, MessageType, Role, UserIdentity};
use livecast_lib::signaling::{
    IceCandidate, SdpType, SessionDescription, SignalData, SignalPayload, SignalingTransport,
};
use livecast_lib::state::ClientContext;

fn status(code: u16) -> ApiError {
    ApiError::Status {
        status: code,
        body: "mock failure".to_string(),
    }
}

// ============================================================
// REST backend
// ============================================================

#[derive(Default)]
pub struct MockBackend {
    calls: Mutex<Vec<String>>,
    sessions: AtomicUsize,
    pub fail_create_session: AtomicBool,
    pub fail_end_session: AtomicBool,
    pub fail_history: AtomicBool,
    history: Mutex<HashMap<String, Vec<ChatMessage>>>,
    history_delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn set_history(&self, room_id: &str, messages: Vec<ChatMessage>) {
        self.history.lock().unwrap().insert(room_id.to_string(), messages);
    }

    pub fn delay_history(&self, delay: Duration) {
        *self.history_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl StreamingBackend for MockBackend {
    async fn create_session(&self, model_id: &str, _session_type: SessionType) -> Result<String, ApiError> {
        self.record(format!("create_session {}", model_id));
        if self.fail_create_session.load(Ordering::SeqCst) {
            return Err(status(503));
        }
        let n = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("session-{}", n))
    }

    async fn end_session(&self, session_id: &str) -> Result<(), ApiError> {
        self.record(format!("end_session {}", session_id));
        if self.fail_end_session.load(Ordering::SeqCst) {
            return Err(status(500));
        }
        Ok(())
    }

    async fn update_model_status(&self, is_live: bool, is_available: bool) -> Result<(), ApiError> {
        self.record(format!("model_status live={} available={}", is_live, is_available));
        Ok(())
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn chat_history(
        &self,
        room_id: &str,
        limit: u32,
        before: Option<DateTime<Utc>>,
    ) -> Result<Vec<ChatMessage>, ApiError> {
        self.record(format!("chat_history {} limit={} before={}", room_id, limit, before.is_some()));
        let delay = *self.history_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(status(502));
        }
        let page = self.history.lock().unwrap().get(room_id).cloned().unwrap_or_default();
        Ok(page
            .into_iter()
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .collect())
    }

    async fn delete_message(&self, message_id: &str) -> Result<(), ApiError> {
        self.record(format!("delete_message {}", message_id));
        Ok(())
    }
}

// ============================================================
// Signaling relay
// ============================================================

#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(String, String, SignalData)>>,
    inboxes: Mutex<HashMap<String, VecDeque<SignalData>>>,
    receive_calls: AtomicUsize,
    /// Queue an answer from the target whenever an offer is sent.
    pub auto_answer: AtomicBool,
    pub fail_send: AtomicBool,
}

impl MockTransport {
    pub fn sent(&self) -> Vec<(String, String, SignalData)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|(_, _, s)| s.payload.kind()).collect()
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    /// Deliver `signal` on the next poll of `session_id`.
    pub fn push(&self, session_id: &str, signal: SignalData) {
        self.inboxes
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push_back(signal);
    }
}

#[async_trait]
impl SignalingTransport for MockTransport {
    async fn send(&self, session_id: &str, target_id: &str, message: &SignalData) -> Result<(), ApiError> {
        self.sent
            .lock()
            .unwrap()
            .push((session_id.to_string(), target_id.to_string(), message.clone()));
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(status(500));
        }
        if matches!(message.payload, SignalPayload::Offer { .. }) && self.auto_answer.load(Ordering::SeqCst) {
            self.push(
                session_id,
                SignalData::new(
                    session_id,
                    target_id,
                    &message.sender_id,
                    SignalPayload::Answer {
                        answer: SessionDescription::answer("v=0 mock answer"),
                    },
                ),
            );
        }
        Ok(())
    }

    async fn receive(&self, session_id: &str) -> Result<Vec<SignalData>, ApiError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inboxes
            .lock()
            .unwrap()
            .get_mut(session_id)
            .map(|queue| queue.drain(..).collect())
            .unwrap_or_default())
    }
}

// ============================================================
// Peer connections
// ============================================================

pub struct MockPeer {
    pub peer_id: String,
    pub connection_id: String,
    events: mpsc::Sender<PeerEvent>,
    log: Mutex<Vec<String>>,
    closed: AtomicBool,
    fail_close: bool,
    fail_negotiation: bool,
    connect_on_answer: bool,
}

impl MockPeer {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, entry: impl Into<String>) {
        self.log.lock().unwrap().push(entry.into());
    }

    pub async fn emit_state(&self, state: ConnectionState) {
        self.events
            .send(PeerEvent::StateChanged {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id.clone(),
                state,
            })
            .await
            .unwrap();
    }

    pub async fn emit_candidate(&self, candidate: &str) {
        self.events
            .send(PeerEvent::IceCandidate {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id.clone(),
                candidate: candidate_init(candidate),
            })
            .await
            .unwrap();
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(format!("add_track {}", track.kind()));
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.record(format!("replace_track {}", track.id()));
        Ok(())
    }

    async fn add_recv_transceivers(&self) -> Result<(), PeerError> {
        self.record("add_recv_transceivers");
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        self.record(format!("create_offer restart={}", ice_restart));
        Ok(SessionDescription::offer(format!("v=0 offer restart={}", ice_restart)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.record("create_answer");
        if self.fail_negotiation {
            return Err(PeerError::new("answer rejected"));
        }
        Ok(SessionDescription::answer("v=0 answer"))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(format!("set_local {:?}", desc.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(format!("set_remote {:?}", desc.sdp_type));
        if desc.sdp_type == SdpType::Answer && self.connect_on_answer {
            for (kind, id) in [(TrackKind::Audio, "remote-audio"), (TrackKind::Video, "remote-video")] {
                let _ = self.events.try_send(PeerEvent::RemoteTrack {
                    peer_id: self.peer_id.clone(),
                    connection_id: self.connection_id.clone(),
                    kind,
                    track_id: id.to_string(),
                });
            }
            let _ = self.events.try_send(PeerEvent::StateChanged {
                peer_id: self.peer_id.clone(),
                connection_id: self.connection_id.clone(),
                state: ConnectionState::Connected,
            });
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.record(format!("add_ice {}", candidate.candidate));
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        self.record("close");
        if self.fail_close {
            return Err(PeerError::new("close refused"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
    pub fail_close: AtomicBool,
    /// Peers created while set refuse to produce an answer.
    pub fail_negotiation: AtomicBool,
    pub connect_on_answer: AtomicBool,
}

impl MockPeerFactory {
    pub fn created(&self) -> Vec<Arc<MockPeer>> {
        self.created.lock().unwrap().clone()
    }

    pub fn last(&self) -> Arc<MockPeer> {
        self.created().last().cloned().expect("no peer connection created")
    }

    pub fn for_peer(&self, peer_id: &str) -> Vec<Arc<MockPeer>> {
        self.created().into_iter().filter(|p| p.peer_id == peer_id).collect()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = Arc::new(MockPeer {
            peer_id: peer_id.to_string(),
            connection_id: connection_id.to_string(),
            events,
            log: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            fail_close: self.fail_close.load(Ordering::SeqCst),
            fail_negotiation: self.fail_negotiation.load(Ordering::SeqCst),
            connect_on_answer: self.connect_on_answer.load(Ordering::SeqCst),
        });
        self.created.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================
// Capture
// ============================================================

#[derive(Debug, Clone, PartialEq)]
pub enum MediaMode {
    Ready,
    Fail(MediaAccessError),
    /// Never resolves, like an unanswered permission prompt.
    Hang,
}

pub struct MockMedia {
    mode: Mutex<MediaMode>,
    acquired: Mutex<Vec<LocalTrack>>,
    inner: TrackSource,
}

impl Default for MockMedia {
    fn default() -> Self {
        Self {
            mode: Mutex::new(MediaMode::Ready),
            acquired: Mutex::new(Vec::new()),
            inner: TrackSource::new("mock"),
        }
    }
}

impl MockMedia {
    pub fn set_mode(&self, mode: MediaMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Every track handed out so far, in acquisition order.
    pub fn tracks(&self) -> Vec<LocalTrack> {
        self.acquired.lock().unwrap().clone()
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks().iter().filter(|t| t.is_live()).count()
    }
}

#[async_trait]
impl MediaSource for MockMedia {
    async fn acquire(&self, quality: QualityPreset) -> Result<LocalMedia, MediaAccessError> {
        let mode = self.mode.lock().unwrap().clone();
        match mode {
            MediaMode::Ready => {
                let media = self.inner.acquire(quality).await?;
                self.acquired.lock().unwrap().extend(media.tracks().iter().cloned());
                Ok(media)
            }
            MediaMode::Fail(e) => Err(e),
            MediaMode::Hang => std::future::pending().await,
        }
    }
}

// ============================================================
// Chat sockets
// ============================================================

/// The relay's end of one mock chat socket.
pub struct ServerSide {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

impl ServerSide {
    pub async fn push(&self, frame: serde_json::Value) {
        self.to_client.send(frame.to_string()).await.unwrap();
    }

    /// Next frame the client wrote, decoded.
    pub async fn next_frame(&mut self) -> serde_json::Value {
        let text = tokio::time::timeout(Duration::from_secs(10), self.from_client.recv())
            .await
            .expect("client wrote nothing")
            .expect("client closed the socket");
        serde_json::from_str(&text).unwrap()
    }
}

#[derive(Default)]
pub struct MockConnector {
    connects: Mutex<Vec<String>>,
    servers: Mutex<HashMap<String, VecDeque<ServerSide>>>,
    pub refuse: AtomicBool,
}

impl MockConnector {
    pub fn connects(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }

    pub fn connect_count(&self, room_id: &str) -> usize {
        self.connects().iter().filter(|r| *r == room_id).count()
    }

    /// Wait until the client has opened a socket for `room_id`.
    pub async fn accept(&self, room_id: &str) -> ServerSide {
        for _ in 0..500 {
            let next = self
                .servers
                .lock()
                .unwrap()
                .get_mut(room_id)
                .and_then(|queue| queue.pop_front());
            if let Some(server) = next {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no socket opened for {}", room_id);
    }
}

#[async_trait]
impl ChatConnector for MockConnector {
    async fn connect(&self, room_id: &str) -> Result<ChatChannel, ChannelError> {
        self.connects.lock().unwrap().push(room_id.to_string());
        if self.refuse.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("refused".to_string()));
        }
        let (outgoing, from_client) = mpsc::channel(64);
        let (to_client, incoming) = mpsc::channel(64);
        self.servers
            .lock()
            .unwrap()
            .entry(room_id.to_string())
            .or_default()
            .push_back(ServerSide { to_client, from_client });
        Ok(ChatChannel { outgoing, incoming })
    }
}

// ============================================================
// Harness
// ============================================================

pub struct Harness {
    pub ctx: ClientContext,
    pub backend: Arc<MockBackend>,
    pub transport: Arc<MockTransport>,
    pub peers: Arc<MockPeerFactory>,
    pub media: Arc<MockMedia>,
    pub connector: Arc<MockConnector>,
    pub events: EventReceiver,
}

impl Harness {
    pub fn new(user_id: &str) -> Self {
        Self::with_identity(UserIdentity {
            user_id: user_id.to_string(),
            username: format!("{}-name", user_id),
            role: Role::Viewer,
            model_room_id: None,
        })
    }

    pub fn with_identity(identity: UserIdentity) -> Self {
        let config = ClientConfig {
            backend_url: "http://localhost:8001".to_string(),
            identity,
            ..Default::default()
        };
        let backend = Arc::new(MockBackend::default());
        let transport = Arc::new(MockTransport::default());
        let peers = Arc::new(MockPeerFactory::default());
        let media = Arc::new(MockMedia::default());
        let connector = Arc::new(MockConnector::default());
        let (event_tx, events) = create_event_bus();

        let ctx = ClientContext {
            config: Arc::new(config),
            streaming: backend.clone(),
            chat_backend: backend.clone(),
            signaling: transport.clone(),
            media: media.clone(),
            peers: peers.clone(),
            chat_connector: connector.clone(),
            event_tx,
        };
        Self {
            ctx,
            backend,
            transport,
            peers,
            media,
            connector,
            events,
        }
    }

    /// Everything emitted since the last drain.
    pub fn drain_events(&mut self) -> Vec<AppEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn candidate_init(candidate: &str) -> IceCandidate {
    IceCandidate {
        candidate: candidate.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn chat_message(id: &str, room_id: &str, sender_id: &str, secs: i64) -> ChatMessage {
    ChatMessage {
        id: id.to_string(),
        room_id: Some(room_id.to_string()),
        sender_id: sender_id.to_string(),
        sender_username: format!("{}-name", sender_id),
        sender_role: Role::Viewer,
        content: format!("hello from {}", id),
        created_at: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        message_type: MessageType::Text,
        tip_amount: None,
        is_deleted: false,
    }
}

/// Relay JSON for a live `chat_message` frame.
pub fn chat_frame(message: &ChatMessage) -> serde_json::Value {
    serde_json::json!({ "type": "chat_message", "message": message })
}

/// Let spawned tasks run until they block.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

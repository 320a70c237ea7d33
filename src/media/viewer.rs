use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::api::SessionType;
use crate::error::{PeerError, StreamError};
use crate::events::AppEvent;
use crate::signaling::{PollHandle, SeenSignals, SignalData, SignalPayload, SignalPoller};
use crate::state::ClientContext;

use super::link::{LinkEffect, ViewerLink};
use super::peer::{ConnectionState, PeerConnection, PeerEvent};
use super::quality::QualityPreset;
use super::source::TrackKind;
use super::{stream_channels, CancelToken, Canceller, StreamInbox, StreamInput, StreamOutlets};

/// What the viewer is receiving from the broadcaster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemoteStream {
    pub tracks: Vec<(TrackKind, String)>,
}

impl RemoteStream {
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|(k, _)| *k == kind)
    }
}

struct ViewerSession {
    broadcaster_id: String,
    session_id: String,
    connection_id: String,
    pc: Arc<dyn PeerConnection>,
    link: ViewerLink,
    remote_stream: Option<RemoteStream>,
    poller: Option<PollHandle>,
    awaiting_answer: bool,
    seen: SeenSignals,
    remote_candidates: HashSet<String>,
}

/// Holds the viewer's single connection to a broadcaster.
pub struct Viewer {
    ctx: ClientContext,
    viewer_id: String,
    session: Option<ViewerSession>,
    outlets: StreamOutlets,
    inbox: StreamInbox,
    canceller: Canceller,
}

impl Viewer {
    pub fn new(ctx: ClientContext) -> Self {
        let (outlets, inbox) = stream_channels();
        let viewer_id = ctx.user_id().to_string();
        Self {
            ctx,
            viewer_id,
            session: None,
            outlets,
            inbox,
            canceller: Canceller::new(),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.viewer_id
    }

    pub fn broadcaster_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.broadcaster_id.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session
            .as_ref()
            .map(|s| s.link.state)
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.connection_state(),
            ConnectionState::New | ConnectionState::Connecting
        ) && self.session.is_some()
    }

    pub fn has_remote_stream(&self) -> bool {
        self.remote_stream().is_some()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.session.as_ref().and_then(|s| s.remote_stream.as_ref())
    }

    /// Interrupts an in-flight `connect`.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    fn set_state(&mut self, state: ConnectionState) {
        let Some(session) = self.session.as_mut() else { return };
        session.link.state = state;
        let broadcaster_id = session.broadcaster_id.clone();
        self.ctx.emit(AppEvent::ConnectionStateChanged { broadcaster_id, state });
    }

    /// Connect to `broadcaster_id`, replacing any current session. Returns
    /// once the broadcaster's answer has been applied.
    pub async fn connect(&mut self, broadcaster_id: &str) -> Result<(), StreamError> {
        let token = self.canceller.token();
        if self.session.is_some() {
            if let Err(e) = self.disconnect().await {
                warn!("Previous session did not close cleanly: {}", e);
            }
        }

        let session_id = self
            .ctx
            .streaming
            .create_session(broadcaster_id, SessionType::Public)
            .await?;
        let connection_id = uuid::Uuid::new_v4().to_string();
        let pc = match self
            .ctx
            .peers
            .create(broadcaster_id, &connection_id, self.outlets.peer_events.clone())
            .await
        {
            Ok(pc) => pc,
            Err(e) => {
                if let Err(end_err) = self.ctx.streaming.end_session(&session_id).await {
                    debug!("Ending abandoned session {}: {}", session_id, end_err);
                }
                return Err(e.into());
            }
        };

        info!("Connecting to {} in session {}", broadcaster_id, session_id);
        self.session = Some(ViewerSession {
            broadcaster_id: broadcaster_id.to_string(),
            session_id: session_id.clone(),
            connection_id,
            pc: pc.clone(),
            link: ViewerLink::default(),
            remote_stream: None,
            poller: None,
            awaiting_answer: true,
            seen: SeenSignals::default(),
            remote_candidates: HashSet::new(),
        });
        self.set_state(ConnectionState::New);

        let offer = async {
            pc.add_recv_transceivers().await?;
            let offer = pc.create_offer(false).await?;
            pc.set_local_description(offer.clone()).await?;
            Ok::<_, PeerError>(offer)
        };
        let offer = match offer.await {
            Ok(offer) => offer,
            Err(e) => {
                self.abandon().await;
                return Err(e.into());
            }
        };

        self.send_to_broadcaster(SignalPayload::Offer {
            offer,
            ice_restart: false,
        })
        .await;
        self.set_state(ConnectionState::Connecting);

        let poller = SignalPoller::start(
            self.ctx.signaling.clone(),
            &session_id,
            self.ctx.config.poll_interval,
            self.outlets.signals.clone(),
        );
        if let Some(session) = self.session.as_mut() {
            session.poller = Some(poller);
        }

        self.await_answer(broadcaster_id, token).await
    }

    async fn await_answer(
        &mut self,
        broadcaster_id: &str,
        mut token: CancelToken,
    ) -> Result<(), StreamError> {
        let waited = self.ctx.config.answer_timeout;
        let wait = async {
            while self.session.as_ref().is_some_and(|s| s.awaiting_answer) {
                match self.inbox.recv().await {
                    Some(input) => self.apply(input).await,
                    None => break,
                }
            }
        };

        let outcome = tokio::select! {
            done = tokio::time::timeout(waited, wait) => done.map_err(|_| StreamError::SignalingTimeout {
                broadcaster_id: broadcaster_id.to_string(),
                waited,
            }),
            _ = token.cancelled() => Err(StreamError::Cancelled),
        };

        match outcome {
            Ok(()) if self.session.is_some() => {
                info!("Answer from {} applied", broadcaster_id);
                Ok(())
            }
            Ok(()) => Err(StreamError::NotConnected),
            Err(e) => {
                warn!("Connect to {} abandoned: {}", broadcaster_id, e);
                self.abandon().await;
                Err(e)
            }
        }
    }

    /// Drop a half-built session without surfacing teardown errors.
    async fn abandon(&mut self) {
        if let Err(e) = self.disconnect().await {
            debug!("Cleanup after failed connect: {}", e);
        }
    }

    /// Close the connection and end the backend session. Does nothing when
    /// not connected.
    pub async fn disconnect(&mut self) -> Result<(), StreamError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Some(mut poller) = session.poller.take() {
            poller.stop();
        }
        if let Err(e) = session.pc.close().await {
            warn!("Closing connection to {} failed: {}", session.broadcaster_id, e);
        }
        session.remote_stream = None;
        self.ctx.emit(AppEvent::ConnectionStateChanged {
            broadcaster_id: session.broadcaster_id.clone(),
            state: ConnectionState::Closed,
        });
        info!("Disconnected from {}", session.broadcaster_id);

        self.ctx.streaming.end_session(&session.session_id).await?;
        Ok(())
    }

    /// Ask the broadcaster to switch presets. Advisory only.
    pub async fn request_quality_change(&mut self, quality: QualityPreset) -> Result<(), StreamError> {
        if self.session.is_none() {
            return Err(StreamError::NotConnected);
        }
        self.send_to_broadcaster(SignalPayload::QualityRequest { quality }).await;
        Ok(())
    }

    /// Wait for the next signal or peer event.
    pub async fn next_input(&mut self) -> Option<StreamInput> {
        self.inbox.recv().await
    }

    pub async fn apply(&mut self, input: StreamInput) {
        match input {
            StreamInput::Signal(signal) => self.handle_signal(signal).await,
            StreamInput::Peer(event) => self.handle_peer_event(event).await,
        }
    }

    /// Apply whatever input is next. Returns `false` when the inbox closed.
    pub async fn process_next(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.apply(input).await;
                true
            }
            None => false,
        }
    }

    pub async fn handle_signal(&mut self, signal: SignalData) {
        let Some(session) = self.session.as_mut() else {
            debug!("Dropping {} signal with no session", signal.payload.kind());
            return;
        };
        if !signal.session_id.is_empty() && signal.session_id != session.session_id {
            debug!("Dropping signal for stale session {}", signal.session_id);
            return;
        }
        if !session.seen.first_delivery(&signal) {
            return;
        }

        match signal.payload {
            SignalPayload::Answer { answer } => {
                if !session.awaiting_answer {
                    debug!("Ignoring answer that arrived after negotiation");
                    return;
                }
                session.awaiting_answer = false;
                if let Err(e) = session.pc.set_remote_description(answer).await {
                    let reason = e.to_string();
                    error!("Applying answer from {} failed: {}", session.broadcaster_id, reason);
                    let broadcaster_id = session.broadcaster_id.clone();
                    self.ctx.emit(AppEvent::StreamFailed { broadcaster_id, reason });
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                if !session.remote_candidates.insert(candidate.candidate.clone()) {
                    return;
                }
                if let Err(e) = session.pc.add_ice_candidate(candidate).await {
                    warn!("Broadcaster candidate rejected: {}", e);
                }
            }
            other @ (SignalPayload::Offer { .. } | SignalPayload::QualityRequest { .. }) => {
                debug!("Ignoring {} addressed to a viewer", other.kind());
            }
            SignalPayload::Unknown => {
                info!("Ignoring unrecognized signal from {}", signal.sender_id);
            }
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self
            .session
            .as_ref()
            .is_some_and(|s| s.connection_id == event.connection_id());
        if !current {
            debug!("Ignoring event from stale connection to {}", event.peer_id());
            return;
        }

        match event {
            PeerEvent::StateChanged { state, .. } => {
                let Some(session) = self.session.as_mut() else { return };
                let (link, effects) = session.link.on_state(state);
                session.link = link;
                let broadcaster_id = session.broadcaster_id.clone();
                self.ctx.emit(AppEvent::ConnectionStateChanged {
                    broadcaster_id: broadcaster_id.clone(),
                    state,
                });
                for effect in effects {
                    match effect {
                        LinkEffect::RestartIce => self.restart_ice().await,
                        LinkEffect::SurfaceFailure => {
                            error!("Connection to {} failed after ICE restart", broadcaster_id);
                            self.ctx.emit(AppEvent::StreamFailed {
                                broadcaster_id: broadcaster_id.clone(),
                                reason: "ICE failed after restart".to_string(),
                            });
                        }
                        LinkEffect::DropViewer => {}
                    }
                }
            }
            PeerEvent::IceCandidate { candidate, .. } => {
                self.send_to_broadcaster(SignalPayload::IceCandidate { candidate })
                    .await;
            }
            PeerEvent::RemoteTrack { kind, track_id, .. } => {
                let Some(session) = self.session.as_mut() else { return };
                let stream = session.remote_stream.get_or_insert_with(RemoteStream::default);
                stream.tracks.push((kind, track_id.clone()));
                let broadcaster_id = session.broadcaster_id.clone();
                self.ctx.emit(AppEvent::RemoteTrackAdded {
                    broadcaster_id,
                    kind,
                    track_id,
                });
            }
        }
    }

    async fn restart_ice(&mut self) {
        let Some(session) = self.session.as_mut() else { return };
        info!("Restarting ICE with {}", session.broadcaster_id);
        let pc = session.pc.clone();
        let offer = async {
            let offer = pc.create_offer(true).await?;
            pc.set_local_description(offer.clone()).await?;
            Ok::<_, PeerError>(offer)
        };
        match offer.await {
            Ok(offer) => {
                session.awaiting_answer = true;
                self.send_to_broadcaster(SignalPayload::Offer {
                    offer,
                    ice_restart: true,
                })
                .await;
            }
            Err(e) => {
                let broadcaster_id = session.broadcaster_id.clone();
                error!("ICE restart offer for {} failed: {}", broadcaster_id, e);
                self.ctx.emit(AppEvent::StreamFailed {
                    broadcaster_id,
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Failures are logged, not retried.
    async fn send_to_broadcaster(&self, payload: SignalPayload) {
        let Some(session) = self.session.as_ref() else { return };
        let kind = payload.kind();
        let message = SignalData::new(
            &session.session_id,
            &self.viewer_id,
            &session.broadcaster_id,
            payload,
        );
        if let Err(e) = self
            .ctx
            .signaling
            .send(&session.session_id, &session.broadcaster_id, &message)
            .await
        {
            error!("Failed to send {} to {}: {}", kind, session.broadcaster_id, e);
        }
    }
}

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::api::SessionType;
use crate::error::{MediaAccessError, PeerError, StreamError, TeardownFailure};
use crate::events::AppEvent;
use crate::signaling::{
    IceCandidate, PollHandle, SeenSignals, SessionDescription, SignalData, SignalPayload,
    SignalPoller,
};
use crate::state::ClientContext;

use super::link::{BroadcastLink, LinkEffect};
use super::peer::{ConnectionState, PeerConnection, PeerEvent};
use super::quality::QualityPreset;
use super::source::LocalMedia;
use super::{stream_channels, Canceller, StreamInbox, StreamInput, StreamOutlets};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Idle,
    Starting,
    Live,
    Stopping,
}

/// The broadcaster's live session as issued by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamSession {
    pub session_id: String,
    pub broadcaster_id: String,
    pub quality: QualityPreset,
    pub status: StreamStatus,
}

struct ViewerConnection {
    /// Signaling session the viewer polls; answers and candidates go there.
    reply_session: String,
    connection_id: String,
    pc: Arc<dyn PeerConnection>,
    link: BroadcastLink,
    remote_candidates: HashSet<String>,
}

/// Owns the local media and one peer connection per viewer.
pub struct Broadcaster {
    ctx: ClientContext,
    broadcaster_id: String,
    status: StreamStatus,
    session: Option<StreamSession>,
    media: Option<LocalMedia>,
    viewers: HashMap<String, ViewerConnection>,
    poller: Option<PollHandle>,
    seen: SeenSignals,
    outlets: StreamOutlets,
    inbox: StreamInbox,
    canceller: Canceller,
}

impl Broadcaster {
    pub fn new(ctx: ClientContext) -> Self {
        let (outlets, inbox) = stream_channels();
        let broadcaster_id = ctx.user_id().to_string();
        Self {
            ctx,
            broadcaster_id,
            status: StreamStatus::Idle,
            session: None,
            media: None,
            viewers: HashMap::new(),
            poller: None,
            seen: SeenSignals::default(),
            outlets,
            inbox,
            canceller: Canceller::new(),
        }
    }

    pub fn broadcaster_id(&self) -> &str {
        &self.broadcaster_id
    }

    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn is_streaming(&self) -> bool {
        self.status == StreamStatus::Live
    }

    pub fn stream_quality(&self) -> Option<QualityPreset> {
        self.session.as_ref().map(|s| s.quality)
    }

    pub fn session(&self) -> Option<&StreamSession> {
        self.session.as_ref()
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    /// Connected viewer ids, sorted.
    pub fn viewers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.viewers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.len()
    }

    pub fn viewer_state(&self, viewer_id: &str) -> Option<ConnectionState> {
        self.viewers.get(viewer_id).map(|v| v.link.state)
    }

    /// Interrupts an in-flight `change_quality`.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    fn set_status(&mut self, status: StreamStatus) {
        self.status = status;
        if let Some(session) = self.session.as_mut() {
            session.status = status;
        }
        self.ctx.emit(AppEvent::StreamStatusChanged { status });
    }

    /// Acquire capture, go live with the backend and start listening for
    /// viewers. Anything acquired before a failure is released again.
    pub async fn start_streaming(&mut self, quality: QualityPreset) -> Result<(), StreamError> {
        if self.status != StreamStatus::Idle {
            return Err(StreamError::AlreadyStreaming);
        }
        if !self.ctx.config.is_secure_context() {
            return Err(MediaAccessError::InsecureContext.into());
        }

        self.set_status(StreamStatus::Starting);
        info!("Starting stream at {} for {}", quality, self.broadcaster_id);

        let mut media = match self.ctx.media.acquire(quality).await {
            Ok(media) => media,
            Err(e) => {
                warn!("Media acquisition failed: {}", e);
                self.set_status(StreamStatus::Idle);
                return Err(e.into());
            }
        };

        if let Err(e) = self.ctx.streaming.update_model_status(true, true).await {
            media.stop();
            self.set_status(StreamStatus::Idle);
            return Err(e.into());
        }

        let session_id = match self
            .ctx
            .streaming
            .create_session(&self.broadcaster_id, SessionType::Public)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                media.stop();
                if let Err(revert) = self.ctx.streaming.update_model_status(false, true).await {
                    warn!("Failed to revert live status: {}", revert);
                }
                self.set_status(StreamStatus::Idle);
                return Err(e.into());
            }
        };

        self.poller = Some(SignalPoller::start(
            self.ctx.signaling.clone(),
            &session_id,
            self.ctx.config.poll_interval,
            self.outlets.signals.clone(),
        ));
        self.media = Some(media);
        self.session = Some(StreamSession {
            session_id: session_id.clone(),
            broadcaster_id: self.broadcaster_id.clone(),
            quality,
            status: StreamStatus::Live,
        });
        self.set_status(StreamStatus::Live);
        self.ctx.emit(AppEvent::StreamStarted {
            session_id: session_id.clone(),
            quality,
        });
        info!("Stream {} is live", session_id);
        Ok(())
    }

    /// Tear everything down in order: signaling, viewers, local tracks,
    /// backend session, live status. Every step runs even if an earlier one
    /// failed; failures are reported together.
    pub async fn stop_streaming(&mut self) -> Result<(), StreamError> {
        if self.status == StreamStatus::Idle {
            return Err(StreamError::NotStreaming);
        }
        self.set_status(StreamStatus::Stopping);
        let mut failures = Vec::new();

        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }

        for (viewer_id, viewer) in self.viewers.drain() {
            if let Err(e) = viewer.pc.close().await {
                failures.push(TeardownFailure {
                    step: "close viewer connection",
                    reason: format!("{}: {}", viewer_id, e),
                });
            }
            self.ctx.emit(AppEvent::ViewerLeft { viewer_id });
        }

        if let Some(mut media) = self.media.take() {
            media.stop();
        }

        let session = self.session.take();
        if let Some(session) = &session {
            if let Err(e) = self.ctx.streaming.end_session(&session.session_id).await {
                failures.push(TeardownFailure {
                    step: "end session",
                    reason: e.to_string(),
                });
            }
        }

        if let Err(e) = self.ctx.streaming.update_model_status(false, true).await {
            failures.push(TeardownFailure {
                step: "clear live status",
                reason: e.to_string(),
            });
        }

        self.seen = SeenSignals::default();
        self.set_status(StreamStatus::Idle);
        self.ctx.emit(AppEvent::StreamStopped {
            session_id: session.map(|s| s.session_id),
        });

        if failures.is_empty() {
            info!("Stream stopped");
            Ok(())
        } else {
            for failure in &failures {
                warn!("Teardown step '{}' failed: {}", failure.step, failure.reason);
            }
            Err(StreamError::PartialTeardown(failures))
        }
    }

    /// Answer a viewer's offer. A second offer from the same viewer
    /// renegotiates the existing connection instead of adding another.
    pub async fn handle_viewer_offer(
        &mut self,
        viewer_id: &str,
        reply_session: &str,
        offer: SessionDescription,
    ) -> Result<(), PeerError> {
        if self.status != StreamStatus::Live {
            return Err(PeerError::new("not streaming"));
        }

        if let Some(existing) = self.viewers.get_mut(viewer_id) {
            debug!("Renegotiating with viewer {}", viewer_id);
            existing.reply_session = reply_session.to_string();
            let pc = existing.pc.clone();
            let answer = negotiate(pc.as_ref(), offer).await?;
            self.send_to_viewer(viewer_id, SignalPayload::Answer { answer }).await;
            return Ok(());
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let pc = self
            .ctx
            .peers
            .create(viewer_id, &connection_id, self.outlets.peer_events.clone())
            .await?;

        let setup = async {
            if let Some(media) = &self.media {
                for track in media.tracks() {
                    pc.add_track(track).await?;
                }
            }
            negotiate(pc.as_ref(), offer).await
        };
        let answer = match setup.await {
            Ok(answer) => answer,
            Err(e) => {
                if let Err(close_err) = pc.close().await {
                    debug!("Closing failed connection to {}: {}", viewer_id, close_err);
                }
                return Err(e);
            }
        };

        self.viewers.insert(
            viewer_id.to_string(),
            ViewerConnection {
                reply_session: reply_session.to_string(),
                connection_id,
                pc,
                link: BroadcastLink::default(),
                remote_candidates: HashSet::new(),
            },
        );
        info!("Viewer {} joined ({} watching)", viewer_id, self.viewers.len());
        self.ctx.emit(AppEvent::ViewerJoined {
            viewer_id: viewer_id.to_string(),
        });
        self.send_to_viewer(viewer_id, SignalPayload::Answer { answer }).await;
        Ok(())
    }

    /// Switch capture to `quality`, swapping tracks on every connection in
    /// place. The new capture is acquired before the old one is released, so
    /// a failure leaves the current stream untouched.
    pub async fn change_quality(&mut self, quality: QualityPreset) -> Result<(), StreamError> {
        if self.status != StreamStatus::Live {
            return Err(StreamError::NotStreaming);
        }
        let mut token = self.canceller.token();
        let source = self.ctx.media.clone();

        let acquired = tokio::select! {
            result = source.acquire(quality) => result,
            _ = token.cancelled() => {
                info!("Quality change to {} cancelled", quality);
                return Err(StreamError::Cancelled);
            }
        };
        let new_media = match acquired {
            Ok(media) => media,
            Err(e) => {
                warn!("Keeping current quality, re-acquisition failed: {}", e);
                return Err(e.into());
            }
        };

        for (viewer_id, viewer) in &self.viewers {
            for track in new_media.tracks() {
                if let Err(e) = viewer.pc.replace_track(track).await {
                    warn!("Track swap for viewer {} failed: {}", viewer_id, e);
                }
            }
        }

        if let Some(mut old) = self.media.replace(new_media) {
            old.stop();
        }
        if let Some(session) = self.session.as_mut() {
            session.quality = quality;
        }
        info!("Stream quality changed to {}", quality);
        self.ctx.emit(AppEvent::StreamQualityChanged { quality });
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

    pub async fn handle_signal(&mut self, signal: SignalData) {
        if self.status != StreamStatus::Live {
            debug!("Dropping {} signal while {:?}", signal.payload.kind(), self.status);
            return;
        }
        if !self.seen.first_delivery(&signal) {
            debug!("Ignoring redelivered {} from {}", signal.payload.kind(), signal.sender_id);
            return;
        }

        if signal.sender_id.is_empty() {
            warn!("Dropping {} signal with no sender", signal.payload.kind());
            return;
        }

        let viewer_id = signal.sender_id;
        match signal.payload {
            SignalPayload::Offer { offer, .. } => {
                let reply_session = if signal.session_id.is_empty() {
                    self.session.as_ref().map(|s| s.session_id.clone()).unwrap_or_default()
                } else {
                    signal.session_id
                };
                if let Err(e) = self.handle_viewer_offer(&viewer_id, &reply_session, offer).await {
                    warn!("Negotiation with viewer {} failed: {}", viewer_id, e);
                    self.ctx.emit(AppEvent::ViewerError {
                        viewer_id,
                        message: e.to_string(),
                    });
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                self.add_viewer_candidate(&viewer_id, candidate).await;
            }
            SignalPayload::QualityRequest { quality } => {
                info!("Viewer {} asked for {}", viewer_id, quality);
                self.ctx.emit(AppEvent::QualityRequested { viewer_id, quality });
            }
            SignalPayload::Answer { .. } => {
                debug!("Ignoring unexpected answer from {}", viewer_id);
            }
            SignalPayload::Unknown => {
                info!("Ignoring unrecognized signal from {}", viewer_id);
            }
        }
    }

    async fn add_viewer_candidate(&mut self, viewer_id: &str, candidate: IceCandidate) {
        let Some(viewer) = self.viewers.get_mut(viewer_id) else {
            debug!("ICE candidate from unknown viewer {}", viewer_id);
            return;
        };
        if !viewer.remote_candidates.insert(candidate.candidate.clone()) {
            return;
        }
        if let Err(e) = viewer.pc.add_ice_candidate(candidate).await {
            warn!("Viewer {} candidate rejected: {}", viewer_id, e);
        }
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        let current = self
            .viewers
            .get(event.peer_id())
            .is_some_and(|v| v.connection_id == event.connection_id());
        if !current {
            debug!("Ignoring event from stale connection to {}", event.peer_id());
            return;
        }

        match event {
            PeerEvent::StateChanged { peer_id, state, .. } => {
                let Some(viewer) = self.viewers.get_mut(&peer_id) else { return };
                let (link, effects) = viewer.link.on_state(state);
                viewer.link = link;
                self.ctx.emit(AppEvent::ViewerStateChanged {
                    viewer_id: peer_id.clone(),
                    state,
                });
                for effect in effects {
                    if effect == LinkEffect::DropViewer {
                        self.remove_viewer(&peer_id).await;
                    }
                }
            }
            PeerEvent::IceCandidate { peer_id, candidate, .. } => {
                self.send_to_viewer(&peer_id, SignalPayload::IceCandidate { candidate })
                    .await;
            }
            PeerEvent::RemoteTrack { peer_id, kind, .. } => {
                debug!("Ignoring inbound {} track from viewer {}", kind, peer_id);
            }
        }
    }

    async fn remove_viewer(&mut self, viewer_id: &str) {
        let Some(viewer) = self.viewers.remove(viewer_id) else { return };
        if let Err(e) = viewer.pc.close().await {
            warn!("Closing connection to {} failed: {}", viewer_id, e);
        }
        info!("Viewer {} left ({} watching)", viewer_id, self.viewers.len());
        self.ctx.emit(AppEvent::ViewerLeft {
            viewer_id: viewer_id.to_string(),
        });
    }

    /// Deliver to one viewer's signaling session. Failures are logged, not
    /// retried.
    async fn send_to_viewer(&self, viewer_id: &str, payload: SignalPayload) {
        let Some(viewer) = self.viewers.get(viewer_id) else { return };
        let kind = payload.kind();
        let message = SignalData::new(&viewer.reply_session, &self.broadcaster_id, viewer_id, payload);
        if let Err(e) = self
            .ctx
            .signaling
            .send(&viewer.reply_session, viewer_id, &message)
            .await
        {
            error!("Failed to send {} to viewer {}: {}", kind, viewer_id, e);
        }
    }
}

async fn negotiate(
    pc: &dyn PeerConnection,
    offer: SessionDescription,
) -> Result<SessionDescription, PeerError> {
    pc.set_remote_description(offer).await?;
    let answer = pc.create_answer().await?;
    pc.set_local_description(answer.clone()).await?;
    Ok(answer)
}

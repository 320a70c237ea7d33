use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as WrtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use crate::error::PeerError;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};

use super::source::{LocalTrack, TrackKind};

/// Lifecycle of one peer connection, mirroring ICE/DTLS progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
            RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
            RTCPeerConnectionState::Connected => ConnectionState::Connected,
            RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
            RTCPeerConnectionState::Failed => ConnectionState::Failed,
            RTCPeerConnectionState::Closed => ConnectionState::Closed,
        }
    }
}

/// Events emitted by peer connections back to their manager. Each carries
/// the id of the connection that produced it so late events from a replaced
/// connection can be told apart.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        peer_id: String,
        connection_id: String,
        state: ConnectionState,
    },
    /// Gathered locally; must go to the remote peer.
    IceCandidate {
        peer_id: String,
        connection_id: String,
        candidate: IceCandidate,
    },
    RemoteTrack {
        peer_id: String,
        connection_id: String,
        kind: TrackKind,
        track_id: String,
    },
}

impl PeerEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            PeerEvent::StateChanged { peer_id, .. }
            | PeerEvent::IceCandidate { peer_id, .. }
            | PeerEvent::RemoteTrack { peer_id, .. } => peer_id,
        }
    }

    pub fn connection_id(&self) -> &str {
        match self {
            PeerEvent::StateChanged { connection_id, .. }
            | PeerEvent::IceCandidate { connection_id, .. }
            | PeerEvent::RemoteTrack { connection_id, .. } => connection_id,
        }
    }
}

/// The operations the managers need from one peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swap the outgoing track of the same kind without renegotiating.
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Receive-only audio and video, for viewers.
    async fn add_recv_transceivers(&self) -> Result<(), PeerError>;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Build a connection to `peer_id` whose callbacks report on `events`
    /// tagged with `connection_id`.
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// webrtc-rs backed factory.
#[derive(Debug, Clone)]
pub struct RtcPeerFactory {
    ice_servers: Vec<String>,
}

impl RtcPeerFactory {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        peer_id: &str,
        connection_id: &str,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media_engine = WrtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::new(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| PeerError::new(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| PeerError::new(format!("Failed to create peer connection: {}", e)))?,
        );

        let pid = peer_id.to_string();
        let cid = connection_id.to_string();

        let (tx, p, c) = (events.clone(), pid.clone(), cid.clone());
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let (tx, peer_id, connection_id) = (tx.clone(), p.clone(), c.clone());
            Box::pin(async move {
                info!("WebRTC connection to {} state: {}", peer_id, state);
                let _ = tx
                    .send(PeerEvent::StateChanged {
                        peer_id,
                        connection_id,
                        state: state.into(),
                    })
                    .await;
            })
        }));

        let (tx, p, c) = (events.clone(), pid.clone(), cid.clone());
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let (tx, peer_id, connection_id) = (tx.clone(), p.clone(), c.clone());
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    RTPCodecType::Unspecified => return,
                };
                info!("Received remote {} track from {}", kind, peer_id);
                let _ = tx
                    .send(PeerEvent::RemoteTrack {
                        peer_id,
                        connection_id,
                        kind,
                        track_id: track.id(),
                    })
                    .await;
            })
        }));

        let (tx, p, c) = (events, pid, cid);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let (tx, peer_id, connection_id) = (tx.clone(), p.clone(), c.clone());
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("Failed to serialize ICE candidate: {}", e);
                        return;
                    }
                };
                let _ = tx
                    .send(PeerEvent::IceCandidate {
                        peer_id,
                        connection_id,
                        candidate: init.into(),
                    })
                    .await;
            })
        }));

        info!("Created WebRTC peer connection for {}", peer_id);
        Ok(Arc::new(RtcPeer {
            pc,
            senders: Mutex::new(HashMap::new()),
        }))
    }
}

/// An `RTCPeerConnection` plus the senders of the tracks it publishes.
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtp_sender = self
            .pc
            .add_track(track.rtc_track())
            .await
            .map_err(|e| PeerError::new(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // Read incoming RTCP packets (needed by webrtc crate for proper operation)
        let reader = rtp_sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.insert(track.kind(), rtp_sender);
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let sender = self
            .senders
            .lock()
            .await
            .get(&track.kind())
            .cloned()
            .ok_or_else(|| PeerError::new(format!("No {} sender to replace", track.kind())))?;
        sender
            .replace_track(Some(track.rtc_track()))
            .await
            .map_err(|e| PeerError::new(format!("Failed to replace {} track: {}", track.kind(), e)))
    }

    async fn add_recv_transceivers(&self) -> Result<(), PeerError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| PeerError::new(format!("Failed to add {:?} transceiver: {}", kind, e)))?;
        }
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            voice_activity_detection: false,
        };
        let offer = self
            .pc
            .create_offer(Some(options))
            .await
            .map_err(|e| PeerError::new(format!("Failed to create offer: {}", e)))?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::new(format!("Failed to create answer: {}", e)))?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::new(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| PeerError::new(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| PeerError::new(format!("Failed to add ICE candidate: {}", e)))?;
        debug!("Added remote ICE candidate");
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.senders.lock().await.clear();
        self.pc
            .close()
            .await
            .map_err(|e| PeerError::new(format!("Error closing peer connection: {}", e)))
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let converted = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            return Ok(rollback);
        }
    };
    converted.map_err(|e| PeerError::new(format!("Invalid SDP: {}", e)))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => return Err(PeerError::new("Unspecified SDP type")),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

pub mod poller;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::media::quality::QualityPreset;

pub use poller::{PollHandle, SignalPoller};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Browser-compatible `{type, sdp}` session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// Browser-compatible ICE candidate init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Type-specific body, discriminated by `type` like the browser clients send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        offer: SessionDescription,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        ice_restart: bool,
    },
    Answer {
        answer: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
    QualityRequest {
        quality: QualityPreset,
    },
    /// Anything newer than this client understands.
    #[serde(other)]
    Unknown,
}

impl SignalPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::QualityRequest { .. } => "quality-request",
            SignalPayload::Unknown => "unknown",
        }
    }
}

/// The envelope stored by the relay as `signal_data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalData {
    /// Unique per envelope; used to drop redelivered signals.
    #[serde(default)]
    pub signal_id: Option<String>,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub target_id: String,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

impl SignalData {
    pub fn new(session_id: &str, sender_id: &str, target_id: &str, payload: SignalPayload) -> Self {
        Self {
            signal_id: Some(uuid::Uuid::new_v4().to_string()),
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            target_id: target_id.to_string(),
            payload,
        }
    }

    /// Identity used for duplicate suppression. Unstamped signals have none
    /// and are always applied.
    pub fn dedup_key(&self) -> Option<(String, String)> {
        self.signal_id
            .as_ref()
            .map(|id| (self.sender_id.clone(), id.clone()))
    }
}

/// Remembers which signals were already applied.
#[derive(Debug, Default)]
pub struct SeenSignals {
    keys: HashSet<(String, String)>,
}

impl SeenSignals {
    /// Returns `true` the first time a signal is seen, and always for
    /// signals without a `signal_id`.
    pub fn first_delivery(&mut self, signal: &SignalData) -> bool {
        match signal.dedup_key() {
            Some(key) => self.keys.insert(key),
            None => true,
        }
    }
}

/// Store-and-forward delivery of signaling envelopes between the two
/// parties of one session.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, session_id: &str, target_id: &str, message: &SignalData) -> Result<(), ApiError>;

    /// Signals addressed to this client since the last call, oldest first.
    async fn receive(&self, session_id: &str) -> Result<Vec<SignalData>, ApiError>;
}

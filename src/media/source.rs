use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::MediaAccessError;

use super::quality::QualityPreset;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub fn codec_type(self) -> RTPCodecType {
        match self {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }

    fn capability(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

/// One outgoing track. Clones share the same underlying track and live flag,
/// so every peer connection sees a stop at once.
#[derive(Clone)]
pub struct LocalTrack {
    kind: TrackKind,
    id: String,
    inner: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// A sample-fed track; an encoder pushes frames through `sample_track()`.
    pub fn new(kind: TrackKind, id: impl Into<String>, stream_id: &str) -> Self {
        let id = id.into();
        let inner = Arc::new(TrackLocalStaticSample::new(
            kind.capability(),
            id.clone(),
            stream_id.to_string(),
        ));
        Self {
            kind,
            id,
            inner,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    /// Marks the track ended. Irreversible.
    pub fn stop(&self) {
        if self.live.swap(false, Ordering::Relaxed) {
            debug!("Stopped local {} track {}", self.kind, self.id);
        }
    }

    pub fn sample_track(&self) -> &Arc<TrackLocalStaticSample> {
        &self.inner
    }

    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.inner.clone() as Arc<dyn TrackLocal + Send + Sync>
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// The broadcaster's captured stream: one track per kind plus whatever
/// keeps the capture device open.
pub struct LocalMedia {
    quality: QualityPreset,
    tracks: Vec<LocalTrack>,
    device: Option<Box<dyn Send + Sync>>,
}

impl LocalMedia {
    pub fn new(quality: QualityPreset, tracks: Vec<LocalTrack>) -> Self {
        Self {
            quality,
            tracks,
            device: None,
        }
    }

    /// Keep `guard` alive until the media is stopped; dropping it releases
    /// the device.
    pub fn holding(mut self, guard: impl Send + Sync + 'static) -> Self {
        self.device = Some(Box::new(guard));
        self
    }

    pub fn quality(&self) -> QualityPreset {
        self.quality
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind == kind)
    }

    pub fn is_live(&self) -> bool {
        self.tracks.iter().any(LocalTrack::is_live)
    }

    pub fn stop(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        if self.device.take().is_some() {
            info!("Released capture device ({})", self.quality);
        }
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Where the broadcaster's audio and video come from. Acquisition may wait
/// indefinitely on the device or the user.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, quality: QualityPreset) -> Result<LocalMedia, MediaAccessError>;
}

/// Hands out fresh sample-fed VP8 and Opus tracks without touching any
/// device. Frames are written by an external encoder.
#[derive(Debug, Clone)]
pub struct TrackSource {
    stream_id: String,
}

impl TrackSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaSource for TrackSource {
    async fn acquire(&self, quality: QualityPreset) -> Result<LocalMedia, MediaAccessError> {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let tracks = vec![
            LocalTrack::new(TrackKind::Audio, format!("audio-{}", suffix), &self.stream_id),
            LocalTrack::new(TrackKind::Video, format!("video-{}", suffix), &self.stream_id),
        ];
        info!(
            "Prepared sample tracks for {} ({}x{}@{})",
            quality,
            quality.width(),
            quality.height(),
            quality.frame_rate()
        );
        Ok(LocalMedia::new(quality, tracks))
    }
}

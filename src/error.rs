use std::time::Duration;

use thiserror::Error;

/// Why local capture could not be started. Always fatal to the
/// `start_streaming` call that hit it, always recoverable by retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("camera/microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("no capture device found: {0}")]
    DeviceNotFound(String),
    #[error("capture device is busy: {0}")]
    DeviceBusy(String),
    #[error("requested capture settings are not supported: {0}")]
    UnsupportedConstraints(String),
    #[error("capture requires a secure connection (https or localhost)")]
    InsecureContext,
}

/// REST backend failures.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode backend payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A peer connection operation failed. Scoped to one connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct PeerError(pub String);

impl PeerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// One step of a stream teardown that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub step: &'static str,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    MediaAccess(#[from] MediaAccessError),
    #[error("already streaming")]
    AlreadyStreaming,
    #[error("not streaming")]
    NotStreaming,
    #[error("no answer from {broadcaster_id} within {waited:?}")]
    SignalingTimeout {
        broadcaster_id: String,
        waited: Duration,
    },
    #[error("peer connection failed: {0}")]
    PeerConnection(#[from] PeerError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("not connected to a stream")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("teardown finished with {} failed step(s)", .0.len())]
    PartialTeardown(Vec<TeardownFailure>),
    #[error("stream engine is no longer running")]
    EngineGone,
}

/// The real-time chat channel dropped or could not be opened. Transient:
/// the owning subscription retries while it stays open.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("failed to open chat channel: {0}")]
    Connect(String),
    #[error("chat channel closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("tip amount must be a positive number of tokens")]
    InvalidTipAmount,
    #[error("message {0} is not in any open chat")]
    UnknownMessage(String),
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat {0} is not open")]
    NotOpen(String),
    #[error("chat {0} is not connected yet")]
    NotConnected(String),
    #[error("failed to send on chat {0}")]
    SendFailed(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("not allowed to {0}")]
    Forbidden(&'static str),
    #[error(transparent)]
    Api(#[from] ApiError),
}

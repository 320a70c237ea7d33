pub mod broadcaster;
#[cfg(feature = "capture")]
pub mod capture;
pub mod engine;
pub mod link;
pub mod peer;
pub mod quality;
pub mod source;
pub mod viewer;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::signaling::SignalData;

use self::peer::PeerEvent;

pub use broadcaster::{Broadcaster, StreamSession, StreamStatus};
pub use engine::{BroadcastHandle, BroadcastSnapshot, ViewerHandle, ViewerSnapshot};
pub use peer::{ConnectionState, PeerConnection, PeerConnectionFactory, RtcPeerFactory};
pub use quality::QualityPreset;
pub use source::{LocalMedia, LocalTrack, MediaSource, TrackKind, TrackSource};
pub use viewer::{RemoteStream, Viewer};

/// Anything a stream manager reacts to besides caller commands.
#[derive(Debug)]
pub enum StreamInput {
    Signal(SignalData),
    Peer(PeerEvent),
}

/// Receiving ends of the channels fed by the signal poller and by peer
/// connection callbacks.
pub struct StreamInbox {
    signals: mpsc::Receiver<SignalData>,
    peer_events: mpsc::Receiver<PeerEvent>,
}

/// Sending ends, cloned into pollers and peer connections.
#[derive(Clone)]
pub(crate) struct StreamOutlets {
    pub signals: mpsc::Sender<SignalData>,
    pub peer_events: mpsc::Sender<PeerEvent>,
}

pub(crate) fn stream_channels() -> (StreamOutlets, StreamInbox) {
    let (signal_tx, signal_rx) = mpsc::channel(256);
    let (peer_tx, peer_rx) = mpsc::channel(256);
    (
        StreamOutlets {
            signals: signal_tx,
            peer_events: peer_tx,
        },
        StreamInbox {
            signals: signal_rx,
            peer_events: peer_rx,
        },
    )
}

impl StreamInbox {
    /// Next input from either source. `None` once both are closed, which
    /// cannot happen while the owning manager holds its outlets.
    pub async fn recv(&mut self) -> Option<StreamInput> {
        tokio::select! {
            Some(signal) = self.signals.recv() => Some(StreamInput::Signal(signal)),
            Some(event) = self.peer_events.recv() => Some(StreamInput::Peer(event)),
            else => None,
        }
    }
}

/// Cancels whatever long-running operation is in flight on a manager.
/// Cloned into handles so a caller can interrupt an operation the engine
/// is still awaiting.
#[derive(Clone)]
pub struct Canceller(Arc<watch::Sender<u64>>);

impl Canceller {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self(Arc::new(tx))
    }

    pub fn cancel(&self) {
        self.0.send_modify(|generation| *generation += 1);
    }

    /// A token that fires on the next `cancel()` after this call.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.0.subscribe(),
            _tx: self.0.clone(),
        }
    }
}

impl Default for Canceller {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CancelToken {
    rx: watch::Receiver<u64>,
    _tx: Arc<watch::Sender<u64>>,
}

impl CancelToken {
    pub async fn cancelled(&mut self) {
        // The token keeps the sender alive, so this only returns on cancel.
        let _ = self.rx.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn token_only_sees_later_cancels() {
        let canceller = Canceller::new();
        canceller.cancel();

        let mut token = canceller.token();
        let early = tokio::time::timeout(Duration::from_millis(10), token.cancelled()).await;
        assert!(early.is_err());

        canceller.cancel();
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .unwrap();
    }
}

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::StreamError;

use super::broadcaster::{Broadcaster, StreamStatus};
use super::peer::ConnectionState;
use super::quality::QualityPreset;
use super::viewer::{RemoteStream, Viewer};
use super::Canceller;

/// Commands sent to the broadcast engine.
#[derive(Debug)]
pub enum BroadcastCommand {
    Start {
        quality: QualityPreset,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    ChangeQuality {
        quality: QualityPreset,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Snapshot {
        reply: oneshot::Sender<BroadcastSnapshot>,
    },
}

/// Current broadcaster state, for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastSnapshot {
    pub status: StreamStatus,
    pub session_id: Option<String>,
    pub quality: Option<QualityPreset>,
    pub viewers: Vec<String>,
}

impl BroadcastSnapshot {
    fn of(broadcaster: &Broadcaster) -> Self {
        Self {
            status: broadcaster.status(),
            session_id: broadcaster.session().map(|s| s.session_id.clone()),
            quality: broadcaster.stream_quality(),
            viewers: broadcaster.viewers(),
        }
    }
}

/// Handle for sending commands to a running broadcast engine.
#[derive(Clone)]
pub struct BroadcastHandle {
    command_tx: mpsc::Sender<BroadcastCommand>,
    canceller: Canceller,
}

impl BroadcastHandle {
    /// Move `broadcaster` onto its own task.
    pub fn spawn(broadcaster: Broadcaster) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let canceller = broadcaster.canceller();
        tokio::spawn(run_broadcast_engine(broadcaster, command_rx));
        Self {
            command_tx,
            canceller,
        }
    }

    pub async fn start_streaming(&self, quality: QualityPreset) -> Result<(), StreamError> {
        request(&self.command_tx, |reply| BroadcastCommand::Start { quality, reply }).await?
    }

    /// Also aborts a quality change the engine is still waiting on.
    pub async fn stop_streaming(&self) -> Result<(), StreamError> {
        self.canceller.cancel();
        request(&self.command_tx, |reply| BroadcastCommand::Stop { reply }).await?
    }

    pub async fn change_quality(&self, quality: QualityPreset) -> Result<(), StreamError> {
        request(&self.command_tx, |reply| BroadcastCommand::ChangeQuality { quality, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<BroadcastSnapshot, StreamError> {
        request(&self.command_tx, |reply| BroadcastCommand::Snapshot { reply }).await
    }
}

/// Run the broadcast engine event loop.
/// Serializes caller commands with inbound signals and peer events so the
/// broadcaster state is only ever touched from this task.
pub async fn run_broadcast_engine(
    mut broadcaster: Broadcaster,
    mut cmd_rx: mpsc::Receiver<BroadcastCommand>,
) {
    info!("Broadcast engine started for {}", broadcaster.broadcaster_id());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    BroadcastCommand::Start { quality, reply } => {
                        let _ = reply.send(broadcaster.start_streaming(quality).await);
                    }
                    BroadcastCommand::Stop { reply } => {
                        let _ = reply.send(broadcaster.stop_streaming().await);
                    }
                    BroadcastCommand::ChangeQuality { quality, reply } => {
                        let _ = reply.send(broadcaster.change_quality(quality).await);
                    }
                    BroadcastCommand::Snapshot { reply } => {
                        let _ = reply.send(BroadcastSnapshot::of(&broadcaster));
                    }
                }
            }
            Some(input) = broadcaster.next_input() => {
                broadcaster.apply(input).await;
            }
        }
    }

    if broadcaster.status() != StreamStatus::Idle {
        if let Err(e) = broadcaster.stop_streaming().await {
            warn!("Stream teardown on shutdown: {}", e);
        }
    }
    info!("Broadcast engine stopped");
}

/// Commands sent to the viewer engine.
#[derive(Debug)]
pub enum ViewerCommand {
    Connect {
        broadcaster_id: String,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    RequestQuality {
        quality: QualityPreset,
        reply: oneshot::Sender<Result<(), StreamError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ViewerSnapshot>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViewerSnapshot {
    pub broadcaster_id: Option<String>,
    pub state: ConnectionState,
    pub remote_stream: Option<RemoteStream>,
}

impl ViewerSnapshot {
    fn of(viewer: &Viewer) -> Self {
        Self {
            broadcaster_id: viewer.broadcaster_id().map(str::to_string),
            state: viewer.connection_state(),
            remote_stream: viewer.remote_stream().cloned(),
        }
    }
}

#[derive(Clone)]
pub struct ViewerHandle {
    command_tx: mpsc::Sender<ViewerCommand>,
    canceller: Canceller,
}

impl ViewerHandle {
    pub fn spawn(viewer: Viewer) -> Self {
        let (command_tx, command_rx) = mpsc::channel(64);
        let canceller = viewer.canceller();
        tokio::spawn(run_viewer_engine(viewer, command_rx));
        Self {
            command_tx,
            canceller,
        }
    }

    /// Supersedes a connect that is still waiting for its answer.
    pub async fn connect(&self, broadcaster_id: &str) -> Result<(), StreamError> {
        self.canceller.cancel();
        let broadcaster_id = broadcaster_id.to_string();
        request(&self.command_tx, |reply| ViewerCommand::Connect { broadcaster_id, reply }).await?
    }

    pub async fn disconnect(&self) -> Result<(), StreamError> {
        self.canceller.cancel();
        request(&self.command_tx, |reply| ViewerCommand::Disconnect { reply }).await?
    }

    pub async fn request_quality_change(&self, quality: QualityPreset) -> Result<(), StreamError> {
        request(&self.command_tx, |reply| ViewerCommand::RequestQuality { quality, reply }).await?
    }

    pub async fn snapshot(&self) -> Result<ViewerSnapshot, StreamError> {
        request(&self.command_tx, |reply| ViewerCommand::Snapshot { reply }).await
    }
}

pub async fn run_viewer_engine(mut viewer: Viewer, mut cmd_rx: mpsc::Receiver<ViewerCommand>) {
    info!("Viewer engine started for {}", viewer.viewer_id());

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    ViewerCommand::Connect { broadcaster_id, reply } => {
                        let _ = reply.send(viewer.connect(&broadcaster_id).await);
                    }
                    ViewerCommand::Disconnect { reply } => {
                        let _ = reply.send(viewer.disconnect().await);
                    }
                    ViewerCommand::RequestQuality { quality, reply } => {
                        let _ = reply.send(viewer.request_quality_change(quality).await);
                    }
                    ViewerCommand::Snapshot { reply } => {
                        let _ = reply.send(ViewerSnapshot::of(&viewer));
                    }
                }
            }
            Some(input) = viewer.next_input() => {
                viewer.apply(input).await;
            }
        }
    }

    if let Err(e) = viewer.disconnect().await {
        debug!("Viewer teardown on shutdown: {}", e);
    }
    info!("Viewer engine stopped");
}

async fn request<C, T>(
    tx: &mpsc::Sender<C>,
    build: impl FnOnce(oneshot::Sender<T>) -> C,
) -> Result<T, StreamError> {
    let (reply_tx, reply_rx) = oneshot::channel();
    tx.send(build(reply_tx))
        .await
        .map_err(|_| StreamError::EngineGone)?;
    reply_rx.await.map_err(|_| StreamError::EngineGone)
}

pub mod api;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod models;
pub mod signaling;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::BackendClient;
use crate::chat::{ChatKey, ChatManager, ChatWindows, WsConnector};
use crate::config::ClientConfig;
use crate::error::{ApiError, ChatError, StreamError};
use crate::events::{create_event_bus, AppEvent, EventReceiver};
use crate::media::{
    BroadcastHandle, Broadcaster, MediaSource, QualityPreset, RtcPeerFactory, Viewer, ViewerHandle,
};
use crate::state::ClientContext;

/// How long `/pm` waits for a newly opened conversation's socket.
const PRIVATE_CONNECT_WAIT: Duration = Duration::from_secs(10);

/// Install the fmt subscriber. `RUST_LOG` overrides the default `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// The CLI has no encoder, so capture only opens and holds the devices at
/// the requested preset; frames are discarded. Embedders that encode attach
/// sinks with `DeviceSource::with_frame_sink` and `with_audio_sink`.
#[cfg(feature = "capture")]
fn media_source(_config: &ClientConfig) -> Arc<dyn MediaSource> {
    Arc::new(media::capture::DeviceSource::new(0))
}

#[cfg(not(feature = "capture"))]
fn media_source(config: &ClientConfig) -> Arc<dyn MediaSource> {
    Arc::new(media::TrackSource::new(format!("livecast-{}", config.identity.user_id)))
}

/// Wire every seam to the real backend.
pub fn create_client_context(config: ClientConfig) -> Result<ClientContext, ApiError> {
    let config = Arc::new(config);
    let backend = Arc::new(BackendClient::new(&config)?);
    let (event_tx, _event_rx) = create_event_bus();

    info!(
        "Client for {} ({}) against {}",
        config.identity.username,
        config.identity.user_id,
        config.api_base()
    );

    Ok(ClientContext {
        streaming: backend.clone(),
        chat_backend: backend.clone(),
        signaling: backend,
        media: media_source(&config),
        peers: Arc::new(RtcPeerFactory::new(config.ice_servers.clone())),
        chat_connector: Arc::new(WsConnector::new(config.clone())),
        event_tx,
        config,
    })
}

/// Print every event as one JSON line, handing each to `on_event` first.
fn spawn_event_printer(
    mut rx: EventReceiver,
    mut on_event: impl FnMut(&AppEvent) + Send + 'static,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    on_event(&event);
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("Unprintable event: {}", e),
                    }
                }
                Err(RecvError::Lagged(n)) => warn!("Event printer lagged, skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Go live and keep serving viewers until ctrl-c.
pub async fn run_broadcast(config: ClientConfig, quality: QualityPreset) -> Result<(), StreamError> {
    let ctx = create_client_context(config)?;
    let printer = spawn_event_printer(ctx.event_tx.subscribe(), |_| {});

    let handle = BroadcastHandle::spawn(Broadcaster::new(ctx));
    handle.start_streaming(quality).await?;
    info!("Live at {}; ctrl-c to stop", quality.label());

    shutdown_signal().await;
    let result = handle.stop_streaming().await;
    printer.abort();
    result
}

/// Watch one broadcaster until ctrl-c.
pub async fn run_watch(config: ClientConfig, broadcaster_id: &str) -> Result<(), StreamError> {
    let ctx = create_client_context(config)?;
    let printer = spawn_event_printer(ctx.event_tx.subscribe(), |_| {});

    let handle = ViewerHandle::spawn(Viewer::new(ctx));
    handle.connect(broadcaster_id).await?;

    shutdown_signal().await;
    let result = handle.disconnect().await;
    printer.abort();
    result
}

/// Join a room and turn stdin lines into chat messages.
///
/// `/tip N text` tips, `/typing` announces typing, `/pm USER text` writes
/// privately, `/quit` leaves.
pub async fn run_chat(config: ClientConfig, room_id: &str) -> Result<(), ChatError> {
    let ctx = create_client_context(config)?;
    let chat = ChatManager::new(ctx.clone());

    let mut windows = ChatWindows::new();
    windows.open_room(room_id, room_id);
    chat.open_room(room_id);

    let notified = chat.clone();
    let printer = spawn_event_printer(ctx.event_tx.subscribe(), move |event| {
        if let AppEvent::PrivateMessageNotification {
            from_user_id,
            from_username,
            ..
        } = event
        {
            if windows.open_private(from_user_id, from_username) {
                notified.open_private(from_user_id);
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown_signal() => break,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin: {}", e);
                break;
            }
        };
        if line.trim() == "/quit" {
            break;
        }
        if let Err(e) = run_chat_line(&chat, room_id, &line).await {
            warn!("{}", e);
        }
    }

    chat.close_all();
    printer.abort();
    Ok(())
}

async fn run_chat_line(chat: &ChatManager, room_id: &str, line: &str) -> Result<(), ChatError> {
    if let Some(rest) = line.strip_prefix("/tip ") {
        let (amount, note) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
        let amount = amount
            .parse::<u32>()
            .map_err(|_| error::ValidationError::InvalidTipAmount)?;
        return chat.send_tip(room_id, note, amount);
    }
    if line.trim() == "/typing" {
        return chat.set_typing(room_id, true);
    }
    if let Some(rest) = line.strip_prefix("/pm ") {
        let (peer, text) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));
        chat.open_private(peer);
        chat.wait_connected(&ChatKey::Private(peer.to_string()), PRIVATE_CONNECT_WAIT)
            .await?;
        return chat.send_private_message(peer, text);
    }
    chat.send_message(room_id, line)
}

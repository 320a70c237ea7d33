mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{settle, Harness, MediaMode};
use livecast_lib::error::{MediaAccessError, StreamError};
use livecast_lib::events::AppEvent;
use livecast_lib::media::peer::ConnectionState;
use livecast_lib::media::{BroadcastHandle, Broadcaster, QualityPreset, StreamStatus};
use livecast_lib::signaling::{SessionDescription, SignalData, SignalPayload};

async fn pump(broadcaster: &mut Broadcaster) {
    let input = tokio::time::timeout(Duration::from_secs(5), broadcaster.next_input())
        .await
        .expect("no input arrived")
        .expect("inbox closed");
    broadcaster.apply(input).await;
}

fn offer_from(viewer_id: &str, viewer_session: &str) -> SignalData {
    SignalData::new(
        viewer_session,
        viewer_id,
        "model-1",
        SignalPayload::Offer {
            offer: SessionDescription::offer("v=0 viewer offer"),
            ice_restart: false,
        },
    )
}

async fn live(h: &Harness) -> Broadcaster {
    let mut broadcaster = Broadcaster::new(h.ctx.clone());
    broadcaster.start_streaming(QualityPreset::Medium).await.unwrap();
    broadcaster
}

#[tokio::test(start_paused = true)]
async fn start_registers_live_status_then_session() {
    let mut h = Harness::new("model-1");
    let broadcaster = live(&h).await;

    assert!(broadcaster.is_streaming());
    assert_eq!(broadcaster.status(), StreamStatus::Live);
    assert_eq!(broadcaster.stream_quality(), Some(QualityPreset::Medium));
    assert_eq!(
        h.backend.calls(),
        ["model_status live=true available=true", "create_session model-1"]
    );
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        AppEvent::StreamStarted { session_id, quality: QualityPreset::Medium } if session_id == "session-1"
    )));
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    let err = broadcaster.start_streaming(QualityPreset::High).await.unwrap_err();
    assert!(matches!(err, StreamError::AlreadyStreaming));
    assert_eq!(h.media.tracks().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn media_failure_leaves_nothing_behind() {
    let h = Harness::new("model-1");
    h.media.set_mode(MediaMode::Fail(MediaAccessError::PermissionDenied("user said no".into())));
    let mut broadcaster = Broadcaster::new(h.ctx.clone());

    let err = broadcaster.start_streaming(QualityPreset::Low).await.unwrap_err();
    assert!(matches!(err, StreamError::MediaAccess(MediaAccessError::PermissionDenied(_))));
    assert_eq!(broadcaster.status(), StreamStatus::Idle);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn session_failure_releases_capture_and_reverts_status() {
    let h = Harness::new("model-1");
    h.backend.fail_create_session.store(true, Ordering::SeqCst);
    let mut broadcaster = Broadcaster::new(h.ctx.clone());

    assert!(broadcaster.start_streaming(QualityPreset::Medium).await.is_err());
    assert_eq!(h.media.live_tracks(), 0);
    assert!(!broadcaster.is_streaming());
    assert_eq!(
        h.backend.calls().last().map(String::as_str),
        Some("model_status live=false available=true")
    );
}

#[tokio::test(start_paused = true)]
async fn insecure_backend_refuses_capture() {
    let mut h = Harness::new("model-1");
    let mut config = (*h.ctx.config).clone();
    config.backend_url = "http://10.1.2.3:8001".into();
    h.ctx.config = Arc::new(config);

    let err = Broadcaster::new(h.ctx.clone())
        .start_streaming(QualityPreset::Medium)
        .await
        .unwrap_err();
    assert!(matches!(err, StreamError::MediaAccess(MediaAccessError::InsecureContext)));
    assert!(h.media.tracks().is_empty());
}

#[tokio::test(start_paused = true)]
async fn repeated_offer_renegotiates_one_connection() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;

    broadcaster
        .handle_viewer_offer("viewer-1", "viewer-session", SessionDescription::offer("v=0 a"))
        .await
        .unwrap();
    broadcaster
        .handle_viewer_offer("viewer-1", "viewer-session", SessionDescription::offer("v=0 b"))
        .await
        .unwrap();

    assert_eq!(broadcaster.viewer_count(), 1);
    assert_eq!(h.peers.created().len(), 1);
    let log = h.peers.last().log();
    assert_eq!(log.iter().filter(|l| l.starts_with("add_track")).count(), 2);
    assert_eq!(log.iter().filter(|l| *l == "set_remote Offer").count(), 2);
    assert_eq!(h.transport.sent_kinds(), ["answer", "answer"]);
}

#[tokio::test(start_paused = true)]
async fn polled_offer_is_answered_on_the_viewers_session() {
    let mut h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;

    h.transport.push("session-1", offer_from("viewer-7", "viewer-session-7"));
    pump(&mut broadcaster).await;

    assert_eq!(broadcaster.viewers(), ["viewer-7"]);
    let (session, target, answer) = h.transport.sent().pop().unwrap();
    assert_eq!((session.as_str(), target.as_str()), ("viewer-session-7", "viewer-7"));
    assert_eq!(answer.sender_id, "model-1");
    assert!(matches!(answer.payload, SignalPayload::Answer { .. }));
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, AppEvent::ViewerJoined { viewer_id } if viewer_id == "viewer-7")));
}

#[tokio::test(start_paused = true)]
async fn redelivered_offer_is_applied_once() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;

    let offer = offer_from("viewer-1", "vs-1");
    h.transport.push("session-1", offer.clone());
    h.transport.push("session-1", offer);
    pump(&mut broadcaster).await;
    pump(&mut broadcaster).await;

    assert_eq!(h.transport.sent_kinds(), ["answer"]);
}

#[tokio::test(start_paused = true)]
async fn local_candidates_go_only_to_their_viewer() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    for viewer in ["viewer-1", "viewer-2"] {
        broadcaster
            .handle_viewer_offer(viewer, &format!("vs-{}", viewer), SessionDescription::offer("v=0"))
            .await
            .unwrap();
    }

    h.peers.for_peer("viewer-2")[0]
        .emit_candidate("candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host")
        .await;
    pump(&mut broadcaster).await;

    let candidates: Vec<_> = h
        .transport
        .sent()
        .into_iter()
        .filter(|(_, _, s)| s.payload.kind() == "ice-candidate")
        .collect();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].0, "vs-viewer-2");
    assert_eq!(candidates[0].1, "viewer-2");
}

#[tokio::test(start_paused = true)]
async fn failed_viewer_is_dropped_without_touching_others() {
    let mut h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    for viewer in ["viewer-1", "viewer-2"] {
        broadcaster
            .handle_viewer_offer(viewer, "vs", SessionDescription::offer("v=0"))
            .await
            .unwrap();
    }
    h.drain_events();

    h.peers.for_peer("viewer-1")[0].emit_state(ConnectionState::Failed).await;
    pump(&mut broadcaster).await;

    assert_eq!(broadcaster.viewers(), ["viewer-2"]);
    assert!(h.peers.for_peer("viewer-1")[0].is_closed());
    assert!(!h.peers.for_peer("viewer-2")[0].is_closed());
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, AppEvent::ViewerLeft { viewer_id } if viewer_id == "viewer-1")));

    // A fresh offer brings the viewer back on a new connection.
    broadcaster
        .handle_viewer_offer("viewer-1", "vs", SessionDescription::offer("v=0"))
        .await
        .unwrap();
    assert_eq!(h.peers.for_peer("viewer-1").len(), 2);
    assert_eq!(broadcaster.viewer_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn failed_negotiation_is_reported_for_that_viewer_only() {
    let mut h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    for viewer in ["viewer-1", "viewer-2"] {
        broadcaster
            .handle_viewer_offer(viewer, "vs", SessionDescription::offer("v=0"))
            .await
            .unwrap();
    }
    h.drain_events();
    let answers = h.transport.sent().len();

    h.peers.fail_negotiation.store(true, Ordering::SeqCst);
    h.transport.push("session-1", offer_from("viewer-3", "vs-3"));
    pump(&mut broadcaster).await;

    assert_eq!(broadcaster.viewers(), ["viewer-1", "viewer-2"]);
    let rejected = h.peers.for_peer("viewer-3");
    assert_eq!(rejected.len(), 1);
    assert!(rejected[0].is_closed());
    assert!(h.peers.for_peer("viewer-1").iter().all(|p| !p.is_closed()));
    assert!(h.peers.for_peer("viewer-2").iter().all(|p| !p.is_closed()));
    assert_eq!(h.transport.sent().len(), answers);
    assert!(broadcaster.is_streaming());

    let events = h.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, AppEvent::ViewerError { viewer_id, .. } if viewer_id == "viewer-3")));
    assert!(!events.iter().any(|e| matches!(e, AppEvent::ViewerJoined { .. })));
}

#[tokio::test(start_paused = true)]
async fn identical_unstamped_requests_from_each_viewer_are_all_surfaced() {
    let mut h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    h.drain_events();

    let unstamped = |viewer: &str, quality: QualityPreset| {
        let mut signal = SignalData::new("vs", viewer, "model-1", SignalPayload::QualityRequest { quality });
        signal.signal_id = None;
        signal
    };
    h.transport.push("session-1", unstamped("viewer-1", QualityPreset::High));
    h.transport.push("session-1", unstamped("viewer-2", QualityPreset::High));
    h.transport.push("session-1", unstamped("viewer-1", QualityPreset::Low));
    h.transport.push("session-1", unstamped("viewer-1", QualityPreset::High));
    for _ in 0..4 {
        pump(&mut broadcaster).await;
    }

    let requests: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            AppEvent::QualityRequested { viewer_id, quality } => Some((viewer_id, quality)),
            _ => None,
        })
        .collect();
    assert_eq!(
        requests,
        [
            ("viewer-1".to_string(), QualityPreset::High),
            ("viewer-2".to_string(), QualityPreset::High),
            ("viewer-1".to_string(), QualityPreset::Low),
            ("viewer-1".to_string(), QualityPreset::High),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn offers_without_a_sender_are_dropped() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;

    let mut offer = offer_from("", "vs");
    offer.signal_id = None;
    h.transport.push("session-1", offer);
    pump(&mut broadcaster).await;

    assert_eq!(broadcaster.viewer_count(), 0);
    assert!(h.peers.created().is_empty());
    assert!(h.transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stop_closes_viewers_and_releases_tracks() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    for viewer in ["viewer-1", "viewer-2"] {
        broadcaster
            .handle_viewer_offer(viewer, "vs", SessionDescription::offer("v=0"))
            .await
            .unwrap();
    }

    broadcaster.stop_streaming().await.unwrap();

    assert_eq!(broadcaster.viewer_count(), 0);
    assert_eq!(h.media.live_tracks(), 0);
    assert!(h.peers.created().iter().all(|p| p.is_closed()));
    assert_eq!(broadcaster.status(), StreamStatus::Idle);
    let calls = h.backend.calls();
    assert_eq!(
        &calls[calls.len() - 2..],
        ["end_session session-1", "model_status live=false available=true"]
    );

    let polls = h.transport.receive_calls();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.transport.receive_calls(), polls);
}

#[tokio::test(start_paused = true)]
async fn teardown_reports_every_failed_step() {
    let h = Harness::new("model-1");
    h.peers.fail_close.store(true, Ordering::SeqCst);
    let mut broadcaster = live(&h).await;
    broadcaster
        .handle_viewer_offer("viewer-1", "vs", SessionDescription::offer("v=0"))
        .await
        .unwrap();
    h.backend.fail_end_session.store(true, Ordering::SeqCst);

    match broadcaster.stop_streaming().await {
        Err(StreamError::PartialTeardown(failures)) => {
            let steps: Vec<_> = failures.iter().map(|f| f.step).collect();
            assert_eq!(steps, ["close viewer connection", "end session"]);
        }
        other => panic!("expected partial teardown, got {:?}", other),
    }
    assert_eq!(broadcaster.viewer_count(), 0);
    assert_eq!(h.media.live_tracks(), 0);
    assert_eq!(broadcaster.status(), StreamStatus::Idle);
    assert!(matches!(broadcaster.stop_streaming().await, Err(StreamError::NotStreaming)));
}

#[tokio::test(start_paused = true)]
async fn failed_quality_change_keeps_current_stream() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    h.media.set_mode(MediaMode::Fail(MediaAccessError::DeviceBusy("in use".into())));

    let err = broadcaster.change_quality(QualityPreset::High).await.unwrap_err();
    assert!(matches!(err, StreamError::MediaAccess(MediaAccessError::DeviceBusy(_))));
    assert!(broadcaster.is_streaming());
    assert_eq!(broadcaster.stream_quality(), Some(QualityPreset::Medium));
    assert_eq!(h.media.live_tracks(), 2);
}

#[tokio::test(start_paused = true)]
async fn quality_change_swaps_tracks_in_place() {
    let h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    broadcaster
        .handle_viewer_offer("viewer-1", "vs", SessionDescription::offer("v=0"))
        .await
        .unwrap();

    broadcaster.change_quality(QualityPreset::High).await.unwrap();

    assert_eq!(broadcaster.stream_quality(), Some(QualityPreset::High));
    let tracks = h.media.tracks();
    assert_eq!(tracks.len(), 4);
    assert!(tracks[..2].iter().all(|t| !t.is_live()));
    assert!(tracks[2..].iter().all(|t| t.is_live()));

    let log = h.peers.last().log();
    assert_eq!(log.iter().filter(|l| l.starts_with("replace_track")).count(), 2);
    assert!(!log.iter().any(|l| l.starts_with("create_offer")));
}

#[tokio::test(start_paused = true)]
async fn quality_requests_are_surfaced() {
    let mut h = Harness::new("model-1");
    let mut broadcaster = live(&h).await;
    h.drain_events();

    h.transport.push(
        "session-1",
        SignalData::new(
            "vs",
            "viewer-3",
            "model-1",
            SignalPayload::QualityRequest {
                quality: QualityPreset::Low,
            },
        ),
    );
    pump(&mut broadcaster).await;

    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        AppEvent::QualityRequested { viewer_id, quality: QualityPreset::Low } if viewer_id == "viewer-3"
    )));
    assert_eq!(broadcaster.stream_quality(), Some(QualityPreset::Medium));
}

#[tokio::test(start_paused = true)]
async fn stopping_cancels_pending_quality_change() {
    let h = Harness::new("model-1");
    let handle = BroadcastHandle::spawn(Broadcaster::new(h.ctx.clone()));
    handle.start_streaming(QualityPreset::Medium).await.unwrap();

    h.media.set_mode(MediaMode::Hang);
    let changer = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.change_quality(QualityPreset::High).await })
    };
    settle().await;

    handle.stop_streaming().await.unwrap();
    assert!(matches!(changer.await.unwrap(), Err(StreamError::Cancelled)));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.status, StreamStatus::Idle);
    assert!(snapshot.viewers.is_empty());
    assert_eq!(h.media.live_tracks(), 0);
}

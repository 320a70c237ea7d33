//! Connection state machines as pure functions of (state, event). The
//! managers apply the returned effects; nothing here touches the network.

use super::peer::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEffect {
    /// Close the connection and forget the viewer.
    DropViewer,
    /// Send a fresh offer with the ICE restart flag set.
    RestartIce,
    /// Give up and report the failure to the caller.
    SurfaceFailure,
}

/// Broadcaster side: one per viewer. Disconnected, failed and closed are
/// terminal; the viewer must send a new offer to come back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastLink {
    pub state: ConnectionState,
}

impl BroadcastLink {
    pub fn on_state(self, next: ConnectionState) -> (Self, Vec<LinkEffect>) {
        let effects = match next {
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed => {
                vec![LinkEffect::DropViewer]
            }
            _ => Vec::new(),
        };
        (BroadcastLink { state: next }, effects)
    }
}

/// Viewer side. A failure gets exactly one ICE restart per episode; the
/// episode ends when the connection is established again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ViewerLink {
    pub state: ConnectionState,
    pub restart_attempted: bool,
    pub gave_up: bool,
}

impl ViewerLink {
    pub fn on_state(self, next: ConnectionState) -> (Self, Vec<LinkEffect>) {
        match next {
            ConnectionState::Failed if !self.restart_attempted => (
                ViewerLink {
                    state: next,
                    restart_attempted: true,
                    gave_up: false,
                },
                vec![LinkEffect::RestartIce],
            ),
            ConnectionState::Failed => {
                let effects = if self.gave_up {
                    Vec::new()
                } else {
                    vec![LinkEffect::SurfaceFailure]
                };
                (
                    ViewerLink {
                        state: next,
                        restart_attempted: true,
                        gave_up: true,
                    },
                    effects,
                )
            }
            ConnectionState::Connected => (
                ViewerLink {
                    state: next,
                    ..ViewerLink::default()
                },
                Vec::new(),
            ),
            _ => (ViewerLink { state: next, ..self }, Vec::new()),
        }
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{SignalData, SignalingTransport};

/// Owns a running poll loop. The loop stops when the handle is stopped or
/// dropped, so a session cannot leak its timer.
#[derive(Debug)]
pub struct PollHandle {
    session_id: String,
    task: Option<JoinHandle<()>>,
}

impl PollHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Stopped signal polling for session {}", self.session_id);
        }
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct SignalPoller;

impl SignalPoller {
    /// Poll `session_id` every `every`, forwarding signals in the order the
    /// relay returned them. The first poll happens one interval after start.
    pub fn start(
        transport: Arc<dyn SignalingTransport>,
        session_id: &str,
        every: Duration,
        out: mpsc::Sender<SignalData>,
    ) -> PollHandle {
        let sid = session_id.to_string();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let signals = match transport.receive(&sid).await {
                    Ok(signals) => signals,
                    Err(e) => {
                        warn!("Signal poll for session {} failed: {}", sid, e);
                        continue;
                    }
                };
                for signal in signals {
                    if out.send(signal).await.is_err() {
                        debug!("Signal consumer for {} went away", sid);
                        return;
                    }
                }
            }
        });

        PollHandle {
            session_id: session_id.to_string(),
            task: Some(task),
        }
    }
}

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::pipeline::StatusObserver;
use crate::types::{StatusUpdate, TransitionStatus};

/// One event flowing through the bridge: a status update, or the two ways a
/// run can end. `Done`/`Error` let a UI close its view of the stream instead
/// of inferring completion from silence.
#[derive(Clone, Debug)]
pub enum BridgeEvent {
    Status(StatusUpdate),
    Done,
    Error(String),
}

/// The producer half of the bridge. Implements `StatusObserver` so it can be
/// handed directly to `run_pipeline`/`run_campaign`; `on_update` is called
/// synchronously from inside the pipeline's async call stack, so the channel
/// is unbounded: `UnboundedSender::send` never blocks and never drops,
/// matching the ordering guarantee the orchestrator relies on without
/// risking a tokio worker thread stalling under backpressure.
pub struct EventBridgeSender {
    tx: UnboundedSender<BridgeEvent>,
}

impl EventBridgeSender {
    pub fn done(&self) {
        let _ = self.tx.send(BridgeEvent::Done);
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(BridgeEvent::Error(message.into()));
    }
}

impl StatusObserver for EventBridgeSender {
    fn on_update(&self, update: &StatusUpdate) {
        let _ = self.tx.send(BridgeEvent::Status(update.clone()));
    }
}

/// The consumer half.
pub struct EventBridgeReceiver {
    rx: UnboundedReceiver<BridgeEvent>,
}

impl EventBridgeReceiver {
    /// Awaits the next event, or returns `None` once the sender and all
    /// clones of it have been dropped.
    pub async fn recv(&mut self) -> Option<BridgeEvent> {
        self.rx.recv().await
    }
}

pub fn event_bridge() -> (EventBridgeSender, EventBridgeReceiver) {
    let (tx, rx) = unbounded_channel();
    (EventBridgeSender { tx }, EventBridgeReceiver { rx })
}

/// The simpler alternative to the bridge: a synchronous formatter that
/// writes one line per transition directly on the caller's thread. No
/// channel, no buffering, nothing to close.
pub struct PlainTextObserver;

impl StatusObserver for PlainTextObserver {
    fn on_update(&self, update: &StatusUpdate) {
        let verb = match update.status {
            TransitionStatus::Pending => "pending",
            TransitionStatus::Running => "running",
            TransitionStatus::Passed => "passed",
            TransitionStatus::Failed => "failed",
            TransitionStatus::Skipped => "skipped",
        };
        println!(
            "[{}] {} {} (attempt {}/{}, {})",
            update.bead_id, update.phase, verb, update.attempt, update.max_retries, update.progress
        );
    }
}

//! Fire-and-forget notification sink.

use drx_events::ExecutionEvent;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Receives one event per persisted transition.
///
/// Delivery must not block or fail the caller; a sink that cannot deliver
/// drops the event.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: ExecutionEvent);
}

/// Writes events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: ExecutionEvent) {
        let payload = match event.payload_json() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(event_id = event.event_id.value(), error = %e, "Event payload not serialisable");
                String::new()
            }
        };
        info!(
            event_id = event.event_id.value(),
            event_type = %event.event_type,
            execution_id = %event.execution_id,
            actor_type = %event.actor_type,
            actor_id = %event.actor_id,
            payload = %payload,
            "Execution event"
        );
    }
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: ExecutionEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification receiver dropped, discarding event");
        }
    }
}

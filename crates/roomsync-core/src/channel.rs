use tokio::sync::broadcast;

use crate::types::EngineEvent;

/// Broadcast event stream type used by session observers.
pub type EventStream = broadcast::Receiver<EngineEvent>;

/// Session-level notification fan-out.
#[derive(Clone, Debug)]
pub struct EngineChannels {
    event_tx: broadcast::Sender<EngineEvent>,
}

impl EngineChannels {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to emitted engine events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.event_tx.send(event);
    }
}

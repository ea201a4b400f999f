//! Event plumbing between the runtime (components D/E/F) and the WS
//! fan-out (component G, in `m360-web`), which is the only subscriber.

use m360_common::RuntimeEvent;
use tokio::sync::broadcast;
use tracing::trace;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RuntimeEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.tx.subscribe()
    }

    /// Best-effort: if nobody is subscribed (no WS clients connected) this
    /// is a no-op, not an error — broadcasting is fire-and-forget per
    /// spec.md §4.G.
    pub fn publish(&self, event: RuntimeEvent) {
        trace!(owner_id = event.owner_id(), "publishing runtime event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

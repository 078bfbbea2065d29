//! Broadcast bus for persisted audit `Event`s.
//!
//! Built on `tokio::sync::broadcast`. Events are published only after the
//! transaction that wrote them has committed. Publishing with no active
//! subscribers is a no-op; slow subscribers lag rather than block the engine.

use nuoc_types::event::Event;
use tokio::sync::broadcast;

/// Multi-consumer bus for job, task and awakeable events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn publish_all(&self, events: &[Event]) {
        for event in events {
            self.publish(event.clone());
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

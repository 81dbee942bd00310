//! Runtime event notification.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::time::SystemTime;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// Every kernel was dropped and the internal kernels rebuilt.
    KernelsReloaded { timestamp: SystemTime, success: bool },
}

/// Fan-out of [`RuntimeEvent`]s to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<RuntimeEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<RuntimeEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver to every live subscriber; dropped receivers are forgotten.
    pub fn emit(&self, event: RuntimeEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        trace!("event {event:?} delivered to {} subscriber(s)", subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let kept = bus.subscribe();
        drop(bus.subscribe());
        let event = RuntimeEvent::KernelsReloaded {
            timestamp: SystemTime::now(),
            success: true,
        };
        bus.emit(event.clone());
        assert_eq!(kept.try_recv().unwrap(), event);
        assert_eq!(bus.subscriber_count(), 1);
    }
}

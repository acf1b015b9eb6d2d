//! Event system for allocation lifecycle changes
//!
//! Services emit an event after the transaction that caused it has
//! committed, so listeners never observe rolled-back work.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::db::RunKind;

/// Lifecycle events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum AllocatorEvent {
    RunFinished {
        run_id: i64,
        kind: RunKind,
        stats: serde_json::Value,
    },
    AllocationQueued {
        allocation_id: i64,
        item_id: i64,
        recipient_id: i64,
        run_id: i64,
    },
    AllocationNotified {
        allocation_id: i64,
        recipient_id: i64,
    },
    AllocationPickedUp {
        allocation_id: i64,
        recipient_id: i64,
    },
    AllocationExpired {
        allocation_id: i64,
        item_id: i64,
        recipient_id: i64,
    },
    ExclusionImposed {
        recipient_id: i64,
        item_id: i64,
        until: DateTime<Utc>,
    },
    AllocationRejected {
        allocation_id: i64,
    },
    AllocationReturned {
        allocation_id: i64,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &AllocatorEvent);
}

/// Event bus for broadcasting lifecycle events
pub struct EventBus {
    sender: broadcast::Sender<AllocatorEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: AllocatorEvent) {
        trace!(event = ?event, "Emitting allocator event");
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AllocatorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &AllocatorEvent) {
        match event {
            AllocatorEvent::RunFinished { run_id, kind, stats } => {
                info!(run_id, kind = %kind, stats = %stats, "Run finished");
            }
            AllocatorEvent::AllocationQueued { allocation_id, item_id, recipient_id, .. } => {
                debug!(allocation_id, item_id, recipient_id, "Allocation queued");
            }
            AllocatorEvent::AllocationNotified { allocation_id, recipient_id } => {
                debug!(allocation_id, recipient_id, "Allocation notified");
            }
            AllocatorEvent::AllocationPickedUp { allocation_id, recipient_id } => {
                info!(allocation_id, recipient_id, "Allocation picked up");
            }
            AllocatorEvent::AllocationExpired { allocation_id, item_id, recipient_id } => {
                info!(allocation_id, item_id, recipient_id, "Allocation expired");
            }
            AllocatorEvent::ExclusionImposed { recipient_id, item_id, until } => {
                debug!(recipient_id, item_id, until = %until, "Exclusion imposed");
            }
            AllocatorEvent::AllocationRejected { allocation_id } => {
                info!(allocation_id, "Allocation rejected");
            }
            AllocatorEvent::AllocationReturned { allocation_id } => {
                info!(allocation_id, "Allocation returned to pool");
            }
        }
    }
}

/// Feed every event from `bus` into `listener` until the bus is dropped
pub fn spawn_listener<L>(bus: &EventBus, listener: L) -> tokio::task::JoinHandle<()>
where
    L: EventListener + 'static,
{
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Event listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Collect(Arc<Mutex<Vec<AllocatorEvent>>>);

    impl EventListener for Collect {
        fn on_event(&self, event: &AllocatorEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn test_listener_receives_events_until_bus_drops() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handle = spawn_listener(&bus, Collect(seen.clone()));
        assert_eq!(bus.subscriber_count(), 1);

        bus.emit(AllocatorEvent::AllocationRejected { allocation_id: 7 });
        drop(bus);
        handle.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![AllocatorEvent::AllocationRejected { allocation_id: 7 }]
        );
    }
}

//! Sync lifecycle events for observability.
//!
//! Listeners are panic-isolated: an observer can never interrupt or abort
//! a sync cycle.

use crate::sync::models::CycleReport;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

/// Lifecycle event emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A cycle passed its readiness checks and began.
    Started,
    /// A cycle finished; carries the per-table counters.
    Completed(CycleReport),
    /// A cycle aborted with an error.
    Error(String),
    /// A realtime invalidation triggered a targeted pull.
    Realtime { table: String },
}

type Listener = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// Registry of lifecycle listeners.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all subsequent events.
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Deliver an event to every listener, isolating panics.
    pub fn emit(&self, event: &SyncEvent) {
        let listeners = match self.listeners.lock() {
            Ok(listeners) => listeners,
            Err(_) => return,
        };
        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("sync event listener panicked; continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_receive_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let seen = count.clone();
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SyncEvent::Started);
        bus.emit(&SyncEvent::Error("boom".to_string()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(|_| panic!("bad listener"));
        let seen = count.clone();
        bus.subscribe(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&SyncEvent::Started);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

//! Plugin Event Bus
//!
//! Pub/sub keyed by event-type string. Subscribers carry a numeric priority
//! (lower is delivered first); equal priorities keep registration order.
//!
//! Two delivery modes:
//! - [`EventBus::publish`] dispatches immediately on the calling thread
//! - [`EventBus::publish_queued`] pushes onto a priority queue drained by a
//!   single loop at a time, FIFO within equal priority
//!
//! Handler errors and panics are caught and logged. They never reach the
//! publisher and never stop delivery to the remaining subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{error, trace, warn};
use uuid::Uuid;

/// Event type names published by the runtime
pub mod names {
    pub const PLUGIN_LOADED: &str = "plugin.loaded";
    pub const PLUGIN_ACTIVATED: &str = "plugin.activated";
    pub const PLUGIN_DEACTIVATED: &str = "plugin.deactivated";
    pub const PLUGIN_STARTED: &str = "plugin.started";
    pub const PLUGIN_STOPPED: &str = "plugin.stopped";
    pub const PLUGIN_UNLOADED: &str = "plugin.unloaded";
    pub const PLUGIN_RELOADED: &str = "plugin.reloaded";
    pub const PLUGIN_ERROR: &str = "plugin.error";
    pub const PLUGIN_CONFIG_CHANGED: &str = "plugin.config_changed";
    pub const PERMISSION_GRANTED: &str = "plugin.permission_granted";
    pub const PERMISSION_REVOKED: &str = "plugin.permission_revoked";
    pub const DATA_PROCESSED: &str = "plugin.data_processed";
    pub const DEPENDENCY_CHECKED: &str = "dependency.checked";
    pub const DEPENDENCY_CONFLICT: &str = "dependency.conflict";
    pub const DEPENDENCY_CYCLE: &str = "dependency.cycle";
    pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
}

/// A published event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    /// Plugin name, or `None` for events raised by the runtime itself
    pub source: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Subscriber callback
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    priority: i32,
    handler: EventHandler,
}

struct QueuedEvent {
    priority: i32,
    seq: u64,
    event: Event,
}

// BinaryHeap is a max-heap: invert so the lowest (priority, seq) pops first.
impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedEvent {}

pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    last_events: RwLock<HashMap<String, Event>>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    draining: AtomicBool,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    queue_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_capacity(1_024)
    }

    /// `queue_capacity` is a soft bound: exceeding it only logs a warning
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            last_events: RwLock::new(HashMap::new()),
            queue: Mutex::new(BinaryHeap::new()),
            draining: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            queue_capacity,
        }
    }

    /// Register a handler for `event_type`
    pub fn subscribe<F>(&self, event_type: &str, priority: i32, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, AtomicOrdering::Relaxed));
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let list = subscribers.entry(event_type.to_string()).or_default();
        let position = list.partition_point(|s| s.priority <= priority);
        list.insert(
            position,
            Subscriber {
                id,
                priority,
                handler: Arc::new(handler),
            },
        );
        trace!(event_type, priority, "Subscriber registered");
        id
    }

    /// Remove a subscription; returns whether it existed
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        subscribers.retain(|_, list| {
            let before = list.len();
            list.retain(|s| s.id != id);
            removed |= list.len() != before;
            !list.is_empty()
        });
        removed
    }

    /// Drop subscribers (and cached last events) for one type, or for all types
    pub fn clear(&self, event_type: Option<&str>) {
        let mut subscribers = self.subscribers.write().unwrap_or_else(PoisonError::into_inner);
        let mut last = self.last_events.write().unwrap_or_else(PoisonError::into_inner);
        match event_type {
            Some(event_type) => {
                subscribers.remove(event_type);
                last.remove(event_type);
            }
            None => {
                subscribers.clear();
                last.clear();
            }
        }
    }

    pub fn subscriber_count(&self, event_type: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .map_or(0, Vec::len)
    }

    /// Most recently published event of a type
    pub fn last_event(&self, event_type: &str) -> Option<Event> {
        self.last_events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    /// Deliver immediately; returns how many handlers completed without error
    pub fn publish(&self, event: Event) -> usize {
        self.last_events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.event_type.clone(), event.clone());
        self.dispatch(&event)
    }

    /// Convenience for `publish(Event::new(..))`
    pub fn emit(&self, event_type: &str, payload: serde_json::Value) -> usize {
        self.publish(Event::new(event_type, payload))
    }

    /// Enqueue for serialized delivery and drain unless a drain is already running
    pub fn publish_queued(&self, event: Event, priority: i32) {
        self.last_events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(event.event_type.clone(), event.clone());

        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() >= self.queue_capacity {
                warn!(pending = queue.len(), capacity = self.queue_capacity, "Event queue above capacity");
            }
            queue.push(QueuedEvent {
                priority,
                seq: self.next_seq.fetch_add(1, AtomicOrdering::Relaxed),
                event,
            });
        }

        self.drain();
    }

    /// Events waiting in the queue
    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, AtomicOrdering::AcqRel, AtomicOrdering::Acquire)
                .is_err()
            {
                return;
            }

            loop {
                let next = self.queue.lock().unwrap_or_else(PoisonError::into_inner).pop();
                match next {
                    Some(queued) => {
                        self.dispatch(&queued.event);
                    }
                    None => break,
                }
            }

            self.draining.store(false, AtomicOrdering::Release);

            // A producer may have pushed after our last pop but before the flag cleared.
            if self.pending() == 0 {
                return;
            }
        }
    }

    fn dispatch(&self, event: &Event) -> usize {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&event.event_type)
            .map(|list| list.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!(event_type = %event.event_type, error = %e, "Event handler failed");
                }
                Err(_) => {
                    error!(event_type = %event.event_type, "Event handler panicked");
                }
            }
        }
        delivered
    }
}

/// Event handle given to a plugin, scoped to its name
#[derive(Clone)]
pub struct EventEmitter {
    bus: Arc<EventBus>,
    source: String,
}

impl EventEmitter {
    pub fn new(bus: Arc<EventBus>, source: impl Into<String>) -> Self {
        Self {
            bus,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Publish with this plugin as the source
    pub fn emit(&self, event_type: &str, payload: serde_json::Value) -> usize {
        self.bus
            .publish(Event::new(event_type, payload).with_source(self.source.clone()))
    }

    pub fn subscribe<F>(&self, event_type: &str, priority: i32, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(event_type, priority, handler)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field("source", &self.source)
            .finish()
    }
}

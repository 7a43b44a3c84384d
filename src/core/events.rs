// Event System for FX Sniper
// Owned pub/sub bus (tokio broadcast + callbacks) for signal lifecycle notifications

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use parking_lot::RwLock;
use uuid::Uuid;

// ============================================================================
// Event Priority
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    Critical = 1,  // Pipeline failures
    High = 2,      // Published / released signals
    Medium = 3,    // Delays, sweeps, threshold adjustments
    Low = 4,       // Rejections, expiries
    Info = 5,      // Minor updates
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Event
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event_type: String,
    pub timestamp: i64,
    pub data: HashMap<String, serde_json::Value>,
    pub source: String,
    pub priority: EventPriority,
    pub event_id: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        timestamp: i64,
        data: HashMap<String, serde_json::Value>,
        source: &str,
        priority: EventPriority,
    ) -> Self {
        Self {
            event_type: event_type.to_string(),
            timestamp,
            data,
            source: source.to_string(),
            priority,
            event_id: Uuid::new_v4().to_string(),
        }
    }

    /// Builder-style field insertion
    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    pub fn symbol(&self) -> Option<&str> {
        self.data.get("symbol").and_then(|v| v.as_str())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Event(type={}, source={}, priority={:?}, id={})",
            self.event_type,
            self.source,
            self.priority,
            &self.event_id[..8]
        )
    }
}

// ============================================================================
// Event Bus
// ============================================================================

type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    subscribers: RwLock<HashMap<String, Vec<EventCallback>>>,
    wildcard_subscribers: RwLock<Vec<EventCallback>>,
    event_history: RwLock<VecDeque<Event>>,
    max_history: usize,
    stats: RwLock<EventBusStats>,
}

#[derive(Debug, Clone, Default)]
struct EventBusStats {
    total_published: u64,
    total_delivered: u64,
    errors: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024, 2000)
    }

    pub fn with_capacity(channel_capacity: usize, max_history: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity.max(1));

        Self {
            tx,
            subscribers: RwLock::new(HashMap::new()),
            wildcard_subscribers: RwLock::new(Vec::new()),
            event_history: RwLock::new(VecDeque::with_capacity(max_history.min(4096))),
            max_history,
            stats: RwLock::new(EventBusStats::default()),
        }
    }

    /// Subscribe to events by type, or "*" for all events
    pub fn subscribe<F>(&self, event_type: &str, callback: F)
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);

        if event_type == "*" {
            self.wildcard_subscribers.write().push(callback);
        } else {
            self.subscribers
                .write()
                .entry(event_type.to_string())
                .or_default()
                .push(callback);
        }

        tracing::debug!(event_type = %event_type, "Subscribed to events");
    }

    /// Publish event to all subscribers. A panicking callback is counted, not propagated.
    pub fn publish(&self, event: Event) {
        self.stats.write().total_published += 1;

        {
            let mut history = self.event_history.write();
            history.push_back(event.clone());
            while history.len() > self.max_history {
                history.pop_front();
            }
        }

        // No receivers is fine
        let _ = self.tx.send(event.clone());

        // Collect callbacks first so they can publish without deadlocking
        let mut callbacks: Vec<EventCallback> = self
            .subscribers
            .read()
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        callbacks.extend(self.wildcard_subscribers.read().iter().cloned());

        let mut delivered = 0u64;
        let mut errors = 0u64;
        for callback in callbacks {
            let ev = event.clone();
            match catch_unwind(AssertUnwindSafe(|| callback(ev))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    errors += 1;
                    tracing::warn!(event_type = %event.event_type, "Event subscriber panicked");
                }
            }
        }

        let mut stats = self.stats.write();
        stats.total_delivered += delivered;
        stats.errors += errors;
    }

    /// Get a receiver for all events (broadcast channel)
    pub fn subscribe_channel(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Get recent events from history, newest first
    pub fn get_recent_events(&self, event_type: Option<&str>, limit: Option<usize>) -> Vec<Event> {
        let history = self.event_history.read();
        let limit = limit.unwrap_or(100);

        history
            .iter()
            .rev()
            .filter(|e| event_type.map_or(true, |et| e.event_type == et))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Get event bus statistics
    pub fn get_stats(&self) -> EventBusStatsSnapshot {
        let stats = self.stats.read();
        let subscribers = self.subscribers.read();
        let wildcard = self.wildcard_subscribers.read();

        EventBusStatsSnapshot {
            total_published: stats.total_published,
            total_delivered: stats.total_delivered,
            errors: stats.errors,
            subscriber_count: subscribers.values().map(|v| v.len()).sum::<usize>() + wildcard.len(),
            event_types: subscribers.keys().cloned().collect(),
            history_size: self.event_history.read().len(),
        }
    }

    /// Clear event history
    pub fn clear_history(&self) {
        self.event_history.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of event bus statistics
#[derive(Debug, Clone)]
pub struct EventBusStatsSnapshot {
    pub total_published: u64,
    pub total_delivered: u64,
    pub errors: u64,
    pub subscriber_count: usize,
    pub event_types: Vec<String>,
    pub history_size: usize,
}

impl fmt::Display for EventBusStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EventBusStats(published={}, delivered={}, errors={}, subscribers={}, history={})",
            self.total_published, self.total_delivered, self.errors,
            self.subscriber_count, self.history_size
        )
    }
}

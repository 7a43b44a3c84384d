// Signal Publisher - Delivers accepted signals to downstream sinks
// Bounded buffer with per-sink retry; publishing never blocks the scan loop

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::core::events::{Event, EventBus, EventPriority};
use crate::core::types::Signal;
use crate::layer3::common::event_types::SIGNAL_PUBLISHED;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

/// Downstream consumer of published signals. Must be idempotent on `Signal::id`.
pub trait SignalSink: Send + Sync {
    fn name(&self) -> &str;
    fn deliver(&self, signal: &Signal) -> Result<(), PublishError>;
}

// ============================================================================
// Sinks
// ============================================================================

/// In-process consumers: each signal becomes a `signal_published` event
pub struct EventBusSink {
    bus: Arc<EventBus>,
}

impl EventBusSink {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self { bus }
    }
}

impl SignalSink for EventBusSink {
    fn name(&self) -> &str {
        "event_bus"
    }

    fn deliver(&self, signal: &Signal) -> Result<(), PublishError> {
        let data: HashMap<String, serde_json::Value> = match serde_json::to_value(signal)? {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => HashMap::from([("signal".to_string(), other)]),
        };
        self.bus.publish(Event::new(
            SIGNAL_PUBLISHED,
            signal.created_at,
            data,
            "signal_publisher",
            EventPriority::High,
        ));
        Ok(())
    }
}

/// One JSON object per line, appended to a file
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SignalSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json_lines"
    }

    fn deliver(&self, signal: &Signal) -> Result<(), PublishError> {
        let mut line = serde_json::to_string(signal)?;
        line.push('\n');

        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }

        let result = match guard.as_mut() {
            Some(file) => file.write_all(line.as_bytes()).and_then(|_| file.flush()),
            None => Ok(()),
        };
        if result.is_err() {
            // Reopen on the next attempt
            *guard = None;
        }
        result.map_err(PublishError::from)
    }
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub published: u64,
    pub delivered: u64,
    pub failed_attempts: u64,
    pub dropped: u64,
    pub pending: usize,
}

impl fmt::Display for PublisherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Publisher(published={}, delivered={}, failed_attempts={}, dropped={}, pending={})",
            self.published, self.delivered, self.failed_attempts, self.dropped, self.pending
        )
    }
}

struct PendingSignal {
    signal: Signal,
    delivered: Vec<bool>,
    attempts: u32,
}

pub struct SignalPublisher {
    sinks: Vec<Arc<dyn SignalSink>>,
    queue: Mutex<VecDeque<PendingSignal>>,
    capacity: usize,
    notify: Notify,
    stats: Mutex<PublisherStats>,
    retry_base: Duration,
    retry_max: Duration,
}

impl SignalPublisher {
    pub fn new(sinks: Vec<Arc<dyn SignalSink>>, capacity: usize) -> Self {
        Self {
            sinks,
            queue: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            notify: Notify::new(),
            stats: Mutex::new(PublisherStats::default()),
            retry_base: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max.max(base);
        self
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    /// Queue a signal for delivery. Never blocks; a full buffer drops its oldest entry.
    pub fn publish(&self, signal: Signal) {
        {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                if let Some(old) = queue.pop_front() {
                    self.stats.lock().dropped += 1;
                    warn!(signal_id = %old.signal.id, symbol = %old.signal.symbol, "Publish buffer full, dropping oldest signal");
                }
            }
            queue.push_back(PendingSignal {
                delivered: vec![false; self.sinks.len()],
                signal,
                attempts: 0,
            });
            self.stats.lock().published += 1;
        }
        self.notify.notify_one();
    }

    /// Try every pending signal against every sink it has not reached yet.
    /// Returns the number of signals fully delivered by this pass.
    pub fn flush(&self) -> usize {
        let mut batch: Vec<PendingSignal> = self.queue.lock().drain(..).collect();
        let mut completed = 0;
        let mut failures = 0u64;

        for pending in batch.iter_mut() {
            pending.attempts += 1;
            for (idx, sink) in self.sinks.iter().enumerate() {
                if pending.delivered[idx] {
                    continue;
                }
                match sink.deliver(&pending.signal) {
                    Ok(()) => pending.delivered[idx] = true,
                    Err(e) => {
                        failures += 1;
                        warn!(
                            sink = sink.name(),
                            signal_id = %pending.signal.id,
                            attempts = pending.attempts,
                            error = %e,
                            "Signal delivery failed, will retry"
                        );
                    }
                }
            }
        }

        let remaining: Vec<PendingSignal> = batch
            .into_iter()
            .filter(|p| {
                let done = p.delivered.iter().all(|d| *d);
                if done {
                    completed += 1;
                    debug!(signal_id = %p.signal.id, "Signal delivered to all sinks");
                }
                !done
            })
            .collect();

        {
            // Retries go back in front of anything queued during this pass
            let mut queue = self.queue.lock();
            for pending in remaining.into_iter().rev() {
                queue.push_front(pending);
            }
            while queue.len() > self.capacity {
                if queue.pop_front().is_some() {
                    self.stats.lock().dropped += 1;
                }
            }
        }

        let mut stats = self.stats.lock();
        stats.delivered += completed as u64;
        stats.failed_attempts += failures;
        completed
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Delivery loop: wakes on new signals, backs off while sinks keep failing
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(sinks = ?self.sink_names(), "Signal publisher started");
        let mut delay = self.retry_base;

        loop {
            if self.pending() > 0 {
                self.flush();
            }
            let wait = if self.pending() > 0 {
                let current = delay;
                delay = (delay * 2).min(self.retry_max);
                current
            } else {
                delay = self.retry_base;
                self.retry_max
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.flush();
        let left = self.pending();
        if left > 0 {
            warn!(pending = left, "Signal publisher stopped with undelivered signals");
        }
        info!("Signal publisher stopped");
    }

    pub fn get_stats(&self) -> PublisherStats {
        let mut stats = self.stats.lock().clone();
        stats.pending = self.pending();
        stats
    }
}

// Supervisor - Restarts the engine after failures with bounded exponential backoff
// The engine snapshots its candles on every exit path, so each restart warm-starts

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::config::SupervisorConfig;
use crate::core::events::{Event, EventBus, EventPriority};
use crate::layer3::common::PIPELINE_RESTARTED;

use super::runtime::EngineError;

/// `min(base * 2^attempt, max)`
pub fn restart_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorStats {
    pub runs: u64,
    pub restarts: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub gave_up: bool,
}

impl fmt::Display for SupervisorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Supervisor(runs={}, restarts={}, consecutive_failures={}, gave_up={})",
            self.runs, self.restarts, self.consecutive_failures, self.gave_up
        )
    }
}

pub struct Supervisor {
    max_restarts: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    stable_after: Duration,
    events: Option<Arc<EventBus>>,
    stats: Mutex<SupervisorStats>,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            base_backoff: Duration::from_secs(config.base_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            stable_after: Duration::from_secs(config.stable_after_secs),
            events: None,
            stats: Mutex::new(SupervisorStats::default()),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max.max(base);
        self
    }

    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Run `factory(run_index)` until it returns Ok, shutdown is requested,
    /// or `max_restarts` consecutive failures have been retried.
    pub async fn run<F, Fut>(&self, mut factory: F, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let mut attempt = 0u32;
        let mut run_index = 0u32;

        loop {
            let started = Instant::now();
            self.stats.lock().runs += 1;
            info!(run = run_index, "Starting engine");

            let err = match factory(run_index).await {
                Ok(()) => {
                    info!(run = run_index, "Engine exited cleanly");
                    return Ok(());
                }
                Err(e) => e,
            };
            run_index += 1;

            if *shutdown.borrow() {
                warn!(error = %err, "Engine failed during shutdown, not restarting");
                return Err(err);
            }

            if started.elapsed() >= self.stable_after {
                attempt = 0;
            }

            {
                let mut stats = self.stats.lock();
                stats.consecutive_failures = attempt + 1;
                stats.last_error = Some(err.to_string());
            }

            if attempt >= self.max_restarts {
                error!(
                    error = %err,
                    max_restarts = self.max_restarts,
                    "Engine exceeded restart limit, giving up"
                );
                self.stats.lock().gave_up = true;
                return Err(err);
            }

            let delay = restart_delay(self.base_backoff, self.max_backoff, attempt);
            attempt += 1;
            self.stats.lock().restarts += 1;
            error!(
                error = %err,
                attempt = attempt,
                max_restarts = self.max_restarts,
                delay_ms = delay.as_millis() as u64,
                "Engine failed, restarting"
            );

            if let Some(bus) = &self.events {
                bus.publish(
                    Event::new(
                        PIPELINE_RESTARTED,
                        chrono::Utc::now().timestamp_millis(),
                        HashMap::new(),
                        "supervisor",
                        EventPriority::Critical,
                    )
                    .with("attempt", attempt)
                    .with("delay_ms", delay.as_millis() as u64)
                    .with("error", err.to_string()),
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown during restart backoff");
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn get_stats(&self) -> SupervisorStats {
        self.stats.lock().clone()
    }
}

// Sweep Guard - Holds signals that sit in front of a liquidity zone until the sweep happens
// Per symbol: Idle -> SweepActive -> SweepCompleted, plus at most one delayed signal

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::config::GuardConfig;
use crate::core::events::{Event, EventBus, EventPriority};
use crate::core::types::{to_pips, Candle, Direction, Signal, SweepStatus};
use crate::layer2::ingestion::TickObserver;
use crate::layer3::common::{TimeWindow, SWEEP_COMPLETED, SWEEP_STARTED};

use super::liquidity_zones::{LiquidityZone, LiquidityZoneTracker, ZoneSettings, ZoneType};

const COMPLETED_CAPACITY: usize = 32;

// ============================================================================
// Sweep records
// ============================================================================

#[derive(Debug, Clone)]
pub struct ActiveSweep {
    pub zone: LiquidityZone,
    pub started_at: i64,
    /// Furthest price reached beyond the zone
    pub extreme: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletedSweep {
    pub symbol: String,
    pub zone_type: ZoneType,
    pub zone_price: f64,
    /// Trade direction the reversal favours: a swept support reverses up
    pub reversal_direction: Direction,
    pub magnitude_pips: f64,
    pub completed_at: i64,
}

#[derive(Debug, Clone)]
pub struct DelayedSignal {
    pub signal: Signal,
    pub zone: LiquidityZone,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone)]
pub enum GuardDecision {
    /// Publish now, tagged Clear or PostSweep
    Publish(Signal),
    /// Held until the zone is swept or the deadline passes. `displaced` is the
    /// weaker signal that was waiting before and has now been dropped.
    Delayed {
        zone: LiquidityZone,
        expires_at: i64,
        displaced: Option<DelayedSignal>,
    },
    /// At risk, but an equal or stronger signal is already waiting for this symbol
    Superseded,
}

fn reversal_direction(zone_type: ZoneType) -> Direction {
    match zone_type {
        ZoneType::Support => Direction::Long,
        ZoneType::Resistance => Direction::Short,
    }
}

/// Zone type a signal would be swept through: longs sit above support, shorts below resistance
fn exposed_zone_type(direction: Direction) -> ZoneType {
    match direction {
        Direction::Long => ZoneType::Support,
        Direction::Short => ZoneType::Resistance,
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GuardStats {
    pub sweeps_started: u64,
    pub sweeps_completed: u64,
    pub sweeps_timed_out: u64,
    pub cleared: u64,
    pub post_sweep: u64,
    pub delayed: u64,
    /// New at-risk signals dropped because a stronger one was already waiting
    pub superseded: u64,
    /// Waiting signals replaced by a stronger newcomer
    pub displaced: u64,
    pub released: u64,
    pub requeued: u64,
    pub expired: u64,
    pub active_sweeps: usize,
    pub pending_delayed: usize,
}

impl fmt::Display for GuardStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SweepGuard(started={}, completed={}, timed_out={}, clear={}, post_sweep={}, delayed={}, superseded={}, displaced={}, released={}, expired={}, pending={})",
            self.sweeps_started,
            self.sweeps_completed,
            self.sweeps_timed_out,
            self.cleared,
            self.post_sweep,
            self.delayed,
            self.superseded,
            self.displaced,
            self.released,
            self.expired,
            self.pending_delayed
        )
    }
}

// ============================================================================
// Guard
// ============================================================================

struct SymbolSweepState {
    active: Option<ActiveSweep>,
    completed: TimeWindow<CompletedSweep>,
    delayed: Option<DelayedSignal>,
    /// Released by a sweep, waiting for the next scan to publish them
    released: Vec<DelayedSignal>,
}

impl SymbolSweepState {
    fn new(window_ms: i64) -> Self {
        Self {
            active: None,
            completed: TimeWindow::new(window_ms, COMPLETED_CAPACITY),
            delayed: None,
            released: Vec::new(),
        }
    }
}

pub struct SweepGuard {
    config: Mutex<GuardConfig>,
    zones: LiquidityZoneTracker,
    state: Mutex<HashMap<String, SymbolSweepState>>,
    event_bus: Option<Arc<EventBus>>,
    stats: Mutex<GuardStats>,
}

impl SweepGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            zones: LiquidityZoneTracker::new(ZoneSettings::from(&config)),
            config: Mutex::new(config),
            state: Mutex::new(HashMap::new()),
            event_bus: None,
            stats: Mutex::new(GuardStats::default()),
        }
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn set_config(&self, config: GuardConfig) {
        self.zones.set_settings(ZoneSettings::from(&config));
        let window_ms = config.completed_window_secs * 1000;
        for state in self.state.lock().values_mut() {
            state.completed.set_duration_ms(window_ms);
        }
        *self.config.lock() = config;
    }

    pub fn zones(&self) -> &LiquidityZoneTracker {
        &self.zones
    }

    pub fn refresh_zones(&self, symbol: &str, m5: &[Candle], current_price: f64) -> usize {
        self.zones.update(symbol, m5, current_price)
    }

    /// Advance the sweep state machine for one price update
    pub fn on_price(&self, symbol: &str, price: f64, now: i64) {
        if !price.is_finite() || price <= 0.0 {
            return;
        }
        let config = self.config.lock().clone();
        let zones = self.zones.zones(symbol);
        let mut events = Vec::new();

        {
            let mut states = self.state.lock();
            let state = states
                .entry(symbol.to_string())
                .or_insert_with(|| SymbolSweepState::new(config.completed_window_secs * 1000));
            let mut stats = self.stats.lock();

            match state.active.take() {
                Some(active) if now - active.started_at > config.active_sweep_timeout_secs * 1000 => {
                    stats.sweeps_timed_out += 1;
                    debug!(symbol = %symbol, zone = active.zone.price, "Active sweep timed out");
                }
                Some(mut active) => {
                    let (zone_type, level) = (active.zone.zone_type, active.zone.price);
                    let (beyond, back_across) = match zone_type {
                        ZoneType::Resistance => (price > active.extreme, price < level),
                        ZoneType::Support => (price < active.extreme, price > level),
                    };
                    if beyond {
                        active.extreme = price;
                    }
                    let retrace = to_pips(symbol, (active.extreme - price).abs());

                    if back_across && retrace >= config.min_reversal_pips {
                        let sweep = CompletedSweep {
                            symbol: symbol.to_string(),
                            zone_type,
                            zone_price: level,
                            reversal_direction: reversal_direction(zone_type),
                            magnitude_pips: to_pips(symbol, (active.extreme - level).abs()),
                            completed_at: now,
                        };
                        stats.sweeps_completed += 1;
                        info!(
                            symbol = %symbol,
                            zone = %zone_type,
                            level,
                            magnitude_pips = sweep.magnitude_pips,
                            "Sweep completed"
                        );

                        // Release a waiting signal on the reversal side
                        if let Some(delayed) = state.delayed.take() {
                            if delayed.signal.direction == sweep.reversal_direction {
                                let signal = delayed
                                    .signal
                                    .boosted(config.sweep_boost)
                                    .with_sweep_status(SweepStatus::Released);
                                stats.released += 1;
                                info!(symbol = %symbol, id = %signal.id, confidence = signal.confidence, "Delayed signal released");
                                state.released.push(DelayedSignal { signal, ..delayed });
                            } else {
                                state.delayed = Some(delayed);
                            }
                        }

                        events.push(
                            Event::new(SWEEP_COMPLETED, now, HashMap::new(), "sweep_guard", EventPriority::High)
                                .with("symbol", symbol)
                                .with("zone_type", sweep.zone_type.to_string())
                                .with("zone_price", sweep.zone_price)
                                .with("direction", sweep.reversal_direction.to_string())
                                .with("magnitude_pips", sweep.magnitude_pips),
                        );
                        state.completed.add(now, sweep);
                    } else {
                        state.active = Some(active);
                    }
                }
                None => {
                    let breached = zones
                        .iter()
                        .filter(|z| z.is_breached_by(price))
                        .min_by(|a, b| a.distance_pips(price).total_cmp(&b.distance_pips(price)));
                    if let Some(zone) = breached {
                        stats.sweeps_started += 1;
                        debug!(symbol = %symbol, zone = %zone, price, "Sweep started");
                        events.push(
                            Event::new(SWEEP_STARTED, now, HashMap::new(), "sweep_guard", EventPriority::Medium)
                                .with("symbol", symbol)
                                .with("zone_type", zone.zone_type.to_string())
                                .with("zone_price", zone.price)
                                .with("price", price),
                        );
                        state.active = Some(ActiveSweep { zone: zone.clone(), started_at: now, extreme: price });
                    }
                }
            }
        }

        if let Some(bus) = &self.event_bus {
            for event in events {
                bus.publish(event);
            }
        }
    }

    /// Decide whether `signal` publishes now, waits for a sweep, or is dropped
    pub fn evaluate(&self, signal: Signal, now: i64) -> GuardDecision {
        let config = self.config.lock().clone();
        let symbol = signal.symbol.clone();
        let mut states = self.state.lock();
        let state = states
            .entry(symbol.clone())
            .or_insert_with(|| SymbolSweepState::new(config.completed_window_secs * 1000));
        let mut stats = self.stats.lock();

        let direction = signal.direction;
        if let Some(sweep) = state.completed.latest_matching(now, |s| s.reversal_direction == direction) {
            stats.post_sweep += 1;
            debug!(symbol = %symbol, level = sweep.zone_price, "Post-sweep entry");
            return GuardDecision::Publish(
                signal.boosted(config.sweep_boost).with_sweep_status(SweepStatus::PostSweep),
            );
        }

        let exposed = exposed_zone_type(direction);
        let entry = signal.entry_price;
        let at_risk = self
            .zones
            .zones(&symbol)
            .into_iter()
            .filter(|z| z.zone_type == exposed)
            .filter(|z| {
                // Entry on the near side of the zone, within the delay distance
                let gap = (entry - z.price) * direction.sign();
                gap >= 0.0 && to_pips(&symbol, gap) <= config.delay_distance_pips
            })
            .min_by(|a, b| a.distance_pips(entry).total_cmp(&b.distance_pips(entry)));

        let Some(zone) = at_risk else {
            stats.cleared += 1;
            return GuardDecision::Publish(signal.with_sweep_status(SweepStatus::Clear));
        };

        if let Some(existing) = &state.delayed {
            if existing.signal.confidence >= signal.confidence {
                stats.superseded += 1;
                debug!(symbol = %symbol, waiting = %existing.signal.id, "Stronger delayed signal already waiting");
                return GuardDecision::Superseded;
            }
        }
        let displaced = state.delayed.take();
        if let Some(old) = &displaced {
            stats.displaced += 1;
            info!(symbol = %symbol, old = %old.signal.id, new = %signal.id, "Delayed signal displaced by stronger one");
        }

        let expires_at = now + config.delay_expiry_secs * 1000;
        info!(
            symbol = %symbol,
            pattern = %signal.pattern,
            zone = %zone,
            expires_at,
            "Signal delayed ahead of liquidity zone"
        );
        stats.delayed += 1;
        state.delayed = Some(DelayedSignal { signal, zone: zone.clone(), created_at: now, expires_at });
        GuardDecision::Delayed { zone, expires_at, displaced }
    }

    /// Drop delayed and released-but-unpublished signals whose deadline has passed
    pub fn expire(&self, now: i64) -> Vec<DelayedSignal> {
        let mut expired = Vec::new();
        let mut states = self.state.lock();
        for (symbol, state) in states.iter_mut() {
            state.completed.prune(now);
            if state.delayed.as_ref().is_some_and(|d| now >= d.expires_at) {
                if let Some(delayed) = state.delayed.take() {
                    info!(symbol = %symbol, id = %delayed.signal.id, "Delayed signal expired");
                    expired.push(delayed);
                }
            }
            let (stale, live): (Vec<_>, Vec<_>) =
                std::mem::take(&mut state.released).into_iter().partition(|d| now >= d.expires_at);
            state.released = live;
            for released in stale {
                info!(symbol = %symbol, id = %released.signal.id, "Released signal expired before publishing");
                expired.push(released);
            }
        }
        self.stats.lock().expired += expired.len() as u64;
        expired
    }

    /// Released signals waiting to be published for one symbol, drained
    pub fn take_released(&self, symbol: &str) -> Vec<DelayedSignal> {
        self.state
            .lock()
            .get_mut(symbol)
            .map(|s| std::mem::take(&mut s.released))
            .unwrap_or_default()
    }

    /// Released signals for every observed symbol, drained, ordered by symbol
    pub fn take_all_released(&self) -> Vec<DelayedSignal> {
        let mut released: Vec<DelayedSignal> = self
            .state
            .lock()
            .values_mut()
            .flat_map(|state| std::mem::take(&mut state.released))
            .collect();
        released.sort_by(|a, b| a.signal.symbol.cmp(&b.signal.symbol));
        released
    }

    /// Put back a released signal that could not publish yet; `expire` still applies
    pub fn requeue_released(&self, released: DelayedSignal) {
        let config = self.config.lock().clone();
        self.stats.lock().requeued += 1;
        self.state
            .lock()
            .entry(released.signal.symbol.clone())
            .or_insert_with(|| SymbolSweepState::new(config.completed_window_secs * 1000))
            .released
            .push(released);
    }

    pub fn delayed(&self, symbol: &str) -> Option<DelayedSignal> {
        self.state.lock().get(symbol).and_then(|s| s.delayed.clone())
    }

    pub fn active_sweep(&self, symbol: &str) -> Option<ActiveSweep> {
        self.state.lock().get(symbol).and_then(|s| s.active.clone())
    }

    pub fn recent_sweeps(&self, symbol: &str, now: i64) -> Vec<CompletedSweep> {
        let mut states = self.state.lock();
        match states.get_mut(symbol) {
            Some(state) => {
                state.completed.prune(now);
                state.completed.iter().map(|(_, s)| s.clone()).collect()
            }
            None => Vec::new(),
        }
    }

    pub fn get_stats(&self) -> GuardStats {
        let states = self.state.lock();
        let mut stats = self.stats.lock().clone();
        stats.active_sweeps = states.values().filter(|s| s.active.is_some()).count();
        stats.pending_delayed = states.values().filter(|s| s.delayed.is_some()).count();
        stats
    }
}

impl TickObserver for SweepGuard {
    fn on_price(&self, symbol: &str, price: f64, timestamp_ms: i64) {
        SweepGuard::on_price(self, symbol, price, timestamp_ms);
    }
}

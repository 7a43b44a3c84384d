// Candle Aggregator - tick -> M1, 5 x M1 -> M5, 3 x M5 -> M15
// Also merges pre-aggregated OHLC candles and seals minutes that went quiet

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::types::{Candle, Tick, Timeframe};
use crate::layer2::candle_store::{CandleStore, SymbolCandles};

const M1_PER_M5: usize = 5;
const M5_PER_M15: usize = 3;

/// Why a tick or candle was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Malformed,
    /// Belongs to a minute older than the forming bar
    Late,
}

#[derive(Debug, Clone, Default)]
pub struct AggregatorStats {
    pub ticks_applied: u64,
    pub ticks_rejected: u64,
    pub ticks_late: u64,
    pub m1_sealed: u64,
    pub m5_built: u64,
    pub m15_built: u64,
    pub candles_merged: u64,
    pub candles_rejected: u64,
    pub duplicate_seals: u64,
}

impl fmt::Display for AggregatorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Aggregator(ticks={}, rejected={}, late={}, m1={}, m5={}, m15={}, merged={}, dup={})",
            self.ticks_applied, self.ticks_rejected, self.ticks_late, self.m1_sealed,
            self.m5_built, self.m15_built, self.candles_merged, self.duplicate_seals
        )
    }
}

pub struct CandleAggregator {
    store: Arc<CandleStore>,
    stats: Mutex<AggregatorStats>,
}

impl CandleAggregator {
    pub fn new(store: Arc<CandleStore>) -> Self {
        Self {
            store,
            stats: Mutex::new(AggregatorStats::default()),
        }
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    /// Apply one tick. Opens, updates or seals-and-reopens the symbol's M1 bar.
    pub fn on_tick(&self, tick: &Tick) -> Result<(), Rejection> {
        if !tick.is_valid() {
            self.stats.lock().ticks_rejected += 1;
            warn!(symbol = %tick.symbol, bid = tick.bid, ask = tick.ask, "Dropping malformed tick");
            return Err(Rejection::Malformed);
        }

        let handle = self.store.handle(&tick.symbol);
        let mut guard = handle.write();
        let minute = Timeframe::M1.period_start(tick.timestamp);
        let mid = tick.mid();

        let live_minute = guard.live_m1.as_ref().map(|c| c.timestamp);
        let sealed_through = guard.last(Timeframe::M1).map(|c| c.timestamp);
        let late = match live_minute {
            Some(ts) => ts > minute,
            None => sealed_through.is_some_and(|ts| ts >= minute),
        };
        if late {
            drop(guard);
            self.stats.lock().ticks_late += 1;
            debug!(symbol = %tick.symbol, ts = tick.timestamp, "Late tick ignored");
            return Err(Rejection::Late);
        }

        let mut sealed = RollupOutcome::default();
        if live_minute == Some(minute) {
            if let Some(live) = guard.live_m1.as_mut() {
                live.update(mid, tick.volume);
            }
        } else {
            if let Some(prev) = guard.live_m1.take() {
                sealed = seal_m1(&mut guard, prev);
            }
            guard.live_m1 = Some(Candle::from_price(Timeframe::M1, minute, mid, tick.volume));
        }
        guard.push_tick(tick.clone());
        drop(guard);

        let mut stats = self.stats.lock();
        stats.ticks_applied += 1;
        sealed.record(&mut stats);
        Ok(())
    }

    /// Seal every forming bar whose minute has fully elapsed at `now_ms`.
    /// Returns the number of bars sealed.
    pub fn seal_elapsed(&self, now_ms: i64) -> usize {
        self.seal_where(|live| live.end_time() <= now_ms)
    }

    /// Seal every forming bar regardless of time (shutdown flush)
    pub fn seal_all(&self) -> usize {
        self.seal_where(|_| true)
    }

    fn seal_where<F: Fn(&Candle) -> bool>(&self, should_seal: F) -> usize {
        let mut count = 0;
        let mut outcome = RollupOutcome::default();
        for symbol in self.store.symbols() {
            let Some(handle) = self.store.get(&symbol) else { continue };
            let mut guard = handle.write();
            if guard.live_m1.as_ref().is_some_and(&should_seal) {
                if let Some(live) = guard.live_m1.take() {
                    outcome.merge(seal_m1(&mut guard, live));
                    count += 1;
                }
            }
        }
        if count > 0 {
            outcome.record(&mut self.stats.lock());
        }
        count
    }

    /// Seal an already-closed M1 candle. Re-sealing a known minute is a no-op.
    pub fn seal_candle(&self, symbol: &str, candle: Candle) -> bool {
        if candle.timeframe != Timeframe::M1 || !candle.is_valid() {
            self.stats.lock().candles_rejected += 1;
            return false;
        }
        let handle = self.store.handle(symbol);
        let outcome = {
            let mut guard = handle.write();
            seal_m1(&mut guard, candle)
        };
        let applied = outcome.m1 > 0;
        outcome.record(&mut self.stats.lock());
        applied
    }

    /// Merge a pre-aggregated candle from the OHLC feed keyed by (symbol, timeframe, period start).
    /// Same key replaces, newer appends (and counts toward roll-ups), older is inserted in order.
    pub fn merge_candle(&self, symbol: &str, mut candle: Candle) -> bool {
        if !candle.is_valid() {
            self.stats.lock().candles_rejected += 1;
            warn!(symbol = %symbol, candle = %candle, "Dropping malformed OHLC candle");
            return false;
        }
        candle.timestamp = candle.timeframe.period_start(candle.timestamp);

        let handle = self.store.handle(symbol);
        let mut guard = handle.write();
        let newest = guard.last(candle.timeframe).map(|c| c.timestamp);
        let is_newer = newest.map_or(true, |ts| candle.timestamp > ts);

        let mut outcome = RollupOutcome::default();
        if is_newer {
            match candle.timeframe {
                Timeframe::M1 => {
                    // Authoritative bar supersedes a forming one for the same minute
                    if guard.live_m1.as_ref().is_some_and(|l| l.timestamp <= candle.timestamp) {
                        guard.live_m1 = None;
                    }
                    outcome = seal_m1(&mut guard, candle);
                }
                Timeframe::M5 => outcome = push_m5(&mut guard, candle),
                Timeframe::M15 => {
                    if guard.append(candle) {
                        outcome.m15 += 1;
                    }
                }
            }
        } else {
            guard.replace_or_insert(candle);
        }
        drop(guard);

        let mut stats = self.stats.lock();
        stats.candles_merged += 1;
        outcome.record(&mut stats);
        true
    }

    pub fn get_stats(&self) -> AggregatorStats {
        self.stats.lock().clone()
    }
}

// ============================================================================
// Roll-up helpers (run under the symbol's write lock)
// ============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct RollupOutcome {
    m1: u64,
    m5: u64,
    m15: u64,
    duplicates: u64,
}

impl RollupOutcome {
    fn merge(&mut self, other: RollupOutcome) {
        self.m1 += other.m1;
        self.m5 += other.m5;
        self.m15 += other.m15;
        self.duplicates += other.duplicates;
    }

    fn record(&self, stats: &mut AggregatorStats) {
        stats.m1_sealed += self.m1;
        stats.m5_built += self.m5;
        stats.m15_built += self.m15;
        stats.duplicate_seals += self.duplicates;
    }
}

/// Combine consecutive candles into one higher-timeframe candle
pub fn combine(candles: &[Candle], timeframe: Timeframe) -> Option<Candle> {
    let first = candles.first()?;
    let last = candles.last()?;
    Some(Candle {
        timeframe,
        open: first.open,
        high: candles.iter().map(|c| c.high).fold(f64::MIN, f64::max),
        low: candles.iter().map(|c| c.low).fold(f64::MAX, f64::min),
        close: last.close,
        volume: candles.iter().map(|c| c.volume).sum(),
        timestamp: timeframe.period_start(first.timestamp),
    })
}

fn seal_m1(guard: &mut SymbolCandles, candle: Candle) -> RollupOutcome {
    let mut outcome = RollupOutcome::default();
    if !guard.append(candle.clone()) {
        outcome.duplicates += 1;
        return outcome;
    }
    outcome.m1 += 1;
    debug!(symbol = %guard.symbol, candle = %candle, "M1 sealed");

    guard.pending_m1.push(candle);
    if guard.pending_m1.len() >= M1_PER_M5 {
        let batch: Vec<Candle> = guard.pending_m1.drain(..).collect();
        if let Some(m5) = combine(&batch, Timeframe::M5) {
            outcome.merge(push_m5(guard, m5));
        }
    }
    outcome
}

fn push_m5(guard: &mut SymbolCandles, candle: Candle) -> RollupOutcome {
    let mut outcome = RollupOutcome::default();
    if !guard.append(candle.clone()) {
        outcome.duplicates += 1;
        return outcome;
    }
    outcome.m5 += 1;
    debug!(symbol = %guard.symbol, candle = %candle, "M5 built");

    guard.pending_m5.push(candle);
    if guard.pending_m5.len() >= M5_PER_M15 {
        let batch: Vec<Candle> = guard.pending_m5.drain(..).collect();
        if let Some(m15) = combine(&batch, Timeframe::M15) {
            if guard.append(m15) {
                outcome.m15 += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
    }
    outcome
}

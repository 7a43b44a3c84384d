// Candle Store - Per-symbol bounded buffers for ticks and M1/M5/M15 candles
// Thread-safe: one RwLock per symbol, the symbol map itself behind its own RwLock

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::core::config::BufferConfig;
use crate::core::types::{Candle, Tick, Timeframe};

/// Lifetime number of candles appended per timeframe (unaffected by eviction)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandleTotals {
    pub m1: u64,
    pub m5: u64,
    pub m15: u64,
}

/// Everything held for one symbol. Guarded by that symbol's lock.
#[derive(Debug, Clone)]
pub struct SymbolCandles {
    pub symbol: String,
    ticks: VecDeque<Tick>,
    m1: VecDeque<Candle>,
    m5: VecDeque<Candle>,
    m15: VecDeque<Candle>,
    capacity: BufferConfig,

    /// Forming M1 bar, never part of the sealed buffer
    pub(crate) live_m1: Option<Candle>,
    /// Sealed M1 candles not yet rolled into an M5
    pub(crate) pending_m1: Vec<Candle>,
    /// M5 candles not yet rolled into an M15
    pub(crate) pending_m5: Vec<Candle>,
    pub(crate) totals: CandleTotals,
}

impl SymbolCandles {
    pub fn new(symbol: &str, capacity: BufferConfig) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            ticks: VecDeque::with_capacity(capacity.max_ticks.min(4096)),
            m1: VecDeque::with_capacity(capacity.max_m1.min(4096)),
            m5: VecDeque::with_capacity(capacity.max_m5.min(4096)),
            m15: VecDeque::with_capacity(capacity.max_m15.min(4096)),
            capacity,
            live_m1: None,
            pending_m1: Vec::with_capacity(5),
            pending_m5: Vec::with_capacity(3),
            totals: CandleTotals::default(),
        }
    }

    fn buffer(&self, timeframe: Timeframe) -> &VecDeque<Candle> {
        match timeframe {
            Timeframe::M1 => &self.m1,
            Timeframe::M5 => &self.m5,
            Timeframe::M15 => &self.m15,
        }
    }

    fn buffer_mut(&mut self, timeframe: Timeframe) -> (&mut VecDeque<Candle>, usize) {
        match timeframe {
            Timeframe::M1 => (&mut self.m1, self.capacity.max_m1),
            Timeframe::M5 => (&mut self.m5, self.capacity.max_m5),
            Timeframe::M15 => (&mut self.m15, self.capacity.max_m15),
        }
    }

    pub fn push_tick(&mut self, tick: Tick) {
        if self.ticks.len() >= self.capacity.max_ticks {
            self.ticks.pop_front();
        }
        self.ticks.push_back(tick);
    }

    pub fn contains(&self, timeframe: Timeframe, period_start: i64) -> bool {
        self.buffer(timeframe)
            .binary_search_by_key(&period_start, |c| c.timestamp)
            .is_ok()
    }

    /// Append a closed candle newer than everything buffered. Returns false (no-op)
    /// if its period start is already present or older than the newest entry.
    pub fn append(&mut self, candle: Candle) -> bool {
        let timeframe = candle.timeframe;
        let (buffer, cap) = self.buffer_mut(timeframe);
        if let Some(last) = buffer.back() {
            if candle.timestamp <= last.timestamp {
                return false;
            }
        }
        if buffer.len() >= cap {
            buffer.pop_front();
        }
        buffer.push_back(candle);

        match timeframe {
            Timeframe::M1 => self.totals.m1 += 1,
            Timeframe::M5 => self.totals.m5 += 1,
            Timeframe::M15 => self.totals.m15 += 1,
        }
        true
    }

    /// Replace the candle with the same period start, or insert an older one in order.
    /// Returns false when the candle would be newer than the buffer (use `append`).
    pub fn replace_or_insert(&mut self, candle: Candle) -> bool {
        let (buffer, cap) = self.buffer_mut(candle.timeframe);
        match buffer.binary_search_by_key(&candle.timestamp, |c| c.timestamp) {
            Ok(idx) => {
                buffer[idx] = candle;
                true
            }
            Err(idx) if idx < buffer.len() => {
                if buffer.len() >= cap {
                    // Inserting history into a full buffer: the oldest entry goes
                    if idx == 0 {
                        return true;
                    }
                    buffer.pop_front();
                    buffer.insert(idx - 1, candle);
                } else {
                    buffer.insert(idx, candle);
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Last `n` sealed candles, oldest first
    pub fn recent(&self, timeframe: Timeframe, n: usize) -> Vec<Candle> {
        let buffer = self.buffer(timeframe);
        let skip = buffer.len().saturating_sub(n);
        buffer.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self, timeframe: Timeframe) -> usize {
        self.buffer(timeframe).len()
    }

    pub fn last(&self, timeframe: Timeframe) -> Option<&Candle> {
        self.buffer(timeframe).back()
    }

    pub fn ticks(&self) -> &VecDeque<Tick> {
        &self.ticks
    }

    pub fn live(&self) -> Option<&Candle> {
        self.live_m1.as_ref()
    }

    pub fn totals(&self) -> CandleTotals {
        self.totals
    }

    /// Sealed M1 candles plus the forming bar, the forming bar only when it is newer
    pub fn m1_with_live(&self, n: usize) -> Vec<Candle> {
        let mut candles = self.recent(Timeframe::M1, n);
        if let Some(live) = &self.live_m1 {
            let newer = candles.last().map_or(true, |c| live.timestamp > c.timestamp);
            if newer {
                candles.push(live.clone());
                if candles.len() > n {
                    candles.remove(0);
                }
            }
        }
        candles
    }

    /// Rebuild buffers from persisted contents. Roll-up progress is recovered from the
    /// tail of the lower timeframe that is not yet covered by a higher-timeframe candle.
    pub fn restore(&mut self, ticks: Vec<Tick>, m1: Vec<Candle>, m5: Vec<Candle>, m15: Vec<Candle>) {
        self.ticks.clear();
        self.m1.clear();
        self.m5.clear();
        self.m15.clear();
        self.live_m1 = None;

        for tick in ticks {
            self.push_tick(tick);
        }
        for (candles, timeframe) in [(m1, Timeframe::M1), (m5, Timeframe::M5), (m15, Timeframe::M15)] {
            let mut sorted: Vec<Candle> = candles
                .into_iter()
                .filter(|c| c.timeframe == timeframe && c.is_valid())
                .collect();
            sorted.sort_by_key(|c| c.timestamp);
            for candle in sorted {
                self.append(candle);
            }
        }

        let m5_covered = self.m5.back().map(|c| c.end_time()).unwrap_or(i64::MIN);
        self.pending_m1 = self
            .m1
            .iter()
            .filter(|c| c.timestamp >= m5_covered)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(4)
            .rev()
            .collect();
        let m15_covered = self.m15.back().map(|c| c.end_time()).unwrap_or(i64::MIN);
        self.pending_m5 = self
            .m5
            .iter()
            .filter(|c| c.timestamp >= m15_covered)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .take(2)
            .rev()
            .collect();
        self.totals = CandleTotals {
            m1: self.m1.len() as u64,
            m5: self.m5.len() as u64,
            m15: self.m15.len() as u64,
        };
    }
}

// ============================================================================
// Candle Store
// ============================================================================

/// Statistics snapshot from the candle store
#[derive(Debug, Clone)]
pub struct CandleStoreStats {
    pub symbols: usize,
    pub ticks: usize,
    pub m1: usize,
    pub m5: usize,
    pub m15: usize,
    pub live: usize,
}

impl fmt::Display for CandleStoreStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CandleStore(symbols={}, ticks={}, m1={}, m5={}, m15={}, live={})",
            self.symbols, self.ticks, self.m1, self.m5, self.m15, self.live
        )
    }
}

pub type SymbolHandle = Arc<RwLock<SymbolCandles>>;

/// Pure data holder; aggregation rules live in `CandleAggregator`
pub struct CandleStore {
    symbols: RwLock<HashMap<String, SymbolHandle>>,
    capacity: BufferConfig,
}

impl CandleStore {
    pub fn new(capacity: BufferConfig) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> &BufferConfig {
        &self.capacity
    }

    /// Get or create the per-symbol handle
    pub fn handle(&self, symbol: &str) -> SymbolHandle {
        let key = symbol.to_uppercase();
        if let Some(handle) = self.symbols.read().get(&key) {
            return Arc::clone(handle);
        }
        let mut symbols = self.symbols.write();
        Arc::clone(
            symbols
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(SymbolCandles::new(&key, self.capacity.clone())))),
        )
    }

    pub fn get(&self, symbol: &str) -> Option<SymbolHandle> {
        self.symbols.read().get(&symbol.to_uppercase()).cloned()
    }

    pub fn symbols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.symbols.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Last `n` sealed candles for (symbol, timeframe), oldest first
    pub fn candles(&self, symbol: &str, timeframe: Timeframe, n: usize) -> Vec<Candle> {
        self.get(symbol)
            .map(|h| h.read().recent(timeframe, n))
            .unwrap_or_default()
    }

    pub fn m1_with_live(&self, symbol: &str, n: usize) -> Vec<Candle> {
        self.get(symbol)
            .map(|h| h.read().m1_with_live(n))
            .unwrap_or_default()
    }

    pub fn live_candle(&self, symbol: &str) -> Option<Candle> {
        self.get(symbol).and_then(|h| h.read().live().cloned())
    }

    pub fn latest_tick(&self, symbol: &str) -> Option<Tick> {
        self.get(symbol).and_then(|h| h.read().ticks().back().cloned())
    }

    pub fn recent_ticks(&self, symbol: &str, n: usize) -> Vec<Tick> {
        self.get(symbol)
            .map(|h| {
                let guard = h.read();
                let ticks = guard.ticks();
                ticks.iter().skip(ticks.len().saturating_sub(n)).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Latest price: last tick mid, else the forming bar, else the last sealed M1 close
    pub fn latest_price(&self, symbol: &str) -> Option<f64> {
        let handle = self.get(symbol)?;
        let guard = handle.read();
        guard
            .ticks()
            .back()
            .map(|t| t.mid())
            .or_else(|| guard.live().map(|c| c.close))
            .or_else(|| guard.last(Timeframe::M1).map(|c| c.close))
    }

    pub fn len(&self, symbol: &str, timeframe: Timeframe) -> usize {
        self.get(symbol).map(|h| h.read().len(timeframe)).unwrap_or(0)
    }

    pub fn totals(&self, symbol: &str) -> CandleTotals {
        self.get(symbol).map(|h| h.read().totals()).unwrap_or_default()
    }

    pub fn get_stats(&self) -> CandleStoreStats {
        let symbols = self.symbols.read();
        let mut stats = CandleStoreStats {
            symbols: symbols.len(),
            ticks: 0,
            m1: 0,
            m5: 0,
            m15: 0,
            live: 0,
        };
        for handle in symbols.values() {
            let guard = handle.read();
            stats.ticks += guard.ticks().len();
            stats.m1 += guard.len(Timeframe::M1);
            stats.m5 += guard.len(Timeframe::M5);
            stats.m15 += guard.len(Timeframe::M15);
            stats.live += usize::from(guard.live().is_some());
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candle(timeframe: Timeframe, minute: i64, close: f64) -> Candle {
        Candle {
            timeframe,
            open: close,
            high: close + 0.0002,
            low: close - 0.0002,
            close,
            volume: 1.0,
            timestamp: minute * 60_000,
        }
    }

    fn small_caps() -> BufferConfig {
        BufferConfig { max_ticks: 3, max_m1: 5, max_m5: 3, max_m15: 2 }
    }

    #[test]
    fn test_store_creation() {
        let store = CandleStore::new(BufferConfig::default());
        assert!(store.symbols().is_empty());
        let _ = store.handle("eurusd");
        assert_eq!(store.symbols(), vec!["EURUSD"]);
        assert_eq!(store.get_stats().symbols, 1);
    }

    #[test]
    fn test_ring_buffer_evicts_oldest() {
        let mut candles = SymbolCandles::new("EURUSD", small_caps());
        for minute in 0..6 {
            assert!(candles.append(make_candle(Timeframe::M1, minute, 1.1 + minute as f64 * 0.0001)));
        }
        assert_eq!(candles.len(Timeframe::M1), 5);
        assert_eq!(candles.recent(Timeframe::M1, 10)[0].timestamp, 60_000);
        assert_eq!(candles.totals().m1, 6);
    }

    #[test]
    fn test_append_rejects_duplicates_and_stale() {
        let mut candles = SymbolCandles::new("EURUSD", small_caps());
        assert!(candles.append(make_candle(Timeframe::M1, 2, 1.1)));
        assert!(!candles.append(make_candle(Timeframe::M1, 2, 1.2)));
        assert!(!candles.append(make_candle(Timeframe::M1, 1, 1.2)));
        assert_eq!(candles.len(Timeframe::M1), 1);
    }

    #[test]
    fn test_replace_or_insert() {
        let mut candles = SymbolCandles::new("EURUSD", small_caps());
        candles.append(make_candle(Timeframe::M1, 1, 1.1));
        candles.append(make_candle(Timeframe::M1, 3, 1.1));

        assert!(candles.replace_or_insert(make_candle(Timeframe::M1, 3, 1.2)));
        assert!(candles.replace_or_insert(make_candle(Timeframe::M1, 2, 1.15)));
        assert!(!candles.replace_or_insert(make_candle(Timeframe::M1, 4, 1.2)));

        let m1 = candles.recent(Timeframe::M1, 10);
        let stamps: Vec<i64> = m1.iter().map(|c| c.timestamp / 60_000).collect();
        assert_eq!(stamps, vec![1, 2, 3]);
        assert_eq!(m1[2].close, 1.2);
    }

    #[test]
    fn test_tick_capping() {
        let mut candles = SymbolCandles::new("EURUSD", small_caps());
        for i in 0..5 {
            candles.push_tick(Tick::new("EURUSD", 1.1, 1.1001, 1.0, i));
        }
        assert_eq!(candles.ticks().len(), 3);
        assert_eq!(candles.ticks()[0].timestamp, 2);
    }

    #[test]
    fn test_m1_with_live_never_duplicates() {
        let mut candles = SymbolCandles::new("EURUSD", small_caps());
        candles.append(make_candle(Timeframe::M1, 1, 1.1));
        candles.live_m1 = Some(make_candle(Timeframe::M1, 1, 1.3));
        assert_eq!(candles.m1_with_live(10).len(), 1);

        candles.live_m1 = Some(make_candle(Timeframe::M1, 2, 1.3));
        let with_live = candles.m1_with_live(10);
        assert_eq!(with_live.len(), 2);
        assert_eq!(with_live[1].close, 1.3);
        assert_eq!(candles.recent(Timeframe::M1, 10).len(), 1);
    }

    #[test]
    fn test_restore_recovers_pending_rollup() {
        let mut candles = SymbolCandles::new("EURUSD", BufferConfig::default());
        let m1: Vec<Candle> = (0..7).map(|m| make_candle(Timeframe::M1, m, 1.1)).collect();
        let mut m5 = make_candle(Timeframe::M5, 0, 1.1);
        m5.timestamp = 0;
        candles.restore(Vec::new(), m1, vec![m5], Vec::new());

        assert_eq!(candles.len(Timeframe::M1), 7);
        assert_eq!(candles.pending_m1.len(), 2);
        assert_eq!(candles.pending_m5.len(), 1);
    }
}

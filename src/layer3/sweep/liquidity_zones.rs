// Liquidity Zone Tracker - Multi-touch swing levels where stops are presumed to cluster
// Rebuilt wholesale from the latest M5 window on every update

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

use crate::core::config::GuardConfig;
use crate::core::types::{from_pips, symbol_pip_multiplier, to_pips, Candle};
use crate::layer3::common::indicators::{swing_highs, swing_lows};

const MAX_STRENGTH: u32 = 5;
/// Beyond this distance a zone contributes nothing to sweep probability
const PROXIMITY_RANGE_PIPS: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneType {
    Support,
    Resistance,
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityZone {
    pub symbol: String,
    pub price: f64,
    pub zone_type: ZoneType,
    /// Touch count, capped at 5
    pub strength: u32,
    pub last_test: i64,
    pub sweep_probability: f64,
    /// Excursion beyond `price` that counts as swept
    pub buffer_pips: f64,
}

impl LiquidityZone {
    pub fn buffer_price(&self) -> f64 {
        from_pips(&self.symbol, self.buffer_pips)
    }

    pub fn distance_pips(&self, price: f64) -> f64 {
        to_pips(&self.symbol, (price - self.price).abs())
    }

    /// Price has run beyond the zone by more than its buffer
    pub fn is_breached_by(&self, price: f64) -> bool {
        match self.zone_type {
            ZoneType::Resistance => price > self.price + self.buffer_price(),
            ZoneType::Support => price < self.price - self.buffer_price(),
        }
    }
}

impl fmt::Display for LiquidityZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Zone({} {} @ {:.5}, strength={}, p={:.2})",
            self.symbol, self.zone_type, self.price, self.strength, self.sweep_probability
        )
    }
}

/// Zone-building parameters, taken from the guard config
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSettings {
    pub lookback: usize,
    pub merge_pips: f64,
    pub buffer_pips: f64,
    pub per_side: usize,
}

impl From<&GuardConfig> for ZoneSettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            lookback: config.zone_lookback,
            merge_pips: config.zone_merge_pips,
            buffer_pips: config.zone_buffer_pips,
            per_side: config.zones_per_side,
        }
    }
}

/// Build the nearest `per_side` support and resistance zones for `symbol`
pub fn build_zones(symbol: &str, candles: &[Candle], current_price: f64, settings: &ZoneSettings) -> Vec<LiquidityZone> {
    let window = &candles[candles.len().saturating_sub(settings.lookback)..];
    let scale = symbol_pip_multiplier(symbol);
    let merge = from_pips(symbol, settings.merge_pips * scale);

    let mut zones = Vec::new();
    for zone_type in [ZoneType::Resistance, ZoneType::Support] {
        let swings = match zone_type {
            ZoneType::Resistance => swing_highs(window),
            ZoneType::Support => swing_lows(window),
        };
        let mut levels: Vec<f64> = swings.into_iter().map(|(_, p)| p).collect();
        levels.sort_by(|a, b| a.total_cmp(b));

        let mut side = Vec::new();
        let mut i = 0;
        while i < levels.len() {
            let mut j = i + 1;
            while j < levels.len() && levels[j] - levels[i] <= merge {
                j += 1;
            }
            let price = levels[i..j].iter().sum::<f64>() / (j - i) as f64;

            let touching: Vec<&Candle> = window
                .iter()
                .filter(|c| {
                    let extreme = match zone_type {
                        ZoneType::Resistance => c.high,
                        ZoneType::Support => c.low,
                    };
                    (extreme - price).abs() <= merge
                })
                .collect();
            let strength = (touching.len() as u32).clamp(1, MAX_STRENGTH);
            let last_test = touching.iter().map(|c| c.timestamp).max().unwrap_or(0);

            let distance = to_pips(symbol, (current_price - price).abs());
            let proximity = (1.0 - distance / PROXIMITY_RANGE_PIPS).clamp(0.0, 1.0);
            let sweep_probability = (0.2 + 0.12 * strength as f64 + 0.3 * proximity).clamp(0.0, 1.0);

            side.push(LiquidityZone {
                symbol: symbol.to_string(),
                price,
                zone_type,
                strength,
                last_test,
                sweep_probability,
                buffer_pips: settings.buffer_pips * scale,
            });
            i = j;
        }

        side.sort_by(|a, b| (a.price - current_price).abs().total_cmp(&(b.price - current_price).abs()));
        side.truncate(settings.per_side);
        zones.extend(side);
    }
    zones
}

#[derive(Debug, Clone, Default)]
pub struct ZoneTrackerStats {
    pub updates: u64,
    pub symbols: usize,
    pub zones: usize,
}

impl fmt::Display for ZoneTrackerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Zones(updates={}, symbols={}, zones={})", self.updates, self.symbols, self.zones)
    }
}

pub struct LiquidityZoneTracker {
    settings: Mutex<ZoneSettings>,
    zones: Mutex<HashMap<String, Vec<LiquidityZone>>>,
    updates: Mutex<u64>,
}

impl LiquidityZoneTracker {
    pub fn new(settings: ZoneSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
            zones: Mutex::new(HashMap::new()),
            updates: Mutex::new(0),
        }
    }

    pub fn set_settings(&self, settings: ZoneSettings) {
        *self.settings.lock() = settings;
    }

    /// Replace the zone set for `symbol`. Returns the number of zones kept.
    pub fn update(&self, symbol: &str, candles: &[Candle], current_price: f64) -> usize {
        let settings = self.settings.lock().clone();
        let zones = build_zones(symbol, candles, current_price, &settings);
        let count = zones.len();
        debug!(symbol = %symbol, zones = count, price = current_price, "Liquidity zones rebuilt");

        self.zones.lock().insert(symbol.to_string(), zones);
        *self.updates.lock() += 1;
        count
    }

    pub fn zones(&self, symbol: &str) -> Vec<LiquidityZone> {
        self.zones.lock().get(symbol).cloned().unwrap_or_default()
    }

    /// Closest zone of `zone_type` to `price`
    pub fn nearest(&self, symbol: &str, zone_type: ZoneType, price: f64) -> Option<LiquidityZone> {
        self.zones
            .lock()
            .get(symbol)?
            .iter()
            .filter(|z| z.zone_type == zone_type)
            .min_by(|a, b| (a.price - price).abs().total_cmp(&(b.price - price).abs()))
            .cloned()
    }

    pub fn get_stats(&self) -> ZoneTrackerStats {
        let zones = self.zones.lock();
        ZoneTrackerStats {
            updates: *self.updates.lock(),
            symbols: zones.len(),
            zones: zones.values().map(|z| z.len()).sum(),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::core::types::{Candle, Timeframe};

    /// Eight M5 candles: resistance near 1.10195 (two touches), support near 1.09805 (two touches)
    pub fn make_zone_candles() -> Vec<Candle> {
        let rows = [
            (1.1010, 1.0995),
            (1.1020, 1.0998),
            (1.1012, 1.0990),
            (1.1008, 1.0980),
            (1.1019, 1.0992),
            (1.1011, 1.0989),
            (1.1009, 1.0981),
            (1.1005, 1.0995),
        ];
        rows.iter()
            .enumerate()
            .map(|(i, (high, low))| Candle {
                timeframe: Timeframe::M5,
                open: low + 0.0003,
                high: *high,
                low: *low,
                close: high - 0.0003,
                volume: 100.0,
                timestamp: i as i64 * Timeframe::M5.duration_ms(),
            })
            .collect()
    }
}

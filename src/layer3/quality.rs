// Quality Gate - Composite scoring, confidence calibration and publication gating
// Gate order: pair/pattern minimum, global floor, per-symbol cooldown, hourly cap

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{debug, info};

use crate::core::config::PipelineConfig;
use crate::core::types::{PatternCandidate, PatternKind, TradingSession};

const HOUR_MS: i64 = 3_600_000;
const MIN_OUTCOMES_FOR_WIN_RATE: u32 = 5;

// ============================================================================
// Performance table
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: PatternKind,
    pub min_confidence: f64,
}

/// Minimum confidence for one pattern on one symbol; overrides the pattern-only rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairRule {
    pub symbol: String,
    pub pattern: PatternKind,
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub wins: u32,
    pub losses: u32,
}

impl OutcomeRecord {
    pub fn total(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_rate(&self) -> Option<f64> {
        match self.total() {
            0 => None,
            n => Some(self.wins as f64 / n as f64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternOutcomes {
    pub pattern: PatternKind,
    #[serde(flatten)]
    pub record: OutcomeRecord,
}

/// Observed-performance table behind calibration, minimum-confidence rules and
/// the win-rate bonus. Hand-tuned; load a replacement with `from_json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceTable {
    pub version: u32,
    /// (raw, calibrated) points, interpolated linearly
    pub calibration: Vec<(f64, f64)>,
    pub pattern_rules: Vec<PatternRule>,
    pub pair_rules: Vec<PairRule>,
    pub outcomes: Vec<PatternOutcomes>,
}

impl Default for PerformanceTable {
    fn default() -> Self {
        let rule = |pattern, min_confidence| PatternRule { pattern, min_confidence };
        let pair = |symbol: &str, pattern, min_confidence| PairRule {
            symbol: symbol.to_string(),
            pattern,
            min_confidence,
        };
        Self {
            version: 1,
            calibration: vec![
                (0.0, 20.0),
                (50.0, 45.0),
                (60.0, 52.0),
                (70.0, 60.0),
                (80.0, 68.0),
                (90.0, 75.0),
                (100.0, 82.0),
            ],
            pattern_rules: vec![
                rule(PatternKind::LiquiditySweepReversal, 65.0),
                rule(PatternKind::OrderBlockBounce, 65.0),
                rule(PatternKind::FairValueGapFill, 62.0),
                rule(PatternKind::VolatilityCompressionBreakout, 62.0),
                rule(PatternKind::SweepAndReturn, 65.0),
                rule(PatternKind::MomentumBurst, 62.0),
            ],
            pair_rules: vec![
                pair("XAUUSD", PatternKind::MomentumBurst, 72.0),
                pair("GBPUSD", PatternKind::VolatilityCompressionBreakout, 66.0),
                pair("USDJPY", PatternKind::FairValueGapFill, 66.0),
            ],
            outcomes: Vec::new(),
        }
    }
}

impl PerformanceTable {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Pair rule first, then the pattern-only rule
    pub fn min_confidence_for(&self, symbol: &str, pattern: PatternKind) -> Option<f64> {
        self.pair_rules
            .iter()
            .find(|r| r.pattern == pattern && r.symbol.eq_ignore_ascii_case(symbol))
            .map(|r| r.min_confidence)
            .or_else(|| {
                self.pattern_rules
                    .iter()
                    .find(|r| r.pattern == pattern)
                    .map(|r| r.min_confidence)
            })
    }

    /// Map raw confidence onto the calibrated band. Points are sorted and made
    /// non-decreasing first, so a higher raw value never maps lower.
    pub fn calibrate(&self, raw: f64) -> f64 {
        let raw = if raw.is_finite() { raw.clamp(0.0, 100.0) } else { 0.0 };
        let mut points: Vec<(f64, f64)> = self
            .calibration
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .collect();
        if points.is_empty() {
            return raw;
        }
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut running = f64::MIN;
        for p in points.iter_mut() {
            running = running.max(p.1);
            p.1 = running;
        }

        let first = points[0];
        let last = points[points.len() - 1];
        if raw <= first.0 {
            return first.1.clamp(0.0, 100.0);
        }
        if raw >= last.0 {
            return last.1.clamp(0.0, 100.0);
        }
        for pair in points.windows(2) {
            let ((x0, y0), (x1, y1)) = (pair[0], pair[1]);
            if raw <= x1 {
                let t = if x1 > x0 { (raw - x0) / (x1 - x0) } else { 1.0 };
                return (y0 + t * (y1 - y0)).clamp(0.0, 100.0);
            }
        }
        last.1.clamp(0.0, 100.0)
    }

    pub fn outcomes_for(&self, pattern: PatternKind) -> OutcomeRecord {
        self.outcomes
            .iter()
            .find(|o| o.pattern == pattern)
            .map(|o| o.record)
            .unwrap_or_default()
    }

    fn record_outcome(&mut self, pattern: PatternKind, win: bool) {
        let idx = match self.outcomes.iter().position(|o| o.pattern == pattern) {
            Some(i) => i,
            None => {
                self.outcomes.push(PatternOutcomes { pattern, record: OutcomeRecord::default() });
                self.outcomes.len() - 1
            }
        };
        let record = &mut self.outcomes[idx].record;
        if win {
            record.wins += 1;
        } else {
            record.losses += 1;
        }
    }
}

// ============================================================================
// Scoring
// ============================================================================

pub fn session_bonus(session: TradingSession) -> f64 {
    match session {
        TradingSession::Overlap => 10.0,
        TradingSession::London | TradingSession::NewYork => 7.0,
        TradingSession::Asian => 2.0,
    }
}

fn momentum_bonus(score: f64) -> f64 {
    if score >= 70.0 {
        15.0
    } else if score >= 50.0 {
        8.0
    } else {
        0.0
    }
}

fn volume_bonus(score: f64) -> f64 {
    if score >= 70.0 {
        10.0
    } else if score >= 50.0 {
        5.0
    } else {
        0.0
    }
}

fn spread_adjustment(spread_pips: Option<f64>) -> f64 {
    match spread_pips {
        Some(s) if s > 2.0 => -10.0,
        Some(s) if s > 1.5 => -5.0,
        Some(s) if s < 0.8 => 3.0,
        _ => 0.0,
    }
}

fn win_rate_bonus(record: OutcomeRecord) -> f64 {
    if record.total() < MIN_OUTCOMES_FOR_WIN_RATE {
        return 0.0;
    }
    record
        .win_rate()
        .map(|wr| ((wr - 0.5) * 40.0).clamp(-10.0, 10.0))
        .unwrap_or(0.0)
}

// ============================================================================
// Gate
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct GateSettings {
    pub min_confidence: f64,
    pub cooldown_ms: i64,
    pub max_per_hour: u32,
}

impl GateSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_confidence: config.min_confidence,
            cooldown_ms: config.cooldown_minutes * 60_000,
            max_per_hour: config.max_signals_per_hour,
        }
    }
}

impl Default for GateSettings {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GateRejection {
    #[error("confidence {actual:.1} below {pattern} minimum {required:.1}")]
    BelowPatternMinimum { pattern: PatternKind, required: f64, actual: f64 },
    #[error("confidence {actual:.1} below global floor {floor:.1}")]
    BelowFloor { floor: f64, actual: f64 },
    #[error("cooldown active, {remaining_secs}s remaining")]
    Cooldown { remaining_secs: i64 },
    #[error("hourly cap reached ({count}/{cap})")]
    HourlyCap { count: u32, cap: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct GateStats {
    pub evaluated: u64,
    pub passed: u64,
    pub rejected_pattern: u64,
    pub rejected_floor: u64,
    pub rejected_cooldown: u64,
    pub rejected_cap: u64,
    pub published: u64,
}

impl fmt::Display for GateStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QualityGate(evaluated={}, passed={}, pattern={}, floor={}, cooldown={}, cap={}, published={})",
            self.evaluated,
            self.passed,
            self.rejected_pattern,
            self.rejected_floor,
            self.rejected_cooldown,
            self.rejected_cap,
            self.published
        )
    }
}

#[derive(Debug, Default, Clone)]
struct SymbolGate {
    last_published: Option<i64>,
    hour_key: i64,
    hour_count: u32,
}

pub struct QualityGate {
    settings: Mutex<GateSettings>,
    table: Mutex<PerformanceTable>,
    symbols: Mutex<HashMap<String, SymbolGate>>,
    stats: Mutex<GateStats>,
}

impl QualityGate {
    pub fn new(settings: GateSettings) -> Self {
        Self::with_table(settings, PerformanceTable::default())
    }

    pub fn with_table(settings: GateSettings, table: PerformanceTable) -> Self {
        info!(version = table.version, "Quality gate initialized");
        Self {
            settings: Mutex::new(settings),
            table: Mutex::new(table),
            symbols: Mutex::new(HashMap::new()),
            stats: Mutex::new(GateStats::default()),
        }
    }

    pub fn settings(&self) -> GateSettings {
        self.settings.lock().clone()
    }

    pub fn set_settings(&self, settings: GateSettings) {
        *self.settings.lock() = settings;
    }

    pub fn table(&self) -> PerformanceTable {
        self.table.lock().clone()
    }

    pub fn set_table(&self, table: PerformanceTable) {
        info!(version = table.version, "Performance table replaced");
        *self.table.lock() = table;
    }

    /// Composite 0-100 quality score
    pub fn score(&self, candidate: &PatternCandidate, session: TradingSession, spread_pips: Option<f64>) -> f64 {
        let record = self.table.lock().outcomes_for(candidate.pattern);
        let composite = 0.3 * candidate.confidence
            + momentum_bonus(candidate.momentum_score)
            + volume_bonus(candidate.volume_quality)
            + session_bonus(session)
            + win_rate_bonus(record)
            + spread_adjustment(spread_pips);
        composite.clamp(0.0, 100.0)
    }

    pub fn calibrate(&self, raw: f64) -> f64 {
        self.table.lock().calibrate(raw)
    }

    /// Full gate on raw confidence. Leaves the per-symbol counters untouched;
    /// call `mark_published` once the signal actually goes out.
    pub fn check(&self, candidate: &PatternCandidate, now: i64) -> Result<(), GateRejection> {
        self.stats.lock().evaluated += 1;
        let result = self.check_inner(candidate, now);

        let mut stats = self.stats.lock();
        match &result {
            Ok(()) => stats.passed += 1,
            Err(GateRejection::BelowPatternMinimum { .. }) => stats.rejected_pattern += 1,
            Err(GateRejection::BelowFloor { .. }) => stats.rejected_floor += 1,
            Err(GateRejection::Cooldown { .. }) => stats.rejected_cooldown += 1,
            Err(GateRejection::HourlyCap { .. }) => stats.rejected_cap += 1,
        }
        if let Err(reason) = &result {
            debug!(symbol = %candidate.symbol, pattern = %candidate.pattern, %reason, "Candidate rejected");
        }
        result
    }

    fn check_inner(&self, candidate: &PatternCandidate, now: i64) -> Result<(), GateRejection> {
        let actual = candidate.confidence;
        if let Some(required) = self.table.lock().min_confidence_for(&candidate.symbol, candidate.pattern) {
            if actual < required {
                return Err(GateRejection::BelowPatternMinimum { pattern: candidate.pattern, required, actual });
            }
        }
        let floor = self.settings.lock().min_confidence;
        if actual < floor {
            return Err(GateRejection::BelowFloor { floor, actual });
        }
        self.check_slot(&candidate.symbol, now)
    }

    /// Cooldown and hourly cap only; used again when a delayed signal is released
    pub fn check_slot(&self, symbol: &str, now: i64) -> Result<(), GateRejection> {
        let settings = self.settings.lock().clone();
        let symbols = self.symbols.lock();
        let Some(gate) = symbols.get(symbol) else {
            return Ok(());
        };

        if let Some(last) = gate.last_published {
            let elapsed = now - last;
            if elapsed < settings.cooldown_ms {
                return Err(GateRejection::Cooldown {
                    remaining_secs: (settings.cooldown_ms - elapsed + 999) / 1000,
                });
            }
        }
        if gate.hour_key == now.div_euclid(HOUR_MS) && gate.hour_count >= settings.max_per_hour {
            return Err(GateRejection::HourlyCap { count: gate.hour_count, cap: settings.max_per_hour });
        }
        Ok(())
    }

    pub fn mark_published(&self, symbol: &str, now: i64) {
        let hour_key = now.div_euclid(HOUR_MS);
        {
            let mut symbols = self.symbols.lock();
            let gate = symbols.entry(symbol.to_string()).or_default();
            gate.last_published = Some(now);
            if gate.hour_key != hour_key {
                gate.hour_key = hour_key;
                gate.hour_count = 0;
            }
            gate.hour_count += 1;
        }
        self.stats.lock().published += 1;
    }

    /// Published this clock hour
    pub fn hourly_count(&self, symbol: &str, now: i64) -> u32 {
        self.symbols
            .lock()
            .get(symbol)
            .filter(|g| g.hour_key == now.div_euclid(HOUR_MS))
            .map(|g| g.hour_count)
            .unwrap_or(0)
    }

    pub fn last_published(&self, symbol: &str) -> Option<i64> {
        self.symbols.lock().get(symbol).and_then(|g| g.last_published)
    }

    pub fn record_outcome(&self, pattern: PatternKind, win: bool) {
        let mut table = self.table.lock();
        table.record_outcome(pattern, win);
        let record = table.outcomes_for(pattern);
        info!(pattern = %pattern, wins = record.wins, losses = record.losses, "Outcome recorded");
    }

    pub fn win_rate(&self, pattern: PatternKind) -> Option<f64> {
        self.table.lock().outcomes_for(pattern).win_rate()
    }

    pub fn get_stats(&self) -> GateStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, Timeframe};
    use proptest::prelude::*;

    const MINUTE: i64 = 60_000;
    const NINE_AM: i64 = 9 * HOUR_MS;

    fn make_candidate(symbol: &str, pattern: PatternKind, confidence: f64) -> PatternCandidate {
        PatternCandidate {
            symbol: symbol.to_string(),
            pattern,
            direction: Direction::Long,
            timeframe: Timeframe::M5,
            entry_price: 1.1000,
            stop_loss: 1.0990,
            take_profit: 1.1020,
            confidence,
            quality_score: 0.0,
            momentum_score: 60.0,
            volume_quality: 75.0,
            reason: String::new(),
            detected_at: 0,
        }
    }

    fn make_gate() -> QualityGate {
        QualityGate::new(GateSettings { min_confidence: 60.0, cooldown_ms: 10 * MINUTE, max_per_hour: 3 })
    }

    #[test]
    fn test_composite_score() {
        let gate = make_gate();
        let candidate = make_candidate("EURUSD", PatternKind::LiquiditySweepReversal, 80.0);
        // 24 + 8 (momentum) + 10 (volume) + 7 (London) + 3 (tight spread)
        let score = gate.score(&candidate, TradingSession::London, Some(0.5));
        assert!((score - 52.0).abs() < 1e-9);

        let wide = gate.score(&candidate, TradingSession::London, Some(2.5));
        assert!((wide - 39.0).abs() < 1e-9);
    }

    #[test]
    fn test_win_rate_bonus_needs_five_outcomes() {
        let gate = make_gate();
        let candidate = make_candidate("EURUSD", PatternKind::OrderBlockBounce, 70.0);
        let base = gate.score(&candidate, TradingSession::Asian, None);

        for _ in 0..4 {
            gate.record_outcome(PatternKind::OrderBlockBounce, true);
        }
        assert_eq!(gate.score(&candidate, TradingSession::Asian, None), base);

        gate.record_outcome(PatternKind::OrderBlockBounce, true);
        assert!((gate.score(&candidate, TradingSession::Asian, None) - (base + 10.0)).abs() < 1e-9);
        assert_eq!(gate.win_rate(PatternKind::OrderBlockBounce), Some(1.0));
    }

    #[test]
    fn test_calibration_is_monotone_and_narrow() {
        let table = PerformanceTable::default();
        assert!((table.calibrate(70.0) - 60.0).abs() < 1e-9);
        assert!((table.calibrate(75.0) - 64.0).abs() < 1e-9);
        assert!(table.calibrate(100.0) <= 82.0);

        // A dip in the points never maps a higher raw value lower
        let mut bumpy = table.clone();
        bumpy.calibration = vec![(0.0, 10.0), (50.0, 60.0), (60.0, 40.0), (100.0, 90.0)];
        assert!(bumpy.calibrate(60.0) >= bumpy.calibrate(50.0));
    }

    #[test]
    fn test_pair_rule_overrides_pattern_rule() {
        let gate = make_gate();
        let candidate = make_candidate("XAUUSD", PatternKind::MomentumBurst, 70.0);
        assert!(matches!(
            gate.check(&candidate, NINE_AM),
            Err(GateRejection::BelowPatternMinimum { required, .. }) if required == 72.0
        ));

        let other_pair = make_candidate("EURUSD", PatternKind::MomentumBurst, 70.0);
        assert!(gate.check(&other_pair, NINE_AM).is_ok());
    }

    #[test]
    fn test_global_floor() {
        let gate = QualityGate::new(GateSettings { min_confidence: 75.0, cooldown_ms: 0, max_per_hour: 3 });
        let candidate = make_candidate("EURUSD", PatternKind::LiquiditySweepReversal, 70.0);
        assert!(matches!(gate.check(&candidate, NINE_AM), Err(GateRejection::BelowFloor { .. })));
    }

    #[test]
    fn test_cooldown_blocks_second_signal() {
        let gate = make_gate();
        let candidate = make_candidate("EURUSD", PatternKind::LiquiditySweepReversal, 80.0);

        assert!(gate.check(&candidate, NINE_AM).is_ok());
        gate.mark_published("EURUSD", NINE_AM);

        let result = gate.check(&candidate, NINE_AM + 5 * MINUTE);
        assert_eq!(result, Err(GateRejection::Cooldown { remaining_secs: 300 }));

        // Other symbols are unaffected
        let other = make_candidate("GBPUSD", PatternKind::LiquiditySweepReversal, 80.0);
        assert!(gate.check(&other, NINE_AM + 5 * MINUTE).is_ok());

        assert!(gate.check(&candidate, NINE_AM + 10 * MINUTE).is_ok());
    }

    #[test]
    fn test_hourly_cap_resets_on_rollover() {
        let gate = QualityGate::new(GateSettings { min_confidence: 60.0, cooldown_ms: 0, max_per_hour: 3 });
        let candidate = make_candidate("EURUSD", PatternKind::LiquiditySweepReversal, 80.0);

        for i in 0..3 {
            let now = NINE_AM + i * 10 * MINUTE;
            assert!(gate.check(&candidate, now).is_ok());
            gate.mark_published("EURUSD", now);
        }
        assert_eq!(gate.hourly_count("EURUSD", NINE_AM + 40 * MINUTE), 3);
        assert!(matches!(
            gate.check(&candidate, NINE_AM + 40 * MINUTE),
            Err(GateRejection::HourlyCap { count: 3, cap: 3 })
        ));

        assert!(gate.check(&candidate, NINE_AM + HOUR_MS).is_ok());
        assert_eq!(gate.get_stats().rejected_cap, 1);
    }

    #[test]
    fn test_table_from_json() {
        let raw = r#"{
            "version": 2,
            "pair_rules": [{"symbol": "EURUSD", "pattern": "OrderBlockBounce", "min_confidence": 90.0}],
            "outcomes": [{"pattern": "OrderBlockBounce", "wins": 3, "losses": 1}]
        }"#;
        let table = PerformanceTable::from_json(raw).expect("valid table");
        assert_eq!(table.version, 2);
        assert_eq!(table.min_confidence_for("eurusd", PatternKind::OrderBlockBounce), Some(90.0));
        assert_eq!(table.outcomes_for(PatternKind::OrderBlockBounce).win_rate(), Some(0.75));
        // Fields left out fall back to the defaults
        assert_eq!(table.calibration.len(), 7);
    }

    proptest! {
        #[test]
        fn prop_calibration_preserves_order(a in 0.0f64..100.0, b in 0.0f64..100.0) {
            let table = PerformanceTable::default();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(table.calibrate(lo) <= table.calibrate(hi) + 1e-9);
        }
    }
}

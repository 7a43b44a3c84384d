// Pattern Bank - Six independent candle-pattern detectors behind one trait
// Each detector returns a tagged result; one failing detector never blocks the rest

pub mod liquidity_sweep;
pub mod order_block;
pub mod fair_value_gap;
pub mod compression_breakout;
pub mod sweep_return;
pub mod momentum_burst;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::types::{
    from_pips, symbol_pip_multiplier, to_pips, Candle, Direction, PatternCandidate, PatternKind,
    Timeframe, TradingSession, VolatilityRegime,
};
use crate::layer2::candle_store::CandleStore;
use crate::layer3::common::indicators::{momentum_score, volume_quality};
use crate::layer3::thresholds::{ThresholdManager, ThresholdSet};

pub use compression_breakout::CompressionBreakoutDetector;
pub use fair_value_gap::FairValueGapDetector;
pub use liquidity_sweep::LiquiditySweepDetector;
pub use momentum_burst::MomentumBurstDetector;
pub use order_block::OrderBlockDetector;
pub use sweep_return::SweepReturnDetector;

/// Candles loaded per timeframe for one scan
pub const M1_WINDOW: usize = 60;
pub const M5_WINDOW: usize = 40;
pub const M15_WINDOW: usize = 20;

// ============================================================================
// Detection results
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DetectorError {
    #[error("Malformed candle at {timestamp}")]
    MalformedCandle { timestamp: i64 },
    #[error("Detector panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone)]
pub enum Detection {
    Candidate(PatternCandidate),
    /// Pattern absent or one of its gates failed
    NoCandidate(&'static str),
    InputError(DetectorError),
}

impl Detection {
    pub fn candidate(self) -> Option<PatternCandidate> {
        match self {
            Detection::Candidate(c) => Some(c),
            _ => None,
        }
    }
}

// ============================================================================
// Detection context
// ============================================================================

/// Read-only candle view for one symbol, captured once per scan
#[derive(Debug, Clone)]
pub struct DetectionContext {
    pub symbol: String,
    /// Completed M1 candles, oldest first
    pub m1: Vec<Candle>,
    pub m5: Vec<Candle>,
    pub m15: Vec<Candle>,
    pub session: TradingSession,
    pub regime: VolatilityRegime,
    pub now_ms: i64,
}

impl DetectionContext {
    pub fn from_store(
        store: &CandleStore,
        symbol: &str,
        session: TradingSession,
        regime: VolatilityRegime,
        now_ms: i64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            m1: store.candles(symbol, Timeframe::M1, M1_WINDOW),
            m5: store.candles(symbol, Timeframe::M5, M5_WINDOW),
            m15: store.candles(symbol, Timeframe::M15, M15_WINDOW),
            session,
            regime,
            now_ms,
        }
    }

    pub fn candles(&self, timeframe: Timeframe) -> &[Candle] {
        match timeframe {
            Timeframe::M1 => &self.m1,
            Timeframe::M5 => &self.m5,
            Timeframe::M15 => &self.m15,
        }
    }

    /// Price distance of `pips` for this symbol
    pub fn price(&self, pips: f64) -> f64 {
        from_pips(&self.symbol, pips)
    }

    pub fn pips(&self, distance: f64) -> f64 {
        to_pips(&self.symbol, distance)
    }

    /// Pip threshold scaled for the instrument (gold and cable need wider distances)
    pub fn symbol_pips(&self, pips: f64) -> f64 {
        pips * symbol_pip_multiplier(&self.symbol)
    }

    /// Last `n` candles of a timeframe, validated
    pub fn window(&self, timeframe: Timeframe, n: usize) -> Result<&[Candle], DetectorError> {
        let all = self.candles(timeframe);
        let window = &all[all.len().saturating_sub(n)..];
        match window.iter().find(|c| !c.is_valid()) {
            Some(bad) => Err(DetectorError::MalformedCandle { timestamp: bad.timestamp }),
            None => Ok(window),
        }
    }
}

/// Multiplier applied to pip thresholds by ambient volatility
pub fn regime_scale(regime: VolatilityRegime) -> f64 {
    match regime {
        VolatilityRegime::VeryLow => 0.8,
        VolatilityRegime::Low => 0.9,
        VolatilityRegime::Normal => 1.0,
        VolatilityRegime::High => 1.25,
    }
}

/// Trade levels proposed by a detector before scoring
pub(crate) struct Setup {
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub entry: f64,
    pub stop: f64,
    pub target: f64,
    pub confidence: f64,
    pub reason: String,
}

/// Apply the confidence floor and attach momentum/volume readings
pub(crate) fn finish(
    ctx: &DetectionContext,
    pattern: PatternKind,
    th: &ThresholdSet,
    window: &[Candle],
    setup: Setup,
) -> Detection {
    let confidence = setup.confidence.clamp(0.0, 100.0);
    if confidence < th.min_confidence.value {
        return Detection::NoCandidate("below minimum confidence");
    }

    let recent = &window[window.len().saturating_sub(10)..];
    Detection::Candidate(PatternCandidate {
        symbol: ctx.symbol.clone(),
        pattern,
        direction: setup.direction,
        timeframe: setup.timeframe,
        entry_price: setup.entry,
        stop_loss: setup.stop,
        take_profit: setup.target,
        confidence,
        quality_score: 0.0,
        momentum_score: momentum_score(recent, setup.direction),
        volume_quality: volume_quality(window),
        reason: setup.reason,
        detected_at: ctx.now_ms,
    })
}

// ============================================================================
// Detector trait
// ============================================================================

pub trait PatternDetector: Send + Sync {
    fn kind(&self) -> PatternKind;

    /// Pure with respect to the candle store: reads `ctx`, never mutates shared state
    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection;
}

// ============================================================================
// Pattern Bank
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PatternBankStats {
    pub scans: u64,
    pub candidates: u64,
    pub no_candidates: u64,
    pub input_errors: u64,
    pub per_pattern: HashMap<PatternKind, u64>,
}

impl fmt::Display for PatternBankStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PatternBank(scans={}, candidates={}, none={}, input_errors={})",
            self.scans, self.candidates, self.no_candidates, self.input_errors
        )
    }
}

pub struct PatternBank {
    detectors: Vec<Box<dyn PatternDetector>>,
    stats: Mutex<PatternBankStats>,
}

impl PatternBank {
    pub fn new() -> Self {
        Self::with_detectors(vec![
            Box::new(LiquiditySweepDetector),
            Box::new(OrderBlockDetector),
            Box::new(FairValueGapDetector),
            Box::new(CompressionBreakoutDetector),
            Box::new(SweepReturnDetector),
            Box::new(MomentumBurstDetector),
        ])
    }

    pub fn with_detectors(detectors: Vec<Box<dyn PatternDetector>>) -> Self {
        Self {
            detectors,
            stats: Mutex::new(PatternBankStats::default()),
        }
    }

    pub fn kinds(&self) -> Vec<PatternKind> {
        self.detectors.iter().map(|d| d.kind()).collect()
    }

    /// Run every detector for one symbol. A panicking detector becomes an input error.
    pub fn run(&self, ctx: &DetectionContext, thresholds: &ThresholdManager) -> Vec<(PatternKind, Detection)> {
        let mut results = Vec::with_capacity(self.detectors.len());

        for detector in &self.detectors {
            let kind = detector.kind();
            let th = thresholds.get(kind);
            let outcome = catch_unwind(AssertUnwindSafe(|| detector.detect(ctx, &th)))
                .unwrap_or_else(|payload| Detection::InputError(DetectorError::Panicked(panic_message(&*payload))));

            match &outcome {
                Detection::Candidate(c) => {
                    debug!(symbol = %ctx.symbol, pattern = %kind, direction = %c.direction, confidence = c.confidence, "Pattern candidate");
                }
                Detection::NoCandidate(reason) => {
                    debug!(symbol = %ctx.symbol, pattern = %kind, reason = *reason, "No candidate");
                }
                Detection::InputError(e) => {
                    warn!(symbol = %ctx.symbol, pattern = %kind, error = %e, "Detector input error");
                }
            }
            results.push((kind, outcome));
        }

        let mut stats = self.stats.lock();
        stats.scans += 1;
        for (kind, outcome) in &results {
            match outcome {
                Detection::Candidate(_) => {
                    stats.candidates += 1;
                    *stats.per_pattern.entry(*kind).or_insert(0) += 1;
                }
                Detection::NoCandidate(_) => stats.no_candidates += 1,
                Detection::InputError(_) => stats.input_errors += 1,
            }
        }
        results
    }

    pub fn get_stats(&self) -> PatternBankStats {
        self.stats.lock().clone()
    }
}

impl Default for PatternBank {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn pattern_rank(kind: PatternKind) -> usize {
    PatternKind::ALL.iter().position(|k| *k == kind).unwrap_or(usize::MAX)
}

/// Deterministic reduction: highest quality score, then higher raw confidence,
/// then fixed pattern order
pub fn select_best(candidates: Vec<PatternCandidate>) -> Option<PatternCandidate> {
    candidates.into_iter().reduce(|best, next| {
        let by_quality = next.quality_score.total_cmp(&best.quality_score);
        let by_confidence = next.confidence.total_cmp(&best.confidence);
        let better = by_quality
            .then(by_confidence)
            .then(pattern_rank(best.pattern).cmp(&pattern_rank(next.pattern)));
        if better == std::cmp::Ordering::Greater {
            next
        } else {
            best
        }
    })
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    struct PanickingDetector;

    impl PatternDetector for PanickingDetector {
        fn kind(&self) -> PatternKind {
            PatternKind::OrderBlockBounce
        }

        fn detect(&self, _ctx: &DetectionContext, _th: &ThresholdSet) -> Detection {
            panic!("boom")
        }
    }

    fn make_scored(pattern: PatternKind, quality: f64, confidence: f64) -> PatternCandidate {
        PatternCandidate {
            symbol: "EURUSD".to_string(),
            pattern,
            direction: Direction::Long,
            timeframe: Timeframe::M5,
            entry_price: 1.1,
            stop_loss: 1.099,
            take_profit: 1.102,
            confidence,
            quality_score: quality,
            momentum_score: 50.0,
            volume_quality: 50.0,
            reason: String::new(),
            detected_at: 0,
        }
    }

    #[test]
    fn test_panicking_detector_is_isolated() {
        let bank = PatternBank::with_detectors(vec![Box::new(PanickingDetector), Box::new(LiquiditySweepDetector)]);
        let ctx = make_context("EURUSD", Vec::new(), Vec::new());
        let results = bank.run(&ctx, &ThresholdManager::new());

        assert_eq!(results.len(), 2);
        assert!(matches!(&results[0].1, Detection::InputError(DetectorError::Panicked(m)) if m == "boom"));
        assert!(matches!(results[1].1, Detection::NoCandidate(_)));
        let stats = bank.get_stats();
        assert_eq!(stats.input_errors, 1);
        assert_eq!(stats.no_candidates, 1);
    }

    #[test]
    fn test_malformed_window_reported() {
        let mut m5: Vec<Candle> = (0..6)
            .map(|i| make_candle(Timeframe::M5, i, 1.1005, 1.1010, 1.1000, 1.1005, 100.0))
            .collect();
        m5[3].high = f64::NAN;
        let ctx = make_context("EURUSD", Vec::new(), m5);
        let bank = PatternBank::new();
        let results = bank.run(&ctx, &ThresholdManager::new());

        let lsr = &results[0];
        assert_eq!(lsr.0, PatternKind::LiquiditySweepReversal);
        assert!(matches!(lsr.1, Detection::InputError(DetectorError::MalformedCandle { .. })));
        assert_eq!(bank.kinds(), PatternKind::ALL.to_vec());
    }

    #[test]
    fn test_select_best_ordering() {
        let picked = select_best(vec![
            make_scored(PatternKind::MomentumBurst, 60.0, 70.0),
            make_scored(PatternKind::FairValueGapFill, 72.0, 65.0),
            make_scored(PatternKind::OrderBlockBounce, 72.0, 66.0),
        ])
        .unwrap();
        assert_eq!(picked.pattern, PatternKind::OrderBlockBounce);

        // Full tie falls back to pattern order
        let picked = select_best(vec![
            make_scored(PatternKind::SweepAndReturn, 50.0, 70.0),
            make_scored(PatternKind::LiquiditySweepReversal, 50.0, 70.0),
        ])
        .unwrap();
        assert_eq!(picked.pattern, PatternKind::LiquiditySweepReversal);
        assert!(select_best(Vec::new()).is_none());
    }

    #[test]
    fn test_regime_scale_monotonic() {
        assert!(regime_scale(VolatilityRegime::VeryLow) < regime_scale(VolatilityRegime::Low));
        assert!(regime_scale(VolatilityRegime::Normal) < regime_scale(VolatilityRegime::High));
    }
}

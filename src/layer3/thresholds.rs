// Threshold Manager - Per-pattern detector knobs with bounded adaptive adjustment
// Nudges knobs by recent throughput, session and volatility, then clamps every field

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, info};

use crate::core::types::{PatternKind, TradingSession, VolatilityRegime};

// ============================================================================
// Knobs
// ============================================================================

/// How a knob reacts to loosening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KnobKind {
    /// Minimum distance in pips; loosening lowers it
    Pips,
    /// Minimum shape ratio (wick, body, acceleration); loosening lowers it
    Ratio,
    /// Minimum confidence; loosening lowers it
    Confidence,
    /// Minimum volume multiple of average; loosening lowers it
    VolumeGate,
    /// Maximum allowed value (compression ratio, tolerance, block height); loosening raises it
    Ceiling,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Knob {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub kind: KnobKind,
}

impl Knob {
    pub fn new(value: f64, min: f64, max: f64, kind: KnobKind) -> Self {
        let mut knob = Self { value, min, max, kind };
        knob.clamp();
        knob
    }

    /// Make the gate easier to pass by `pct` (0.10 = 10%)
    pub fn loosen(&mut self, pct: f64) {
        match self.kind {
            KnobKind::Ceiling => self.value *= 1.0 + pct,
            _ => self.value *= 1.0 - pct,
        }
    }

    /// Make the gate harder to pass by `pct`
    pub fn tighten(&mut self, pct: f64) {
        match self.kind {
            KnobKind::Ceiling => self.value *= 1.0 - pct,
            _ => self.value *= 1.0 + pct,
        }
    }

    /// NaN snaps to the floor, infinities to the nearest bound
    pub fn clamp(&mut self) {
        self.value = if self.value.is_nan() {
            self.min
        } else {
            self.value.clamp(self.min, self.max)
        };
    }

    pub fn in_bounds(&self) -> bool {
        self.value >= self.min && self.value <= self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjustment {
    Loosen(f64),
    Tighten(f64),
    Hold,
}

/// Named distance knobs, all in pips
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipKnob {
    /// Minimum excursion beyond a swept extreme (LSR, SAR)
    SweepPips,
    /// Minimum FVG gap
    GapPips,
    /// Minimum close beyond the broken level (OBB, VCB, MB)
    BreakoutPips,
    BlockMinPips,
    BlockMaxPips,
    /// How close a retest must come to the order block
    RetestPips,
    /// How close price must come to the gap midpoint
    MidpointTolerancePips,
    /// How far touches may sit from a shared level and still count
    LevelTolerancePips,
}

impl PipKnob {
    pub fn name(&self) -> &'static str {
        match self {
            PipKnob::SweepPips => "sweep_pips",
            PipKnob::GapPips => "gap_pips",
            PipKnob::BreakoutPips => "breakout_pips",
            PipKnob::BlockMinPips => "block_min_pips",
            PipKnob::BlockMaxPips => "block_max_pips",
            PipKnob::RetestPips => "retest_pips",
            PipKnob::MidpointTolerancePips => "midpoint_tolerance_pips",
            PipKnob::LevelTolerancePips => "level_tolerance_pips",
        }
    }

    /// Used only when a set was built without this knob
    fn fallback(&self) -> f64 {
        match self {
            PipKnob::SweepPips | PipKnob::BreakoutPips | PipKnob::RetestPips | PipKnob::MidpointTolerancePips => 3.0,
            PipKnob::GapPips | PipKnob::LevelTolerancePips => 2.0,
            PipKnob::BlockMinPips => 5.0,
            PipKnob::BlockMaxPips => 15.0,
        }
    }
}

impl fmt::Display for PipKnob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Threshold Set
// ============================================================================

/// Knobs for one pattern. `shape_ratio` means the pattern's characteristic
/// ratio: wick ratio for LSR/OBB/FVG, compression ceiling for VCB, body ratio for
/// SAR, acceleration for MB. `distances` holds only the pip knobs the pattern reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    pub pattern: PatternKind,
    pub min_confidence: Knob,
    pub volume_multiplier: Knob,
    pub shape_ratio: Knob,
    pub distances: BTreeMap<PipKnob, Knob>,
    /// Never touched by adjustment
    pub rejection_required: bool,
}

impl ThresholdSet {
    pub fn defaults(pattern: PatternKind) -> Self {
        use KnobKind::*;
        let conf = |v: f64| Knob::new(v, 20.0, 90.0, Confidence);
        let vol = |v: f64| Knob::new(v, 1.0, 3.0, VolumeGate);
        let distances = |knobs: &[(PipKnob, Knob)]| knobs.iter().copied().collect::<BTreeMap<_, _>>();

        match pattern {
            PatternKind::LiquiditySweepReversal => Self {
                pattern,
                min_confidence: conf(65.0),
                volume_multiplier: vol(1.2),
                shape_ratio: Knob::new(0.5, 0.3, 0.8, Ratio),
                distances: distances(&[(PipKnob::SweepPips, Knob::new(3.0, 1.5, 8.0, Pips))]),
                rejection_required: true,
            },
            PatternKind::OrderBlockBounce => Self {
                pattern,
                min_confidence: conf(65.0),
                volume_multiplier: vol(1.1),
                shape_ratio: Knob::new(0.3, 0.15, 0.6, Ratio),
                distances: distances(&[
                    (PipKnob::BreakoutPips, Knob::new(3.0, 1.5, 8.0, Pips)),
                    (PipKnob::BlockMinPips, Knob::new(5.0, 3.0, 8.0, Pips)),
                    (PipKnob::BlockMaxPips, Knob::new(15.0, 10.0, 25.0, Ceiling)),
                    (PipKnob::RetestPips, Knob::new(3.0, 1.5, 6.0, Ceiling)),
                ]),
                rejection_required: false,
            },
            PatternKind::FairValueGapFill => Self {
                pattern,
                min_confidence: conf(62.0),
                volume_multiplier: vol(1.2),
                shape_ratio: Knob::new(0.4, 0.2, 0.7, Ratio),
                distances: distances(&[
                    (PipKnob::GapPips, Knob::new(2.0, 1.0, 6.0, Pips)),
                    (PipKnob::MidpointTolerancePips, Knob::new(3.0, 1.5, 6.0, Ceiling)),
                ]),
                rejection_required: false,
            },
            PatternKind::VolatilityCompressionBreakout => Self {
                pattern,
                min_confidence: conf(60.0),
                volume_multiplier: vol(1.3),
                shape_ratio: Knob::new(0.6, 0.3, 0.9, Ceiling),
                distances: distances(&[(PipKnob::BreakoutPips, Knob::new(2.0, 0.5, 6.0, Pips))]),
                rejection_required: false,
            },
            PatternKind::SweepAndReturn => Self {
                pattern,
                min_confidence: conf(65.0),
                volume_multiplier: vol(1.5),
                shape_ratio: Knob::new(0.5, 0.3, 0.8, Ratio),
                distances: distances(&[
                    (PipKnob::SweepPips, Knob::new(3.0, 1.5, 8.0, Pips)),
                    (PipKnob::LevelTolerancePips, Knob::new(2.0, 1.0, 4.0, Ceiling)),
                ]),
                rejection_required: false,
            },
            PatternKind::MomentumBurst => Self {
                pattern,
                min_confidence: conf(60.0),
                volume_multiplier: vol(1.5),
                shape_ratio: Knob::new(2.0, 1.2, 4.0, Ratio),
                distances: distances(&[(PipKnob::BreakoutPips, Knob::new(2.0, 1.0, 6.0, Pips))]),
                rejection_required: false,
            },
        }
    }

    /// Current value of a distance knob, in pips
    pub fn pips(&self, knob: PipKnob) -> f64 {
        self.distances.get(&knob).map(|k| k.value).unwrap_or_else(|| knob.fallback())
    }

    pub fn knobs(&self) -> impl Iterator<Item = &Knob> + '_ {
        [&self.min_confidence, &self.volume_multiplier, &self.shape_ratio]
            .into_iter()
            .chain(self.distances.values())
    }

    fn knobs_mut(&mut self) -> impl Iterator<Item = &mut Knob> + '_ {
        [&mut self.min_confidence, &mut self.volume_multiplier, &mut self.shape_ratio]
            .into_iter()
            .chain(self.distances.values_mut())
    }

    /// Fill in distance knobs missing from a hand-built or deserialized set
    fn fill_missing(&mut self) {
        for (name, knob) in ThresholdSet::defaults(self.pattern).distances {
            self.distances.entry(name).or_insert(knob);
        }
    }

    pub fn apply(&mut self, adjustment: Adjustment) {
        for knob in self.knobs_mut() {
            match adjustment {
                Adjustment::Loosen(p) => knob.loosen(p),
                Adjustment::Tighten(p) => knob.tighten(p),
                Adjustment::Hold => {}
            }
        }
    }

    pub fn clamp_all(&mut self) {
        for knob in self.knobs_mut() {
            knob.clamp();
        }
    }

    pub fn in_bounds(&self) -> bool {
        self.knobs().all(|k| k.in_bounds())
    }
}

impl fmt::Display for ThresholdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thresholds({}: conf={:.1}, vol={:.2}, ratio={:.2}",
            self.pattern.code(),
            self.min_confidence.value,
            self.volume_multiplier.value,
            self.shape_ratio.value,
        )?;
        for (name, knob) in &self.distances {
            write!(f, ", {}={:.2}", name, knob.value)?;
        }
        write!(f, ", rejection={})", self.rejection_required)
    }
}

// ============================================================================
// Adjustment rules
// ============================================================================

/// Throughput rule: 0 signals loosens 10%, 1-2 is the target band, 3-5 tightens 5%, more tightens 15%
pub fn counter_adjustment(count: u32) -> Adjustment {
    match count {
        0 => Adjustment::Loosen(0.10),
        1..=2 => Adjustment::Hold,
        3..=5 => Adjustment::Tighten(0.05),
        _ => Adjustment::Tighten(0.15),
    }
}

pub fn session_adjustment(session: TradingSession) -> Adjustment {
    match session {
        TradingSession::Asian => Adjustment::Loosen(0.20),
        TradingSession::London | TradingSession::NewYork => Adjustment::Tighten(0.10),
        TradingSession::Overlap => Adjustment::Tighten(0.15),
    }
}

pub fn volatility_adjustment(regime: VolatilityRegime) -> Adjustment {
    match regime {
        VolatilityRegime::VeryLow => Adjustment::Loosen(0.25),
        VolatilityRegime::Low => Adjustment::Loosen(0.15),
        VolatilityRegime::Normal => Adjustment::Hold,
        VolatilityRegime::High => Adjustment::Tighten(0.20),
    }
}

// ============================================================================
// Threshold Manager
// ============================================================================

#[derive(Debug, Clone)]
pub struct AdjustmentReport {
    pub session: TradingSession,
    pub regime: VolatilityRegime,
    pub timestamp: i64,
    /// (pattern, signals counted, min_confidence before, after)
    pub changes: Vec<(PatternKind, u32, f64, f64)>,
}

#[derive(Debug, Clone, Default)]
pub struct ThresholdStats {
    pub adjustments: u64,
    pub last_adjust: Option<i64>,
    pub pending_signals: u32,
}

impl fmt::Display for ThresholdStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Thresholds(adjustments={}, last_adjust={:?}, pending_signals={})",
            self.adjustments, self.last_adjust, self.pending_signals
        )
    }
}

struct ThresholdState {
    sets: HashMap<PatternKind, ThresholdSet>,
    counters: HashMap<PatternKind, u32>,
    last_adjust: Option<i64>,
    session: Option<TradingSession>,
    adjustments: u64,
}

pub struct ThresholdManager {
    state: Mutex<ThresholdState>,
}

impl ThresholdManager {
    pub fn new() -> Self {
        let sets = PatternKind::ALL
            .iter()
            .map(|k| (*k, ThresholdSet::defaults(*k)))
            .collect();
        Self::with_sets(sets)
    }

    pub fn with_sets(mut sets: HashMap<PatternKind, ThresholdSet>) -> Self {
        for kind in PatternKind::ALL {
            let set = sets.entry(kind).or_insert_with(|| ThresholdSet::defaults(kind));
            set.fill_missing();
            set.clamp_all();
        }
        Self {
            state: Mutex::new(ThresholdState {
                sets,
                counters: HashMap::new(),
                last_adjust: None,
                session: None,
                adjustments: 0,
            }),
        }
    }

    pub fn get(&self, pattern: PatternKind) -> ThresholdSet {
        self.state
            .lock()
            .sets
            .get(&pattern)
            .cloned()
            .unwrap_or_else(|| ThresholdSet::defaults(pattern))
    }

    /// All sets in fixed pattern order
    pub fn snapshot(&self) -> Vec<ThresholdSet> {
        let state = self.state.lock();
        PatternKind::ALL
            .iter()
            .map(|k| state.sets.get(k).cloned().unwrap_or_else(|| ThresholdSet::defaults(*k)))
            .collect()
    }

    pub fn record_signal(&self, pattern: PatternKind) {
        *self.state.lock().counters.entry(pattern).or_insert(0) += 1;
    }

    pub fn signal_count(&self, pattern: PatternKind) -> u32 {
        self.state.lock().counters.get(&pattern).copied().unwrap_or(0)
    }

    pub fn current_session(&self) -> Option<TradingSession> {
        self.state.lock().session
    }

    /// One adjustment cycle: throughput, session, volatility, clamp, reset counters
    pub fn adjust(&self, session: TradingSession, regime: VolatilityRegime, now: i64) -> AdjustmentReport {
        let mut state = self.state.lock();
        let mut changes = Vec::with_capacity(PatternKind::ALL.len());

        for kind in PatternKind::ALL {
            let count = state.counters.get(&kind).copied().unwrap_or(0);
            let set = state.sets.entry(kind).or_insert_with(|| ThresholdSet::defaults(kind));
            let before = set.min_confidence.value;

            set.apply(counter_adjustment(count));
            set.apply(session_adjustment(session));
            set.apply(volatility_adjustment(regime));
            set.clamp_all();

            debug!(pattern = %kind, signals = count, %set, "Thresholds adjusted");
            changes.push((kind, count, before, set.min_confidence.value));
        }

        state.counters.clear();
        state.last_adjust = Some(now);
        state.session = Some(session);
        state.adjustments += 1;

        info!(session = %session, regime = %regime, cycle = state.adjustments, "Threshold adjustment cycle complete");

        AdjustmentReport {
            session,
            regime,
            timestamp: now,
            changes,
        }
    }

    /// Run `adjust` when `interval_ms` has passed since the last cycle.
    /// The first call only starts the clock.
    pub fn maybe_adjust(
        &self,
        session: TradingSession,
        regime: VolatilityRegime,
        now: i64,
        interval_ms: i64,
    ) -> Option<AdjustmentReport> {
        {
            let mut state = self.state.lock();
            match state.last_adjust {
                None => {
                    state.last_adjust = Some(now);
                    state.session = Some(session);
                    return None;
                }
                Some(last) if now - last < interval_ms => return None,
                Some(_) => {}
            }
        }
        Some(self.adjust(session, regime, now))
    }

    pub fn get_stats(&self) -> ThresholdStats {
        let state = self.state.lock();
        ThresholdStats {
            adjustments: state.adjustments,
            last_adjust: state.last_adjust,
            pending_signals: state.counters.values().sum(),
        }
    }
}

impl Default for ThresholdManager {
    fn default() -> Self {
        Self::new()
    }
}

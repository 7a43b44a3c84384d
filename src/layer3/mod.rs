// Layer 3 - Signal Analysis
// Pattern detection, adaptive thresholds, quality gating and sweep protection

// Common utilities
pub mod common;

// Six candle-pattern detectors and the bank that runs them
pub mod patterns;

// Adaptive per-pattern knobs
pub mod thresholds;

// Composite scoring and publication gate
pub mod quality;

// Liquidity zones and sweep-aware delays
pub mod sweep;

pub use patterns::{
    select_best, Detection, DetectionContext, DetectorError, PatternBank, PatternBankStats,
    PatternDetector,
};
pub use thresholds::{AdjustmentReport, Knob, KnobKind, PipKnob, ThresholdManager, ThresholdSet, ThresholdStats};
pub use quality::{GateRejection, GateSettings, GateStats, PerformanceTable, QualityGate};
pub use sweep::{DelayedSignal, GuardDecision, GuardStats, LiquidityZone, LiquidityZoneTracker, SweepGuard, ZoneType};

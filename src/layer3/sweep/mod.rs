// Sweep protection - liquidity zones and the guard that delays signals in front of them

pub mod liquidity_zones;
pub mod sweep_guard;

pub use liquidity_zones::{build_zones, LiquidityZone, LiquidityZoneTracker, ZoneSettings, ZoneType};
pub use sweep_guard::{ActiveSweep, CompletedSweep, DelayedSignal, GuardDecision, GuardStats, SweepGuard};

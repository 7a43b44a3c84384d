// Event Type Constants - Signal lifecycle, sweep and threshold notifications
// Centralized so publishers and subscribers agree on names

// ============================================================================
// Signal Lifecycle Events (5)
// ============================================================================

pub const SIGNAL_PUBLISHED: &str = "signal_published";
pub const SIGNAL_DELAYED: &str = "signal_delayed";
pub const SIGNAL_RELEASED: &str = "signal_released";
pub const SIGNAL_EXPIRED: &str = "signal_expired";
pub const SIGNAL_REJECTED: &str = "signal_rejected";

// ============================================================================
// Sweep Events (2)
// ============================================================================

pub const SWEEP_STARTED: &str = "sweep_started";
pub const SWEEP_COMPLETED: &str = "sweep_completed";

// ============================================================================
// Engine Events (3)
// ============================================================================

pub const THRESHOLDS_ADJUSTED: &str = "thresholds_adjusted";
pub const DETECTOR_ERROR: &str = "detector_error";
pub const PIPELINE_RESTARTED: &str = "pipeline_restarted";

/// Every event type, for wildcard-free subscription setups
pub const ALL_EVENT_TYPES: [&str; 10] = [
    SIGNAL_PUBLISHED,
    SIGNAL_DELAYED,
    SIGNAL_RELEASED,
    SIGNAL_EXPIRED,
    SIGNAL_REJECTED,
    SWEEP_STARTED,
    SWEEP_COMPLETED,
    THRESHOLDS_ADJUSTED,
    DETECTOR_ERROR,
    PIPELINE_RESTARTED,
];

// Core Module - Foundational types, config, logging, events, clocks

pub mod types;
pub mod config;
pub mod logger;
pub mod events;
pub mod clock;

// Re-export commonly used items for convenience
pub use types::*;
pub use config::{
    BufferConfig, ConfigError, ConfigManager, ConfigSummary, FeedConfig, GuardConfig,
    MonitoringConfig, PipelineConfig, SnapshotConfig, SupervisorConfig,
};
pub use logger::setup_logging;
pub use events::{Event, EventBus, EventBusStatsSnapshot, EventPriority};
pub use clock::{system_clock, Clock, ManualClock, MonotonicClock, SharedClock, SystemClock};

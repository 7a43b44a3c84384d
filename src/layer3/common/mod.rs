// Layer3 Common Module - Shared utilities for detectors, scoring and sweep tracking

pub mod time_windows;
pub mod event_types;
pub mod indicators;

pub use time_windows::TimeWindow;
pub use event_types::*;

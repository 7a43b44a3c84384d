// Engine - Scan orchestration, runtime wiring and restart supervision

pub mod signal_pipeline;
pub mod runtime;
pub mod supervisor;

pub use signal_pipeline::{assemble_signal, PipelineStats, ScanReport, SignalPipeline, SignalState};
pub use runtime::{Engine, EngineError};
pub use supervisor::{restart_delay, Supervisor, SupervisorStats};

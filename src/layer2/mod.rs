// Layer 2 - Market Data Processing
// Parses feed traffic, builds M1/M5/M15 candles and keeps them warm across restarts

pub mod parser;
pub mod candle_store;
pub mod aggregator;
pub mod ingestion;
pub mod snapshot;
pub mod metrics;

// Re-export commonly used items
pub use parser::{MessageParser, ParseError, ParsedMessage, ParserStats};
pub use candle_store::{CandleStore, CandleStoreStats, CandleTotals, SymbolCandles};
pub use aggregator::{AggregatorStats, CandleAggregator, Rejection};
pub use ingestion::{IngestionPipeline, IngestionStats, TickObserver};
pub use snapshot::{CandleSnapshot, SnapshotError, SnapshotStore, SymbolSnapshot};
pub use metrics::UnifiedMetrics;

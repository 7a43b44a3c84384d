// Ingestion Pipeline - feed payloads -> parser -> bounded queue -> aggregator
// Continuous context: never waits on the periodic scan, drops oldest ticks under backpressure

use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::core::clock::SharedClock;
use crate::layer1::feed_client::FeedHandler;
use crate::layer2::aggregator::{CandleAggregator, Rejection};
use crate::layer2::parser::{MessageParser, ParseError, ParsedMessage};

/// Per-tick hook for components that track price between scans (sweep detection)
pub trait TickObserver: Send + Sync {
    fn on_price(&self, symbol: &str, price: f64, timestamp_ms: i64);
}

/// Ingestion statistics
#[derive(Debug, Clone, Default)]
pub struct IngestionStats {
    pub is_running: bool,
    pub raw_received: u64,
    pub enqueued: u64,
    pub processed: u64,
    pub dropped_lagged: u64,
    pub rejected: u64,
    pub parse_errors: u64,
}

impl fmt::Display for IngestionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Ingestion(running={}, received={}, processed={}, dropped={}, rejected={}, parse_errors={})",
            self.is_running, self.raw_received, self.processed, self.dropped_lagged,
            self.rejected, self.parse_errors
        )
    }
}

pub struct IngestionPipeline {
    parser: Mutex<MessageParser>,
    aggregator: Arc<CandleAggregator>,
    observers: RwLock<Vec<Arc<dyn TickObserver>>>,
    tx: broadcast::Sender<ParsedMessage>,
    clock: SharedClock,
    stats: Mutex<IngestionStats>,
}

impl IngestionPipeline {
    pub fn new(
        aggregator: Arc<CandleAggregator>,
        symbols: &[String],
        queue_capacity: usize,
        clock: SharedClock,
    ) -> Self {
        let (tx, _rx) = broadcast::channel(queue_capacity.max(1));
        Self {
            parser: Mutex::new(MessageParser::new(symbols)),
            aggregator,
            observers: RwLock::new(Vec::new()),
            tx,
            clock,
            stats: Mutex::new(IngestionStats::default()),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn TickObserver>) {
        self.observers.write().push(observer);
    }

    /// Update the tracked symbol list without touching candle state
    pub fn set_symbols(&self, symbols: &[String]) {
        self.parser.lock().set_symbols(symbols);
    }

    /// Receiver for the consumer loop. Must be taken before messages are submitted.
    pub fn subscribe(&self) -> broadcast::Receiver<ParsedMessage> {
        self.tx.subscribe()
    }

    /// Parse one raw feed payload and enqueue it. Malformed input is counted and dropped.
    pub fn submit_raw(&self, raw: &str) -> Result<(), ParseError> {
        self.stats.lock().raw_received += 1;
        let now = self.clock.now_ms();
        let parsed = self.parser.lock().parse(raw, now);

        match parsed {
            Ok(msg) => {
                self.submit(msg);
                Ok(())
            }
            Err(e) => {
                if !e.is_ignorable() {
                    self.stats.lock().parse_errors += 1;
                    warn!(error = %e, "Dropping malformed feed message");
                }
                Err(e)
            }
        }
    }

    /// Enqueue an already-parsed message. Never blocks; a full queue evicts its oldest entry.
    pub fn submit(&self, msg: ParsedMessage) {
        if self.tx.send(msg).is_ok() {
            self.stats.lock().enqueued += 1;
        }
    }

    /// Apply a message to the candle state and notify observers
    pub fn process_message(&self, msg: &ParsedMessage) {
        let applied = match msg {
            ParsedMessage::Tick(tick) => match self.aggregator.on_tick(tick) {
                Ok(()) => {
                    let observers = self.observers.read().clone();
                    for observer in observers {
                        observer.on_price(&tick.symbol, tick.mid(), tick.timestamp);
                    }
                    true
                }
                Err(Rejection::Late) | Err(Rejection::Malformed) => false,
            },
            ParsedMessage::Ohlc { symbol, candle } => self.aggregator.merge_candle(symbol, candle.clone()),
        };

        let mut stats = self.stats.lock();
        if applied {
            stats.processed += 1;
        } else {
            stats.rejected += 1;
        }
    }

    /// Consumer loop. Runs until shutdown is signalled or every sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut rx: broadcast::Receiver<ParsedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.stats.lock().is_running = true;
        info!("Ingestion loop started");

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(msg) => self.process_message(&msg),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        self.stats.lock().dropped_lagged += skipped;
                        warn!(skipped = skipped, "Ingestion lagging, oldest ticks dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Ingestion queue closed");
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Apply whatever is already queued so the shutdown flush sees it
        while let Ok(msg) = rx.try_recv() {
            self.process_message(&msg);
        }

        self.stats.lock().is_running = false;
        info!("Ingestion loop stopped");
    }

    pub fn parser_stats(&self) -> crate::layer2::parser::ParserStats {
        self.parser.lock().get_stats()
    }

    pub fn get_stats(&self) -> IngestionStats {
        self.stats.lock().clone()
    }
}

impl FeedHandler for IngestionPipeline {
    fn on_message(&self, raw: &str) {
        // Errors are already counted and logged by submit_raw
        let _ = self.submit_raw(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::config::BufferConfig;
    use crate::core::types::Timeframe;
    use crate::layer2::candle_store::CandleStore;
    use std::time::Duration;

    struct CountingObserver(Mutex<u32>);

    impl TickObserver for CountingObserver {
        fn on_price(&self, _symbol: &str, _price: f64, _ts: i64) {
            *self.0.lock() += 1;
        }
    }

    fn make_pipeline(capacity: usize) -> (Arc<IngestionPipeline>, Arc<CandleStore>) {
        let store = Arc::new(CandleStore::new(BufferConfig::default()));
        let aggregator = Arc::new(CandleAggregator::new(Arc::clone(&store)));
        let clock: SharedClock = Arc::new(ManualClock::new(0));
        let pipeline = IngestionPipeline::new(aggregator, &["EURUSD".to_string()], capacity, clock);
        (Arc::new(pipeline), store)
    }

    fn tick_json(bid: f64, ts: i64) -> String {
        format!(
            r#"{{"type":"tick","symbol":"EURUSD","bid":{},"ask":{},"volume":1,"timestamp":{}}}"#,
            bid,
            bid + 0.0001,
            ts
        )
    }

    #[tokio::test]
    async fn test_ticks_flow_into_store() {
        let (pipeline, store) = make_pipeline(64);
        let observer = Arc::new(CountingObserver(Mutex::new(0)));
        pipeline.add_observer(observer.clone());

        let rx = pipeline.subscribe();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&pipeline).run(rx, shutdown_rx));

        for i in 0..3 {
            pipeline.submit_raw(&tick_json(1.1, i * 60_000)).unwrap();
        }
        assert!(pipeline.submit_raw("garbage").is_err());
        assert!(pipeline.submit_raw(r#"{"type":"heartbeat"}"#).is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.len("EURUSD", Timeframe::M1), 2);
        assert_eq!(*observer.0.lock(), 3);
        let stats = pipeline.get_stats();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.parse_errors, 1);
        assert!(!stats.is_running);
    }

    #[tokio::test]
    async fn test_backpressure_drops_oldest() {
        let (pipeline, store) = make_pipeline(4);
        let rx = pipeline.subscribe();

        // Consumer not running yet: 10 ticks into a queue of 4
        for i in 0..10 {
            pipeline.submit_raw(&tick_json(1.1, i * 60_000)).unwrap();
        }

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&pipeline).run(rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pipeline.get_stats();
        assert_eq!(stats.dropped_lagged, 6);
        assert_eq!(stats.processed, 4);

        // Newest ticks survived
        let last = store.latest_tick("EURUSD").unwrap();
        assert_eq!(last.timestamp, 9 * 60_000);
        handle.abort();
    }
}

// Engine Runtime - Owns every component and drives the ingestion and periodic contexts
// Feed -> IngestionPipeline -> CandleAggregator -> CandleStore <- SignalPipeline (scan loop)

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::clock::SharedClock;
use crate::core::config::{ConfigError, ConfigManager};
use crate::core::events::EventBus;
use crate::layer1::feed_client::{FeedClient, FeedError, FeedHandler};
use crate::layer1::signal_publisher::{EventBusSink, JsonLinesSink, SignalPublisher, SignalSink};
use crate::layer2::aggregator::CandleAggregator;
use crate::layer2::candle_store::CandleStore;
use crate::layer2::ingestion::IngestionPipeline;
use crate::layer2::metrics::UnifiedMetrics;
use crate::layer2::snapshot::{SnapshotError, SnapshotStore};
use crate::layer3::sweep::SweepGuard;

use super::signal_pipeline::{ScanReport, SignalPipeline, SignalState};

const PUBLISH_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),
    #[error("Task join error: {0}")]
    Join(String),
}

pub struct Engine {
    config: Arc<ConfigManager>,
    clock: SharedClock,
    events: Arc<EventBus>,
    store: Arc<CandleStore>,
    aggregator: Arc<CandleAggregator>,
    ingestion: Arc<IngestionPipeline>,
    feed: Arc<FeedClient>,
    publisher: Arc<SignalPublisher>,
    pipeline: Arc<SignalPipeline>,
    snapshots: SnapshotStore,
}

impl Engine {
    /// Wire every component from the current config. Nothing runs until `run`.
    pub fn new(config: Arc<ConfigManager>, events: Arc<EventBus>, clock: SharedClock) -> Result<Self, EngineError> {
        let state = SignalState::new(&config, events.clone());
        Self::with_state(config, events, clock, state)
    }

    /// Like `new`, but cooldowns, thresholds and delayed signals carry over from `state`
    pub fn with_state(
        config: Arc<ConfigManager>,
        events: Arc<EventBus>,
        clock: SharedClock,
        state: SignalState,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let feed_config = config.feed();
        let store = Arc::new(CandleStore::new(config.buffers()));
        let aggregator = Arc::new(CandleAggregator::new(store.clone()));
        let ingestion = Arc::new(IngestionPipeline::new(
            aggregator.clone(),
            &feed_config.symbols,
            feed_config.tick_queue_capacity,
            clock.clone(),
        ));
        let feed = Arc::new(FeedClient::new(&feed_config));

        let mut sinks: Vec<Arc<dyn SignalSink>> = vec![Arc::new(EventBusSink::new(events.clone()))];
        if let Some(path) = config.monitoring().signal_log_path {
            sinks.push(Arc::new(JsonLinesSink::new(path)));
        }
        let publisher = Arc::new(SignalPublisher::new(sinks, PUBLISH_BUFFER));

        let pipeline = Arc::new(SignalPipeline::with_state(
            aggregator.clone(),
            publisher.clone(),
            events.clone(),
            config.clone(),
            clock.clone(),
            state,
        ));
        let guard: Arc<SweepGuard> = pipeline.guard().clone();
        ingestion.add_observer(guard);

        let snapshots = SnapshotStore::new(config.snapshot().path);

        info!(
            symbols = ?config.pipeline().symbols,
            sinks = ?publisher.sink_names(),
            snapshot = %snapshots.path().display(),
            "Engine created"
        );

        Ok(Self {
            config,
            clock,
            events,
            store,
            aggregator,
            ingestion,
            feed,
            publisher,
            pipeline,
            snapshots,
        })
    }

    /// Read and write candle snapshots somewhere other than the configured path
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshots = SnapshotStore::new(path.into());
        self
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Arc<CandleAggregator> {
        &self.aggregator
    }

    pub fn ingestion(&self) -> &Arc<IngestionPipeline> {
        &self.ingestion
    }

    pub fn pipeline(&self) -> &Arc<SignalPipeline> {
        &self.pipeline
    }

    pub fn publisher(&self) -> &Arc<SignalPublisher> {
        &self.publisher
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Restore candles from the snapshot file. Returns restored symbol count.
    pub fn warm_start(&self) -> usize {
        self.snapshots.warm_start(&self.store)
    }

    pub fn scan_once(&self) -> ScanReport {
        self.pipeline.scan()
    }

    /// Seal every live candle and write the snapshot
    pub fn flush(&self) -> Result<usize, EngineError> {
        let sealed = self.aggregator.seal_all();
        let saved = self.snapshots.save(&self.store, self.clock.now_ms())?;
        debug!(sealed, saved, "Engine state flushed");
        Ok(saved)
    }

    pub fn collect_metrics(&self) -> UnifiedMetrics {
        UnifiedMetrics {
            feed: Some(self.feed.get_stats()),
            parser: Some(self.ingestion.parser_stats()),
            ingestion: Some(self.ingestion.get_stats()),
            aggregator: Some(self.aggregator.get_stats()),
            candles: Some(self.store.get_stats()),
            bank: Some(self.pipeline.bank().get_stats()),
            thresholds: Some(self.pipeline.thresholds().get_stats()),
            gate: Some(self.pipeline.gate().get_stats()),
            guard: Some(self.pipeline.guard().get_stats()),
            publisher: Some(self.publisher.get_stats()),
        }
    }

    fn reload_config(&self) {
        match self.config.reload() {
            Ok(()) => {
                let symbols = self.config.feed().symbols;
                self.ingestion.set_symbols(&symbols);
                self.feed.set_symbols(&symbols);
            }
            Err(e) => warn!(error = %e, "Config reload failed, keeping previous values"),
        }
    }

    /// Run both contexts until `shutdown` flips to true or the feed gives up.
    /// Live candles are sealed and snapshotted on every exit path.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let started = Instant::now();

        let ingestion_task = tokio::spawn(self.ingestion.clone().run(self.ingestion.subscribe(), stop_rx.clone()));
        let publisher_task = tokio::spawn(self.publisher.clone().run(stop_rx.clone()));
        let mut feed_task: JoinHandle<Result<(), FeedError>> = {
            let feed = self.feed.clone();
            let handler: Arc<dyn FeedHandler> = self.ingestion.clone();
            let rx = stop_rx.clone();
            tokio::spawn(async move { feed.run(handler, rx).await })
        };

        let monitoring = self.config.monitoring();
        let mut snapshot_tick = tokio::time::interval(Duration::from_secs(self.config.snapshot().interval_secs.max(1)));
        let mut metrics_tick = tokio::time::interval(Duration::from_secs(monitoring.metrics_interval_secs.max(1)));
        let mut reload_tick = tokio::time::interval(Duration::from_secs(monitoring.config_reload_secs.max(1)));
        // The first tick of an interval fires immediately
        snapshot_tick.tick().await;
        metrics_tick.tick().await;
        reload_tick.tick().await;

        let scan_sleep = tokio::time::sleep(self.scan_interval());
        tokio::pin!(scan_sleep);

        info!("Engine running");
        let mut feed_done = false;
        let result = loop {
            tokio::select! {
                _ = &mut scan_sleep => {
                    self.pipeline.scan();
                    // Interval is re-read so a reload takes effect on the next cycle
                    scan_sleep.as_mut().reset(tokio::time::Instant::now() + self.scan_interval());
                }
                _ = snapshot_tick.tick() => {
                    if let Err(e) = self.snapshots.save(&self.store, self.clock.now_ms()) {
                        warn!(error = %e, "Periodic snapshot failed");
                    }
                }
                _ = metrics_tick.tick() => {
                    self.collect_metrics().print_compact(started.elapsed().as_secs());
                }
                _ = reload_tick.tick() => self.reload_config(),
                joined = &mut feed_task => {
                    feed_done = true;
                    break match joined {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => {
                            error!(error = %e, "Feed stopped");
                            Err(EngineError::Feed(e))
                        }
                        Err(e) => Err(EngineError::Join(e.to_string())),
                    };
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Engine shutdown requested");
                        break Ok(());
                    }
                }
            }
        };

        let _ = stop_tx.send(true);
        if !feed_done {
            if let Err(e) = feed_task.await {
                warn!(error = %e, "Feed task did not stop cleanly");
            }
        }
        for (name, task) in [("ingestion", ingestion_task), ("publisher", publisher_task)] {
            if let Err(e) = task.await {
                warn!(task = name, error = %e, "Task did not stop cleanly");
            }
        }

        if let Err(e) = self.flush() {
            error!(error = %e, "Shutdown snapshot failed");
        }
        self.collect_metrics().print_report();
        info!(uptime_secs = started.elapsed().as_secs(), "Engine stopped");
        result
    }

    fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.config.pipeline().scan_interval_secs.max(1))
    }
}

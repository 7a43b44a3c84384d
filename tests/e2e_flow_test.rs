// End-to-End Flow Tests for FX Sniper
//
// These tests exercise the full signal path without network connections:
//   raw feed JSON → IngestionPipeline → CandleAggregator → CandleStore
//   → SignalPipeline (PatternBank → QualityGate → SweepGuard) → SignalPublisher sinks
//
// Run with: cargo test --test e2e_flow_test

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use fx_sniper::core::{
    BufferConfig, Candle, ConfigManager, Direction, EventBus, ManualClock, PatternCandidate,
    PatternKind, SharedClock, SweepStatus, Tick, Timeframe,
};
use fx_sniper::engine::{Engine, EngineError, SignalPipeline, SignalState, Supervisor};
use fx_sniper::layer1::{EventBusSink, JsonLinesSink, SignalPublisher, SignalSink};
use fx_sniper::layer2::{CandleAggregator, CandleStore, IngestionPipeline, ParsedMessage, SnapshotStore};
use fx_sniper::layer3::common::{
    SIGNAL_DELAYED, SIGNAL_EXPIRED, SIGNAL_PUBLISHED, SIGNAL_REJECTED, SIGNAL_RELEASED, SWEEP_COMPLETED,
};
use fx_sniper::layer3::patterns::LiquiditySweepDetector;
use fx_sniper::layer3::{Detection, DetectionContext, PatternBank, PatternDetector, ThresholdSet};

// ============================================================================
// Helpers
// ============================================================================

/// 2024-01-02 09:00:00 UTC, London session
const T0: i64 = 1_704_186_000_000;
const MINUTE: i64 = 60_000;

fn make_tick(mid: f64, ts: i64) -> Tick {
    Tick::new("EURUSD", mid - 0.00005, mid + 0.00005, 1.0, ts)
}

fn make_tick_json(mid: f64, ts: i64) -> String {
    format!(
        r#"{{"type":"tick","symbol":"EURUSD","bid":{bid},"ask":{ask},"volume":1,"timestamp":{ts}}}"#,
        bid = mid - 0.00005,
        ask = mid + 0.00005,
        ts = ts,
    )
}

fn make_m5(index: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
    Candle {
        timeframe: Timeframe::M5,
        open,
        high,
        low,
        close,
        volume: 100.0,
        timestamp: T0 + index * 5 * MINUTE,
    }
}

/// Eight M5 bars ending at T0: resistance near 1.10195, support near 1.09805
fn make_zone_history() -> Vec<Candle> {
    let rows = [
        (1.1010, 1.0995),
        (1.1020, 1.0998),
        (1.1012, 1.0990),
        (1.1008, 1.0980),
        (1.1019, 1.0992),
        (1.1011, 1.0989),
        (1.1009, 1.0981),
        (1.1005, 1.0995),
    ];
    rows.iter()
        .enumerate()
        .map(|(i, (high, low))| make_m5(i as i64 - 8, low + 0.0003, *high, *low, high - 0.0003))
        .collect()
}

/// Always proposes the same long setup, whatever the candles say
struct ScriptedDetector {
    kind: PatternKind,
    entry: f64,
    confidence: f64,
}

impl PatternDetector for ScriptedDetector {
    fn kind(&self) -> PatternKind {
        self.kind
    }

    fn detect(&self, ctx: &DetectionContext, _th: &ThresholdSet) -> Detection {
        Detection::Candidate(PatternCandidate {
            symbol: ctx.symbol.clone(),
            pattern: self.kind,
            direction: Direction::Long,
            timeframe: Timeframe::M5,
            entry_price: self.entry,
            stop_loss: self.entry - 0.0010,
            take_profit: self.entry + 0.0020,
            confidence: self.confidence,
            quality_score: 0.0,
            momentum_score: 70.0,
            volume_quality: 70.0,
            reason: "scripted".to_string(),
            detected_at: ctx.now_ms,
        })
    }
}

/// Three flat M5 bars, then one that wicks below their low and closes back inside
fn load_sweep_reversal(aggregator: &CandleAggregator) {
    for i in 0..3 {
        aggregator.merge_candle("EURUSD", make_m5(i - 4, 1.1005, 1.1010, 1.1000, 1.1005));
    }
    aggregator.merge_candle("EURUSD", make_m5(-1, 1.1002, 1.1003, 1.0994, 1.0999));
}

fn scripted_bank(entry: f64) -> PatternBank {
    PatternBank::with_detectors(vec![Box::new(ScriptedDetector {
        kind: PatternKind::LiquiditySweepReversal,
        entry,
        confidence: 80.0,
    })])
}

struct Harness {
    config: Arc<ConfigManager>,
    clock: Arc<ManualClock>,
    events: Arc<EventBus>,
    aggregator: Arc<CandleAggregator>,
    ingestion: Arc<IngestionPipeline>,
    publisher: Arc<SignalPublisher>,
    pipeline: SignalPipeline,
}

fn make_harness(bank: PatternBank, extra_sinks: Vec<Arc<dyn SignalSink>>) -> Harness {
    let config = ConfigManager::default();
    config
        .load_from_str(r#"{"pipeline": {"symbols": ["EURUSD"]}}"#)
        .expect("config");
    let config = Arc::new(config);

    let clock = Arc::new(ManualClock::new(T0));
    let shared: SharedClock = clock.clone();
    let events = Arc::new(EventBus::new());

    let store = Arc::new(CandleStore::new(BufferConfig::default()));
    let aggregator = Arc::new(CandleAggregator::new(store));
    let ingestion = Arc::new(IngestionPipeline::new(aggregator.clone(), &["EURUSD".to_string()], 1024, shared.clone()));

    let mut sinks: Vec<Arc<dyn SignalSink>> = vec![Arc::new(EventBusSink::new(events.clone()))];
    sinks.extend(extra_sinks);
    let publisher = Arc::new(SignalPublisher::new(sinks, 16));

    let pipeline = SignalPipeline::new(aggregator.clone(), publisher.clone(), events.clone(), config.clone(), shared)
        .with_bank(bank);
    ingestion.add_observer(pipeline.guard().clone());

    Harness {
        config,
        clock,
        events,
        aggregator,
        ingestion,
        publisher,
        pipeline,
    }
}

// ============================================================================
// TEST 1 – Aggregation: raw ticks roll up into M1, M5 and M15
// ============================================================================

#[tokio::test]
async fn test_raw_ticks_roll_up_through_ingestion() {
    let clock: SharedClock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(CandleStore::new(BufferConfig::default()));
    let aggregator = Arc::new(CandleAggregator::new(store.clone()));
    let ingestion = Arc::new(IngestionPipeline::new(aggregator.clone(), &["EURUSD".to_string()], 4096, clock));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(ingestion.clone().run(ingestion.subscribe(), shutdown_rx));

    // Two ticks per minute for fifteen minutes, price climbing one pip per minute
    for minute in 0..15 {
        let mid = 1.1000 + minute as f64 * 0.0001;
        ingestion.submit_raw(&make_tick_json(mid, T0 + minute * MINUTE)).expect("tick");
        ingestion.submit_raw(&make_tick_json(mid + 0.00005, T0 + minute * MINUTE + 30_000)).expect("tick");
    }
    // Malformed and unknown messages are dropped, never fatal
    assert!(ingestion.submit_raw("{not json").is_err());
    assert!(ingestion.submit_raw(r#"{"type":"heartbeat"}"#).is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;
    shutdown_tx.send(true).expect("shutdown");
    task.await.expect("ingestion task");

    assert_eq!(aggregator.seal_elapsed(T0 + 15 * MINUTE), 1);
    assert_eq!(store.len("EURUSD", Timeframe::M1), 15);
    assert_eq!(store.len("EURUSD", Timeframe::M5), 3);
    assert_eq!(store.len("EURUSD", Timeframe::M15), 1);

    let m5 = store.candles("EURUSD", Timeframe::M5, 3);
    assert!((m5[0].open - 1.1000).abs() < 1e-9);
    assert!((m5[0].close - 1.10045).abs() < 1e-9);
    assert_eq!(m5[0].volume, 10.0);
    let m15 = store.candles("EURUSD", Timeframe::M15, 1);
    assert!((m15[0].high - 1.10145).abs() < 1e-9);
    assert!((m15[0].low - 1.1000).abs() < 1e-9);

    let stats = ingestion.get_stats();
    assert_eq!(stats.processed, 30);
    assert_eq!(stats.parse_errors, 1);
}

#[test]
fn test_resealing_minute_is_idempotent() {
    let store = Arc::new(CandleStore::new(BufferConfig::default()));
    let aggregator = CandleAggregator::new(store.clone());
    let candle = Candle {
        timeframe: Timeframe::M1,
        open: 1.1000,
        high: 1.1003,
        low: 1.0999,
        close: 1.1002,
        volume: 4.0,
        timestamp: T0,
    };

    assert!(aggregator.seal_candle("EURUSD", candle.clone()));
    assert!(!aggregator.seal_candle("EURUSD", candle));
    assert_eq!(store.len("EURUSD", Timeframe::M1), 1);
    assert_eq!(aggregator.get_stats().duplicate_seals, 1);
}

#[test]
fn test_buffers_stay_bounded() {
    let capacity = BufferConfig {
        max_ticks: 20,
        max_m1: 10,
        max_m5: 4,
        max_m15: 2,
    };
    let store = Arc::new(CandleStore::new(capacity));
    let aggregator = CandleAggregator::new(store.clone());

    for minute in 0..60 {
        let mid = 1.1000 + (minute % 7) as f64 * 0.0001;
        aggregator.on_tick(&make_tick(mid, T0 + minute * MINUTE)).expect("tick");
    }

    assert_eq!(store.recent_ticks("EURUSD", 100).len(), 20);
    assert_eq!(store.len("EURUSD", Timeframe::M1), 10);
    assert_eq!(store.len("EURUSD", Timeframe::M5), 4);
    assert_eq!(store.len("EURUSD", Timeframe::M15), 2);

    // Lifetime totals keep the roll-up ratios even after eviction
    let totals = store.totals("EURUSD");
    assert_eq!(totals.m1, 59);
    assert_eq!(totals.m5, totals.m1 / 5);
    assert_eq!(totals.m15, totals.m5 / 3);
}

// ============================================================================
// TEST 2 – Scenario A through the whole pipeline
// ============================================================================

#[test]
fn test_liquidity_sweep_reversal_published() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_path = dir.path().join("signals.jsonl");
    let h = make_harness(
        PatternBank::with_detectors(vec![Box::new(LiquiditySweepDetector)]),
        vec![Arc::new(JsonLinesSink::new(&log_path))],
    );

    load_sweep_reversal(&h.aggregator);

    let report = h.pipeline.scan();
    assert_eq!(report.published.len(), 1, "rejected: {:?}", report.rejected);

    let signal = &report.published[0];
    assert_eq!(signal.pattern, PatternKind::LiquiditySweepReversal);
    assert_eq!(signal.direction, Direction::Long);
    assert!((signal.entry_price - 1.1000).abs() < 1e-9);
    assert!((signal.stop_loss - 1.0993).abs() < 1e-9);
    assert!(signal.raw_confidence >= 70.0);
    assert!(signal.confidence <= signal.raw_confidence);
    assert_eq!(signal.sweep_status, SweepStatus::Clear);
    assert!(signal.risk_reward >= 1.5);

    assert_eq!(h.publisher.flush(), 1);
    assert_eq!(h.events.get_recent_events(Some(SIGNAL_PUBLISHED), None).len(), 1);
    let lines = std::fs::read_to_string(&log_path).expect("signal log");
    assert_eq!(lines.lines().count(), 1);
    assert!(lines.contains(&signal.id));
}

// ============================================================================
// TEST 3 – Scenarios B and C: cooldown and hourly cap
// ============================================================================

#[test]
fn test_cooldown_then_hourly_cap() {
    let h = make_harness(scripted_bank(1.1000), Vec::new());

    assert_eq!(h.pipeline.scan().published.len(), 1);

    // 09:05 - inside the 10 minute cooldown
    h.clock.advance_minutes(5);
    let report = h.pipeline.scan();
    assert!(report.published.is_empty());
    assert!(report.rejected[0].1.contains("cooldown"));

    // 09:10 and 09:20 fill the hour
    h.clock.advance_minutes(5);
    assert_eq!(h.pipeline.scan().published.len(), 1);
    h.clock.advance_minutes(10);
    assert_eq!(h.pipeline.scan().published.len(), 1);

    // 09:40 - cooldown is over but the cap of 3 is reached
    h.clock.advance_minutes(20);
    let report = h.pipeline.scan();
    assert!(report.published.is_empty());
    assert!(report.rejected[0].1.contains("hourly cap"));

    // 10:00 - new clock hour
    h.clock.set(T0 + 60 * MINUTE);
    assert_eq!(h.pipeline.scan().published.len(), 1);
    assert_eq!(h.pipeline.get_stats().published, 4);
}

// ============================================================================
// TEST 4 – Sweep protection: delay, release, expiry
// ============================================================================

fn load_zones(h: &Harness) {
    for candle in make_zone_history() {
        h.aggregator.merge_candle("EURUSD", candle);
    }
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.1000, T0)));
}

#[test]
fn test_delayed_signal_released_after_sweep() {
    // Long entry 3.5 pips above support at 1.09805
    let h = make_harness(scripted_bank(1.0984), Vec::new());
    load_zones(&h);

    let report = h.pipeline.scan();
    assert!(report.published.is_empty());
    assert_eq!(report.delayed.len(), 1);
    assert_eq!(h.events.get_recent_events(Some(SIGNAL_DELAYED), None).len(), 1);

    // Price runs through support, then snaps back above it
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0975, T0 + 20_000)));
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0985, T0 + 40_000)));
    assert_eq!(h.events.get_recent_events(Some(SWEEP_COMPLETED), None).len(), 1);

    h.clock.advance_minutes(1);
    let report = h.pipeline.scan();
    assert_eq!(report.published.len(), 1);
    let released = &report.published[0];
    assert_eq!(released.id, report_delayed_id(&h));
    assert_eq!(released.sweep_status, SweepStatus::Released);
    assert_eq!(released.sweep_badge, SweepStatus::Released.badge());
    assert_eq!(h.events.get_recent_events(Some(SIGNAL_RELEASED), None).len(), 1);
    assert_eq!(h.pipeline.get_stats().released, 1);
}

#[test]
fn test_released_signal_waits_out_cooldown() {
    let h = make_harness(scripted_bank(1.0984), Vec::new());
    load_zones(&h);
    assert_eq!(h.pipeline.scan().delayed.len(), 1);

    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0975, T0 + 20_000)));
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0985, T0 + 40_000)));
    // Another EURUSD signal went out just after the sweep
    h.pipeline.gate().mark_published("EURUSD", T0 + 60_000);

    // 09:02 - the release is held back by the cooldown, not dropped
    h.clock.set(T0 + 2 * MINUTE);
    let report = h.pipeline.scan();
    assert!(report.published.is_empty());
    assert_eq!(h.pipeline.guard().get_stats().requeued, 1);

    // 09:12 - cooldown over, the held release goes out
    h.clock.set(T0 + 12 * MINUTE);
    let report = h.pipeline.scan();
    assert_eq!(report.published.len(), 1);
    assert_eq!(report.published[0].sweep_status, SweepStatus::Released);
    assert_eq!(h.pipeline.get_stats().released, 1);
}

#[test]
fn test_release_for_unscanned_symbol_is_drained() {
    let h = make_harness(scripted_bank(1.0984), Vec::new());
    load_zones(&h);
    assert_eq!(h.pipeline.scan().delayed.len(), 1);

    // EURUSD drops out of the scan list while its signal waits
    h.config
        .load_from_str(r#"{"pipeline": {"symbols": ["GBPUSD"]}}"#)
        .expect("config");
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0975, T0 + 20_000)));
    h.ingestion.process_message(&ParsedMessage::Tick(make_tick(1.0985, T0 + 40_000)));

    h.clock.advance_minutes(1);
    let report = h.pipeline.scan();
    assert!(report
        .published
        .iter()
        .any(|s| s.symbol == "EURUSD" && s.sweep_status == SweepStatus::Released));
    assert!(h.pipeline.guard().take_released("EURUSD").is_empty());
}

/// Same long setup as `ScriptedDetector`, ten points more confident on every call
struct RisingDetector {
    calls: AtomicU32,
}

impl PatternDetector for RisingDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::OrderBlockBounce
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let step = self.calls.fetch_add(1, Ordering::SeqCst) as f64;
        let scripted = ScriptedDetector {
            kind: self.kind(),
            entry: 1.0984,
            confidence: 76.0 + step * 10.0,
        };
        scripted.detect(ctx, th)
    }
}

#[test]
fn test_stronger_signal_displaces_waiting_one() {
    let h = make_harness(
        PatternBank::with_detectors(vec![Box::new(RisingDetector { calls: AtomicU32::new(0) })]),
        Vec::new(),
    );
    load_zones(&h);
    let first = h.pipeline.scan();
    assert_eq!(first.delayed.len(), 1);

    h.clock.advance_minutes(1);
    let second = h.pipeline.scan();
    assert_eq!(second.delayed.len(), 1);
    assert!(second.rejected.iter().any(|(_, reason)| reason.contains("displaced")));

    let rejected = h.events.get_recent_events(Some(SIGNAL_REJECTED), None);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].data["signal_id"].as_str(), Some(first.delayed[0].as_str()));
    assert_eq!(
        h.pipeline.guard().delayed("EURUSD").map(|d| d.signal.id),
        Some(second.delayed[0].clone())
    );
    assert_eq!(h.pipeline.guard().get_stats().displaced, 1);
}

/// Id of the signal that was originally delayed, read back from its event
fn report_delayed_id(h: &Harness) -> String {
    let events = h.events.get_recent_events(Some(SIGNAL_DELAYED), None);
    let data: &HashMap<String, serde_json::Value> = &events[0].data;
    data["signal_id"].as_str().unwrap_or_default().to_string()
}

#[test]
fn test_delayed_signal_expires_unpublished() {
    let h = make_harness(scripted_bank(1.0984), Vec::new());
    load_zones(&h);

    let report = h.pipeline.scan();
    assert_eq!(report.delayed.len(), 1);
    let delayed_id = report.delayed[0].clone();

    h.clock.advance_minutes(29);
    assert!(h.pipeline.scan().expired.is_empty());

    h.clock.set(T0 + 30 * MINUTE);
    let report = h.pipeline.scan();
    assert_eq!(report.expired, vec![delayed_id.clone()]);
    assert!(report.published.iter().all(|s| s.id != delayed_id));
    assert_eq!(h.events.get_recent_events(Some(SIGNAL_EXPIRED), None).len(), 1);
}

// ============================================================================
// TEST 5 – Snapshot warm start and engine failure path
// ============================================================================

#[test]
fn test_snapshot_warm_start_restores_candles() {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshots = SnapshotStore::new(dir.path().join("candles.json"));

    let store = Arc::new(CandleStore::new(BufferConfig::default()));
    let aggregator = CandleAggregator::new(store.clone());
    for minute in 0..12 {
        aggregator.on_tick(&make_tick(1.1000 + minute as f64 * 0.0001, T0 + minute * MINUTE)).expect("tick");
    }
    aggregator.seal_all();
    assert_eq!(snapshots.save(&store, T0 + 12 * MINUTE).expect("save"), 1);

    let restored = Arc::new(CandleStore::new(BufferConfig::default()));
    assert_eq!(snapshots.warm_start(&restored), 1);
    assert_eq!(restored.candles("EURUSD", Timeframe::M1, 100), store.candles("EURUSD", Timeframe::M1, 100));
    assert_eq!(restored.candles("EURUSD", Timeframe::M5, 100), store.candles("EURUSD", Timeframe::M5, 100));

    // Corrupt file means an empty start, not an error
    std::fs::write(snapshots.path(), b"{ truncated").expect("write");
    let empty = CandleStore::new(BufferConfig::default());
    assert_eq!(snapshots.warm_start(&empty), 0);
    assert!(empty.symbols().is_empty());
}

#[tokio::test]
async fn test_engine_feed_failure_still_snapshots() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ConfigManager::default();
    config
        .load_from_str(
            r#"{"feed": {"url": "ws://127.0.0.1:9", "max_reconnect_attempts": 0},
                "monitoring": {"signal_log_path": null}}"#,
        )
        .expect("config");
    let engine = Engine::new(Arc::new(config), Arc::new(EventBus::new()), Arc::new(ManualClock::new(T0)))
        .expect("engine")
        .with_snapshot_path(dir.path().join("snapshot.json"));

    engine.ingestion().process_message(&ParsedMessage::Tick(make_tick(1.1000, T0)));

    let (_tx, rx) = watch::channel(false);
    let result = tokio::time::timeout(Duration::from_secs(10), engine.run(rx)).await.expect("engine exits");
    assert!(matches!(result, Err(EngineError::Feed(_))));

    // The forming bar was sealed and written before returning
    let restored = CandleStore::new(BufferConfig::default());
    assert_eq!(engine.snapshots().warm_start(&restored), 1);
    assert_eq!(restored.len("EURUSD", Timeframe::M1), 1);
}

#[tokio::test]
async fn test_restart_keeps_cooldown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = ConfigManager::default();
    config
        .load_from_str(
            r#"{"pipeline": {"symbols": ["EURUSD"]},
                "feed": {"url": "ws://127.0.0.1:9", "max_reconnect_attempts": 0},
                "monitoring": {"signal_log_path": null},
                "supervisor": {"max_restarts": 1}}"#,
        )
        .expect("config");
    let config = Arc::new(config);
    let events = Arc::new(EventBus::new());
    let clock = Arc::new(ManualClock::new(T0));
    let state = SignalState::new(&config, events.clone());
    let supervisor = Supervisor::new(&config.supervisor())
        .with_backoff(Duration::from_millis(1), Duration::from_millis(4));

    let reports = Arc::new(Mutex::new(Vec::new()));
    let (_tx, rx) = watch::channel(false);
    let factory = |run: u32| {
        let config = config.clone();
        let events = events.clone();
        let clock = clock.clone();
        let state = state.clone();
        let reports = reports.clone();
        let path = dir.path().join(format!("snapshot-{run}.json"));
        let rx = rx.clone();
        async move {
            // Every run sees the same sweep, two minutes after the previous one
            clock.set(T0 + run as i64 * 2 * MINUTE);
            let shared: SharedClock = clock.clone();
            let engine = Engine::with_state(config, events, shared, state)?.with_snapshot_path(path);
            load_sweep_reversal(engine.aggregator());
            reports.lock().push(engine.scan_once());
            engine.run(rx).await
        }
    };

    let result = tokio::time::timeout(Duration::from_secs(20), supervisor.run(factory, rx.clone()))
        .await
        .expect("supervisor exits");
    assert!(matches!(result, Err(EngineError::Feed(_))));
    assert_eq!(supervisor.get_stats().restarts, 1);

    let reports = reports.lock();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].published.len(), 1);
    // The restarted engine still remembers the publish from the first run
    assert!(reports[1].published.is_empty());
    assert!(reports[1].rejected.iter().any(|(_, reason)| reason.contains("cooldown")));
}

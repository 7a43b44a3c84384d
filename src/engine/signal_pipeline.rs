// Signal Pipeline - Periodic scan orchestration
// CandleStore -> PatternBank -> QualityGate -> ThresholdManager -> SweepGuard -> publisher

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, Level};
use uuid::Uuid;

use crate::core::clock::SharedClock;
use crate::core::config::ConfigManager;
use crate::core::events::{Event, EventBus, EventPriority};
use crate::core::logger::create_span;
use crate::core::types::{
    to_pips, PatternCandidate, QualityTier, Signal, SweepStatus, Timeframe, TradingSession,
    VolatilityRegime,
};
use crate::layer1::signal_publisher::SignalPublisher;
use crate::layer2::aggregator::CandleAggregator;
use crate::layer2::candle_store::CandleStore;
use crate::layer3::common::indicators::{atr, median};
use crate::layer3::common::{
    DETECTOR_ERROR, SIGNAL_DELAYED, SIGNAL_EXPIRED, SIGNAL_REJECTED, SIGNAL_RELEASED,
    THRESHOLDS_ADJUSTED,
};
use crate::layer3::patterns::{select_best, Detection, DetectionContext, PatternBank};
use crate::layer3::quality::{GateSettings, PerformanceTable, QualityGate};
use crate::layer3::sweep::{DelayedSignal, GuardDecision, SweepGuard};
use crate::layer3::thresholds::{AdjustmentReport, ThresholdManager};

const SOURCE: &str = "signal_pipeline";
const REGIME_ATR_PERIOD: usize = 14;

/// Outcome of one scan cycle
#[derive(Debug, Clone)]
pub struct ScanReport {
    pub timestamp: i64,
    pub session: TradingSession,
    pub regime: VolatilityRegime,
    pub symbols_scanned: usize,
    pub candidates: usize,
    pub published: Vec<Signal>,
    pub delayed: Vec<String>,
    pub expired: Vec<String>,
    /// (symbol, reason)
    pub rejected: Vec<(String, String)>,
    pub detector_errors: usize,
    pub adjustment: Option<AdjustmentReport>,
}

impl ScanReport {
    fn new(timestamp: i64, session: TradingSession, regime: VolatilityRegime) -> Self {
        Self {
            timestamp,
            session,
            regime,
            symbols_scanned: 0,
            candidates: 0,
            published: Vec::new(),
            delayed: Vec::new(),
            expired: Vec::new(),
            rejected: Vec::new(),
            detector_errors: 0,
            adjustment: None,
        }
    }
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Scan(session={}, regime={}, symbols={}, candidates={}, published={}, delayed={}, rejected={})",
            self.session,
            self.regime,
            self.symbols_scanned,
            self.candidates,
            self.published.len(),
            self.delayed.len(),
            self.rejected.len()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub scans: u64,
    pub published: u64,
    pub released: u64,
    pub delayed: u64,
    pub expired: u64,
    pub rejected: u64,
    pub last_scan: Option<i64>,
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SignalPipeline(scans={}, published={}, released={}, delayed={}, expired={}, rejected={})",
            self.scans, self.published, self.released, self.delayed, self.expired, self.rejected
        )
    }
}

/// Turn a gated candidate into the published record
pub fn assemble_signal(
    candidate: &PatternCandidate,
    calibrated_confidence: f64,
    session: TradingSession,
    base_lot_size: f64,
    now: i64,
) -> Signal {
    let symbol = candidate.symbol.as_str();
    let stop_pips = to_pips(symbol, candidate.stop_distance());
    let target_pips = to_pips(symbol, candidate.target_distance());
    let risk_reward = if stop_pips > 0.0 { target_pips / stop_pips } else { 0.0 };
    let tier = QualityTier::from_score(candidate.quality_score);

    Signal {
        id: Uuid::new_v4().to_string(),
        symbol: candidate.symbol.clone(),
        direction: candidate.direction,
        pattern: candidate.pattern,
        classification: candidate.pattern.classification(),
        timeframe: candidate.timeframe,
        confidence: calibrated_confidence,
        raw_confidence: candidate.confidence,
        quality_score: candidate.quality_score,
        quality_tier: tier,
        entry_price: candidate.entry_price,
        stop_loss: candidate.stop_loss,
        take_profit: candidate.take_profit,
        stop_pips,
        target_pips,
        risk_reward,
        lot_size: base_lot_size * tier.lot_multiplier(),
        session,
        sweep_status: SweepStatus::Clear,
        sweep_badge: SweepStatus::Clear.badge().to_string(),
        reason: candidate.reason.clone(),
        created_at: now,
    }
}

fn signal_event(event_type: &str, signal: &Signal, now: i64, priority: EventPriority) -> Event {
    Event::new(event_type, now, HashMap::new(), SOURCE, priority)
        .with("symbol", signal.symbol.as_str())
        .with("signal_id", signal.id.as_str())
        .with("pattern", signal.pattern.to_string())
        .with("direction", signal.direction.to_string())
        .with("confidence", signal.confidence)
}

/// Per-symbol signal bookkeeping that must outlive a single engine run:
/// cooldowns and hourly counts, adaptive thresholds, delayed signals.
#[derive(Clone)]
pub struct SignalState {
    pub thresholds: Arc<ThresholdManager>,
    pub gate: Arc<QualityGate>,
    pub guard: Arc<SweepGuard>,
}

impl SignalState {
    pub fn new(config: &ConfigManager, events: Arc<EventBus>) -> Self {
        Self {
            thresholds: Arc::new(ThresholdManager::new()),
            gate: Arc::new(QualityGate::new(GateSettings::from_config(&config.pipeline()))),
            guard: Arc::new(SweepGuard::new(config.guard()).with_event_bus(events)),
        }
    }
}

pub struct SignalPipeline {
    store: Arc<CandleStore>,
    aggregator: Arc<CandleAggregator>,
    bank: PatternBank,
    thresholds: Arc<ThresholdManager>,
    gate: Arc<QualityGate>,
    guard: Arc<SweepGuard>,
    publisher: Arc<SignalPublisher>,
    events: Arc<EventBus>,
    config: Arc<ConfigManager>,
    clock: SharedClock,
    stats: Mutex<PipelineStats>,
}

impl SignalPipeline {
    pub fn new(
        aggregator: Arc<CandleAggregator>,
        publisher: Arc<SignalPublisher>,
        events: Arc<EventBus>,
        config: Arc<ConfigManager>,
        clock: SharedClock,
    ) -> Self {
        let state = SignalState::new(&config, events.clone());
        Self::with_state(aggregator, publisher, events, config, clock, state)
    }

    /// Build around existing gate, threshold and guard state, e.g. after a restart
    pub fn with_state(
        aggregator: Arc<CandleAggregator>,
        publisher: Arc<SignalPublisher>,
        events: Arc<EventBus>,
        config: Arc<ConfigManager>,
        clock: SharedClock,
        state: SignalState,
    ) -> Self {
        Self {
            store: aggregator.store().clone(),
            aggregator,
            bank: PatternBank::new(),
            thresholds: state.thresholds,
            gate: state.gate,
            guard: state.guard,
            publisher,
            events,
            config,
            clock,
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    pub fn with_bank(mut self, bank: PatternBank) -> Self {
        self.bank = bank;
        self
    }

    pub fn with_performance_table(self, table: PerformanceTable) -> Self {
        self.gate.set_table(table);
        self
    }

    pub fn store(&self) -> &Arc<CandleStore> {
        &self.store
    }

    pub fn bank(&self) -> &PatternBank {
        &self.bank
    }

    pub fn thresholds(&self) -> &Arc<ThresholdManager> {
        &self.thresholds
    }

    pub fn gate(&self) -> &Arc<QualityGate> {
        &self.gate
    }

    /// Shared with the ingestion context as a tick observer
    pub fn guard(&self) -> &Arc<SweepGuard> {
        &self.guard
    }

    pub fn state(&self) -> SignalState {
        SignalState {
            thresholds: self.thresholds.clone(),
            gate: self.gate.clone(),
            guard: self.guard.clone(),
        }
    }

    /// Median M5 ATR across tracked symbols, in pips
    pub fn ambient_regime(&self, symbols: &[String]) -> VolatilityRegime {
        let mut readings: Vec<f64> = symbols
            .iter()
            .filter_map(|s| {
                let m5 = self.store.candles(s, Timeframe::M5, REGIME_ATR_PERIOD + 1);
                atr(&m5, REGIME_ATR_PERIOD).map(|a| to_pips(s, a))
            })
            .filter(|p| p.is_finite())
            .collect();
        median(&mut readings)
            .map(VolatilityRegime::from_atr_pips)
            .unwrap_or(VolatilityRegime::Normal)
    }

    /// One full evaluation cycle over every tracked symbol
    pub fn scan(&self) -> ScanReport {
        let _span = create_span("scan", Level::DEBUG).entered();
        let now = self.clock.now_ms();
        let sealed = self.aggregator.seal_elapsed(now);
        if sealed > 0 {
            debug!(sealed, "Sealed elapsed candles before scan");
        }

        // Settings are re-read every scan so config reloads apply without a restart
        let settings = self.config.pipeline();
        self.gate.set_settings(GateSettings::from_config(&settings));
        self.guard.set_config(self.config.guard());

        let session = TradingSession::from_timestamp_ms(now);
        let regime = self.ambient_regime(&settings.symbols);
        let mut report = ScanReport::new(now, session, regime);

        let interval_ms = settings.threshold_adjust_interval_secs as i64 * 1000;
        if let Some(adjustment) = self.thresholds.maybe_adjust(session, regime, now, interval_ms) {
            self.events.publish(
                Event::new(THRESHOLDS_ADJUSTED, now, HashMap::new(), SOURCE, EventPriority::Medium)
                    .with("session", session.to_string())
                    .with("regime", regime.to_string())
                    .with("patterns", adjustment.changes.len()),
            );
            report.adjustment = Some(adjustment);
        }

        for expired in self.guard.expire(now) {
            self.events.publish(signal_event(SIGNAL_EXPIRED, &expired.signal, now, EventPriority::Low));
            report.expired.push(expired.signal.id);
        }

        // Every observed symbol, not only the scanned ones, so no release is stranded
        for released in self.guard.take_all_released() {
            self.publish_released(released, now, &mut report);
        }

        for symbol in &settings.symbols {
            self.scan_symbol(symbol, session, regime, settings.base_lot_size, now, &mut report);
            report.symbols_scanned += 1;
        }

        {
            let mut stats = self.stats.lock();
            stats.scans += 1;
            stats.expired += report.expired.len() as u64;
            stats.delayed += report.delayed.len() as u64;
            stats.rejected += report.rejected.len() as u64;
            stats.last_scan = Some(now);
        }

        if report.published.is_empty() {
            debug!(%report, "Scan complete");
        } else {
            info!(%report, "Scan complete");
        }
        report
    }

    fn scan_symbol(
        &self,
        symbol: &str,
        session: TradingSession,
        regime: VolatilityRegime,
        base_lot_size: f64,
        now: i64,
        report: &mut ScanReport,
    ) {
        let guard_config = self.config.guard();
        let m5 = self.store.candles(symbol, Timeframe::M5, guard_config.zone_lookback);
        if let Some(price) = self.store.latest_price(symbol) {
            self.guard.refresh_zones(symbol, &m5, price);
        }

        let ctx = DetectionContext::from_store(&self.store, symbol, session, regime, now);
        let spread_pips = self.store.latest_tick(symbol).map(|t| t.spread_pips());

        let mut candidates = Vec::new();
        for (kind, outcome) in self.bank.run(&ctx, &self.thresholds) {
            match outcome {
                Detection::Candidate(mut candidate) => {
                    candidate.quality_score = self.gate.score(&candidate, session, spread_pips);
                    candidates.push(candidate);
                }
                Detection::NoCandidate(_) => {}
                Detection::InputError(e) => {
                    report.detector_errors += 1;
                    self.events.publish(
                        Event::new(DETECTOR_ERROR, now, HashMap::new(), SOURCE, EventPriority::Medium)
                            .with("symbol", symbol)
                            .with("pattern", kind.to_string())
                            .with("error", e.to_string()),
                    );
                }
            }
        }
        report.candidates += candidates.len();

        let Some(best) = select_best(candidates) else {
            return;
        };

        if let Err(reason) = self.gate.check(&best, now) {
            self.reject(symbol, &reason.to_string(), now, report);
            return;
        }

        let calibrated = self.gate.calibrate(best.confidence);
        let signal = assemble_signal(&best, calibrated, session, base_lot_size, now);

        match self.guard.evaluate(signal.clone(), now) {
            GuardDecision::Publish(signal) => self.emit(signal, now, report),
            GuardDecision::Delayed { zone, expires_at, displaced } => {
                if let Some(old) = displaced {
                    self.events.publish(
                        signal_event(SIGNAL_REJECTED, &old.signal, now, EventPriority::Low)
                            .with("reason", "displaced by stronger delayed signal")
                            .with("replaced_by", signal.id.as_str()),
                    );
                    report
                        .rejected
                        .push((symbol.to_string(), "displaced by stronger delayed signal".to_string()));
                }
                self.events.publish(
                    signal_event(SIGNAL_DELAYED, &signal, now, EventPriority::Medium)
                        .with("zone_price", zone.price)
                        .with("zone_type", zone.zone_type.to_string())
                        .with("expires_at", expires_at),
                );
                report.delayed.push(signal.id);
            }
            GuardDecision::Superseded => {
                self.reject(symbol, "stronger delayed signal already waiting", now, report);
            }
        }
    }

    /// Released signals still respect cooldown and the hourly cap. A blocked one
    /// goes back to the guard and retries until its original deadline.
    fn publish_released(&self, released: DelayedSignal, now: i64, report: &mut ScanReport) {
        let symbol = released.signal.symbol.clone();
        match self.gate.check_slot(&symbol, now) {
            Ok(()) => {
                self.events.publish(signal_event(SIGNAL_RELEASED, &released.signal, now, EventPriority::High));
                self.stats.lock().released += 1;
                self.emit(released.signal, now, report);
            }
            Err(reason) => {
                debug!(symbol = %symbol, id = %released.signal.id, %reason, "Released signal held by gate");
                self.guard.requeue_released(released);
            }
        }
    }

    fn emit(&self, signal: Signal, now: i64, report: &mut ScanReport) {
        self.gate.mark_published(&signal.symbol, now);
        self.thresholds.record_signal(signal.pattern);
        self.stats.lock().published += 1;

        info!(
            symbol = %signal.symbol,
            pattern = %signal.pattern,
            direction = %signal.direction,
            confidence = signal.confidence,
            quality = signal.quality_score,
            tier = %signal.quality_tier,
            sweep = %signal.sweep_status,
            "Signal published"
        );
        self.publisher.publish(signal.clone());
        report.published.push(signal);
    }

    fn reject(&self, symbol: &str, reason: &str, now: i64, report: &mut ScanReport) {
        self.events.publish(
            Event::new(SIGNAL_REJECTED, now, HashMap::new(), SOURCE, EventPriority::Low)
                .with("symbol", symbol)
                .with("reason", reason),
        );
        report.rejected.push((symbol.to_string(), reason.to_string()));
    }

    pub fn get_stats(&self) -> PipelineStats {
        self.stats.lock().clone()
    }
}

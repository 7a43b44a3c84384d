// Unified Metrics - Collects and formats stats from all pipeline components
// Aggregates existing per-component stats into a single view

use std::fmt;
use tracing::info;

use crate::layer1::feed_client::FeedStats;
use crate::layer1::signal_publisher::PublisherStats;
use crate::layer2::aggregator::AggregatorStats;
use crate::layer2::candle_store::CandleStoreStats;
use crate::layer2::ingestion::IngestionStats;
use crate::layer2::parser::ParserStats;
use crate::layer3::patterns::PatternBankStats;
use crate::layer3::quality::GateStats;
use crate::layer3::sweep::GuardStats;
use crate::layer3::thresholds::ThresholdStats;

/// Unified metrics snapshot from all pipeline components
#[derive(Debug, Clone, Default)]
pub struct UnifiedMetrics {
    pub feed: Option<FeedStats>,
    pub parser: Option<ParserStats>,
    pub ingestion: Option<IngestionStats>,
    pub aggregator: Option<AggregatorStats>,
    pub candles: Option<CandleStoreStats>,
    pub bank: Option<PatternBankStats>,
    pub thresholds: Option<ThresholdStats>,
    pub gate: Option<GateStats>,
    pub guard: Option<GuardStats>,
    pub publisher: Option<PublisherStats>,
}

impl UnifiedMetrics {
    /// Ticks that reached the aggregator
    pub fn total_ticks(&self) -> u64 {
        self.aggregator.as_ref().map(|a| a.ticks_applied).unwrap_or(0)
    }

    /// Total messages parsed
    pub fn total_parsed(&self) -> u64 {
        self.parser.as_ref().map(|p| p.messages_parsed).unwrap_or(0)
    }

    pub fn total_signals(&self) -> u64 {
        self.publisher.as_ref().map(|p| p.published).unwrap_or(0)
    }

    /// Total errors across all components
    pub fn total_errors(&self) -> u64 {
        let feed_errs = self.feed.as_ref().map(|f| f.error_count).unwrap_or(0);
        let parse_errs = self.parser.as_ref().map(|p| p.parse_errors + p.validation_failures).unwrap_or(0);
        let tick_rejects = self.aggregator.as_ref().map(|a| a.ticks_rejected + a.candles_rejected).unwrap_or(0);
        let detector_errs = self.bank.as_ref().map(|b| b.input_errors).unwrap_or(0);
        let publish_fails = self.publisher.as_ref().map(|p| p.failed_attempts).unwrap_or(0);
        feed_errs + parse_errs + tick_rejects + detector_errs + publish_fails
    }

    /// Print detailed multi-line report
    pub fn print_report(&self) {
        info!("=== UNIFIED METRICS ===");

        if let Some(feed) = &self.feed {
            info!("  Feed:         state={} msgs={} errs={} reconnects={} symbols={}",
                feed.state, feed.message_count, feed.error_count, feed.reconnects, feed.symbols);
        }

        if let Some(p) = &self.parser {
            info!("  Parser:       parsed={} errs={} invalid={} ignored={} ticks={} ohlc={}",
                p.messages_parsed, p.parse_errors, p.validation_failures,
                p.ignored_messages, p.tick_count, p.ohlc_count);
        }

        if let Some(i) = &self.ingestion {
            info!("  Ingestion:    running={} raw={} queued={} processed={} lagged={}",
                i.is_running, i.raw_received, i.enqueued, i.processed, i.dropped_lagged);
        }

        if let Some(a) = &self.aggregator {
            info!("  Aggregator:   ticks={} rejected={} late={} m1={} m5={} m15={} merged={}",
                a.ticks_applied, a.ticks_rejected, a.ticks_late,
                a.m1_sealed, a.m5_built, a.m15_built, a.candles_merged);
        }

        if let Some(c) = &self.candles {
            info!("  Candles:      {}", c);
        }

        if let Some(b) = &self.bank {
            info!("  Patterns:     {}", b);
        }

        if let Some(t) = &self.thresholds {
            info!("  Thresholds:   {}", t);
        }

        if let Some(g) = &self.gate {
            info!("  Gate:         {}", g);
        }

        if let Some(g) = &self.guard {
            info!("  Guard:        {}", g);
        }

        if let Some(p) = &self.publisher {
            info!("  Publisher:    published={} delivered={} failed={} dropped={} pending={}",
                p.published, p.delivered, p.failed_attempts, p.dropped, p.pending);
        }
    }

    /// Print compact single-line stats for periodic logging
    pub fn print_compact(&self, elapsed_secs: u64) {
        let m1 = self.aggregator.as_ref().map(|a| a.m1_sealed).unwrap_or(0);
        let m5 = self.aggregator.as_ref().map(|a| a.m5_built).unwrap_or(0);
        let candidates = self.bank.as_ref().map(|b| b.candidates).unwrap_or(0);
        let passed = self.gate.as_ref().map(|g| g.passed).unwrap_or(0);
        let delayed = self.guard.as_ref().map(|g| g.pending_delayed).unwrap_or(0);
        let lagged = self.ingestion.as_ref().map(|i| i.dropped_lagged).unwrap_or(0);

        info!("[{:>4}s] ticks={} m1={} m5={} | cand={} gated={} delayed={} signals={} | lag={} errs={}",
            elapsed_secs, self.total_ticks(), m1, m5,
            candidates, passed, delayed, self.total_signals(),
            lagged, self.total_errors());
    }
}

impl fmt::Display for UnifiedMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "UnifiedMetrics(ticks={}, signals={}, errors={})",
            self.total_ticks(),
            self.total_signals(),
            self.total_errors()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ConnectionStatus;

    #[test]
    fn test_empty_metrics() {
        let metrics = UnifiedMetrics::default();
        assert_eq!(metrics.total_ticks(), 0);
        assert_eq!(metrics.total_parsed(), 0);
        assert_eq!(metrics.total_errors(), 0);
    }

    #[test]
    fn test_metrics_total_errors() {
        let feed = FeedStats {
            state: ConnectionStatus::Connected,
            message_count: 100,
            error_count: 1,
            reconnects: 0,
            symbols: 6,
        };
        let parser = ParserStats {
            messages_parsed: 90,
            parse_errors: 2,
            ..Default::default()
        };
        let aggregator = AggregatorStats {
            ticks_applied: 85,
            ticks_rejected: 3,
            ..Default::default()
        };
        let bank = PatternBankStats {
            input_errors: 1,
            ..Default::default()
        };
        let metrics = UnifiedMetrics {
            feed: Some(feed),
            parser: Some(parser),
            aggregator: Some(aggregator),
            bank: Some(bank),
            ..Default::default()
        };
        // 1 feed err + 2 parse err + 3 rejected ticks + 1 detector err = 7
        assert_eq!(metrics.total_errors(), 7);
        assert_eq!(metrics.total_ticks(), 85);
    }

    #[test]
    fn test_display() {
        let metrics = UnifiedMetrics {
            publisher: Some(PublisherStats { published: 4, ..Default::default() }),
            ..Default::default()
        };
        let s = format!("{}", metrics);
        assert!(s.contains("signals=4"));
        assert!(s.contains("errors=0"));
    }
}

// Message Parser - feed payloads into Tick / Candle values
// Type discriminator "type": "tick" | "ohlc"; anything else is ignored, never fatal

use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::core::types::{Candle, Tick, Timeframe};

// ============================================================================
// Parsed Message Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    Tick(Tick),
    Ohlc { symbol: String, candle: Candle },
}

impl ParsedMessage {
    pub fn symbol(&self) -> &str {
        match self {
            ParsedMessage::Tick(t) => &t.symbol,
            ParsedMessage::Ohlc { symbol, .. } => symbol,
        }
    }
}

/// Parser error type
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

impl ParseError {
    /// Non-data traffic (heartbeats, status frames) rather than a broken payload
    pub fn is_ignorable(&self) -> bool {
        matches!(self, ParseError::UnknownMessageType(_))
    }
}

// ============================================================================
// Serde Structures (raw feed JSON)
// ============================================================================

/// Numbers arrive either as JSON numbers or as decimal strings
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawNumber {
    Num(f64),
    Str(String),
}

impl RawNumber {
    fn value(&self, field: &'static str) -> Result<f64, ParseError> {
        match self {
            RawNumber::Num(v) => Ok(*v),
            RawNumber::Str(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidJson(format!("Invalid {}: '{}'", field, s))),
        }
    }
}

fn required(raw: &Option<RawNumber>, field: &'static str) -> Result<f64, ParseError> {
    raw.as_ref().ok_or(ParseError::MissingField(field))?.value(field)
}

#[derive(Debug, Deserialize)]
struct RawTick {
    symbol: Option<String>,
    bid: Option<RawNumber>,
    ask: Option<RawNumber>,
    #[serde(default)]
    volume: Option<RawNumber>,
    /// Milliseconds since epoch
    #[serde(default)]
    timestamp: Option<i64>,
    /// Seconds since epoch (alternative to `timestamp`)
    #[serde(default)]
    time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawOhlc {
    symbol: Option<String>,
    timeframe: Option<String>,
    open: Option<RawNumber>,
    high: Option<RawNumber>,
    low: Option<RawNumber>,
    close: Option<RawNumber>,
    #[serde(default)]
    volume: Option<RawNumber>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    time: Option<f64>,
}

fn event_time(timestamp: Option<i64>, time_secs: Option<f64>, now_ms: i64) -> i64 {
    timestamp
        .or_else(|| time_secs.filter(|t| t.is_finite()).map(|t| (t * 1000.0) as i64))
        .unwrap_or(now_ms)
}

// ============================================================================
// MessageParser - Stateful parser with validation & stats
// ============================================================================

/// Parser statistics
#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_received: u64,
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub validation_failures: u64,
    pub ignored_messages: u64,
    pub tick_count: u64,
    pub ohlc_count: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        if self.messages_received > 0 {
            (self.parse_errors + self.validation_failures) as f64 / self.messages_received as f64
        } else {
            0.0
        }
    }
}

impl fmt::Display for ParserStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Parser(received={}, ticks={}, ohlc={}, errors={}, invalid={}, ignored={})",
            self.messages_received, self.tick_count, self.ohlc_count, self.parse_errors,
            self.validation_failures, self.ignored_messages
        )
    }
}

/// Stateful feed parser: symbol filter, validation and stats
pub struct MessageParser {
    symbols: HashSet<String>,
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new(symbols: &[String]) -> Self {
        Self {
            symbols: symbols.iter().map(|s| s.to_uppercase()).collect(),
            stats: ParserStats::default(),
        }
    }

    /// Replace the tracked symbol list (config reload)
    pub fn set_symbols(&mut self, symbols: &[String]) {
        self.symbols = symbols.iter().map(|s| s.to_uppercase()).collect();
    }

    fn check_symbol(&self, raw: Option<String>) -> Result<String, ParseError> {
        let symbol = raw.ok_or(ParseError::MissingField("symbol"))?.to_uppercase();
        if !self.symbols.is_empty() && !self.symbols.contains(&symbol) {
            return Err(ParseError::ValidationFailed(format!("Untracked symbol {}", symbol)));
        }
        Ok(symbol)
    }

    // ========================================================================
    // Main parse entry point
    // ========================================================================

    /// Parse one feed message. `now_ms` stamps payloads that carry no time.
    pub fn parse(&mut self, raw_json: &str, now_ms: i64) -> Result<ParsedMessage, ParseError> {
        self.stats.messages_received += 1;
        let result = self.parse_inner(raw_json, now_ms);

        match &result {
            Ok(ParsedMessage::Tick(_)) => {
                self.stats.messages_parsed += 1;
                self.stats.tick_count += 1;
            }
            Ok(ParsedMessage::Ohlc { .. }) => {
                self.stats.messages_parsed += 1;
                self.stats.ohlc_count += 1;
            }
            Err(ParseError::UnknownMessageType(kind)) => {
                self.stats.ignored_messages += 1;
                debug!(kind = %kind, "Ignoring non-data message");
            }
            Err(ParseError::ValidationFailed(_)) => self.stats.validation_failures += 1,
            Err(_) => self.stats.parse_errors += 1,
        }
        result
    }

    fn parse_inner(&self, raw_json: &str, now_ms: i64) -> Result<ParsedMessage, ParseError> {
        let value: serde_json::Value = serde_json::from_str(raw_json)
            .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

        // Unwrap envelope format: {"channel": "...", "data": {...}}
        let data = value.get("data").unwrap_or(&value);

        let kind = data
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or(ParseError::MissingField("type"))?;

        match kind.to_lowercase().as_str() {
            "tick" | "quote" => self.parse_tick(data, now_ms),
            "ohlc" | "candle" | "bar" => self.parse_ohlc(data, now_ms),
            other => Err(ParseError::UnknownMessageType(other.to_string())),
        }
    }

    // ========================================================================
    // Individual parsers
    // ========================================================================

    fn parse_tick(&self, data: &serde_json::Value, now_ms: i64) -> Result<ParsedMessage, ParseError> {
        let raw = RawTick::deserialize(data).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let symbol = self.check_symbol(raw.symbol)?;
        let bid = required(&raw.bid, "bid")?;
        let ask = required(&raw.ask, "ask")?;
        let volume = match &raw.volume {
            Some(v) => v.value("volume")?,
            None => 0.0,
        };

        let tick = Tick::new(&symbol, bid, ask, volume, event_time(raw.timestamp, raw.time, now_ms));
        if !tick.is_valid() {
            return Err(ParseError::ValidationFailed(format!("Inconsistent quote {}", tick)));
        }
        Ok(ParsedMessage::Tick(tick))
    }

    fn parse_ohlc(&self, data: &serde_json::Value, now_ms: i64) -> Result<ParsedMessage, ParseError> {
        let raw = RawOhlc::deserialize(data).map_err(|e| ParseError::InvalidJson(e.to_string()))?;
        let symbol = self.check_symbol(raw.symbol)?;
        let timeframe: Timeframe = raw
            .timeframe
            .as_deref()
            .ok_or(ParseError::MissingField("timeframe"))?
            .parse()
            .map_err(ParseError::ValidationFailed)?;
        let volume = match &raw.volume {
            Some(v) => v.value("volume")?,
            None => 0.0,
        };

        let candle = Candle {
            timeframe,
            open: required(&raw.open, "open")?,
            high: required(&raw.high, "high")?,
            low: required(&raw.low, "low")?,
            close: required(&raw.close, "close")?,
            volume,
            timestamp: timeframe.period_start(event_time(raw.timestamp, raw.time, now_ms)),
        };
        if !candle.is_valid() {
            return Err(ParseError::ValidationFailed(format!("Inconsistent OHLC {}", candle)));
        }
        Ok(ParsedMessage::Ohlc { symbol, candle })
    }

    pub fn get_stats(&self) -> ParserStats {
        self.stats.clone()
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_parser() -> MessageParser {
        MessageParser::new(&["EURUSD".to_string(), "USDJPY".to_string()])
    }

    #[test]
    fn test_parse_tick() {
        let mut parser = make_parser();
        let msg = parser
            .parse(r#"{"type":"tick","symbol":"eurusd","bid":"1.10000","ask":1.10020,"volume":3,"timestamp":1000}"#, 0)
            .unwrap();
        match msg {
            ParsedMessage::Tick(t) => {
                assert_eq!(t.symbol, "EURUSD");
                assert!((t.bid - 1.1).abs() < 1e-12);
                assert_eq!(t.timestamp, 1000);
            }
            other => panic!("expected tick, got {:?}", other),
        }
        assert_eq!(parser.stats.tick_count, 1);
    }

    #[test]
    fn test_parse_envelope_and_default_time() {
        let mut parser = make_parser();
        let msg = parser
            .parse(r#"{"channel":"fx","data":{"type":"tick","symbol":"USDJPY","bid":150.1,"ask":150.12}}"#, 77)
            .unwrap();
        assert_eq!(msg.symbol(), "USDJPY");
        if let ParsedMessage::Tick(t) = msg {
            assert_eq!(t.timestamp, 77);
            assert_eq!(t.volume, 0.0);
        }
    }

    #[test]
    fn test_parse_ohlc() {
        let mut parser = make_parser();
        let msg = parser
            .parse(r#"{"type":"ohlc","symbol":"EURUSD","timeframe":"M5","open":1.1,"high":1.101,"low":1.099,"close":1.1005,"time":600.5}"#, 0)
            .unwrap();
        match msg {
            ParsedMessage::Ohlc { candle, .. } => {
                assert_eq!(candle.timeframe, Timeframe::M5);
                assert_eq!(candle.timestamp, 600_000);
            }
            other => panic!("expected ohlc, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_type_is_ignorable() {
        let mut parser = make_parser();
        let err = parser.parse(r#"{"type":"heartbeat"}"#, 0).unwrap_err();
        assert!(err.is_ignorable());
        assert_eq!(parser.stats.ignored_messages, 1);
        assert_eq!(parser.stats.error_rate(), 0.0);
    }

    #[test]
    fn test_malformed_payloads() {
        let mut parser = make_parser();
        assert!(matches!(parser.parse("not json", 0), Err(ParseError::InvalidJson(_))));
        assert!(matches!(
            parser.parse(r#"{"type":"tick","symbol":"EURUSD","ask":1.1}"#, 0),
            Err(ParseError::MissingField("bid"))
        ));
        assert!(matches!(
            parser.parse(r#"{"type":"tick","symbol":"EURUSD","bid":1.2,"ask":1.1}"#, 0),
            Err(ParseError::ValidationFailed(_))
        ));
        assert!(matches!(
            parser.parse(r#"{"type":"tick","symbol":"GBPCHF","bid":1.1,"ask":1.1001}"#, 0),
            Err(ParseError::ValidationFailed(_))
        ));
        assert!(matches!(
            parser.parse(r#"{"type":"ohlc","symbol":"EURUSD","timeframe":"H4","open":1,"high":1,"low":1,"close":1}"#, 0),
            Err(ParseError::ValidationFailed(_))
        ));
        assert_eq!(parser.stats.parse_errors, 2);
        assert_eq!(parser.stats.validation_failures, 3);
        assert!(parser.stats.error_rate() > 0.99);
    }
}

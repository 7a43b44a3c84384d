// Core Type Definitions for the FX Sniper signal pipeline
// Ticks, candles, pattern candidates and the published Signal record

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for long, -1.0 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "BUY"),
            Direction::Short => write!(f, "SELL"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "BUY" | "LONG" => Ok(Direction::Long),
            "SELL" | "SHORT" => Ok(Direction::Short),
            _ => Err(format!("Invalid Direction: '{}'. Expected 'BUY' or 'SELL'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.minutes() * 60_000
    }

    /// Floor a millisecond timestamp to the start of its period
    pub fn period_start(&self, timestamp_ms: i64) -> i64 {
        timestamp_ms - timestamp_ms.rem_euclid(self.duration_ms())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "M1" | "1M" | "1MIN" => Ok(Timeframe::M1),
            "M5" | "5M" | "5MIN" => Ok(Timeframe::M5),
            "M15" | "15M" | "15MIN" => Ok(Timeframe::M15),
            _ => Err(format!("Invalid Timeframe: '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PatternKind {
    LiquiditySweepReversal,
    OrderBlockBounce,
    FairValueGapFill,
    VolatilityCompressionBreakout,
    SweepAndReturn,
    MomentumBurst,
}

impl PatternKind {
    /// Fixed evaluation order, also used as the final tie-break
    pub const ALL: [PatternKind; 6] = [
        PatternKind::LiquiditySweepReversal,
        PatternKind::OrderBlockBounce,
        PatternKind::FairValueGapFill,
        PatternKind::VolatilityCompressionBreakout,
        PatternKind::SweepAndReturn,
        PatternKind::MomentumBurst,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            PatternKind::LiquiditySweepReversal => "LSR",
            PatternKind::OrderBlockBounce => "OBB",
            PatternKind::FairValueGapFill => "FVG",
            PatternKind::VolatilityCompressionBreakout => "VCB",
            PatternKind::SweepAndReturn => "SAR",
            PatternKind::MomentumBurst => "MB",
        }
    }

    pub fn classification(&self) -> SignalClass {
        match self {
            PatternKind::MomentumBurst | PatternKind::VolatilityCompressionBreakout => SignalClass::Rapid,
            _ => SignalClass::Sniper,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalClass {
    Rapid,
    Sniper,
}

impl fmt::Display for SignalClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalClass::Rapid => write!(f, "RAPID"),
            SignalClass::Sniper => write!(f, "SNIPER"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityTier {
    Acceptable,
    Standard,
    Premium,
}

impl QualityTier {
    pub fn from_score(quality_score: f64) -> Self {
        if quality_score >= 70.0 {
            QualityTier::Premium
        } else if quality_score >= 55.0 {
            QualityTier::Standard
        } else {
            QualityTier::Acceptable
        }
    }

    pub fn lot_multiplier(&self) -> f64 {
        match self {
            QualityTier::Premium => 1.0,
            QualityTier::Standard => 0.75,
            QualityTier::Acceptable => 0.5,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradingSession {
    Asian,
    London,
    Overlap,
    NewYork,
}

impl TradingSession {
    /// UTC hour buckets: Asian 22-07, London 07-12, London/NY overlap 12-16, New York 16-22
    pub fn from_utc_hour(hour: u32) -> Self {
        match hour {
            7..=11 => TradingSession::London,
            12..=15 => TradingSession::Overlap,
            16..=21 => TradingSession::NewYork,
            _ => TradingSession::Asian,
        }
    }

    pub fn from_timestamp_ms(timestamp_ms: i64) -> Self {
        let hour = (timestamp_ms.rem_euclid(86_400_000) / 3_600_000) as u32;
        Self::from_utc_hour(hour)
    }
}

impl fmt::Display for TradingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolatilityRegime {
    VeryLow,
    Low,
    Normal,
    High,
}

impl VolatilityRegime {
    /// Classify from an M5 ATR expressed in pips
    pub fn from_atr_pips(atr_pips: f64) -> Self {
        if atr_pips < 3.0 {
            VolatilityRegime::VeryLow
        } else if atr_pips < 5.0 {
            VolatilityRegime::Low
        } else if atr_pips < 12.0 {
            VolatilityRegime::Normal
        } else {
            VolatilityRegime::High
        }
    }
}

impl fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SweepStatus {
    /// No zone nearby, published as-is
    Clear,
    /// Matched a fresh completed sweep at evaluation time
    PostSweep,
    /// Was held back and released after the sweep completed
    Released,
}

impl SweepStatus {
    pub fn badge(&self) -> &'static str {
        match self {
            SweepStatus::Clear => "SWEEP-CLEAR",
            SweepStatus::PostSweep => "POST-SWEEP ENTRY",
            SweepStatus::Released => "RELEASED AFTER SWEEP",
        }
    }
}

impl fmt::Display for SweepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// Pip helpers
// ============================================================================

/// Minimum meaningful price increment for a symbol
pub fn pip_size(symbol: &str) -> f64 {
    let upper = symbol.to_uppercase();
    if upper.starts_with("XAU") {
        0.1
    } else if upper.starts_with("XAG") || upper.contains("JPY") {
        0.01
    } else {
        0.0001
    }
}

/// Convert an absolute price distance into pips
pub fn to_pips(symbol: &str, distance: f64) -> f64 {
    distance / pip_size(symbol)
}

/// Convert pips into an absolute price distance
pub fn from_pips(symbol: &str, pips: f64) -> f64 {
    pips * pip_size(symbol)
}

/// Per-symbol scaling of pip thresholds (more volatile pairs need larger distances)
pub fn symbol_pip_multiplier(symbol: &str) -> f64 {
    let upper = symbol.to_uppercase();
    if upper.starts_with("XAU") {
        2.0
    } else if upper.starts_with("GBP") {
        1.2
    } else if upper.contains("JPY") {
        1.1
    } else {
        1.0
    }
}

// ============================================================================
// Tick
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub volume: f64,
    pub timestamp: i64, // milliseconds
}

impl Tick {
    pub fn new(symbol: &str, bid: f64, ask: f64, volume: f64, timestamp: i64) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            bid,
            ask,
            volume,
            timestamp,
        }
    }

    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn spread_pips(&self) -> f64 {
        to_pips(&self.symbol, self.spread())
    }

    pub fn is_valid(&self) -> bool {
        self.bid.is_finite()
            && self.ask.is_finite()
            && self.bid > 0.0
            && self.ask >= self.bid
            && self.volume.is_finite()
            && self.volume >= 0.0
    }
}

impl fmt::Display for Tick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tick(symbol={}, bid={:.5}, ask={:.5}, vol={:.2})",
            self.symbol, self.bid, self.ask, self.volume
        )
    }
}

// ============================================================================
// Candle
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: i64, // period start, milliseconds
}

impl Candle {
    /// Open a fresh candle from a single price
    pub fn from_price(timeframe: Timeframe, timestamp: i64, price: f64, volume: f64) -> Self {
        Self {
            timeframe,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
            timestamp: timeframe.period_start(timestamp),
        }
    }

    pub fn update(&mut self, price: f64, volume: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    pub fn body(&self) -> f64 { (self.close - self.open).abs() }
    pub fn upper_wick(&self) -> f64 { self.high - self.open.max(self.close) }
    pub fn lower_wick(&self) -> f64 { self.open.min(self.close) - self.low }
    pub fn range(&self) -> f64 { self.high - self.low }
    pub fn is_bullish(&self) -> bool { self.close > self.open }
    pub fn is_bearish(&self) -> bool { self.close < self.open }
    pub fn body_pct(&self) -> f64 { if self.range() > 0.0 { self.body() / self.range() } else { 0.0 } }
    pub fn upper_wick_pct(&self) -> f64 { if self.range() > 0.0 { self.upper_wick() / self.range() } else { 0.0 } }
    pub fn lower_wick_pct(&self) -> f64 { if self.range() > 0.0 { self.lower_wick() / self.range() } else { 0.0 } }
    pub fn end_time(&self) -> i64 { self.timestamp + self.timeframe.duration_ms() }

    /// OHLC consistency check: finite values and low <= open/close <= high
    pub fn is_valid(&self) -> bool {
        let finite = [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite());
        finite
            && self.low > 0.0
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.volume >= 0.0
    }
}

impl fmt::Display for Candle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candle({}, t={}, O={:.5}, H={:.5}, L={:.5}, C={:.5})",
            self.timeframe, self.timestamp, self.open, self.high, self.low, self.close
        )
    }
}

// ============================================================================
// PatternCandidate
// ============================================================================

/// Output of a single detector for one symbol in one scan
#[derive(Debug, Clone, Serialize)]
pub struct PatternCandidate {
    pub symbol: String,
    pub pattern: PatternKind,
    pub direction: Direction,
    pub timeframe: Timeframe,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Detector confidence, 0-100
    pub confidence: f64,
    /// Composite score filled in by the quality gate, 0-100
    pub quality_score: f64,
    pub momentum_score: f64,
    pub volume_quality: f64,
    pub reason: String,
    pub detected_at: i64,
}

impl PatternCandidate {
    pub fn stop_distance(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }

    pub fn target_distance(&self) -> f64 {
        (self.take_profit - self.entry_price).abs()
    }

    pub fn risk_reward(&self) -> f64 {
        let stop = self.stop_distance();
        if stop > 0.0 {
            self.target_distance() / stop
        } else {
            0.0
        }
    }
}

impl fmt::Display for PatternCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Candidate({} {} {} @ {:.5}, conf={:.1}, quality={:.1})",
            self.symbol, self.pattern.code(), self.direction, self.entry_price,
            self.confidence, self.quality_score
        )
    }
}

// ============================================================================
// Signal
// ============================================================================

/// Final published record. Flat so downstream consumers can read it as one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub pattern: PatternKind,
    pub classification: SignalClass,
    pub timeframe: Timeframe,
    pub confidence: f64,
    pub raw_confidence: f64,
    pub quality_score: f64,
    pub quality_tier: QualityTier,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub stop_pips: f64,
    pub target_pips: f64,
    pub risk_reward: f64,
    pub lot_size: f64,
    pub session: TradingSession,
    pub sweep_status: SweepStatus,
    pub sweep_badge: String,
    pub reason: String,
    pub created_at: i64,
}

impl Signal {
    pub fn with_sweep_status(mut self, status: SweepStatus) -> Self {
        self.sweep_status = status;
        self.sweep_badge = status.badge().to_string();
        self
    }

    /// Raise confidence by `boost` points, capped at 100
    pub fn boosted(mut self, boost: f64) -> Self {
        self.confidence = (self.confidence + boost).clamp(0.0, 100.0);
        self
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signal({} {} {} [{}] @ {:.5}, SL={:.5}, TP={:.5}, conf={:.1}, {})",
            self.symbol, self.direction, self.pattern.code(), self.classification,
            self.entry_price, self.stop_loss, self.take_profit, self.confidence,
            self.sweep_badge
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pip_size() {
        assert_eq!(pip_size("EURUSD"), 0.0001);
        assert_eq!(pip_size("USDJPY"), 0.01);
        assert_eq!(pip_size("XAUUSD"), 0.1);
        assert!((to_pips("EURUSD", 0.0006) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_tick_mid_and_spread() {
        let tick = Tick::new("eurusd", 1.1000, 1.1002, 1.0, 0);
        assert_eq!(tick.symbol, "EURUSD");
        assert!((tick.mid() - 1.1001).abs() < 1e-12);
        assert!((tick.spread_pips() - 2.0).abs() < 1e-6);
        assert!(tick.is_valid());
        assert!(!Tick::new("EURUSD", 1.1, 1.0, 1.0, 0).is_valid());
    }

    #[test]
    fn test_timeframe_period_start() {
        assert_eq!(Timeframe::M1.period_start(61_500), 60_000);
        assert_eq!(Timeframe::M5.period_start(299_999), 0);
        assert_eq!(Timeframe::M15.period_start(900_001), 900_000);
        assert_eq!("5m".parse::<Timeframe>().unwrap(), Timeframe::M5);
    }

    #[test]
    fn test_candle_geometry() {
        let candle = Candle {
            timeframe: Timeframe::M5,
            open: 1.1002,
            high: 1.1003,
            low: 1.0994,
            close: 1.0999,
            volume: 10.0,
            timestamp: 0,
        };
        assert!(candle.is_valid());
        assert!(candle.is_bearish());
        assert!(candle.lower_wick_pct() > 0.5);
    }

    #[test]
    fn test_session_buckets() {
        assert_eq!(TradingSession::from_utc_hour(3), TradingSession::Asian);
        assert_eq!(TradingSession::from_utc_hour(23), TradingSession::Asian);
        assert_eq!(TradingSession::from_utc_hour(8), TradingSession::London);
        assert_eq!(TradingSession::from_utc_hour(13), TradingSession::Overlap);
        assert_eq!(TradingSession::from_utc_hour(18), TradingSession::NewYork);
    }

    #[test]
    fn test_quality_tier() {
        assert_eq!(QualityTier::from_score(80.0), QualityTier::Premium);
        assert_eq!(QualityTier::from_score(60.0), QualityTier::Standard);
        assert_eq!(QualityTier::from_score(30.0), QualityTier::Acceptable);
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(format!("{}", Direction::Long), "BUY");
        assert_eq!("sell".parse::<Direction>().unwrap(), Direction::Short);
        assert!("flat".parse::<Direction>().is_err());
    }
}

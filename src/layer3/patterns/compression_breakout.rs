// Volatility-Compression Breakout - narrow M5 candles against ATR, then a close beyond the range before them
// Ceiling ratio is session-adjusted: tighter in Asia, looser in the London/NY overlap

use crate::core::types::{Direction, PatternKind, Timeframe, TradingSession};
use crate::layer3::common::indicators::{atr, highest_high, lowest_low, volume_ratio};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, Detection, DetectionContext, PatternDetector, Setup};

const LOOKBACK: usize = 20;
const MAX_COMPRESSION: usize = 3;
const MIN_COMPRESSION: usize = 2;
/// Candles before the compression run that define the breakout level
const MIN_REFERENCE: usize = 5;
const MIN_RISK_REWARD: f64 = 1.2;

pub struct CompressionBreakoutDetector;

pub fn session_ratio_factor(session: TradingSession) -> f64 {
    match session {
        TradingSession::Asian => 0.85,
        TradingSession::Overlap => 1.1,
        TradingSession::London | TradingSession::NewYork => 1.0,
    }
}

impl PatternDetector for CompressionBreakoutDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::VolatilityCompressionBreakout
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M5, LOOKBACK + 1) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        let n = window.len();
        if n < MIN_REFERENCE + MAX_COMPRESSION + 1 {
            return Detection::NoCandidate("insufficient candles");
        }

        // ATR reference excludes every candle that could belong to the compression
        let reference = &window[..n - 1 - MAX_COMPRESSION];
        let Some(atr_value) = atr(reference, 14).filter(|a| *a > 0.0) else {
            return Detection::NoCandidate("flat reference window");
        };
        let ceiling = th.shape_ratio.value * session_ratio_factor(ctx.session) * atr_value;

        let compressed = window[n - 1 - MAX_COMPRESSION..n - 1]
            .iter()
            .rev()
            .take_while(|c| c.range() < ceiling)
            .count();
        if compressed < MIN_COMPRESSION {
            return Detection::NoCandidate("no compression");
        }
        let run_start = n - 1 - compressed;
        let run = &window[run_start..n - 1];
        let structure = &window[run_start - MIN_REFERENCE..run_start];
        let (Some(comp_high), Some(comp_low), Some(pre_high), Some(pre_low)) = (
            highest_high(run),
            lowest_low(run),
            highest_high(structure),
            lowest_low(structure),
        ) else {
            return Detection::NoCandidate("no compression");
        };

        let newest = &window[n - 1];
        let breakout_min = ctx.price(ctx.symbol_pips(th.pips(PipKnob::BreakoutPips)));
        let (direction, breakout) = if newest.close >= pre_high + breakout_min {
            (Direction::Long, newest.close - pre_high)
        } else if newest.close <= pre_low - breakout_min {
            (Direction::Short, pre_low - newest.close)
        } else {
            return Detection::NoCandidate("no breakout from pre-compression range");
        };

        let pip = ctx.price(1.0);
        let entry = newest.close;
        let stop = match direction {
            Direction::Long => comp_low - pip,
            Direction::Short => comp_high + pip,
        };
        let stop_distance = (entry - stop).abs();
        let target_distance = (1.5 * stop_distance).min(2.0 * atr_value);
        if stop_distance <= 0.0 || target_distance / stop_distance < MIN_RISK_REWARD {
            return Detection::NoCandidate("risk:reward below 1.2");
        }
        let target = entry + target_distance * direction.sign();

        let avg_comp_range = run.iter().map(|c| c.range()).sum::<f64>() / run.len() as f64;
        let mut confidence = 60.0 + compressed as f64 * 3.0;
        confidence += (ctx.pips(breakout - breakout_min)).clamp(0.0, 8.0);
        confidence += ((1.0 - avg_comp_range / atr_value) * 10.0).clamp(0.0, 10.0);
        if volume_ratio(newest, run) >= th.volume_multiplier.value {
            confidence += 5.0;
        }

        finish(
            ctx,
            self.kind(),
            th,
            window,
            Setup {
                direction,
                timeframe: Timeframe::M5,
                entry,
                stop,
                target,
                confidence,
                reason: format!(
                    "{} compressed candles at {:.0}% of ATR, breakout {:.1} pips",
                    compressed,
                    avg_comp_range / atr_value * 100.0,
                    ctx.pips(breakout)
                ),
            },
        )
    }
}

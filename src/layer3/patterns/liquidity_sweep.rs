// Liquidity Sweep Reversal - M5 wick through the recent extreme that closes back
// Entry one pip beyond the close, stop beyond the sweep extreme

use crate::core::types::{Direction, PatternKind, Timeframe};
use crate::layer3::common::indicators::{atr, highest_high, lowest_low, volume_ratio};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, regime_scale, Detection, DetectionContext, PatternDetector, Setup};

const MIN_PRIOR: usize = 3;
const MAX_PRIOR: usize = 10;
const MIN_RISK_REWARD: f64 = 1.5;
const MAX_TARGET_PIPS: f64 = 30.0;

pub struct LiquiditySweepDetector;

impl PatternDetector for LiquiditySweepDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::LiquiditySweepReversal
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M5, MAX_PRIOR + 1) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        let Some((newest, prior)) = window.split_last() else {
            return Detection::NoCandidate("insufficient candles");
        };
        if prior.len() < MIN_PRIOR {
            return Detection::NoCandidate("insufficient candles");
        }

        let (Some(recent_high), Some(recent_low)) = (highest_high(prior), lowest_low(prior)) else {
            return Detection::NoCandidate("insufficient candles");
        };
        let threshold = ctx.price(ctx.symbol_pips(th.pips(PipKnob::SweepPips)) * regime_scale(ctx.regime));
        let pip = ctx.price(1.0);

        let undershoot = recent_low - newest.low;
        let overshoot = newest.high - recent_high;

        let (direction, depth, wick_pct, extreme) = if undershoot >= threshold
            && newest.lower_wick_pct() > th.shape_ratio.value
        {
            (Direction::Long, undershoot, newest.lower_wick_pct(), newest.low)
        } else if overshoot >= threshold && newest.upper_wick_pct() > th.shape_ratio.value {
            (Direction::Short, overshoot, newest.upper_wick_pct(), newest.high)
        } else {
            return Detection::NoCandidate("no sweep of recent extreme");
        };

        // Rejection: the close must give back more than half of the excursion
        let recovered = (newest.close - extreme) * direction.sign();
        if th.rejection_required && recovered <= depth / 2.0 {
            return Detection::NoCandidate("sweep not rejected");
        }

        let entry = newest.close + pip * direction.sign();
        let stop = extreme - pip * direction.sign();
        let stop_distance = (entry - stop).abs();

        let Some(atr_value) = atr(window, 14) else {
            return Detection::NoCandidate("insufficient candles");
        };
        let target_distance = (2.0 * atr_value).min(ctx.price(MAX_TARGET_PIPS));
        if stop_distance <= 0.0 || target_distance / stop_distance < MIN_RISK_REWARD {
            return Detection::NoCandidate("risk:reward below 1.5");
        }
        let target = entry + target_distance * direction.sign();

        let depth_pips = ctx.pips(depth);
        let threshold_pips = ctx.pips(threshold);
        let mut confidence = 70.0;
        confidence += ((depth_pips - threshold_pips) * 2.0).clamp(0.0, 10.0);
        confidence += ((wick_pct - th.shape_ratio.value) * 50.0).clamp(0.0, 10.0);
        if volume_ratio(newest, prior) >= th.volume_multiplier.value {
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
                    "Swept {} by {:.1} pips, wick {:.0}%",
                    if direction == Direction::Long { "low" } else { "high" },
                    depth_pips,
                    wick_pct * 100.0
                ),
            },
        )
    }
}

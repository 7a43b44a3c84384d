// Fair Value Gap Fill - three-candle M5 imbalance revisited near its midpoint
// Targets the post-gap extreme plus half the gap, capped by ATR

use crate::core::types::{Candle, Direction, PatternKind, Timeframe};
use crate::layer3::common::indicators::{atr, highest_high, lowest_low, volume_ratio};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, Detection, DetectionContext, PatternDetector, Setup};

const LOOKBACK: usize = 10;
const MIN_RISK_REWARD: f64 = 1.8;

pub struct FairValueGapDetector;

struct Gap {
    first: usize,
    direction: Direction,
    /// Near edge (candle-1 extreme) and far edge (candle-3 extreme)
    near: f64,
    far: f64,
}

impl Gap {
    fn size(&self) -> f64 {
        (self.far - self.near).abs()
    }

    fn midpoint(&self) -> f64 {
        (self.far + self.near) / 2.0
    }
}

/// Most recent unfilled gap that closed before the newest candle
fn find_gap(candles: &[Candle], min_gap: f64) -> Option<Gap> {
    let n = candles.len();
    if n < 4 {
        return None;
    }
    let earliest = n.saturating_sub(LOOKBACK + 1);

    for i in (earliest..=n - 4).rev() {
        let (c1, c3) = (&candles[i], &candles[i + 2]);
        let between = &candles[i + 3..n - 1];

        if c3.low - c1.high >= min_gap && between.iter().all(|c| c.low > c1.high) {
            return Some(Gap { first: i, direction: Direction::Long, near: c1.high, far: c3.low });
        }
        if c1.low - c3.high >= min_gap && between.iter().all(|c| c.high < c1.low) {
            return Some(Gap { first: i, direction: Direction::Short, near: c1.low, far: c3.high });
        }
    }
    None
}

impl PatternDetector for FairValueGapDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::FairValueGapFill
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M5, LOOKBACK + 2) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        let min_gap = ctx.price(ctx.symbol_pips(th.pips(PipKnob::GapPips)));
        let Some(gap) = find_gap(window, min_gap) else {
            return Detection::NoCandidate("no fair value gap");
        };
        let Some((newest, history)) = window.split_last() else {
            return Detection::NoCandidate("insufficient candles");
        };

        let direction = gap.direction;
        let touch = match direction {
            Direction::Long => newest.low,
            Direction::Short => newest.high,
        };
        if (touch - gap.midpoint()).abs() > ctx.price(th.pips(PipKnob::MidpointTolerancePips)) {
            return Detection::NoCandidate("price not at gap midpoint");
        }
        // The gap's near edge must hold on close
        if (newest.close - gap.near) * direction.sign() <= 0.0 {
            return Detection::NoCandidate("gap filled through");
        }

        let wick_pct = match direction {
            Direction::Long => newest.lower_wick_pct(),
            Direction::Short => newest.upper_wick_pct(),
        };
        let vol_ratio = volume_ratio(newest, history);
        let wick_ok = wick_pct >= th.shape_ratio.value;
        let volume_ok = vol_ratio >= th.volume_multiplier.value;
        if !wick_ok && !volume_ok {
            return Detection::NoCandidate("no reaction at gap");
        }

        let pip = ctx.price(1.0);
        let entry = newest.close;
        let stop = match direction {
            Direction::Long => gap.near.min(newest.low) - pip,
            Direction::Short => gap.near.max(newest.high) + pip,
        };
        let stop_distance = (entry - stop).abs();

        let post_gap = &window[gap.first + 1..window.len() - 1];
        let extreme = match direction {
            Direction::Long => highest_high(post_gap),
            Direction::Short => lowest_low(post_gap),
        };
        let (Some(extreme), Some(atr_value)) = (extreme, atr(window, 14)) else {
            return Detection::NoCandidate("insufficient candles");
        };
        let run = ((extreme - entry) * direction.sign()).max(0.0);
        let target_distance = (2.0 * atr_value).min(run + 0.5 * gap.size());
        if stop_distance <= 0.0 || target_distance / stop_distance < MIN_RISK_REWARD {
            return Detection::NoCandidate("risk:reward below 1.8");
        }
        let target = entry + target_distance * direction.sign();

        let gap_pips = ctx.pips(gap.size());
        let mut confidence = 62.0;
        confidence += (gap_pips - ctx.pips(min_gap)).clamp(0.0, 8.0);
        if wick_ok {
            confidence += 5.0;
        }
        if volume_ok {
            confidence += 5.0;
        }
        let displacement = &window[gap.first + 1];
        if (displacement.close - displacement.open) * direction.sign() > 0.0 {
            confidence += 3.0;
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
                reason: format!("{:.1} pip gap revisited at midpoint {:.5}", gap_pips, gap.midpoint()),
            },
        )
    }
}

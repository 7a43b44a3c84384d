// Sweep-and-Return - a candle runs multi-touch liquidity, the next one closes back across it
// Targets the next opposing liquidity level

use crate::core::types::{Direction, PatternKind, Timeframe};
use crate::layer3::common::indicators::{highest_high, lowest_low, volume_ratio};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, Detection, DetectionContext, PatternDetector, Setup};

const LOOKBACK: usize = 20;
const MIN_BASE: usize = 6;
const MIN_TOUCHES: usize = 2;
const MIN_RISK_REWARD: f64 = 2.0;

pub struct SweepReturnDetector;

/// Cluster prices lying within `tolerance` of each other; clusters with enough touches become levels
pub fn liquidity_levels(prices: &[f64], tolerance: f64) -> Vec<(f64, usize)> {
    let mut sorted: Vec<f64> = prices.iter().copied().filter(|p| p.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let mut levels = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let mut j = i + 1;
        while j < sorted.len() && sorted[j] - sorted[i] <= tolerance {
            j += 1;
        }
        let touches = j - i;
        if touches >= MIN_TOUCHES {
            let avg = sorted[i..j].iter().sum::<f64>() / touches as f64;
            levels.push((avg, touches));
        }
        i = j;
    }
    levels
}

impl PatternDetector for SweepReturnDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::SweepAndReturn
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M5, LOOKBACK) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        let n = window.len();
        if n < MIN_BASE + 2 {
            return Detection::NoCandidate("insufficient candles");
        }
        let base = &window[..n - 2];
        let sweep = &window[n - 2];
        let ret = &window[n - 1];

        let tolerance = ctx.price(ctx.symbol_pips(th.pips(PipKnob::LevelTolerancePips)));
        let min_sweep = ctx.price(ctx.symbol_pips(th.pips(PipKnob::SweepPips)));
        let highs: Vec<f64> = base.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = base.iter().map(|c| c.low).collect();
        let high_levels = liquidity_levels(&highs, tolerance);
        let low_levels = liquidity_levels(&lows, tolerance);

        // Nearest swept level on each side
        let swept_high = high_levels
            .iter()
            .filter(|(level, _)| sweep.high - level >= min_sweep && ret.close < *level)
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .copied();
        let swept_low = low_levels
            .iter()
            .filter(|(level, _)| level - sweep.low >= min_sweep && ret.close > *level)
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .copied();

        let (direction, (level, touches)) = match (swept_low, swept_high) {
            (Some(low), _) => (Direction::Long, low),
            (None, Some(high)) => (Direction::Short, high),
            (None, None) => return Detection::NoCandidate("no swept liquidity level"),
        };

        let strong_body = (ret.close - ret.open) * direction.sign() > 0.0 && ret.body_pct() > th.shape_ratio.value;
        let volume_surge = volume_ratio(ret, base) >= th.volume_multiplier.value;
        if !strong_body && !volume_surge {
            return Detection::NoCandidate("weak return candle");
        }

        let pip = ctx.price(1.0);
        let entry = ret.close;
        let (stop, depth) = match direction {
            Direction::Long => (sweep.low.min(ret.low) - pip, level - sweep.low),
            Direction::Short => (sweep.high.max(ret.high) + pip, sweep.high - level),
        };

        // Next opposing level beyond entry, else the window extreme
        let target = match direction {
            Direction::Long => high_levels
                .iter()
                .map(|(l, _)| *l)
                .filter(|l| *l > entry)
                .min_by(|a, b| a.total_cmp(b))
                .or_else(|| highest_high(base)),
            Direction::Short => low_levels
                .iter()
                .map(|(l, _)| *l)
                .filter(|l| *l < entry)
                .max_by(|a, b| a.total_cmp(b))
                .or_else(|| lowest_low(base)),
        };
        let Some(target) = target else {
            return Detection::NoCandidate("no target level");
        };

        let stop_distance = (entry - stop).abs();
        let target_distance = (target - entry) * direction.sign();
        if stop_distance <= 0.0 || target_distance / stop_distance < MIN_RISK_REWARD {
            return Detection::NoCandidate("risk:reward below 2.0");
        }

        let mut confidence = 65.0;
        confidence += ((touches - MIN_TOUCHES) as f64 * 3.0).min(9.0);
        if strong_body {
            confidence += ((ret.body_pct() - th.shape_ratio.value) * 30.0).clamp(0.0, 8.0);
        }
        if volume_surge {
            confidence += 5.0;
        }
        confidence += ctx.pips(depth - min_sweep).clamp(0.0, 5.0);

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
                    "Swept {}-touch level {:.5} by {:.1} pips and returned",
                    touches,
                    level,
                    ctx.pips(depth)
                ),
            },
        )
    }
}

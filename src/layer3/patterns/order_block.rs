// Order Block Bounce - tight M5 consolidation, breakout, then a retest of the block edge
// Entry beyond the edge, stop beyond the opposite edge

use crate::core::types::{Candle, Direction, PatternKind, Timeframe};
use crate::layer3::common::indicators::{atr, average_volume, highest_high, lowest_low};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, Detection, DetectionContext, PatternDetector, Setup};

const LOOKBACK: usize = 12;
const BLOCK_LEN: usize = 3;
const MIN_RISK_REWARD: f64 = 1.0;

pub struct OrderBlockDetector;

struct Block {
    start: usize,
    high: f64,
    low: f64,
    breakout: usize,
    direction: Direction,
}

impl OrderBlockDetector {
    /// Most recent block whose breakout happened before the newest candle and held
    fn find_block(ctx: &DetectionContext, th: &ThresholdSet, candles: &[Candle]) -> Option<Block> {
        let n = candles.len();
        if n < BLOCK_LEN + 2 {
            return None;
        }
        let min_range = ctx.price(ctx.symbol_pips(th.pips(PipKnob::BlockMinPips)));
        let max_range = ctx.price(ctx.symbol_pips(th.pips(PipKnob::BlockMaxPips)));
        let breakout_dist = ctx.price(ctx.symbol_pips(th.pips(PipKnob::BreakoutPips)));

        for start in (0..=n - BLOCK_LEN - 2).rev() {
            let block = &candles[start..start + BLOCK_LEN];
            let (Some(high), Some(low)) = (highest_high(block), lowest_low(block)) else {
                continue;
            };
            let range = high - low;
            if range < min_range || range > max_range {
                continue;
            }

            for b in start + BLOCK_LEN..n - 1 {
                let close = candles[b].close;
                let direction = if close >= high + breakout_dist {
                    Direction::Long
                } else if close <= low - breakout_dist {
                    Direction::Short
                } else {
                    continue;
                };

                // Everything between breakout and retest must stay outside the block
                let held = candles[b + 1..n - 1].iter().all(|c| match direction {
                    Direction::Long => c.close > high,
                    Direction::Short => c.close < low,
                });
                if held {
                    return Some(Block { start, high, low, breakout: b, direction });
                }
                break;
            }
        }
        None
    }
}

impl PatternDetector for OrderBlockDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::OrderBlockBounce
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M5, LOOKBACK + 1) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        let Some(block) = Self::find_block(ctx, th, window) else {
            return Detection::NoCandidate("no order block breakout");
        };
        let Some(newest) = window.last() else {
            return Detection::NoCandidate("insufficient candles");
        };

        let pip = ctx.price(1.0);
        let tolerance = ctx.price(th.pips(PipKnob::RetestPips));
        let (edge, opposite, touch, wick_pct, back_outside, recrossed) = match block.direction {
            Direction::Long => (
                block.high,
                block.low,
                newest.low,
                newest.lower_wick_pct(),
                newest.close >= block.high,
                newest.low < block.high && newest.close > block.high,
            ),
            Direction::Short => (
                block.low,
                block.high,
                newest.high,
                newest.upper_wick_pct(),
                newest.close <= block.low,
                newest.high > block.low && newest.close < block.low,
            ),
        };

        if (touch - edge).abs() > tolerance || !back_outside {
            return Detection::NoCandidate("no retest of block edge");
        }
        let rejection_wick = wick_pct > th.shape_ratio.value;
        if !rejection_wick && !(recrossed && !th.rejection_required) {
            return Detection::NoCandidate("retest without rejection");
        }

        let direction = block.direction;
        let entry = edge + pip * direction.sign();
        let stop = opposite - pip * direction.sign();
        let stop_distance = (entry - stop).abs();
        let Some(atr_value) = atr(window, 14) else {
            return Detection::NoCandidate("insufficient candles");
        };
        let target_distance = (2.0 * stop_distance).min(1.5 * atr_value);
        if stop_distance <= 0.0 || target_distance / stop_distance < MIN_RISK_REWARD {
            return Detection::NoCandidate("risk:reward below 1.0");
        }
        let target = entry + target_distance * direction.sign();

        let block_volume = average_volume(&window[block.start..block.start + BLOCK_LEN]);
        let block_pips = ctx.pips(block.high - block.low);

        let mut confidence = 65.0;
        if rejection_wick {
            confidence += ((wick_pct - th.shape_ratio.value) * 40.0).clamp(0.0, 10.0);
        }
        if block_volume > 0.0 && window[block.breakout].volume >= th.volume_multiplier.value * block_volume {
            confidence += 5.0;
        }
        if block_pips <= ctx.symbol_pips(8.0) {
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
                    "Retest of {:.1} pip block {} after breakout",
                    block_pips,
                    if rejection_wick { "with rejection wick" } else { "with clean re-cross" }
                ),
            },
        )
    }
}

// Momentum Burst - three fast M1 candles that accelerate out of the prior range
// Stop behind the burst, fixed 1.5R target

use crate::core::types::{Direction, PatternKind, Timeframe};
use crate::layer3::common::indicators::{average_volume, highest_high, lowest_low};
use crate::layer3::thresholds::{PipKnob, ThresholdSet};

use super::{finish, Detection, DetectionContext, PatternDetector, Setup};

const BURST_LEN: usize = 3;
const PRIOR_LEN: usize = 10;
const MIN_AVG_BODY_PIPS: f64 = 0.5;
const MIN_STOP_PIPS: f64 = 5.0;
const MAX_STOP_PIPS: f64 = 25.0;
const TARGET_MULTIPLE: f64 = 1.5;

pub struct MomentumBurstDetector;

impl PatternDetector for MomentumBurstDetector {
    fn kind(&self) -> PatternKind {
        PatternKind::MomentumBurst
    }

    fn detect(&self, ctx: &DetectionContext, th: &ThresholdSet) -> Detection {
        let window = match ctx.window(Timeframe::M1, BURST_LEN + PRIOR_LEN) {
            Ok(w) => w,
            Err(e) => return Detection::InputError(e),
        };
        if window.len() < BURST_LEN + PRIOR_LEN {
            return Detection::NoCandidate("insufficient candles");
        }
        let (prior, burst) = window.split_at(PRIOR_LEN);
        let (first, last) = (&burst[0], &burst[BURST_LEN - 1]);

        // Pips per candle across the burst
        let velocity = ctx.pips(last.close - first.open) / BURST_LEN as f64;
        let direction = if velocity > 0.0 {
            Direction::Long
        } else if velocity < 0.0 {
            Direction::Short
        } else {
            return Detection::NoCandidate("no directional move");
        };

        let prior_body =
            prior.iter().map(|c| ctx.pips((c.close - c.open).abs())).sum::<f64>() / prior.len() as f64;
        let acceleration = velocity.abs() / prior_body.max(MIN_AVG_BODY_PIPS);
        if acceleration < th.shape_ratio.value {
            return Detection::NoCandidate("insufficient acceleration");
        }

        let (Some(prior_high), Some(prior_low)) = (highest_high(prior), lowest_low(prior)) else {
            return Detection::NoCandidate("insufficient candles");
        };
        let min_breakout = ctx.price(ctx.symbol_pips(th.pips(PipKnob::BreakoutPips)));
        let breakout = match direction {
            Direction::Long => last.close - prior_high,
            Direction::Short => prior_low - last.close,
        };
        if breakout < min_breakout {
            return Detection::NoCandidate("burst inside prior range");
        }

        let pip = ctx.price(1.0);
        let entry = last.close;
        let stop = match direction {
            Direction::Long => lowest_low(burst).map(|l| l - pip),
            Direction::Short => highest_high(burst).map(|h| h + pip),
        };
        let Some(stop) = stop else {
            return Detection::NoCandidate("insufficient candles");
        };
        let stop_pips = ctx.pips((entry - stop).abs());
        if stop_pips < ctx.symbol_pips(MIN_STOP_PIPS) || stop_pips > ctx.symbol_pips(MAX_STOP_PIPS) {
            return Detection::NoCandidate("stop distance out of range");
        }
        let target = entry + (entry - stop).abs() * TARGET_MULTIPLE * direction.sign();

        let prior_volume = average_volume(prior);
        let volume_ratio = if prior_volume > 0.0 { average_volume(burst) / prior_volume } else { 1.0 };

        let mut confidence = 60.0;
        confidence += (acceleration * 5.0).min(15.0);
        if volume_ratio >= th.volume_multiplier.value {
            confidence += 10.0;
        } else {
            confidence += ((volume_ratio - 1.0) * 10.0).clamp(0.0, 10.0);
        }
        confidence += ctx.pips(breakout - min_breakout).clamp(0.0, 10.0);

        finish(
            ctx,
            self.kind(),
            th,
            window,
            Setup {
                direction,
                timeframe: Timeframe::M1,
                entry,
                stop,
                target,
                confidence,
                reason: format!(
                    "{:.1} pips/candle at {:.1}x prior pace, volume {:.1}x",
                    velocity.abs(),
                    acceleration,
                    volume_ratio
                ),
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::core::types::Candle;

    fn make_burst(first_low: f64) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..10)
            .map(|i| make_candle(Timeframe::M1, i, 1.1000, 1.1003, 1.0998, 1.1001, 100.0))
            .collect();
        candles.push(make_candle(Timeframe::M1, 10, 1.1001, 1.1006, first_low, 1.1005, 200.0));
        candles.push(make_candle(Timeframe::M1, 11, 1.1005, 1.1010, 1.1004, 1.1009, 200.0));
        candles.push(make_candle(Timeframe::M1, 12, 1.1009, 1.1014, 1.1008, 1.1013, 200.0));
        candles
    }

    #[test]
    fn test_bullish_burst() {
        let ctx = make_context("EURUSD", make_burst(1.1000), Vec::new());
        let th = ThresholdSet::defaults(PatternKind::MomentumBurst);
        let candidate = MomentumBurstDetector.detect(&ctx, &th).candidate().expect("burst candidate");

        assert_eq!(candidate.direction, Direction::Long);
        assert_eq!(candidate.timeframe, Timeframe::M1);
        assert!((candidate.entry_price - 1.1013).abs() < 1e-9);
        assert!((candidate.stop_loss - 1.0999).abs() < 1e-9);
        assert!((candidate.take_profit - 1.1034).abs() < 1e-9);
        assert!((candidate.risk_reward() - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_slow_drift_is_not_a_burst() {
        let mut candles: Vec<Candle> = (0..10)
            .map(|i| make_candle(Timeframe::M1, i, 1.1000, 1.1003, 1.0998, 1.1001, 100.0))
            .collect();
        for i in 10..13 {
            let open = 1.1001 + (i - 10) as f64 * 0.0001;
            candles.push(make_candle(Timeframe::M1, i, open, open + 0.0002, open - 0.0001, open + 0.0001, 100.0));
        }
        let ctx = make_context("EURUSD", candles, Vec::new());
        let th = ThresholdSet::defaults(PatternKind::MomentumBurst);
        assert!(matches!(MomentumBurstDetector.detect(&ctx, &th), Detection::NoCandidate(_)));
    }

    #[test]
    fn test_stop_too_wide() {
        // A 44 pip stop is beyond the 25 pip limit
        let ctx = make_context("EURUSD", make_burst(1.0970), Vec::new());
        let th = ThresholdSet::defaults(PatternKind::MomentumBurst);
        assert!(matches!(MomentumBurstDetector.detect(&ctx, &th), Detection::NoCandidate(_)));
    }

    #[test]
    fn test_needs_thirteen_candles() {
        let mut candles = make_burst(1.1000);
        candles.remove(0);
        let ctx = make_context("EURUSD", candles, Vec::new());
        let th = ThresholdSet::defaults(PatternKind::MomentumBurst);
        assert!(matches!(MomentumBurstDetector.detect(&ctx, &th), Detection::NoCandidate(_)));
    }
}

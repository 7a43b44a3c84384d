// Indicators - Candle-window math shared by detectors, scoring and zones
// All functions are pure and tolerate short or empty windows

use crate::core::types::{Candle, Direction};

/// True range of `candle` given the previous close
pub fn true_range(prev_close: Option<f64>, candle: &Candle) -> f64 {
    match prev_close {
        Some(pc) => candle.range().max((candle.high - pc).abs()).max((candle.low - pc).abs()),
        None => candle.range(),
    }
}

/// Simple-average true range over the last `period` candles
pub fn atr(candles: &[Candle], period: usize) -> Option<f64> {
    if candles.is_empty() || period == 0 {
        return None;
    }
    let start = candles.len().saturating_sub(period);
    let mut sum = 0.0;
    let mut count = 0usize;
    for i in start..candles.len() {
        let prev_close = if i > 0 { Some(candles[i - 1].close) } else { None };
        sum += true_range(prev_close, &candles[i]);
        count += 1;
    }
    Some(sum / count as f64)
}

pub fn highest_high(candles: &[Candle]) -> Option<f64> {
    candles.iter().map(|c| c.high).fold(None, |acc, h| Some(acc.map_or(h, |a: f64| a.max(h))))
}

pub fn lowest_low(candles: &[Candle]) -> Option<f64> {
    candles.iter().map(|c| c.low).fold(None, |acc, l| Some(acc.map_or(l, |a: f64| a.min(l))))
}

pub fn average_volume(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    candles.iter().map(|c| c.volume).sum::<f64>() / candles.len() as f64
}

/// Volume of `last` relative to the average of `history`. 1.0 when there is no baseline.
pub fn volume_ratio(last: &Candle, history: &[Candle]) -> f64 {
    let avg = average_volume(history);
    if avg > 0.0 {
        last.volume / avg
    } else {
        1.0
    }
}

/// 0-100: net move in `direction` against ATR, blended with the share of candles closing that way
pub fn momentum_score(candles: &[Candle], direction: Direction) -> f64 {
    let (Some(first), Some(last)) = (candles.first(), candles.last()) else {
        return 0.0;
    };
    let Some(range) = atr(candles, candles.len()).filter(|a| *a > 0.0) else {
        return 50.0;
    };

    let net = (last.close - first.open) * direction.sign();
    let move_score = (50.0 + 20.0 * net / range).clamp(0.0, 100.0);

    let agreeing = candles
        .iter()
        .filter(|c| (c.close - c.open) * direction.sign() > 0.0)
        .count();
    let share = agreeing as f64 / candles.len() as f64;

    (0.6 * move_score + 40.0 * share).clamp(0.0, 100.0)
}

/// 0-100: the newest candle's volume against the window average (2x average scores 100)
pub fn volume_quality(candles: &[Candle]) -> f64 {
    match candles.split_last() {
        Some((last, history)) if !history.is_empty() && average_volume(history) > 0.0 => {
            (volume_ratio(last, history) / 2.0 * 100.0).clamp(0.0, 100.0)
        }
        _ => 50.0,
    }
}

/// 3-bar fractal highs: (index, price)
pub fn swing_highs(candles: &[Candle]) -> Vec<(usize, f64)> {
    let mut out = Vec::new();
    for i in 1..candles.len().saturating_sub(1) {
        if candles[i].high > candles[i - 1].high && candles[i].high >= candles[i + 1].high {
            out.push((i, candles[i].high));
        }
    }
    out
}

/// 3-bar fractal lows: (index, price)
pub fn swing_lows(candles: &[Candle]) -> Vec<(usize, f64)> {
    let mut out = Vec::new();
    for i in 1..candles.len().saturating_sub(1) {
        if candles[i].low < candles[i - 1].low && candles[i].low <= candles[i + 1].low {
            out.push((i, candles[i].low));
        }
    }
    out
}

pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some((values[mid - 1] + values[mid]) / 2.0)
    } else {
        Some(values[mid])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Timeframe;

    fn make_candle(open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            timeframe: Timeframe::M5,
            open,
            high,
            low,
            close,
            volume,
            timestamp: 0,
        }
    }

    #[test]
    fn test_true_range_uses_gap() {
        let c = make_candle(1.1010, 1.1015, 1.1005, 1.1012, 1.0);
        assert!((true_range(None, &c) - 0.0010).abs() < 1e-12);
        assert!((true_range(Some(1.0990), &c) - 0.0025).abs() < 1e-12);
    }

    #[test]
    fn test_atr_window() {
        let candles = vec![
            make_candle(1.0, 1.2, 0.9, 1.1, 1.0),
            make_candle(1.1, 1.2, 1.0, 1.1, 1.0),
            make_candle(1.1, 1.3, 1.1, 1.2, 1.0),
        ];
        let v = atr(&candles, 2).unwrap();
        assert!((v - 0.2).abs() < 1e-9);
        assert!(atr(&[], 14).is_none());
    }

    #[test]
    fn test_extremes() {
        let candles = vec![make_candle(1.0, 1.5, 0.8, 1.2, 1.0), make_candle(1.2, 1.4, 0.7, 1.3, 1.0)];
        assert_eq!(highest_high(&candles), Some(1.5));
        assert_eq!(lowest_low(&candles), Some(0.7));
        assert_eq!(highest_high(&[]), None);
    }

    #[test]
    fn test_momentum_score_direction() {
        let rising: Vec<Candle> = (0..5)
            .map(|i| {
                let o = 1.1 + i as f64 * 0.001;
                make_candle(o, o + 0.0012, o - 0.0002, o + 0.001, 1.0)
            })
            .collect();
        let long = momentum_score(&rising, Direction::Long);
        let short = momentum_score(&rising, Direction::Short);
        assert!(long > 70.0);
        assert!(short < 30.0);
    }

    #[test]
    fn test_volume_quality() {
        let mut candles = vec![make_candle(1.0, 1.1, 0.9, 1.0, 100.0); 4];
        candles.push(make_candle(1.0, 1.1, 0.9, 1.0, 200.0));
        assert!((volume_quality(&candles) - 100.0).abs() < 1e-9);
        candles.push(make_candle(1.0, 1.1, 0.9, 1.0, 0.0));
        assert_eq!(volume_quality(&candles), 0.0);
        assert_eq!(volume_quality(&candles[..1]), 50.0);
    }

    #[test]
    fn test_swings() {
        let candles = vec![
            make_candle(1.0, 1.1, 0.95, 1.0, 1.0),
            make_candle(1.0, 1.3, 0.90, 1.0, 1.0),
            make_candle(1.0, 1.2, 0.97, 1.0, 1.0),
            make_candle(1.0, 1.1, 0.85, 1.0, 1.0),
            make_candle(1.0, 1.2, 0.99, 1.0, 1.0),
        ];
        assert_eq!(swing_highs(&candles), vec![(1, 1.3)]);
        let lows: Vec<usize> = swing_lows(&candles).iter().map(|(i, _)| *i).collect();
        assert_eq!(lows, vec![1, 3]);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&mut [3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&mut [4.0, 1.0, 2.0, 3.0]), Some(2.5));
        assert_eq!(median(&mut Vec::<f64>::new()), None);
    }
}

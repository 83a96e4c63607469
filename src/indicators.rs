//! Pure technical indicator functions over ordered price bars.
//!
//! Every function here is stateless: given the same input slice it always
//! returns the same output, and none of them retain data across calls. Series
//! outputs are aligned to the input with `None` for the warm-up period;
//! scalar consumers that need "the latest value or treat it as absent" use
//! [`latest`].

use crate::error::InsufficientData;
use crate::types::Candle;

/// Pull the most recent defined value out of a indicator series, or report
/// `InsufficientData` so the caller can score the indicator as neutral
/// instead of failing the run.
pub fn latest(series: &[Option<f64>]) -> Result<f64, InsufficientData> {
    series
        .last()
        .copied()
        .flatten()
        .ok_or(InsufficientData {
            required: 1,
            available: 0,
        })
}

/// Simple Moving Average. First `period-1` outputs are `None`.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        if i + 1 < period {
            result.push(None);
        } else {
            let sum: f64 = values[i + 1 - period..=i].iter().sum();
            result.push(Some(sum / period as f64));
        }
    }
    result
}

/// Exponential Moving Average, standard recurrence (`alpha = 2/(period+1)`),
/// seeded with the simple average of the first `period` values.
pub fn ema(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if values.is_empty() || period == 0 {
        return result;
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_value: Option<f64> = None;

    for (i, &value) in values.iter().enumerate() {
        if i < period - 1 {
            result.push(None);
        } else if i == period - 1 {
            let sum: f64 = values[0..period].iter().sum();
            ema_value = Some(sum / period as f64);
            result.push(ema_value);
        } else if let Some(prev_ema) = ema_value {
            let new_ema = (value - prev_ema) * multiplier + prev_ema;
            ema_value = Some(new_ema);
            result.push(Some(new_ema));
        }
    }
    result
}

/// Wilder smoothing (`alpha = 1/period`), seeded with the simple average of
/// the first `period` values. Used by RSI and ATR per their Wilder
/// definitions — distinct from the standard EMA recurrence above.
fn wilder_smooth(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = Vec::with_capacity(values.len());
    if values.is_empty() || period == 0 {
        return result;
    }

    let mut smoothed: Option<f64> = None;
    for (i, &value) in values.iter().enumerate() {
        if i < period - 1 {
            result.push(None);
        } else if i == period - 1 {
            let sum: f64 = values[0..period].iter().sum();
            smoothed = Some(sum / period as f64);
            result.push(smoothed);
        } else if let Some(prev) = smoothed {
            let next = prev + (value - prev) / period as f64;
            smoothed = Some(next);
            result.push(Some(next));
        }
    }
    result
}

/// True Range per bar.
pub fn true_range(high: &[f64], low: &[f64], close: &[f64]) -> Vec<f64> {
    let mut tr = Vec::with_capacity(high.len());
    for i in 0..high.len() {
        let tr_value = if i == 0 {
            high[i] - low[i]
        } else {
            let hl = high[i] - low[i];
            let hc = (high[i] - close[i - 1]).abs();
            let lc = (low[i] - close[i - 1]).abs();
            hl.max(hc).max(lc)
        };
        tr.push(tr_value);
    }
    tr
}

/// Average True Range, Wilder-smoothed.
pub fn atr(high: &[f64], low: &[f64], close: &[f64], period: usize) -> Vec<Option<f64>> {
    let tr = true_range(high, low, close);
    wilder_smooth(&tr, period)
}

/// Relative Strength Index, Wilder-smoothed. Output in `[0, 100]`.
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut gains = Vec::with_capacity(values.len());
    let mut losses = Vec::with_capacity(values.len());
    gains.push(0.0);
    losses.push(0.0);

    for i in 1..values.len() {
        let change = values[i] - values[i - 1];
        gains.push(if change > 0.0 { change } else { 0.0 });
        losses.push(if change < 0.0 { -change } else { 0.0 });
    }

    let avg_gains = wilder_smooth(&gains, period);
    let avg_losses = wilder_smooth(&losses, period);

    let mut out = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        match (avg_gains[i], avg_losses[i]) {
            (Some(_), Some(loss)) if loss == 0.0 => out.push(Some(100.0)),
            (Some(gain), Some(loss)) => {
                let rs = gain / loss;
                out.push(Some(100.0 - 100.0 / (1.0 + rs)));
            }
            _ => out.push(None),
        }
    }
    out
}

/// MACD cross direction computed at the last bar, comparing the sign of
/// `macd - signal` at `t` vs `t-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdCross {
    Golden,
    Death,
    None,
}

/// MACD: returns `(macd_line, signal_line, histogram)` plus the cross at the
/// last bar.
pub fn macd(
    values: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>, Vec<Option<f64>>) {
    let ema_fast = ema(values, fast);
    let ema_slow = ema(values, slow);

    let macd_line: Vec<Option<f64>> = ema_fast
        .iter()
        .zip(ema_slow.iter())
        .map(|(f, s)| match (f, s) {
            (Some(f), Some(s)) => Some(f - s),
            _ => None,
        })
        .collect();

    // The signal line is an EMA of the MACD line, computed only over its
    // defined (post slow-warm-up) tail so the EMA seed lines up correctly.
    let first_defined = macd_line.iter().position(Option::is_some);
    let mut signal_line = vec![None; macd_line.len()];
    if let Some(start) = first_defined {
        let tail: Vec<f64> = macd_line[start..].iter().map(|v| v.unwrap()).collect();
        let tail_signal = ema(&tail, signal);
        for (i, v) in tail_signal.into_iter().enumerate() {
            signal_line[start + i] = v;
        }
    }

    let histogram: Vec<Option<f64>> = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(m, s)| match (m, s) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        })
        .collect();

    (macd_line, signal_line, histogram)
}

/// Cross direction at the last bar of a `(macd_line, signal_line)` pair.
pub fn macd_cross(macd_line: &[Option<f64>], signal_line: &[Option<f64>]) -> MacdCross {
    let n = macd_line.len();
    if n < 2 {
        return MacdCross::None;
    }
    let diff = |i: usize| -> Option<f64> {
        match (macd_line[i], signal_line[i]) {
            (Some(m), Some(s)) => Some(m - s),
            _ => None,
        }
    };
    match (diff(n - 2), diff(n - 1)) {
        (Some(prev), Some(curr)) if prev <= 0.0 && curr > 0.0 => MacdCross::Golden,
        (Some(prev), Some(curr)) if prev >= 0.0 && curr < 0.0 => MacdCross::Death,
        _ => MacdCross::None,
    }
}

/// Bollinger Bands: `(mid, upper, lower, percent_b, squeeze)`, aligned to
/// the input.
pub struct Bollinger {
    pub mid: Vec<Option<f64>>,
    pub upper: Vec<Option<f64>>,
    pub lower: Vec<Option<f64>>,
    pub percent_b: Vec<Option<f64>>,
    pub squeeze: Vec<bool>,
}

pub fn bollinger(values: &[f64], period: usize, k: f64) -> Bollinger {
    let mid = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());
    let mut bandwidth = Vec::with_capacity(values.len());

    for i in 0..values.len() {
        if let Some(m) = mid[i] {
            if i + 1 >= period {
                let window = &values[i + 1 - period..=i];
                let variance: f64 =
                    window.iter().map(|&x| (x - m) * (x - m)).sum::<f64>() / period as f64;
                let std_dev = variance.sqrt();
                let u = m + k * std_dev;
                let l = m - k * std_dev;
                upper.push(Some(u));
                lower.push(Some(l));
                bandwidth.push(if m != 0.0 { Some((u - l) / m) } else { Some(0.0) });
                continue;
            }
        }
        upper.push(None);
        lower.push(None);
        bandwidth.push(None);
    }

    let percent_b: Vec<Option<f64>> = (0..values.len())
        .map(|i| match (upper[i], lower[i]) {
            (Some(u), Some(l)) if u != l => Some((values[i] - l) / (u - l)),
            _ => None,
        })
        .collect();

    // squeeze: current bandwidth below the 20-bar rolling minimum bandwidth,
    // within a 5% tolerance.
    let mut squeeze = vec![false; values.len()];
    const ROLLING_WINDOW: usize = 20;
    for i in 0..values.len() {
        let Some(curr_bw) = bandwidth[i] else {
            continue;
        };
        let start = i.saturating_sub(ROLLING_WINDOW - 1);
        let window_min = bandwidth[start..=i].iter().filter_map(|b| *b).fold(f64::MAX, f64::min);
        if window_min.is_finite() {
            squeeze[i] = curr_bw <= window_min * 1.05;
        }
    }

    Bollinger {
        mid,
        upper,
        lower,
        percent_b,
        squeeze,
    }
}

/// Stochastic RSI: `(%K, %D)`, both smoothed simple moving averages over the
/// raw normalized RSI.
pub fn stoch_rsi(
    values: &[f64],
    period: usize,
    k_smooth: usize,
    d_smooth: usize,
) -> (Vec<Option<f64>>, Vec<Option<f64>>) {
    let rsi_values = rsi(values, period);

    let raw: Vec<Option<f64>> = (0..rsi_values.len())
        .map(|i| {
            if i + 1 < period {
                return None;
            }
            let window = &rsi_values[i + 1 - period..=i];
            if window.iter().any(Option::is_none) {
                return None;
            }
            let vals: Vec<f64> = window.iter().map(|v| v.unwrap()).collect();
            let min = vals.iter().cloned().fold(f64::MAX, f64::min);
            let max = vals.iter().cloned().fold(f64::MIN, f64::max);
            if (max - min).abs() < f64::EPSILON {
                Some(0.0)
            } else {
                Some((rsi_values[i].unwrap() - min) / (max - min) * 100.0)
            }
        })
        .collect();

    let first = raw.iter().position(Option::is_some);
    let k = if let Some(start) = first {
        let tail: Vec<f64> = raw[start..].iter().map(|v| v.unwrap()).collect();
        let tail_k = sma(&tail, k_smooth);
        let mut full = vec![None; raw.len()];
        for (i, v) in tail_k.into_iter().enumerate() {
            full[start + i] = v;
        }
        full
    } else {
        vec![None; raw.len()]
    };

    let first_k = k.iter().position(Option::is_some);
    let d = if let Some(start) = first_k {
        let tail: Vec<f64> = k[start..].iter().map(|v| v.unwrap()).collect();
        let tail_d = sma(&tail, d_smooth);
        let mut full = vec![None; k.len()];
        for (i, v) in tail_d.into_iter().enumerate() {
            full[start + i] = v;
        }
        full
    } else {
        vec![None; k.len()]
    };

    (k, d)
}

/// Volume classification relative to its 20-bar average.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeClass {
    Surge,
    Dry,
    Normal,
}

/// `last_volume / 20-bar average volume`, per bar.
pub fn volume_ratio(volume: &[f64]) -> Vec<Option<f64>> {
    let avg = sma(volume, 20);
    volume
        .iter()
        .zip(avg.iter())
        .map(|(&v, a)| a.map(|a| if a != 0.0 { v / a } else { 0.0 }))
        .collect()
}

pub fn classify_volume_ratio(ratio: f64) -> VolumeClass {
    if ratio > 2.0 {
        VolumeClass::Surge
    } else if ratio < 0.5 {
        VolumeClass::Dry
    } else {
        VolumeClass::Normal
    }
}

/// Multi-bar trend label over the last 50 bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrendStructure {
    Uptrend,
    Downtrend,
    Consolidation,
}

/// Classify the trend over the last `min(50, candles.len())` bars by
/// comparing successive swing highs/lows, detected as local extrema within a
/// 5-bar window on each side.
pub fn trend_structure(candles: &[Candle]) -> TrendStructure {
    const LOOKBACK: usize = 50;
    const SWING_WINDOW: usize = 5;

    let start = candles.len().saturating_sub(LOOKBACK);
    let window = &candles[start..];

    let mut swing_highs = Vec::new();
    let mut swing_lows = Vec::new();

    for i in 0..window.len() {
        let lo = i.saturating_sub(SWING_WINDOW);
        let hi = (i + SWING_WINDOW + 1).min(window.len());
        let is_swing_high = window[lo..hi]
            .iter()
            .all(|c| c.high <= window[i].high);
        let is_swing_low = window[lo..hi].iter().all(|c| c.low >= window[i].low);
        if is_swing_high {
            swing_highs.push(window[i].high);
        }
        if is_swing_low {
            swing_lows.push(window[i].low);
        }
    }

    let higher_highs = swing_highs.windows(2).all(|w| w[1] > w[0]) && swing_highs.len() >= 2;
    let higher_lows = swing_lows.windows(2).all(|w| w[1] > w[0]) && swing_lows.len() >= 2;
    let lower_highs = swing_highs.windows(2).all(|w| w[1] < w[0]) && swing_highs.len() >= 2;
    let lower_lows = swing_lows.windows(2).all(|w| w[1] < w[0]) && swing_lows.len() >= 2;

    if higher_highs && higher_lows {
        TrendStructure::Uptrend
    } else if lower_highs && lower_lows {
        TrendStructure::Downtrend
    } else {
        TrendStructure::Consolidation
    }
}

/// Candle body/shadow pattern detected on the last bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandlePattern {
    BullishEngulfing,
    BearishEngulfing,
    Hammer,
    ShootingStar,
    Doji,
    None,
}

/// Detect the dominant candlestick pattern on the last bar using
/// conventional body/shadow ratios.
pub fn detect_candle_pattern(candles: &[Candle]) -> CandlePattern {
    let Some(last) = candles.last() else {
        return CandlePattern::None;
    };
    let range = last.high - last.low;
    if range <= 0.0 {
        return CandlePattern::None;
    }

    let body = (last.close - last.open).abs();
    let upper_shadow = last.high - last.open.max(last.close);
    let lower_shadow = last.open.min(last.close) - last.low;

    // Hammer/shooting star are small-body bars with a strongly asymmetric
    // shadow; check those before doji so a long-lower-shadow bar isn't
    // swallowed by the body-size check alone. A doji's shadows are roughly
    // balanced on both sides.
    if lower_shadow >= 2.0 * body && upper_shadow <= body {
        return CandlePattern::Hammer;
    }
    if upper_shadow >= 2.0 * body && lower_shadow <= body {
        return CandlePattern::ShootingStar;
    }
    if body <= 0.10 * range {
        return CandlePattern::Doji;
    }

    if candles.len() >= 2 {
        let prev = &candles[candles.len() - 2];
        let prev_bullish = prev.close > prev.open;
        let prev_bearish = prev.close < prev.open;
        let curr_bullish = last.close > last.open;
        let curr_bearish = last.close < last.open;

        let fully_engulfs =
            last.open.min(last.close) <= prev.open.min(prev.close)
                && last.open.max(last.close) >= prev.open.max(prev.close);

        if curr_bullish && prev_bearish && fully_engulfs {
            return CandlePattern::BullishEngulfing;
        }
        if curr_bearish && prev_bullish && fully_engulfs {
            return CandlePattern::BearishEngulfing;
        }
    }

    CandlePattern::None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new_unchecked(Utc.timestamp_opt(0, 0).unwrap(), open, high, low, close, 100.0)
    }

    #[test]
    fn test_sma() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = sma(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[2], Some(2.0));
        assert_eq!(result[4], Some(4.0));
    }

    #[test]
    fn test_ema_warmup() {
        let values = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let result = ema(&values, 3);
        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert!(result[2].is_some());
    }

    #[test]
    fn test_rsi_bounds() {
        let up: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        let result = rsi(&up, 14);
        let last = result.last().unwrap().unwrap();
        assert!(last > 50.0 && last <= 100.0);
    }

    #[test]
    fn test_atr_positive() {
        let high = vec![12.0, 13.0, 14.0, 15.0, 16.0, 15.5, 16.5, 17.0, 16.0, 17.5];
        let low = vec![10.0, 11.0, 12.0, 13.0, 14.0, 14.0, 15.0, 15.5, 14.5, 16.0];
        let close = vec![11.0, 12.0, 13.0, 14.0, 15.0, 15.0, 16.0, 16.5, 15.5, 17.0];
        let result = atr(&high, &low, &close, 5);
        assert!(result[4].unwrap() > 0.0);
    }

    #[test]
    fn test_macd_golden_cross() {
        // A falling-then-rising series should eventually cross golden.
        let mut values: Vec<f64> = (0..30).map(|i| 100.0 - i as f64 * 0.5).collect();
        values.extend((0..30).map(|i| values.last().unwrap() + i as f64 * 1.0));
        let (macd_line, signal_line, _) = macd(&values, 12, 26, 9);
        let cross = macd_cross(&macd_line, &signal_line);
        assert!(matches!(cross, MacdCross::Golden | MacdCross::None));
    }

    #[test]
    fn test_bollinger_ordering() {
        let values = vec![20.0, 21.0, 22.0, 21.5, 20.5, 21.0, 22.5, 23.0, 22.0, 21.5];
        let b = bollinger(&values, 5, 2.0);
        assert!(b.upper[4].unwrap() > b.mid[4].unwrap());
        assert!(b.mid[4].unwrap() > b.lower[4].unwrap());
    }

    #[test]
    fn test_volume_ratio_classification() {
        assert_eq!(classify_volume_ratio(2.5), VolumeClass::Surge);
        assert_eq!(classify_volume_ratio(0.3), VolumeClass::Dry);
        assert_eq!(classify_volume_ratio(1.0), VolumeClass::Normal);
    }

    #[test]
    fn test_doji_detection() {
        let candles = vec![candle(100.0, 110.0, 90.0, 100.5)];
        assert_eq!(detect_candle_pattern(&candles), CandlePattern::Doji);
    }

    #[test]
    fn test_hammer_detection() {
        let candles = vec![candle(100.0, 101.0, 85.0, 100.5)];
        assert_eq!(detect_candle_pattern(&candles), CandlePattern::Hammer);
    }

    #[test]
    fn test_bullish_engulfing() {
        let candles = vec![candle(100.0, 101.0, 95.0, 96.0), candle(95.0, 105.0, 94.0, 104.0)];
        assert_eq!(detect_candle_pattern(&candles), CandlePattern::BullishEngulfing);
    }

    #[test]
    fn test_latest_reports_insufficient_data() {
        let series: Vec<Option<f64>> = vec![None, None, None];
        assert!(latest(&series).is_err());
    }
}

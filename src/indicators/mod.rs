//! Technical indicator library
//!
//! Pure stateless functions over price/candle slices. Every function
//! returns `Option` (or a neutral value where noted) when the slice is
//! too short; callers treat `None` as "no decision", never an error.

use crate::types::Candle;

/// Exponential moving average, SMA-seeded.
///
/// Seeds with the simple average of the first `period` values, then
/// applies `k = 2 / (period + 1)` recursive smoothing over the rest.
pub fn compute_ema(closes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || closes.len() < period {
        return None;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut ema: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    for close in &closes[period..] {
        ema = close * k + ema * (1.0 - k);
    }
    Some(ema)
}

/// RSI with Wilder smoothing.
///
/// Returns the neutral 50.0 when there are fewer than `period + 1`
/// closes. A zero average loss yields a value asymptotically close to
/// 100 rather than a division by zero.
pub fn compute_rsi(closes: &[f64], period: usize) -> f64 {
    if period == 0 || closes.len() < period + 1 {
        return 50.0;
    }
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for w in closes[..period + 1].windows(2) {
        let delta = w[1] - w[0];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss -= delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;

    for w in closes[period..].windows(2) {
        let delta = w[1] - w[0];
        let (gain, loss) = if delta > 0.0 { (delta, 0.0) } else { (0.0, -delta) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Average true range over the last `period` bars.
///
/// `TR = max(high - low, |high - prev_close|, |low - prev_close|)`,
/// averaged arithmetically. `None` below `period + 1` bars.
pub fn compute_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let start = candles.len() - period;
    let mut sum = 0.0;
    for i in start..candles.len() {
        let c = &candles[i];
        let prev_close = candles[i - 1].close;
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        sum += tr;
    }
    Some(sum / period as f64)
}

/// Relative volume: the last bar's volume divided by the mean of the
/// preceding `period` volumes (the current bar is excluded from the mean).
pub fn compute_relative_volume(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let last = candles.last()?.volume;
    let start = candles.len() - 1 - period;
    let mean: f64 =
        candles[start..candles.len() - 1].iter().map(|c| c.volume).sum::<f64>() / period as f64;
    if mean <= 0.0 {
        return None;
    }
    Some(last / mean)
}

/// Normalized price slope over `period` bars, in basis points.
///
/// Displacement from the first to the last close divided by the first
/// close and by the number of bars, scaled by 10_000 so a threshold of
/// 2.0 means 2 bps per bar.
pub fn compute_slope(closes: &[f64], period: usize) -> Option<f64> {
    if period < 2 || closes.len() < period {
        return None;
    }
    let window = &closes[closes.len() - period..];
    let first = window[0];
    if first <= 0.0 {
        return None;
    }
    let last = window[period - 1];
    Some((last - first) / first / period as f64 * 10_000.0)
}

/// Donchian channel: (highest high, lowest low) of the last `period` bars.
pub fn compute_donchian(candles: &[Candle], period: usize) -> Option<(f64, f64)> {
    if period == 0 || candles.len() < period {
        return None;
    }
    let window = &candles[candles.len() - period..];
    let high = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
    let low = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
    Some((high, low))
}

/// Wilder-smoothed directional movement index (trend strength, 0-100).
pub fn compute_dmi(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period * 2 + 1 {
        return None;
    }

    let mut trs = Vec::with_capacity(candles.len() - 1);
    let mut plus_dms = Vec::with_capacity(candles.len() - 1);
    let mut minus_dms = Vec::with_capacity(candles.len() - 1);
    for w in candles.windows(2) {
        let (prev, cur) = (&w[0], &w[1]);
        let tr = (cur.high - cur.low)
            .max((cur.high - prev.close).abs())
            .max((cur.low - prev.close).abs());
        trs.push(tr);
        let up = cur.high - prev.high;
        let down = prev.low - cur.low;
        plus_dms.push(if up > down && up > 0.0 { up } else { 0.0 });
        minus_dms.push(if down > up && down > 0.0 { down } else { 0.0 });
    }

    let mut tr_s: f64 = trs[..period].iter().sum();
    let mut plus_s: f64 = plus_dms[..period].iter().sum();
    let mut minus_s: f64 = minus_dms[..period].iter().sum();

    let di = |plus: f64, minus: f64, tr: f64| -> Option<f64> {
        if tr <= 0.0 {
            return None;
        }
        let plus_di = plus / tr * 100.0;
        let minus_di = minus / tr * 100.0;
        let sum = plus_di + minus_di;
        if sum <= 0.0 {
            return None;
        }
        Some((plus_di - minus_di).abs() / sum * 100.0)
    };

    let mut dx_sum = 0.0;
    let mut dx_count = 0usize;
    for i in period..trs.len() {
        tr_s = tr_s - tr_s / period as f64 + trs[i];
        plus_s = plus_s - plus_s / period as f64 + plus_dms[i];
        minus_s = minus_s - minus_s / period as f64 + minus_dms[i];
        if let Some(dx) = di(plus_s, minus_s, tr_s) {
            dx_sum += dx;
            dx_count += 1;
        }
    }
    if dx_count < period {
        return None;
    }
    // ADX is the mean of the last `period` DX values; a running mean of
    // all of them is close enough for a gate and avoids a second pass.
    Some(dx_sum / dx_count as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64 * 60_000,
                open: c,
                high: c + 0.5,
                low: c - 0.5,
                close: c,
                volume: 10.0,
            })
            .collect()
    }

    #[test]
    fn ema_matches_hand_computation() {
        // SMA(1,2,3) = 2, k = 0.5: 4 -> 3.0, 5 -> 4.0
        let ema = compute_ema(&[1.0, 2.0, 3.0, 4.0, 5.0], 3).unwrap();
        assert!((ema - 4.0).abs() < 1e-9);
    }

    #[test]
    fn ema_requires_full_period() {
        assert!(compute_ema(&[1.0, 2.0], 3).is_none());
    }

    #[test]
    fn rsi_neutral_when_short() {
        assert_eq!(compute_rsi(&[1.0, 2.0, 3.0], 7), 50.0);
    }

    #[test]
    fn rsi_saturates_on_pure_gains() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        assert_eq!(compute_rsi(&closes, 7), 100.0);
    }

    #[test]
    fn rsi_midrange_on_zigzag() {
        // Alternating +0.6 / -0.5 keeps RSI near the middle of the range
        let mut closes = vec![100.0];
        for i in 0..30 {
            let delta = if i % 2 == 0 { 0.6 } else { -0.5 };
            closes.push(closes.last().unwrap() + delta);
        }
        let rsi = compute_rsi(&closes, 7);
        assert!(rsi > 40.0 && rsi < 65.0, "rsi = {rsi}");
    }

    #[test]
    fn atr_on_constant_range() {
        // Every bar has high-low = 1.0 and no gaps
        let candles = candles_from_closes(&[100.0; 20]);
        let atr = compute_atr(&candles, 14).unwrap();
        assert!((atr - 1.0).abs() < 1e-9);
    }

    #[test]
    fn atr_needs_period_plus_one() {
        let candles = candles_from_closes(&[100.0; 14]);
        assert!(compute_atr(&candles, 14).is_none());
    }

    #[test]
    fn relative_volume_excludes_current_bar() {
        let mut candles = candles_from_closes(&[100.0; 21]);
        candles.last_mut().unwrap().volume = 40.0;
        let rvol = compute_relative_volume(&candles, 20).unwrap();
        assert!((rvol - 4.0).abs() < 1e-9);
    }

    #[test]
    fn relative_volume_none_on_zero_mean() {
        let mut candles = candles_from_closes(&[100.0; 21]);
        for c in candles.iter_mut().take(20) {
            c.volume = 0.0;
        }
        assert!(compute_relative_volume(&candles, 20).is_none());
    }

    #[test]
    fn slope_sign_follows_direction() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + i as f64 * 0.1).collect();
        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64 * 0.1).collect();
        assert!(compute_slope(&rising, 20).unwrap() > 0.0);
        assert!(compute_slope(&falling, 20).unwrap() < 0.0);
    }

    #[test]
    fn donchian_covers_window_extremes() {
        let mut candles = candles_from_closes(&[100.0; 96]);
        candles[50].high = 120.0;
        candles[60].low = 90.0;
        let (high, low) = compute_donchian(&candles, 96).unwrap();
        assert_eq!(high, 120.0);
        assert_eq!(low, 90.0);
    }

    #[test]
    fn dmi_strong_on_one_way_trend() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let candles = candles_from_closes(&closes);
        let dmi = compute_dmi(&candles, 14).unwrap();
        assert!(dmi > 50.0, "dmi = {dmi}");
    }
}

//! Signal scoring engine
//!
//! Scores one symbol's closed-bar history against a declarative list of
//! weighted contributions, one score per direction. A side qualifies
//! when it clears the threshold and strictly beats the opposing side;
//! anything else produces no signal.
//!
//! The engine is pure: candle slice + funding + benchmark bias in,
//! `Option<Signal>` out. Too little history is a "no decision", never
//! an error.

use chrono::Utc;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::indicators;
use crate::types::{Candle, Direction, Signal, StrategyTag};

/// ATR multiples for the four staged targets
pub const TARGET_ATR_MULTS: [f64; 4] = [0.6, 1.2, 2.0, 3.5];

/// Lookback for the RSI divergence check, in bars
const DIVERGENCE_LOOKBACK: usize = 10;

/// Everything the contribution rules look at, computed once per bar
#[derive(Debug, Clone)]
pub struct IndicatorSnapshot {
    pub close: f64,
    pub ema20: Option<f64>,
    pub ema50: Option<f64>,
    pub ema200: Option<f64>,
    pub rsi: f64,
    pub prev_rsi: f64,
    pub slope: Option<f64>,
    pub atr: Option<f64>,
    pub rvol: Option<f64>,
    /// Position of the close inside the Donchian channel, 0..=1
    pub range_pos: Option<f64>,
    pub bar_bullish: bool,
}

/// One labelled, signed score contribution for one side
#[derive(Debug, Clone)]
pub struct Contribution {
    pub label: &'static str,
    pub direction: Direction,
    pub weight: f64,
}

/// Both directional scores plus the contributions behind them
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub long: f64,
    pub short: f64,
    pub contributions: Vec<Contribution>,
}

impl ScoreBreakdown {
    fn from_contributions(contributions: Vec<Contribution>) -> Self {
        let mut long = 0.0;
        let mut short = 0.0;
        for c in &contributions {
            match c.direction {
                Direction::Long => long += c.weight,
                Direction::Short => short += c.weight,
            }
        }
        Self {
            long,
            short,
            contributions,
        }
    }

    fn score(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.long,
            Direction::Short => self.short,
        }
    }
}

pub struct SignalScorer {
    config: ScoringConfig,
}

impl SignalScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Compute the snapshot, or `None` below the history gate.
    pub fn snapshot(&self, candles: &[Candle]) -> Option<IndicatorSnapshot> {
        if candles.len() < self.config.min_bars {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let last = candles.last()?;

        let donchian = indicators::compute_donchian(candles, self.config.donchian_period);
        let range_pos = donchian.and_then(|(high, low)| {
            let range = high - low;
            if range <= 0.0 {
                None
            } else {
                Some((last.close - low) / range)
            }
        });

        Some(IndicatorSnapshot {
            close: last.close,
            ema20: indicators::compute_ema(&closes, 20),
            ema50: indicators::compute_ema(&closes, 50),
            ema200: indicators::compute_ema(&closes, 200),
            rsi: indicators::compute_rsi(&closes, self.config.rsi_period),
            prev_rsi: indicators::compute_rsi(
                &closes[..closes.len() - 1],
                self.config.rsi_period,
            ),
            slope: indicators::compute_slope(&closes, self.config.slope_period),
            atr: indicators::compute_atr(candles, self.config.atr_period),
            rvol: indicators::compute_relative_volume(candles, self.config.rvol_period),
            range_pos,
            bar_bullish: last.is_bullish(),
        })
    }

    /// Evaluate the contribution list for both sides.
    pub fn breakdown(
        &self,
        candles: &[Candle],
        snap: &IndicatorSnapshot,
        funding_rate: Option<f64>,
        benchmark_change_pct: f64,
    ) -> ScoreBreakdown {
        use Direction::{Long, Short};
        let mut out: Vec<Contribution> = Vec::new();
        let mut push = |label: &'static str, direction: Direction, weight: f64| {
            out.push(Contribution {
                label,
                direction,
                weight,
            });
        };

        // Structure: reward the side the range position favors, penalize
        // chasing into the boundary the side trades toward.
        if let Some(p) = snap.range_pos {
            if p >= 0.70 {
                push("range_high", Long, 1.5);
            }
            if p <= 0.30 {
                push("range_low", Short, 1.5);
            }
            if p >= 0.95 {
                push("boundary_exhaustion", Long, -1.5);
            }
            if p <= 0.05 {
                push("boundary_exhaustion", Short, -1.5);
            }
        }

        // Trend
        if let Some(ema200) = snap.ema200 {
            if snap.close > ema200 {
                push("above_ema200", Long, 1.5);
            } else if snap.close < ema200 {
                push("below_ema200", Short, 1.5);
            }
        }
        if let (Some(ema20), Some(ema50)) = (snap.ema20, snap.ema50) {
            if snap.close > ema20 && ema20 > ema50 {
                push("fan_aligned", Long, 1.0);
            } else if snap.close < ema20 && ema20 < ema50 {
                push("fan_aligned", Short, 1.0);
            }
        }
        if let Some(slope) = snap.slope {
            if slope >= 2.0 {
                push("slope_up", Long, 1.5);
            } else if slope <= -2.0 {
                push("slope_down", Short, 1.5);
            }
        }

        // Momentum: oversold/overbought exits and 10-bar divergences
        if snap.prev_rsi <= 30.0 && snap.rsi > 30.0 {
            push("rsi_cross_up", Long, 2.0);
        }
        if snap.prev_rsi >= 70.0 && snap.rsi < 70.0 {
            push("rsi_cross_down", Short, 2.0);
        }
        match self.divergence(candles) {
            Some(Long) => push("bullish_divergence", Long, 2.0),
            Some(Short) => push("bearish_divergence", Short, 2.0),
            None => {}
        }

        // Volume confirms either side; the stronger tier replaces the weaker
        if let Some(rvol) = snap.rvol {
            let weight = if rvol >= 2.5 {
                Some(2.0)
            } else if rvol >= 1.5 {
                Some(1.0)
            } else {
                None
            };
            if let Some(w) = weight {
                push("volume_surge", Long, w);
                push("volume_surge", Short, w);
            }
        }

        // Context penalties
        if let Some(rate) = funding_rate {
            if rate >= self.config.funding_extreme {
                push("crowded_funding", Long, -1.5);
            } else if rate <= -self.config.funding_extreme {
                push("crowded_funding", Short, -1.5);
            }
        }
        if snap.bar_bullish {
            push("bar_against", Short, -1.0);
        } else {
            push("bar_against", Long, -1.0);
        }
        if benchmark_change_pct <= -self.config.benchmark_extreme_pct {
            push("benchmark_risk_off", Long, -1.5);
        } else if benchmark_change_pct >= self.config.benchmark_extreme_pct {
            push("benchmark_risk_on", Short, -1.5);
        }

        ScoreBreakdown::from_contributions(out)
    }

    /// 10-bar RSI divergence: price extends past the window extreme
    /// while RSI does not confirm.
    fn divergence(&self, candles: &[Candle]) -> Option<Direction> {
        let len = candles.len();
        if len < self.config.min_bars || len < DIVERGENCE_LOOKBACK + 2 {
            return None;
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi_at = |end: usize| indicators::compute_rsi(&closes[..end], self.config.rsi_period);

        let window = (len - 1 - DIVERGENCE_LOOKBACK)..(len - 1);
        let current_close = closes[len - 1];
        let current_rsi = rsi_at(len);

        let min_idx = window.clone().min_by(|&a, &b| {
            closes[a]
                .partial_cmp(&closes[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if current_close < closes[min_idx] && current_rsi > rsi_at(min_idx + 1) {
            return Some(Direction::Long);
        }

        let max_idx = window.max_by(|&a, &b| {
            closes[a]
                .partial_cmp(&closes[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if current_close > closes[max_idx] && current_rsi < rsi_at(max_idx + 1) {
            return Some(Direction::Short);
        }
        None
    }

    fn tag(&self, snap: &IndicatorSnapshot) -> StrategyTag {
        if snap.rvol.map(|r| r >= 2.5).unwrap_or(false) {
            return StrategyTag::Breakout;
        }
        if let Some(ema20) = snap.ema20 {
            if (snap.close - ema20).abs() < 0.002 * snap.close {
                return StrategyTag::Pullback;
            }
        }
        StrategyTag::Reversion
    }

    /// Full evaluation of one symbol's closed-bar history.
    pub fn evaluate(
        &self,
        symbol: &str,
        candles: &[Candle],
        funding_rate: Option<f64>,
        benchmark_change_pct: f64,
    ) -> Option<Signal> {
        let snap = self.snapshot(candles)?;
        let atr = snap.atr?;
        let breakdown = self.breakdown(candles, &snap, funding_rate, benchmark_change_pct);

        let high_rvol = snap.rvol.map(|r| r >= 2.5).unwrap_or(false);
        let threshold = if high_rvol {
            self.config.threshold_high_rvol
        } else {
            self.config.threshold
        };

        let direction = if breakdown.long > breakdown.short {
            Direction::Long
        } else if breakdown.short > breakdown.long {
            Direction::Short
        } else {
            return None; // tie
        };
        let score = breakdown.score(direction);
        if score < threshold {
            return None;
        }

        let entry_price = snap.close;
        let tag = self.tag(&snap);
        let stop_mult = if tag == StrategyTag::Breakout {
            self.config.stop_atr_mult_breakout
        } else {
            self.config.stop_atr_mult
        };
        let stop_distance = atr * stop_mult;
        if stop_distance < self.config.min_stop_frac * entry_price {
            debug!(symbol, stop_distance, "Signal rejected: stop too tight");
            return None;
        }

        let sign = direction.sign();
        let stop_price = entry_price - stop_distance * sign;
        let targets = TARGET_ATR_MULTS.map(|m| entry_price + atr * m * sign);

        let stop_frac = stop_distance / entry_price;
        let leverage = ((self.config.risk_per_trade / stop_frac).round() as i64)
            .clamp(self.config.min_leverage as i64, self.config.max_leverage as i64)
            as u32;

        debug!(
            symbol,
            %direction,
            score = format!("{score:.1}"),
            long = format!("{:.1}", breakdown.long),
            short = format!("{:.1}", breakdown.short),
            %tag,
            "Signal qualified"
        );

        Some(Signal {
            symbol: symbol.to_string(),
            direction,
            entry_price,
            stop_price,
            targets,
            leverage,
            created_at: Utc::now().timestamp_millis(),
            tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn scorer() -> SignalScorer {
        SignalScorer::new(AppConfig::load().unwrap().scoring)
    }

    /// Zigzag upward drift: +0.7 then -0.5, keeping RSI mid-range and
    /// slope positive while staying off the channel boundary.
    fn rising_zigzag(bars: usize, last_volume: f64) -> Vec<Candle> {
        let mut candles = Vec::with_capacity(bars);
        let mut close = 100.0;
        for i in 0..bars {
            let delta = if i % 2 == 0 { 0.7 } else { -0.5 };
            let open = close;
            close += delta;
            candles.push(Candle {
                open_time: i as i64 * 900_000,
                open,
                high: open.max(close) + 0.2,
                low: open.min(close) - 0.2,
                close,
                volume: 10.0,
            });
        }
        candles.last_mut().unwrap().volume = last_volume;
        candles
    }

    #[test]
    fn no_signal_below_history_gate() {
        let candles = rising_zigzag(50, 40.0);
        assert!(scorer().evaluate("TEST-USDT", &candles, None, 0.0).is_none());
    }

    #[test]
    fn volume_confirmed_uptrend_goes_long() {
        // Rising structure + close above EMA200 + positive slope +
        // volume surge clears the lowered threshold.
        let candles = rising_zigzag(240, 40.0);
        let signal = scorer().evaluate("TEST-USDT", &candles, None, 0.0).unwrap();
        assert_eq!(signal.direction, Direction::Long);
        assert_eq!(signal.tag, StrategyTag::Breakout);
        assert!(signal.stop_price < signal.entry_price);
        // Targets increase in the trade direction
        for w in signal.targets.windows(2) {
            assert!(w[1] > w[0]);
        }
        assert!(signal.targets[0] > signal.entry_price);
        assert!((3..=20).contains(&signal.leverage));
    }

    #[test]
    fn quiet_volume_fails_raised_threshold() {
        // Same structure without the volume surge: score stays below
        // the base threshold.
        let candles = rising_zigzag(240, 10.0);
        assert!(scorer().evaluate("TEST-USDT", &candles, None, 0.0).is_none());
    }

    #[test]
    fn aligned_moving_average_fan_rewards_the_trend_side() {
        let candles = rising_zigzag(240, 10.0);
        let s = scorer();
        let snap = s.snapshot(&candles).unwrap();
        let breakdown = s.breakdown(&candles, &snap, None, 0.0);

        // close > EMA20 > EMA50 on the rising tape
        assert!(breakdown
            .contributions
            .iter()
            .any(|c| c.label == "fan_aligned" && c.direction == Direction::Long));
        assert!(!breakdown
            .contributions
            .iter()
            .any(|c| c.label == "fan_aligned" && c.direction == Direction::Short));
    }

    #[test]
    fn extreme_funding_penalizes_the_crowded_side() {
        let candles = rising_zigzag(240, 40.0);
        let s = scorer();
        let snap = s.snapshot(&candles).unwrap();

        let neutral = s.breakdown(&candles, &snap, None, 0.0);
        let crowded = s.breakdown(&candles, &snap, Some(0.001), 0.0);
        assert!((neutral.long - crowded.long - 1.5).abs() < 1e-9);
        assert_eq!(neutral.short, crowded.short);
    }

    #[test]
    fn benchmark_risk_off_penalizes_longs() {
        let candles = rising_zigzag(240, 40.0);
        let s = scorer();
        let snap = s.snapshot(&candles).unwrap();

        let neutral = s.breakdown(&candles, &snap, None, 0.0);
        let risk_off = s.breakdown(&candles, &snap, None, -3.0);
        assert!((neutral.long - risk_off.long - 1.5).abs() < 1e-9);
    }

    #[test]
    fn stop_and_targets_are_symmetric_for_shorts() {
        // Mirror the zigzag downward to produce a short.
        let mut candles = Vec::new();
        let mut close = 200.0;
        for i in 0..240 {
            let delta = if i % 2 == 0 { -0.7 } else { 0.5 };
            let open = close;
            close += delta;
            candles.push(Candle {
                open_time: i as i64 * 900_000,
                open,
                high: open.max(close) + 0.2,
                low: open.min(close) - 0.2,
                close,
                volume: 10.0,
            });
        }
        candles.last_mut().unwrap().volume = 40.0;

        let signal = scorer().evaluate("TEST-USDT", &candles, None, 0.0).unwrap();
        assert_eq!(signal.direction, Direction::Short);
        assert!(signal.stop_price > signal.entry_price);
        assert!(signal.targets[0] < signal.entry_price);
        for w in signal.targets.windows(2) {
            assert!(w[1] < w[0]);
        }
    }

    #[test]
    fn tie_produces_no_signal() {
        // Flat tape: every structural/trend rule abstains, both sides
        // get at most the symmetric volume weight.
        let candles: Vec<Candle> = (0..240)
            .map(|i| Candle {
                open_time: i as i64 * 900_000,
                open: 100.0,
                high: 100.1,
                low: 99.9,
                close: 100.0,
                volume: 10.0,
            })
            .collect();
        assert!(scorer().evaluate("TEST-USDT", &candles, None, 0.0).is_none());
    }
}

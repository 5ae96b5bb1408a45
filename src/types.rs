//! Core types used throughout the scanner
//!
//! Defines candles, signals, active/closed trades and the small wire-level
//! structs shared between the exchange client and the selectors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for longs, -1.0 for shorts
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    /// Order side for the exchange API
    pub fn order_side(&self) -> &'static str {
        match self {
            Direction::Long => "buy",
            Direction::Short => "sell",
        }
    }

    /// Side that closes a position in this direction
    pub fn close_side(&self) -> &'static str {
        match self {
            Direction::Long => "sell",
            Direction::Short => "buy",
        }
    }

    /// Position side for the exchange API
    pub fn position_side(&self) -> &'static str {
        match self {
            Direction::Long => "long",
            Direction::Short => "short",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "LONG"),
            Direction::Short => write!(f, "SHORT"),
        }
    }
}

/// Why a trade left the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// Stop hit before any target was reached
    Stop,
    /// Stop hit after at least one target had been reached
    TrailingProfit,
    /// Fourth target reached, full close
    MaxTarget,
    /// Held longer than the configured ceiling
    TimeLimit,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Stop => write!(f, "STOP"),
            CloseReason::TrailingProfit => write!(f, "TRAILING_PROFIT"),
            CloseReason::MaxTarget => write!(f, "MAX_TARGET"),
            CloseReason::TimeLimit => write!(f, "TIME_LIMIT"),
        }
    }
}

/// Label attached to a signal describing which setup produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyTag {
    Breakout,
    Pullback,
    Reversion,
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyTag::Breakout => write!(f, "BREAKOUT"),
            StrategyTag::Pullback => write!(f, "PULLBACK"),
            StrategyTag::Reversion => write!(f, "REVERSION"),
        }
    }
}

/// One OHLCV bar. Immutable once closed; the forming bar is replaced in
/// place by the ingestor until the exchange confirms it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in milliseconds (start of period)
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    /// Volume in base currency
    pub volume: f64,
}

impl Candle {
    /// Whether the bar body closed in the candle's own favor
    pub fn is_bullish(&self) -> bool {
        self.close >= self.open
    }

    /// Parse a `[ts, o, h, l, c, vol, ...]` row of string fields, the wire
    /// shape shared by the REST kline endpoint and the websocket push.
    pub fn from_wire_row(row: &[serde_json::Value]) -> Option<Self> {
        if row.len() < 6 {
            return None;
        }
        let ts = match &row[0] {
            serde_json::Value::String(s) => s.parse::<i64>().ok()?,
            v => v.as_i64()?,
        };
        let field = |v: &serde_json::Value| -> Option<f64> {
            match v {
                serde_json::Value::String(s) => s.parse::<f64>().ok(),
                v => v.as_f64(),
            }
        };
        Some(Candle {
            open_time: ts,
            open: field(&row[1])?,
            high: field(&row[2])?,
            low: field(&row[3])?,
            close: field(&row[4])?,
            volume: field(&row[5])?,
        })
    }
}

/// A fully-specified trade candidate produced by the scoring engine.
/// Immutable after creation; the lifecycle manager copies the mutable
/// bits into an [`ActiveTrade`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_price: f64,
    /// Four staged target prices, increasing in the trade direction
    pub targets: [f64; 4],
    pub leverage: u32,
    pub created_at: i64,
    pub tag: StrategyTag,
}

impl Signal {
    /// Signed percent move from entry to `price`, positive when favorable
    pub fn price_change_pct(&self, price: f64) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (price - self.entry_price) / self.entry_price * self.direction.sign() * 100.0
    }

    /// Percent return on margin at `price`
    pub fn roi_pct(&self, price: f64) -> f64 {
        self.price_change_pct(price) * self.leverage as f64
    }
}

/// A signal accepted into management, tracked until closure.
///
/// Invariants kept by construction: at most one per symbol in the active
/// set, `hit_targets` only grows in ascending order, and the stop only
/// moves in the favorable direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveTrade {
    pub signal: Signal,
    /// Last price seen for the symbol; `None` until the feed delivers one
    pub current_price: Option<f64>,
    /// Trailed stop, starts at the signal's stop
    pub stop_price: f64,
    /// Target indices (1..=4) reached so far, ascending
    pub hit_targets: Vec<u8>,
    /// Position size in base units (0 when tracked paper-only)
    pub size: f64,
    /// Weighted return on margin marked at the current price
    pub unrealized_roi_pct: f64,
    pub updated_at: i64,
}

impl ActiveTrade {
    pub fn new(signal: Signal, size: f64) -> Self {
        let stop_price = signal.stop_price;
        let created_at = signal.created_at;
        Self {
            signal,
            current_price: None,
            stop_price,
            hit_targets: Vec::new(),
            size,
            unrealized_roi_pct: 0.0,
            updated_at: created_at,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.signal.symbol
    }

    pub fn direction(&self) -> Direction {
        self.signal.direction
    }

    /// Highest target index reached so far
    pub fn highest_hit(&self) -> Option<u8> {
        self.hit_targets.last().copied()
    }

    /// Whether `price` has reached target `idx` (1-based)
    pub fn target_reached(&self, price: f64, idx: u8) -> bool {
        let target = self.signal.targets[(idx - 1) as usize];
        match self.signal.direction {
            Direction::Long => price >= target,
            Direction::Short => price <= target,
        }
    }

    /// Whether `price` has reached the current (possibly trailed) stop
    pub fn stop_reached(&self, price: f64) -> bool {
        match self.signal.direction {
            Direction::Long => price <= self.stop_price,
            Direction::Short => price >= self.stop_price,
        }
    }

    /// Move the stop to `candidate` only if that tightens it. Returns
    /// true when the stop actually moved.
    pub fn trail_stop(&mut self, candidate: f64) -> bool {
        let improved = match self.signal.direction {
            Direction::Long => candidate > self.stop_price,
            Direction::Short => candidate < self.stop_price,
        };
        if improved {
            self.stop_price = candidate;
        }
        improved
    }
}

/// Terminal snapshot of a trade, appended to the bounded history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: String,
    pub direction: Direction,
    pub tag: StrategyTag,
    pub entry_price: f64,
    pub exit_price: f64,
    pub stop_price: f64,
    pub targets: [f64; 4],
    pub leverage: u32,
    pub hit_targets: Vec<u8>,
    pub close_reason: CloseReason,
    pub opened_at: i64,
    pub closed_at: i64,
    /// Size-weighted percent P&L across partial exits
    pub final_pnl_pct: f64,
    /// The same weighted P&L expressed as return on margin
    pub final_roi_pct: f64,
}

/// 24h ticker statistics for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    pub last: f64,
    pub open_24h: f64,
    /// 24h volume in base currency
    pub volume_24h: f64,
}

impl TickerStats {
    /// 24h turnover in quote currency
    pub fn notional_24h(&self) -> f64 {
        self.volume_24h * self.last
    }

    /// Signed 24h percent change
    pub fn change_pct(&self) -> f64 {
        if self.open_24h <= 0.0 {
            return 0.0;
        }
        (self.last - self.open_24h) / self.open_24h * 100.0
    }
}

/// Current funding rate of one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub rate: f64,
}

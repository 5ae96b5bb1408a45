//! Trade lifecycle manager
//!
//! Owns the transition of a qualified signal into an active trade and
//! its management through partial take-profits, the trailing stop and
//! closure. All book mutations happen synchronously under the write
//! lock; exchange and notification calls are collected and performed
//! after the lock is released, with preconditions re-validated where a
//! suspension could have raced an entry.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::config::LifecycleConfig;
use crate::exchange::{ExecutionAdapter, OrderRequest};
use crate::notify::Notifier;
use crate::types::{ActiveTrade, CloseReason, ClosedTrade, Signal};

/// Size fractions consumed by targets 1..=3; target 4 closes the rest
const TARGET_WEIGHTS: [f64; 3] = [0.40, 0.20, 0.20];

/// Active trades plus bounded closed-trade history
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TradeBook {
    pub active: HashMap<String, ActiveTrade>,
    /// Newest first
    pub history: VecDeque<ClosedTrade>,
}

impl TradeBook {
    pub fn push_history(&mut self, closed: ClosedTrade, cap: usize) {
        self.history.push_front(closed);
        while self.history.len() > cap {
            self.history.pop_back();
        }
    }
}

/// Percent price change consumed by the filled fractions plus the
/// remainder marked at `mark_pct`.
fn weighted_pnl_pct(signal: &Signal, hit_targets: &[u8], mark_pct: f64) -> f64 {
    let mut pnl = 0.0;
    let mut remaining = 1.0;
    for &t in hit_targets.iter().filter(|&&t| t <= 3) {
        let w = TARGET_WEIGHTS[(t - 1) as usize];
        pnl += w * signal.price_change_pct(signal.targets[(t - 1) as usize]);
        remaining -= w;
    }
    if hit_targets.contains(&4) {
        pnl += remaining * signal.price_change_pct(signal.targets[3]);
    } else {
        pnl += remaining * mark_pct;
    }
    pnl
}

/// Deferred side effect collected under the write lock
enum PostAction {
    ReplaceStop {
        symbol: String,
        trade: ActiveTrade,
        target_idx: u8,
    },
    Closed {
        closed: ClosedTrade,
        was_live: bool,
    },
}

pub struct TradeManager {
    config: LifecycleConfig,
    live_trading: bool,
    margin_per_trade: f64,
    adapter: Arc<dyn ExecutionAdapter>,
    notifier: Arc<Notifier>,
}

impl TradeManager {
    pub fn new(
        config: LifecycleConfig,
        live_trading: bool,
        margin_per_trade: f64,
        adapter: Arc<dyn ExecutionAdapter>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            live_trading,
            margin_per_trade,
            adapter,
            notifier,
        }
    }

    /// Try to open a trade for a qualified signal. Returns `true` when
    /// the trade entered the active set.
    ///
    /// When live trading is on and the exchange is reachable the entry
    /// order is placed first-class: a placement failure rolls the trade
    /// back out of the book. Otherwise the trade is tracked paper-only.
    pub async fn open(
        &self,
        book: &RwLock<TradeBook>,
        signal: Signal,
        live_price: f64,
    ) -> bool {
        let symbol = signal.symbol.clone();

        let go_live = self.live_trading && self.adapter.is_reachable();
        let size = if go_live {
            self.margin_per_trade * signal.leverage as f64 / signal.entry_price
        } else {
            0.0
        };

        // Reserve the slot before any await so a second signal for the
        // same symbol cannot slip in during placement.
        {
            let mut book = book.write().unwrap();
            if book.active.contains_key(&symbol) || book.active.len() >= self.config.max_active {
                return false;
            }
            let mut trade = ActiveTrade::new(signal.clone(), size);
            trade.current_price = Some(live_price);
            book.active.insert(symbol.clone(), trade);
        }

        if go_live {
            // Price-aware placement: if the market has already run past
            // the entry in the favorable direction, insist on a limit at
            // the signal price instead of chasing with a market order.
            let run_pct = signal.price_change_pct(live_price);
            let (order_type, price) = if run_pct > self.config.entry_tolerance_frac * 100.0 {
                ("limit", Some(signal.entry_price))
            } else {
                ("market", None)
            };
            let request = OrderRequest {
                symbol: symbol.clone(),
                direction: signal.direction,
                order_type,
                price,
                size,
                leverage: signal.leverage,
            };

            if let Err(e) = self.adapter.place_order(&request).await {
                warn!(symbol, error = %e, "Entry placement failed, rolling back");
                book.write().unwrap().active.remove(&symbol);
                return false;
            }
            if let Err(e) = self
                .adapter
                .place_stop(&symbol, signal.direction, signal.stop_price)
                .await
            {
                warn!(symbol, error = %e, "Initial stop placement failed");
            }
        }

        info!(
            symbol,
            direction = %signal.direction,
            entry = signal.entry_price,
            stop = signal.stop_price,
            leverage = signal.leverage,
            live = go_live,
            "📈 Trade opened"
        );
        let snapshot = book.read().unwrap().active.get(&symbol).cloned();
        if let Some(trade) = snapshot {
            self.notifier.notify_entry(&trade).await;
        }
        true
    }

    /// One management pass over every active trade. Returns the trades
    /// closed this tick, already recorded in history.
    pub async fn tick(
        &self,
        book: &RwLock<TradeBook>,
        prices: &HashMap<String, f64>,
        now_ms: i64,
    ) -> Vec<ClosedTrade> {
        let mut actions: Vec<PostAction> = Vec::new();

        {
            let mut book = book.write().unwrap();
            let symbols: Vec<String> = book.active.keys().cloned().collect();
            for symbol in symbols {
                let Some(price) = prices.get(&symbol).copied() else {
                    continue;
                };
                self.manage_one(&mut book, &symbol, price, now_ms, &mut actions);
            }
        }

        let mut closures = Vec::new();
        for action in actions {
            match action {
                PostAction::ReplaceStop {
                    symbol,
                    trade,
                    target_idx,
                } => {
                    if trade.size > 0.0 {
                        // Cancel-and-replace; a failure leaves the old
                        // exchange stop in place, which is the safer side.
                        if let Err(e) = self.adapter.cancel_stops(&symbol).await {
                            warn!(symbol, error = %e, "Stop cancel failed");
                        } else if let Err(e) = self
                            .adapter
                            .place_stop(&symbol, trade.direction(), trade.stop_price)
                            .await
                        {
                            warn!(symbol, error = %e, "Stop replace failed");
                        }
                    }
                    self.notifier.notify_target(&trade, target_idx).await;
                }
                PostAction::Closed { closed, was_live } => {
                    if was_live {
                        if let Err(e) = self
                            .adapter
                            .close_position(&closed.symbol, closed.direction)
                            .await
                        {
                            warn!(symbol = %closed.symbol, error = %e, "Exchange close failed");
                        }
                    }
                    self.notifier.notify_close(&closed).await;
                    closures.push(closed);
                }
            }
        }
        closures
    }

    /// Synchronous management of one trade under the write lock.
    fn manage_one(
        &self,
        book: &mut TradeBook,
        symbol: &str,
        price: f64,
        now_ms: i64,
        actions: &mut Vec<PostAction>,
    ) {
        let closure: Option<(f64, CloseReason)> = {
            let Some(trade) = book.active.get_mut(symbol) else {
                return;
            };
            trade.current_price = Some(price);
            trade.updated_at = now_ms;
            trade.unrealized_roi_pct = weighted_pnl_pct(
                &trade.signal,
                &trade.hit_targets,
                trade.signal.price_change_pct(price),
            ) * trade.signal.leverage as f64;

            // Stale timeout wins over everything else
            if now_ms - trade.signal.created_at >= self.config.max_hold_secs * 1000 {
                Some((price, CloseReason::TimeLimit))
            } else {
                // Targets strictly in order 1 -> 4
                let mut close = None;
                let next = trade.highest_hit().unwrap_or(0) + 1;
                for idx in next..=4 {
                    if !trade.target_reached(price, idx) {
                        break;
                    }
                    trade.hit_targets.push(idx);
                    if idx == 4 {
                        close = Some((trade.signal.targets[3], CloseReason::MaxTarget));
                        break;
                    }
                    // Trail: break-even after the first target, then
                    // ladder the stop one target behind. Only tightens.
                    let candidate = if idx == 1 {
                        trade.signal.entry_price
                    } else {
                        trade.signal.targets[(idx - 2) as usize]
                    };
                    if trade.trail_stop(candidate) {
                        actions.push(PostAction::ReplaceStop {
                            symbol: symbol.to_string(),
                            trade: trade.clone(),
                            target_idx: idx,
                        });
                    }
                }

                // Stop check, only if the trade survived the target pass
                if close.is_none() && trade.stop_reached(price) {
                    let reason = if trade.hit_targets.is_empty() {
                        CloseReason::Stop
                    } else {
                        CloseReason::TrailingProfit
                    };
                    close = Some((trade.stop_price, reason));
                }
                close
            }
        };

        if let Some((exit, reason)) = closure {
            if let Some((closed, was_live)) =
                Self::close_entry(book, symbol, exit, reason, now_ms, self.config.history_cap)
            {
                actions.push(PostAction::Closed { closed, was_live });
            }
        }
    }

    /// Remove a trade from the active set and record the closure.
    /// Idempotent: a symbol with no active trade is a no-op.
    fn close_entry(
        book: &mut TradeBook,
        symbol: &str,
        exit_price: f64,
        reason: CloseReason,
        now_ms: i64,
        history_cap: usize,
    ) -> Option<(ClosedTrade, bool)> {
        let trade = book.active.remove(symbol)?;
        let signal = &trade.signal;

        // Exit never reports worse than the best target already banked:
        // the exchange filled those partials at their own prices.
        let mut mark_pct = signal.price_change_pct(exit_price);
        if let Some(best) = trade.highest_hit() {
            let best_pct = signal.price_change_pct(signal.targets[(best - 1) as usize]);
            mark_pct = mark_pct.max(best_pct);
        }

        let final_pnl_pct = weighted_pnl_pct(signal, &trade.hit_targets, mark_pct);
        let final_roi_pct = final_pnl_pct * signal.leverage as f64;
        let was_live = trade.size > 0.0;

        let closed = ClosedTrade {
            symbol: symbol.to_string(),
            direction: signal.direction,
            tag: signal.tag,
            entry_price: signal.entry_price,
            exit_price,
            stop_price: trade.stop_price,
            targets: signal.targets,
            leverage: signal.leverage,
            hit_targets: trade.hit_targets.clone(),
            close_reason: reason,
            opened_at: signal.created_at,
            closed_at: now_ms,
            final_pnl_pct,
            final_roi_pct,
        };
        info!(
            symbol,
            reason = %reason,
            exit = exit_price,
            pnl_pct = format!("{final_pnl_pct:+.2}"),
            roi_pct = format!("{final_roi_pct:+.2}"),
            hits = ?closed.hit_targets,
            "📉 Trade closed"
        );
        book.push_history(closed.clone(), history_cap);
        Some((closed, was_live))
    }
}

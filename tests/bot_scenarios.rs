//! End-to-end scenarios across scoring and trade management

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chartist::config::{AppConfig, NotifyConfig};
use chartist::engine::{export_snapshot, import_snapshot};
use chartist::exchange::{ExchangeError, ExchangeResult, ExecutionAdapter, OrderRequest};
use chartist::lifecycle::{TradeBook, TradeManager};
use chartist::notify::Notifier;
use chartist::scoring::SignalScorer;
use chartist::types::{Candle, CloseReason, Direction, Signal, StrategyTag};

/// Adapter that accepts everything and counts nothing.
struct AcceptingAdapter;

#[async_trait]
impl ExecutionAdapter for AcceptingAdapter {
    async fn place_order(&self, _req: &OrderRequest) -> ExchangeResult<String> {
        Ok("order".to_string())
    }
    async fn place_stop(
        &self,
        _symbol: &str,
        _direction: Direction,
        _trigger_price: f64,
    ) -> ExchangeResult<String> {
        Ok("stop".to_string())
    }
    async fn cancel_stops(&self, _symbol: &str) -> ExchangeResult<()> {
        Ok(())
    }
    async fn close_position(&self, _symbol: &str, _direction: Direction) -> ExchangeResult<()> {
        Ok(())
    }
    fn is_reachable(&self) -> bool {
        true
    }
}

/// Adapter whose order placement always fails.
struct RejectingAdapter {
    attempts: AtomicUsize,
}

#[async_trait]
impl ExecutionAdapter for RejectingAdapter {
    async fn place_order(&self, _req: &OrderRequest) -> ExchangeResult<String> {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        Err(ExchangeError::Parse("connection reset".to_string()))
    }
    async fn place_stop(
        &self,
        _symbol: &str,
        _direction: Direction,
        _trigger_price: f64,
    ) -> ExchangeResult<String> {
        Ok("stop".to_string())
    }
    async fn cancel_stops(&self, _symbol: &str) -> ExchangeResult<()> {
        Ok(())
    }
    async fn close_position(&self, _symbol: &str, _direction: Direction) -> ExchangeResult<()> {
        Ok(())
    }
    fn is_reachable(&self) -> bool {
        true
    }
}

fn manager_with(adapter: Arc<dyn ExecutionAdapter>, live: bool) -> TradeManager {
    let config = AppConfig::load().unwrap();
    let notifier = Arc::new(Notifier::new(&NotifyConfig {
        bot_token: String::new(),
        chat_id: String::new(),
    }));
    TradeManager::new(
        config.lifecycle,
        live,
        config.bot.margin_per_trade,
        adapter,
        notifier,
    )
}

fn paper_manager() -> TradeManager {
    manager_with(Arc::new(AcceptingAdapter), false)
}

fn signal(symbol: &str) -> Signal {
    Signal {
        symbol: symbol.to_string(),
        direction: Direction::Long,
        entry_price: 100.0,
        stop_price: 98.0,
        targets: [101.0, 103.0, 106.0, 111.0],
        leverage: 10,
        created_at: 0,
        tag: StrategyTag::Pullback,
    }
}

fn prices(symbol: &str, price: f64) -> HashMap<String, f64> {
    HashMap::from([(symbol.to_string(), price)])
}

/// Zigzag upward drift with a volume surge on the final bar
fn trending_candles(bars: usize) -> Vec<Candle> {
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
    candles.last_mut().unwrap().volume = 40.0;
    candles
}

#[test]
fn short_history_is_a_quiet_no_decision() {
    let scorer = SignalScorer::new(AppConfig::load().unwrap().scoring);
    let candles = trending_candles(60);
    assert!(scorer.evaluate("NEW-USDT", &candles, None, 0.0).is_none());
}

#[tokio::test]
async fn scored_signal_runs_the_full_lifecycle() {
    let scorer = SignalScorer::new(AppConfig::load().unwrap().scoring);
    let candles = trending_candles(240);
    let signal = scorer
        .evaluate("TREND-USDT", &candles, None, 0.0)
        .expect("volume-confirmed uptrend should qualify");
    assert_eq!(signal.direction, Direction::Long);

    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    assert!(manager.open(&book, signal.clone(), signal.entry_price).await);

    // Ride through targets 1 and 2, then retrace through the trailed stop
    manager.tick(&book, &prices("TREND-USDT", signal.targets[0]), 1_000).await;
    manager.tick(&book, &prices("TREND-USDT", signal.targets[1]), 2_000).await;
    {
        let guard = book.read().unwrap();
        let trade = &guard.active["TREND-USDT"];
        assert_eq!(trade.hit_targets, vec![1, 2]);
        assert_eq!(trade.stop_price, signal.targets[0]);
    }

    let closed = manager
        .tick(&book, &prices("TREND-USDT", signal.stop_price), 3_000)
        .await;
    assert_eq!(closed.len(), 1);
    let c = &closed[0];
    assert_eq!(c.close_reason, CloseReason::TrailingProfit);
    assert_eq!(c.exit_price, signal.targets[0]);

    // 40% banked at T1, 20% at T2, remainder marked at the best banked
    // target because the raw exit sits below it
    let p1 = signal.price_change_pct(signal.targets[0]);
    let p2 = signal.price_change_pct(signal.targets[1]);
    let expected = 0.4 * p1 + 0.2 * p2 + 0.4 * p2;
    assert!((c.final_pnl_pct - expected).abs() < 1e-9);
    assert!(book.read().unwrap().active.is_empty());
    assert_eq!(book.read().unwrap().history.len(), 1);
}

#[tokio::test]
async fn active_set_is_unique_and_capped() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());

    for i in 0..30 {
        assert!(manager.open(&book, signal(&format!("S{i}-USDT")), 100.0).await);
    }
    // Duplicate symbol and over-cap entries both bounce
    assert!(!manager.open(&book, signal("S0-USDT"), 100.0).await);
    assert!(!manager.open(&book, signal("OVERFLOW-USDT"), 100.0).await);
    assert_eq!(book.read().unwrap().active.len(), 30);
}

#[tokio::test]
async fn rejected_placement_leaves_no_trace() {
    let adapter = Arc::new(RejectingAdapter {
        attempts: AtomicUsize::new(0),
    });
    let manager = manager_with(adapter.clone(), true);
    let book = RwLock::new(TradeBook::default());

    assert!(!manager.open(&book, signal("FAIL-USDT"), 100.0).await);
    assert_eq!(adapter.attempts.load(Ordering::Relaxed), 1);
    let guard = book.read().unwrap();
    assert!(guard.active.is_empty());
    assert!(guard.history.is_empty());
}

#[tokio::test]
async fn snapshot_restores_mid_flight_trades() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    manager.open(&book, signal("PERSIST-USDT"), 100.0).await;
    manager.tick(&book, &prices("PERSIST-USDT", 101.5), 1_000).await;

    let raw = export_snapshot(&book, 0.5);
    let restored = RwLock::new(TradeBook::default());
    import_snapshot(&restored, &raw).unwrap();

    {
        let guard = restored.read().unwrap();
        let trade = &guard.active["PERSIST-USDT"];
        assert_eq!(trade.hit_targets, vec![1]);
        assert_eq!(trade.stop_price, 100.0);
    }

    // Management continues seamlessly on the restored book
    let closed = manager
        .tick(&restored, &prices("PERSIST-USDT", 99.5), 2_000)
        .await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].close_reason, CloseReason::TrailingProfit);
    assert_eq!(closed[0].exit_price, 100.0);
}

#[tokio::test]
async fn oscillation_never_loosens_the_stop() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    manager.open(&book, signal("OSC-USDT"), 100.0).await;

    manager.tick(&book, &prices("OSC-USDT", 101.5), 1_000).await;
    assert_eq!(book.read().unwrap().active["OSC-USDT"].stop_price, 100.0);

    // Pull back above the stop: nothing moves, nothing closes
    manager.tick(&book, &prices("OSC-USDT", 100.4), 2_000).await;
    {
        let guard = book.read().unwrap();
        assert_eq!(guard.active["OSC-USDT"].stop_price, 100.0);
        assert_eq!(guard.active["OSC-USDT"].hit_targets, vec![1]);
    }

    // New high ladders the stop up, never down
    manager.tick(&book, &prices("OSC-USDT", 103.2), 3_000).await;
    assert_eq!(book.read().unwrap().active["OSC-USDT"].stop_price, 101.0);

    let closed = manager.tick(&book, &prices("OSC-USDT", 100.9), 4_000).await;
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_price, 101.0);
}

#[tokio::test]
async fn fourth_target_is_a_forced_full_close() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    manager.open(&book, signal("MOON-USDT"), 100.0).await;

    let closed = manager.tick(&book, &prices("MOON-USDT", 115.0), 1_000).await;
    assert_eq!(closed.len(), 1);
    let c = &closed[0];
    assert_eq!(c.close_reason, CloseReason::MaxTarget);
    assert_eq!(c.hit_targets, vec![1, 2, 3, 4]);
    // Exit is the target price, not the overshooting live price
    assert_eq!(c.exit_price, 111.0);
    let expected = 0.4 * 1.0 + 0.2 * 3.0 + 0.2 * 6.0 + 0.2 * 11.0;
    assert!((c.final_pnl_pct - expected).abs() < 1e-9);
}

#[tokio::test]
async fn stale_trades_are_evicted_on_time() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    manager.open(&book, signal("SLOW-USDT"), 100.0).await;

    // Within the hold ceiling: untouched
    let early = manager
        .tick(&book, &prices("SLOW-USDT", 100.2), 7 * 3600 * 1000)
        .await;
    assert!(early.is_empty());

    let late = manager
        .tick(&book, &prices("SLOW-USDT", 100.2), 9 * 3600 * 1000)
        .await;
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].close_reason, CloseReason::TimeLimit);
    assert_eq!(late[0].exit_price, 100.2);
}

#[tokio::test]
async fn double_closure_is_a_no_op() {
    let manager = paper_manager();
    let book = RwLock::new(TradeBook::default());
    manager.open(&book, signal("ONCE-USDT"), 100.0).await;

    let first = manager.tick(&book, &prices("ONCE-USDT", 97.0), 1_000).await;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].close_reason, CloseReason::Stop);

    let second = manager.tick(&book, &prices("ONCE-USDT", 96.0), 2_000).await;
    assert!(second.is_empty());
    assert_eq!(book.read().unwrap().history.len(), 1);
}

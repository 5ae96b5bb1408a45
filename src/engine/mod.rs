//! Engine: aggregate state and the single-writer event loop
//!
//! One task owns every mutation: candle contexts, watch-list wiring,
//! scoring triggers and the lifecycle tick all run inside the
//! `tokio::select!` loop below. The inspection API shares only the
//! trade book (behind a lock taken briefly, never across an await) and
//! a few liveness atomics.

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::exchange::{ExchangeClient, ExecutionAdapter};
use crate::ingest::{IngestCommand, IngestEvent, Ingestor};
use crate::lifecycle::{TradeBook, TradeManager};
use crate::notify::Notifier;
use crate::persistence::TradeLog;
use crate::scoring::SignalScorer;
use crate::store::StateStore;
use crate::types::Candle;
use crate::universe::UniverseSelector;

/// Per-symbol candle state. Created when a symbol enters the
/// watch-list (backfilled first); kept after eviction but unsubscribed.
#[derive(Debug, Default)]
pub struct InstrumentContext {
    pub candles: VecDeque<Candle>,
    pub funding_rate: Option<f64>,
    pub subscribed: bool,
}

impl InstrumentContext {
    pub fn seed(candles: Vec<Candle>, cap: usize) -> Self {
        let mut deque: VecDeque<Candle> = candles.into();
        while deque.len() > cap {
            deque.pop_front();
        }
        Self {
            candles: deque,
            funding_rate: None,
            subscribed: true,
        }
    }

    /// Apply one bar update. Same open time replaces the forming
    /// candle; a newer open time appends and evicts past `cap`; stale
    /// updates are dropped.
    pub fn apply_bar(&mut self, candle: Candle, cap: usize) {
        match self.candles.back_mut() {
            Some(last) if last.open_time == candle.open_time => *last = candle,
            Some(last) if candle.open_time > last.open_time => {
                self.candles.push_back(candle);
                while self.candles.len() > cap {
                    self.candles.pop_front();
                }
            }
            None => self.candles.push_back(candle),
            _ => {}
        }
    }
}

/// State shared with the inspection API
pub struct SharedState {
    pub book: RwLock<TradeBook>,
    pub feed_connected: AtomicBool,
    pub exchange_reachable: AtomicBool,
    pub store_reachable: AtomicBool,
    pub last_bar_ms: AtomicI64,
    pub watchlist_len: AtomicUsize,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            book: RwLock::new(TradeBook::default()),
            feed_connected: AtomicBool::new(false),
            exchange_reachable: AtomicBool::new(false),
            store_reachable: AtomicBool::new(false),
            last_bar_ms: AtomicI64::new(0),
            watchlist_len: AtomicUsize::new(0),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// The opaque state snapshot persisted to the store
#[derive(Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub book: TradeBook,
    pub benchmark_change_pct: f64,
    pub saved_at: i64,
}

pub fn export_snapshot(book: &RwLock<TradeBook>, benchmark_change_pct: f64) -> String {
    let guard = book.read().unwrap();
    let snapshot = Snapshot {
        book: TradeBook {
            active: guard.active.clone(),
            history: guard.history.clone(),
        },
        benchmark_change_pct,
        saved_at: Utc::now().timestamp_millis(),
    };
    serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
}

pub fn import_snapshot(book: &RwLock<TradeBook>, raw: &str) -> Result<f64> {
    let snapshot: Snapshot = serde_json::from_str(raw)?;
    let mut guard = book.write().unwrap();
    guard.active = snapshot.book.active;
    guard.history = snapshot.book.history;
    info!(
        active = guard.active.len(),
        history = guard.history.len(),
        "State snapshot restored"
    );
    Ok(snapshot.benchmark_change_pct)
}

pub struct Engine {
    config: AppConfig,
    exchange: Arc<ExchangeClient>,
    scorer: SignalScorer,
    manager: TradeManager,
    selector: UniverseSelector,
    store: Arc<StateStore>,
    trade_log: TradeLog,
    shared: Arc<SharedState>,
    contexts: HashMap<String, InstrumentContext>,
    prices: HashMap<String, f64>,
    benchmark_change_pct: f64,
}

impl Engine {
    pub fn new(config: AppConfig, shared: Arc<SharedState>) -> Self {
        let exchange = Arc::new(ExchangeClient::new(&config.exchange));
        let notifier = Arc::new(Notifier::new(&config.notify));
        let scorer = SignalScorer::new(config.scoring.clone());
        let manager = TradeManager::new(
            config.lifecycle.clone(),
            config.bot.live_trading && config.has_credentials(),
            config.bot.margin_per_trade,
            exchange.clone() as Arc<dyn ExecutionAdapter>,
            notifier,
        );
        let selector = UniverseSelector::new(config.universe.clone());
        let store = Arc::new(StateStore::new(&config.store));
        let trade_log = TradeLog::new(
            &config.persistence.data_dir,
            config.persistence.csv_enabled,
        );

        Self {
            config,
            exchange,
            scorer,
            manager,
            selector,
            store,
            trade_log,
            shared,
            contexts: HashMap::new(),
            prices: HashMap::new(),
            benchmark_change_pct: 0.0,
        }
    }

    /// Run until shutdown. Restores the snapshot, wires up the
    /// ingestor, then drives all state from one select loop.
    pub async fn run(mut self) -> Result<()> {
        if let Some(raw) = self.store.load().await {
            match import_snapshot(&self.shared.book, &raw) {
                Ok(benchmark) => self.benchmark_change_pct = benchmark,
                Err(e) => warn!(error = %e, "Snapshot restore failed, starting clean"),
            }
        }

        let (event_tx, mut events) = mpsc::channel::<IngestEvent>(1024);
        let (commands, command_rx) = mpsc::channel::<IngestCommand>(64);
        let ingestor = Ingestor::new(
            self.config.ingest.clone(),
            self.config.exchange.ws_url.clone(),
        );
        let ingest_handle = tokio::spawn(async move {
            if let Err(e) = ingestor.run(event_tx, command_rx).await {
                error!(error = %e, "Ingestor exited");
            }
        });

        self.refresh_universe(&commands).await;

        let mut lifecycle_tick =
            tokio::time::interval(Duration::from_secs(self.config.lifecycle.tick_secs));
        let mut universe_tick =
            tokio::time::interval(Duration::from_secs(self.config.universe.refresh_secs));
        universe_tick.tick().await; // the initial refresh already ran

        info!("🚀 Engine loop started");
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_ingest_event(event).await,
                        None => {
                            warn!("Ingest channel closed");
                            break;
                        }
                    }
                }
                _ = lifecycle_tick.tick() => {
                    self.run_lifecycle_tick().await;
                }
                _ = universe_tick.tick() => {
                    self.refresh_universe(&commands).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(commands);
        ingest_handle.abort();
        self.store
            .save(&export_snapshot(&self.shared.book, self.benchmark_change_pct))
            .await;
        info!("Engine stopped");
        Ok(())
    }

    async fn handle_ingest_event(&mut self, event: IngestEvent) {
        match event {
            IngestEvent::Connected => {
                self.shared.feed_connected.store(true, Ordering::Relaxed);
            }
            IngestEvent::Disconnected => {
                self.shared.feed_connected.store(false, Ordering::Relaxed);
            }
            IngestEvent::Bar {
                symbol,
                candle,
                confirmed,
            } => {
                self.prices.insert(symbol.clone(), candle.close);
                self.shared
                    .last_bar_ms
                    .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

                let Some(ctx) = self.contexts.get_mut(&symbol) else {
                    return; // late push for an unsubscribed symbol
                };
                ctx.apply_bar(candle, self.config.ingest.history_cap);

                if confirmed {
                    self.maybe_score(&symbol).await;
                }
            }
        }
    }

    /// A closed bar is the sole scoring trigger, and only when the
    /// symbol is idle and the active set has room.
    async fn maybe_score(&mut self, symbol: &str) {
        {
            let book = self.shared.book.read().unwrap();
            if book.active.contains_key(symbol)
                || book.active.len() >= self.config.lifecycle.max_active
            {
                return;
            }
        }
        let Some(ctx) = self.contexts.get_mut(symbol) else {
            return;
        };
        let candles = ctx.candles.make_contiguous();
        let funding = ctx.funding_rate;
        let Some(signal) =
            self.scorer
                .evaluate(symbol, candles, funding, self.benchmark_change_pct)
        else {
            return;
        };

        let live_price = self.prices.get(symbol).copied().unwrap_or(signal.entry_price);
        // Preconditions are re-validated inside open(): the read above
        // only short-circuits the (comparatively expensive) scoring.
        if self.manager.open(&self.shared.book, signal, live_price).await {
            self.persist().await;
        }
    }

    async fn run_lifecycle_tick(&mut self) {
        let now_ms = Utc::now().timestamp_millis();
        let closed = self
            .manager
            .tick(&self.shared.book, &self.prices, now_ms)
            .await;

        self.shared
            .exchange_reachable
            .store(self.exchange.is_reachable(), Ordering::Relaxed);
        self.shared
            .store_reachable
            .store(self.store.is_reachable(), Ordering::Relaxed);

        if closed.is_empty() {
            return;
        }
        for trade in &closed {
            if let Err(e) = self.trade_log.append(trade) {
                warn!(symbol = %trade.symbol, error = %e, "CSV append failed");
            }
        }
        self.persist().await;
    }

    async fn refresh_universe(&mut self, commands: &mpsc::Sender<IngestCommand>) {
        let update = match self.selector.refresh(&self.exchange).await {
            Ok(update) => update,
            Err(e) => {
                // Transient: keep the previous watch-list until the
                // next scheduled refresh.
                warn!(error = %e, "Universe refresh failed");
                return;
            }
        };

        self.benchmark_change_pct = update.benchmark_change_pct;
        self.shared
            .watchlist_len
            .store(update.watchlist.len(), Ordering::Relaxed);
        for (symbol, rate) in &update.funding {
            if let Some(ctx) = self.contexts.get_mut(symbol) {
                ctx.funding_rate = Some(*rate);
            }
        }

        // Entrants are backfilled before the live subscription so the
        // first streamed bar lands on a full history.
        let mut subscribed = Vec::new();
        for symbol in &update.entered {
            match self
                .exchange
                .get_candles(
                    symbol,
                    &self.config.ingest.timeframe,
                    self.config.ingest.history_cap,
                )
                .await
            {
                Ok(candles) => {
                    let mut ctx =
                        InstrumentContext::seed(candles, self.config.ingest.history_cap);
                    ctx.funding_rate = update.funding.get(symbol).copied();
                    self.contexts.insert(symbol.clone(), ctx);
                    subscribed.push(symbol.clone());
                }
                Err(e) => {
                    warn!(symbol, error = %e, "Backfill failed, skipping symbol");
                }
            }
        }

        for symbol in &update.left {
            if let Some(ctx) = self.contexts.get_mut(symbol) {
                ctx.subscribed = false;
            }
        }

        if !update.left.is_empty() {
            let _ = commands
                .send(IngestCommand::Unsubscribe(update.left.clone()))
                .await;
        }
        if !subscribed.is_empty() {
            let _ = commands.send(IngestCommand::Subscribe(subscribed)).await;
        }
    }

    async fn persist(&self) {
        self.store
            .save(&export_snapshot(&self.shared.book, self.benchmark_change_pct))
            .await;
    }
}

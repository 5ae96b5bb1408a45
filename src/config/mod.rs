//! Configuration management
//!
//! Loads from optional config files + environment variables via .env

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub bot: BotConfig,
    pub exchange: ExchangeConfig,
    pub universe: UniverseConfig,
    pub ingest: IngestConfig,
    pub scoring: ScoringConfig,
    pub lifecycle: LifecycleConfig,
    pub store: StoreConfig,
    pub notify: NotifyConfig,
    pub api: ApiConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Version tag for logging and CSV
    pub tag: String,
    /// Place real orders when the exchange is reachable
    pub live_trading: bool,
    /// Margin per trade in quote currency
    pub margin_per_trade: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    /// REST API base URL
    pub rest_url: String,
    /// Public websocket URL
    pub ws_url: String,
    /// API key (empty = paper mode only)
    pub api_key: String,
    pub api_secret: String,
    pub api_passphrase: String,
    /// Request timeout in milliseconds
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniverseConfig {
    /// Watch-list refresh interval in seconds
    pub refresh_secs: u64,
    /// Maximum watch-list size
    pub watchlist_size: usize,
    /// Minimum 24h notional volume in quote currency
    pub min_volume: f64,
    /// Settlement currency suffix for instrument filtering
    pub quote_currency: String,
    /// Benchmark instrument for the market-bias reading
    pub benchmark_symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Candle timeframe for the bar streams
    pub timeframe: String,
    /// Per-symbol candle history cap
    pub history_cap: usize,
    /// Reconnect delay in milliseconds (fixed, not exponential)
    pub reconnect_delay_ms: u64,
    /// Ping cadence in seconds
    pub ping_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Minimum closed bars before a symbol is scored
    pub min_bars: usize,
    /// RSI period
    pub rsi_period: usize,
    /// ATR period
    pub atr_period: usize,
    /// Slope lookback in bars
    pub slope_period: usize,
    /// Relative-volume lookback in bars
    pub rvol_period: usize,
    /// Donchian channel lookback in bars
    pub donchian_period: usize,
    /// Base qualification threshold
    pub threshold: f64,
    /// Lower threshold applied when volume is exceptional
    pub threshold_high_rvol: f64,
    /// Stop distance as a multiple of ATR
    pub stop_atr_mult: f64,
    /// Stop multiple for breakout-tagged signals
    pub stop_atr_mult_breakout: f64,
    /// Minimum stop distance as a fraction of price
    pub min_stop_frac: f64,
    /// Target risk fraction used to derive leverage
    pub risk_per_trade: f64,
    pub min_leverage: u32,
    pub max_leverage: u32,
    /// Funding-rate penalty threshold (absolute, e.g. 0.0005 = 0.05%)
    pub funding_extreme: f64,
    /// Benchmark 24h move that penalizes the opposing side, in percent
    pub benchmark_extreme_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Management tick interval in seconds
    pub tick_secs: u64,
    /// Maximum simultaneously active trades
    pub max_active: usize,
    /// Stale-trade ceiling in seconds
    pub max_hold_secs: i64,
    /// Closed-trade history retention
    pub history_cap: usize,
    /// Entry price tolerance before switching to a limit order, as a fraction
    pub entry_tolerance_frac: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// KV store REST URL (empty disables persistence)
    pub url: String,
    /// Bearer token
    pub token: String,
    /// Snapshot key
    pub key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifyConfig {
    /// Telegram bot token (empty disables notifications)
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Data directory for the CSV trade log
    pub data_dir: String,
    /// Enable CSV logging of closed trades
    pub csv_enabled: bool,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file first
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .set_default("bot.tag", env!("CARGO_PKG_VERSION"))?
            .set_default("bot.live_trading", false)?
            .set_default("bot.margin_per_trade", 10.0)?
            // Exchange defaults
            .set_default("exchange.rest_url", "https://openapi.blofin.com")?
            .set_default("exchange.ws_url", "wss://openapi.blofin.com/ws/public")?
            .set_default("exchange.api_key", "")?
            .set_default("exchange.api_secret", "")?
            .set_default("exchange.api_passphrase", "")?
            .set_default("exchange.timeout_ms", 10_000)?
            // Universe defaults
            .set_default("universe.refresh_secs", 600)?
            .set_default("universe.watchlist_size", 200)?
            .set_default("universe.min_volume", 500_000.0)?
            .set_default("universe.quote_currency", "USDT")?
            .set_default("universe.benchmark_symbol", "BTC-USDT")?
            // Ingest defaults
            .set_default("ingest.timeframe", "15m")?
            .set_default("ingest.history_cap", 300)?
            .set_default("ingest.reconnect_delay_ms", 5000)?
            .set_default("ingest.ping_secs", 15)?
            // Scoring defaults
            .set_default("scoring.min_bars", 100)?
            .set_default("scoring.rsi_period", 7)?
            .set_default("scoring.atr_period", 14)?
            .set_default("scoring.slope_period", 20)?
            .set_default("scoring.rvol_period", 20)?
            .set_default("scoring.donchian_period", 96)?
            .set_default("scoring.threshold", 6.0)?
            .set_default("scoring.threshold_high_rvol", 4.5)?
            .set_default("scoring.stop_atr_mult", 0.75)?
            .set_default("scoring.stop_atr_mult_breakout", 1.1)?
            .set_default("scoring.min_stop_frac", 0.002)?
            .set_default("scoring.risk_per_trade", 0.10)?
            .set_default("scoring.min_leverage", 3)?
            .set_default("scoring.max_leverage", 20)?
            .set_default("scoring.funding_extreme", 0.0005)?
            .set_default("scoring.benchmark_extreme_pct", 2.0)?
            // Lifecycle defaults
            .set_default("lifecycle.tick_secs", 2)?
            .set_default("lifecycle.max_active", 30)?
            .set_default("lifecycle.max_hold_secs", 28_800)?
            .set_default("lifecycle.history_cap", 300)?
            .set_default("lifecycle.entry_tolerance_frac", 0.002)?
            // Store defaults
            .set_default("store.url", "")?
            .set_default("store.token", "")?
            .set_default("store.key", "chartist:state")?
            // Notify defaults
            .set_default("notify.bot_token", "")?
            .set_default("notify.chat_id", "")?
            // API defaults
            .set_default("api.enabled", true)?
            .set_default("api.port", 8080)?
            // Persistence defaults
            .set_default("persistence.data_dir", "./data")?
            .set_default("persistence.csv_enabled", true)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (CHARTIST_*)
            .add_source(Environment::with_prefix("CHARTIST").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "tag={} live={} tf={} watchlist={} max_active={} threshold={:.1} api_port={}",
            self.bot.tag,
            self.bot.live_trading,
            self.ingest.timeframe,
            self.universe.watchlist_size,
            self.lifecycle.max_active,
            self.scoring.threshold,
            self.api.port
        )
    }

    /// Whether exchange credentials are configured
    pub fn has_credentials(&self) -> bool {
        !self.exchange.api_key.is_empty() && !self.exchange.api_secret.is_empty()
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

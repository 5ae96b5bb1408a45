//! Exchange REST client and execution adapter
//!
//! Thin signed client for a Blofin-style USDT-perp API. Market-data
//! calls are unauthenticated; trading calls carry an HMAC-SHA256
//! signature over `path + method + timestamp + nonce + body`.
//!
//! Every error here is transient-network class: callers log it, abandon
//! the current cycle and retry on the next natural schedule. The client
//! keeps a reachability flag so the rest of the bot can degrade to
//! paper tracking instead of failing.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ExchangeConfig;
use crate::types::{Candle, Direction, FundingRate, TickerStats};

type HmacSha256 = Hmac<Sha256>;

/// Errors surfaced by the exchange client
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("api error code {code}: {msg}")]
    Api { code: String, msg: String },
    #[error("unexpected response shape: {0}")]
    Parse(String),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Order placement request
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub direction: Direction,
    /// "market" or "limit"
    pub order_type: &'static str,
    /// Limit price, ignored for market orders
    pub price: Option<f64>,
    /// Size in contracts/base units
    pub size: f64,
    pub leverage: u32,
}

/// The execution surface the lifecycle manager talks to.
///
/// Implemented by [`ExchangeClient`] for real trading and by in-memory
/// stubs in tests; the manager never needs to know which it has.
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Place an entry order. Returns the exchange order id.
    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<String>;

    /// Place a conditional stop order for an open position.
    async fn place_stop(
        &self,
        symbol: &str,
        direction: Direction,
        trigger_price: f64,
    ) -> ExchangeResult<String>;

    /// Cancel all pending stop orders for a symbol.
    async fn cancel_stops(&self, symbol: &str) -> ExchangeResult<()>;

    /// Close whatever position remains for a symbol at market.
    async fn close_position(&self, symbol: &str, direction: Direction) -> ExchangeResult<()>;

    /// Whether the adapter has recently reached its backend.
    fn is_reachable(&self) -> bool;
}

/// Signed REST client
pub struct ExchangeClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    api_passphrase: String,
    reachable: AtomicBool,
}

impl ExchangeClient {
    pub fn new(config: &ExchangeConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            api_passphrase: config.api_passphrase.clone(),
            reachable: AtomicBool::new(true),
        }
    }

    /// Signature: hex HMAC-SHA256 of `path + method + timestamp + nonce
    /// + body`, then the hex string itself base64-encoded.
    fn sign(&self, path: &str, method: &str, timestamp: &str, nonce: &str, body: &str) -> String {
        let prehash = format!("{path}{method}{timestamp}{nonce}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(prehash.as_bytes());
        let hex_sig = hex::encode(mac.finalize().into_bytes());
        general_purpose::STANDARD.encode(hex_sig.as_bytes())
    }

    fn mark(&self, ok: bool) {
        self.reachable.store(ok, Ordering::Relaxed);
    }

    /// Unwrap the `{code, msg, data}` envelope, treating any non-"0"
    /// code as an API error.
    fn unwrap_envelope(body: Value) -> ExchangeResult<Value> {
        let code = body
            .get("code")
            .map(|c| match c {
                Value::String(s) => s.clone(),
                v => v.to_string(),
            })
            .unwrap_or_default();
        if code != "0" {
            let msg = body
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("")
                .to_string();
            return Err(ExchangeError::Api { code, msg });
        }
        body.get("data")
            .cloned()
            .ok_or_else(|| ExchangeError::Parse("envelope without data".into()))
    }

    async fn get(&self, path: &str) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let result = async {
            let resp = self.client.get(&url).send().await?;
            let body: Value = resp.json().await?;
            Self::unwrap_envelope(body)
        }
        .await;
        self.mark(result.is_ok() || matches!(result, Err(ExchangeError::Api { .. })));
        result
    }

    async fn post_signed(&self, path: &str, payload: &Value) -> ExchangeResult<Value> {
        let url = format!("{}{}", self.base_url, path);
        let body = payload.to_string();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let nonce = Uuid::new_v4().to_string();
        let signature = self.sign(path, "POST", &timestamp, &nonce, &body);

        let result = async {
            let resp = self
                .client
                .post(&url)
                .header("ACCESS-KEY", &self.api_key)
                .header("ACCESS-SIGN", signature)
                .header("ACCESS-TIMESTAMP", &timestamp)
                .header("ACCESS-NONCE", &nonce)
                .header("ACCESS-PASSPHRASE", &self.api_passphrase)
                .header("Content-Type", "application/json")
                .body(body)
                .send()
                .await?;
            let body: Value = resp.json().await?;
            Self::unwrap_envelope(body)
        }
        .await;
        self.mark(result.is_ok() || matches!(result, Err(ExchangeError::Api { .. })));
        result
    }

    /// Fetch 24h stats for every instrument.
    pub async fn get_tickers(&self) -> ExchangeResult<Vec<TickerStats>> {
        let data = self.get("/api/v1/market/tickers").await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("tickers: expected array".into()))?;

        let parse = |row: &Value| -> Option<TickerStats> {
            let field = |key: &str| row.get(key)?.as_str()?.parse::<f64>().ok();
            Some(TickerStats {
                symbol: row.get("instId")?.as_str()?.to_string(),
                last: field("last")?,
                open_24h: field("open24h")?,
                volume_24h: field("vol24h")?,
            })
        };
        Ok(rows.iter().filter_map(parse).collect())
    }

    /// Fetch up to `limit` candles for one symbol. The wire delivers
    /// newest-first; the result is reversed to ascending open time.
    pub async fn get_candles(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let path =
            format!("/api/v1/market/candles?instId={symbol}&bar={timeframe}&limit={limit}");
        let data = self.get(&path).await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("candles: expected array".into()))?;

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| Candle::from_wire_row(row.as_array()?))
            .collect();
        candles.reverse();
        Ok(candles)
    }

    /// Fetch current funding rates for all instruments.
    pub async fn get_funding_rates(&self) -> ExchangeResult<Vec<FundingRate>> {
        let data = self.get("/api/v1/market/funding-rate").await?;
        let rows = data
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("funding: expected array".into()))?;

        let parse = |row: &Value| -> Option<FundingRate> {
            Some(FundingRate {
                symbol: row.get("instId")?.as_str()?.to_string(),
                rate: row.get("fundingRate")?.as_str()?.parse().ok()?,
            })
        };
        Ok(rows.iter().filter_map(parse).collect())
    }

    async fn set_leverage(&self, symbol: &str, direction: Direction, leverage: u32) {
        let payload = json!({
            "instId": symbol,
            "leverage": leverage.to_string(),
            "marginMode": "cross",
            "positionSide": direction.position_side(),
        });
        // Leverage changes are advisory; the order itself still goes out.
        if let Err(e) = self.post_signed("/api/v1/account/set-leverage", &payload).await {
            warn!(symbol, leverage, error = %e, "set-leverage failed");
        }
    }
}

#[async_trait]
impl ExecutionAdapter for ExchangeClient {
    async fn place_order(&self, req: &OrderRequest) -> ExchangeResult<String> {
        self.set_leverage(&req.symbol, req.direction, req.leverage).await;

        let mut payload = json!({
            "instId": req.symbol,
            "marginMode": "cross",
            "positionSide": req.direction.position_side(),
            "side": req.direction.order_side(),
            "orderType": req.order_type,
            "size": format!("{}", req.size),
        });
        if req.order_type == "limit" {
            if let Some(price) = req.price {
                payload["price"] = json!(format!("{price}"));
            }
        }

        let data = self.post_signed("/api/v1/trade/order", &payload).await?;
        let order_id = data
            .get(0)
            .and_then(|o| o.get("orderId"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Parse("order: missing orderId".into()))?;
        debug!(symbol = %req.symbol, order_id, "order placed");
        Ok(order_id.to_string())
    }

    async fn place_stop(
        &self,
        symbol: &str,
        direction: Direction,
        trigger_price: f64,
    ) -> ExchangeResult<String> {
        let payload = json!({
            "instId": symbol,
            "marginMode": "cross",
            "positionSide": direction.position_side(),
            "side": direction.close_side(),
            "slTriggerPrice": format!("{trigger_price}"),
            // -1 = execute at market once triggered
            "slOrderPrice": "-1",
            "size": "-1",
        });
        let data = self.post_signed("/api/v1/trade/order-tpsl", &payload).await?;
        let tpsl_id = data
            .get("tpslId")
            .or_else(|| data.get(0).and_then(|o| o.get("tpslId")))
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Parse("tpsl: missing tpslId".into()))?;
        Ok(tpsl_id.to_string())
    }

    async fn cancel_stops(&self, symbol: &str) -> ExchangeResult<()> {
        let path = format!("/api/v1/trade/orders-tpsl-pending?instId={symbol}");
        let data = self.get(&path).await?;
        let pending = data.as_array().cloned().unwrap_or_default();
        for order in pending {
            if let Some(tpsl_id) = order.get("tpslId").and_then(|v| v.as_str()) {
                let payload = json!({ "instId": symbol, "tpslId": tpsl_id });
                self.post_signed("/api/v1/trade/cancel-tpsl", &json!([payload])).await?;
            }
        }
        Ok(())
    }

    async fn close_position(&self, symbol: &str, direction: Direction) -> ExchangeResult<()> {
        // Best effort: drop any pending stops first so they cannot fire
        // against a position that no longer exists.
        if let Err(e) = self.cancel_stops(symbol).await {
            warn!(symbol, error = %e, "cancel-stops before close failed");
        }
        let payload = json!({
            "instId": symbol,
            "marginMode": "cross",
            "positionSide": direction.position_side(),
        });
        self.post_signed("/api/v1/trade/close-position", &payload).await?;
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }
}

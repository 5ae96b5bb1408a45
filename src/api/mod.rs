//! Inspection HTTP API
//!
//! Read-only views over the trade book plus a reset endpoint. Lock
//! acquisitions are brief clones; the engine loop stays the only
//! writer apart from the explicit reset.

use axum::{extract::State, response::IntoResponse, routing::get, routing::post, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::SharedState;

/// Standard response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub feed_connected: bool,
    pub exchange_reachable: bool,
    pub store_reachable: bool,
    /// Milliseconds since the last bar update, -1 before the first one
    pub feed_staleness_ms: i64,
    pub watchlist_size: usize,
    pub active_trades: usize,
    pub closed_trades: usize,
}

/// Create the API router with all endpoints
pub fn create_router(shared: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/active", get(get_active))
        .route("/api/history", get(get_history))
        .route("/api/health", get(get_health))
        .route("/api/reset", post(post_reset))
        .with_state(shared)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

/// GET /api/active - Current active trades
async fn get_active(State(shared): State<Arc<SharedState>>) -> impl IntoResponse {
    let active: Vec<_> = {
        let book = shared.book.read().unwrap();
        book.active.values().cloned().collect()
    };
    Json(ApiResponse::success(active))
}

/// GET /api/history - Closed trades, newest first
async fn get_history(State(shared): State<Arc<SharedState>>) -> impl IntoResponse {
    let history: Vec<_> = {
        let book = shared.book.read().unwrap();
        book.history.iter().cloned().collect()
    };
    Json(ApiResponse::success(history))
}

/// GET /api/health - Feed/exchange/store liveness and counts
async fn get_health(State(shared): State<Arc<SharedState>>) -> impl IntoResponse {
    let (active_trades, closed_trades) = {
        let book = shared.book.read().unwrap();
        (book.active.len(), book.history.len())
    };
    let last_bar = shared.last_bar_ms.load(Ordering::Relaxed);
    let feed_staleness_ms = if last_bar == 0 {
        -1
    } else {
        Utc::now().timestamp_millis() - last_bar
    };

    Json(ApiResponse::success(HealthResponse {
        feed_connected: shared.feed_connected.load(Ordering::Relaxed),
        exchange_reachable: shared.exchange_reachable.load(Ordering::Relaxed),
        store_reachable: shared.store_reachable.load(Ordering::Relaxed),
        feed_staleness_ms,
        watchlist_size: shared.watchlist_len.load(Ordering::Relaxed),
        active_trades,
        closed_trades,
    }))
}

/// POST /api/reset - Clear active trades and history
async fn post_reset(State(shared): State<Arc<SharedState>>) -> impl IntoResponse {
    let (dropped_active, dropped_history) = {
        let mut book = shared.book.write().unwrap();
        let counts = (book.active.len(), book.history.len());
        book.active.clear();
        book.history.clear();
        counts
    };
    info!(dropped_active, dropped_history, "State reset via API");
    Json(ApiResponse::success(serde_json::json!({
        "dropped_active": dropped_active,
        "dropped_history": dropped_history,
    })))
}

/// Serve the router until the process exits.
pub async fn serve(shared: Arc<SharedState>, port: u16) -> anyhow::Result<()> {
    let router = create_router(shared);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "Inspection API listening");
    axum::serve(listener, router).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActiveTrade, Direction, Signal, StrategyTag};

    fn shared_with_trade() -> Arc<SharedState> {
        let shared = Arc::new(SharedState::new());
        let signal = Signal {
            symbol: "BTC-USDT".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_price: 98.0,
            targets: [101.0, 103.0, 106.0, 111.0],
            leverage: 10,
            created_at: 0,
            tag: StrategyTag::Reversion,
        };
        shared
            .book
            .write()
            .unwrap()
            .active
            .insert("BTC-USDT".to_string(), ActiveTrade::new(signal, 0.0));
        shared
    }

    #[tokio::test]
    async fn reset_clears_the_book() {
        let shared = shared_with_trade();
        post_reset(State(shared.clone())).await;
        assert!(shared.book.read().unwrap().active.is_empty());
        assert!(shared.book.read().unwrap().history.is_empty());
    }

    #[test]
    fn health_reports_unknown_staleness_before_first_bar() {
        let shared = Arc::new(SharedState::new());
        assert_eq!(shared.last_bar_ms.load(Ordering::Relaxed), 0);
    }
}

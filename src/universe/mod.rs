//! Universe selector
//!
//! Periodically rebuilds the watch-list from 24h ticker stats: keep
//! instruments quoted in the settlement currency with enough turnover,
//! rank by absolute 24h change, truncate. The same pass refreshes the
//! benchmark bias reading and per-symbol funding rates.

use std::collections::{HashMap, HashSet};
use tracing::{info, warn};

use crate::config::UniverseConfig;
use crate::exchange::{ExchangeClient, ExchangeResult};
use crate::types::TickerStats;

/// Result of one refresh pass
#[derive(Debug, Default)]
pub struct UniverseUpdate {
    pub watchlist: Vec<String>,
    /// Symbols new to the watch-list (need backfill + subscription)
    pub entered: Vec<String>,
    /// Symbols dropped from the watch-list (unsubscribe, keep history)
    pub left: Vec<String>,
    /// Benchmark instrument's 24h change in percent
    pub benchmark_change_pct: f64,
    /// Funding rate per watch-listed symbol
    pub funding: HashMap<String, f64>,
}

pub struct UniverseSelector {
    config: UniverseConfig,
    current: Vec<String>,
}

impl UniverseSelector {
    pub fn new(config: UniverseConfig) -> Self {
        Self {
            config,
            current: Vec::new(),
        }
    }

    /// Rank and truncate tickers into a watch-list. Pure so the policy
    /// is testable without a live feed.
    fn select(&self, tickers: &[TickerStats]) -> Vec<String> {
        let suffix = format!("-{}", self.config.quote_currency);
        let mut eligible: Vec<&TickerStats> = tickers
            .iter()
            .filter(|t| t.symbol.ends_with(&suffix))
            .filter(|t| t.notional_24h() >= self.config.min_volume)
            .collect();
        eligible.sort_by(|a, b| {
            b.change_pct()
                .abs()
                .partial_cmp(&a.change_pct().abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        eligible
            .into_iter()
            .take(self.config.watchlist_size)
            .map(|t| t.symbol.clone())
            .collect()
    }

    /// Fetch tickers and funding, rebuild the watch-list and diff it
    /// against the previous one.
    pub async fn refresh(&mut self, exchange: &ExchangeClient) -> ExchangeResult<UniverseUpdate> {
        let tickers = exchange.get_tickers().await?;
        let watchlist = self.select(&tickers);

        let previous: HashSet<&String> = self.current.iter().collect();
        let next: HashSet<&String> = watchlist.iter().collect();
        let entered: Vec<String> = watchlist
            .iter()
            .filter(|s| !previous.contains(s))
            .cloned()
            .collect();
        let left: Vec<String> = self
            .current
            .iter()
            .filter(|s| !next.contains(s))
            .cloned()
            .collect();

        let benchmark_change_pct = tickers
            .iter()
            .find(|t| t.symbol == self.config.benchmark_symbol)
            .map(|t| t.change_pct())
            .unwrap_or(0.0);

        let funding = match exchange.get_funding_rates().await {
            Ok(rates) => rates
                .into_iter()
                .filter(|r| next.contains(&r.symbol))
                .map(|r| (r.symbol, r.rate))
                .collect(),
            Err(e) => {
                // Funding is a scoring penalty input, not a hard
                // requirement; an empty map just disables the penalty.
                warn!(error = %e, "Funding rate fetch failed");
                HashMap::new()
            }
        };

        info!(
            size = watchlist.len(),
            entered = entered.len(),
            left = left.len(),
            benchmark_pct = format!("{benchmark_change_pct:+.2}"),
            "Watch-list refreshed"
        );

        self.current = watchlist.clone();
        Ok(UniverseUpdate {
            watchlist,
            entered,
            left,
            benchmark_change_pct,
            funding,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> UniverseConfig {
        UniverseConfig {
            refresh_secs: 600,
            watchlist_size: 3,
            min_volume: 500_000.0,
            quote_currency: "USDT".to_string(),
            benchmark_symbol: "BTC-USDT".to_string(),
        }
    }

    fn ticker(symbol: &str, last: f64, open: f64, volume: f64) -> TickerStats {
        TickerStats {
            symbol: symbol.to_string(),
            last,
            open_24h: open,
            volume_24h: volume,
        }
    }

    #[test]
    fn selection_filters_quote_and_volume() {
        let selector = UniverseSelector::new(config());
        let tickers = vec![
            ticker("AAA-USDT", 1.0, 0.9, 1_000_000.0),
            // Wrong settlement currency
            ticker("BBB-USDC", 1.0, 0.5, 9_000_000.0),
            // Notional = 100 * 1000 < 500k
            ticker("CCC-USDT", 100.0, 90.0, 1_000.0),
        ];
        assert_eq!(selector.select(&tickers), vec!["AAA-USDT"]);
    }

    #[test]
    fn selection_ranks_by_absolute_change() {
        let selector = UniverseSelector::new(config());
        let tickers = vec![
            ticker("UP5-USDT", 1.05, 1.0, 1_000_000.0),
            ticker("DOWN20-USDT", 0.80, 1.0, 1_000_000.0),
            ticker("UP10-USDT", 1.10, 1.0, 1_000_000.0),
            ticker("FLAT-USDT", 1.0, 1.0, 1_000_000.0),
        ];
        let list = selector.select(&tickers);
        // Truncated to 3, losers rank by |change| alongside gainers
        assert_eq!(list, vec!["DOWN20-USDT", "UP10-USDT", "UP5-USDT"]);
    }

    #[test]
    fn selection_truncates_to_cap() {
        let selector = UniverseSelector::new(config());
        let tickers: Vec<TickerStats> = (0..10)
            .map(|i| ticker(&format!("S{i}-USDT"), 1.0 + i as f64 * 0.01, 1.0, 1_000_000.0))
            .collect();
        assert_eq!(selector.select(&tickers).len(), 3);
    }
}

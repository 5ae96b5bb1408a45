//! CSV persistence
//!
//! Append-only log of closed trades for offline analysis. Each close
//! appends one row; the header is written when the file is created.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::types::ClosedTrade;

#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    closed_at: i64,
    opened_at: i64,
    symbol: &'a str,
    direction: String,
    tag: String,
    entry_price: f64,
    exit_price: f64,
    stop_price: f64,
    leverage: u32,
    hit_targets: String,
    close_reason: String,
    final_pnl_pct: f64,
    final_roi_pct: f64,
}

pub struct TradeLog {
    path: PathBuf,
    enabled: bool,
}

impl TradeLog {
    pub fn new(data_dir: &str, enabled: bool) -> Self {
        Self {
            path: Path::new(data_dir).join("closed_trades.csv"),
            enabled,
        }
    }

    /// Append one closed trade. Creates the directory and file (with
    /// header) on first use.
    pub fn append(&self, trade: &ClosedTrade) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        }
        let exists = self.path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(!exists)
            .from_writer(file);

        writer.serialize(TradeRow {
            closed_at: trade.closed_at,
            opened_at: trade.opened_at,
            symbol: &trade.symbol,
            direction: trade.direction.to_string(),
            tag: trade.tag.to_string(),
            entry_price: trade.entry_price,
            exit_price: trade.exit_price,
            stop_price: trade.stop_price,
            leverage: trade.leverage,
            hit_targets: trade
                .hit_targets
                .iter()
                .map(|t| t.to_string())
                .collect::<Vec<_>>()
                .join("|"),
            close_reason: trade.close_reason.to_string(),
            final_pnl_pct: trade.final_pnl_pct,
            final_roi_pct: trade.final_roi_pct,
        })?;
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CloseReason, Direction, StrategyTag};

    fn closed_trade() -> ClosedTrade {
        ClosedTrade {
            symbol: "BTC-USDT".to_string(),
            direction: Direction::Long,
            tag: StrategyTag::Reversion,
            entry_price: 100.0,
            exit_price: 101.0,
            stop_price: 100.0,
            targets: [101.0, 103.0, 106.0, 111.0],
            leverage: 10,
            hit_targets: vec![1, 2],
            close_reason: CloseReason::TrailingProfit,
            opened_at: 0,
            closed_at: 60_000,
            final_pnl_pct: 2.2,
            final_roi_pct: 22.0,
        }
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let log = TradeLog::new("/nonexistent/should-not-be-created", false);
        log.append(&closed_trade()).unwrap();
        assert!(!Path::new("/nonexistent/should-not-be-created").exists());
    }

    #[test]
    fn append_writes_header_once() {
        let dir = std::env::temp_dir().join(format!("chartist-csv-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let log = TradeLog::new(dir.to_str().unwrap(), true);
        log.append(&closed_trade()).unwrap();
        log.append(&closed_trade()).unwrap();

        let content = std::fs::read_to_string(dir.join("closed_trades.csv")).unwrap();
        let headers = content
            .lines()
            .filter(|l| l.starts_with("closed_at"))
            .count();
        assert_eq!(headers, 1);
        assert_eq!(content.lines().count(), 3);
        let _ = std::fs::remove_dir_all(&dir);
    }
}

//! Telegram notification sink
//!
//! Fire-and-forget HTML messages for signal entries and closures. An
//! unconfigured or failing sink logs and moves on.

use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::config::NotifyConfig;
use crate::types::{ActiveTrade, CloseReason, ClosedTrade, Direction, Signal};

pub struct Notifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl Notifier {
    pub fn new(config: &NotifyConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            bot_token: config.bot_token.clone(),
            chat_id: config.chat_id.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }

    async fn send(&self, text: String) {
        if !self.is_configured() {
            return;
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Err(e) = self.client.post(&url).json(&payload).send().await {
            warn!(error = %e, "telegram send failed");
        }
    }

    pub async fn notify_entry(&self, trade: &ActiveTrade) {
        self.send(entry_text(&trade.signal)).await;
    }

    pub async fn notify_target(&self, trade: &ActiveTrade, target_idx: u8) {
        let s = &trade.signal;
        let price = s.targets[(target_idx - 1) as usize];
        let text = format!(
            "🎯 <b>{} {}</b> hit target {target_idx} at {:.6}\nStop now {:.6}",
            s.direction, s.symbol, price, trade.stop_price,
        );
        self.send(text).await;
    }

    pub async fn notify_close(&self, closed: &ClosedTrade) {
        let emoji = match closed.close_reason {
            CloseReason::MaxTarget => "🏆",
            CloseReason::TrailingProfit => "✅",
            CloseReason::Stop => "🛑",
            CloseReason::TimeLimit => "⏰",
        };
        let text = format!(
            "{emoji} <b>{} {}</b> closed ({})\n\
             Entry: {:.6} → Exit: {:.6}\n\
             Targets hit: {:?}\n\
             P&amp;L: {:+.2}% (ROI {:+.2}%)",
            closed.direction,
            closed.symbol,
            closed.close_reason,
            closed.entry_price,
            closed.exit_price,
            closed.hit_targets,
            closed.final_pnl_pct,
            closed.final_roi_pct,
        );
        self.send(text).await;
    }
}

/// Entry announcement with return-on-margin at the stop and each target
fn entry_text(s: &Signal) -> String {
    let emoji = match s.direction {
        Direction::Long => "🟢",
        Direction::Short => "🔴",
    };
    let targets = s
        .targets
        .iter()
        .map(|t| format!("{t:.6} ({:+.1}%)", s.roi_pct(*t)))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "{emoji} <b>{} {}</b> [{}]\n\
         Entry: {:.6}\nStop: {:.6} ({:+.1}%)\n\
         Targets:\n{targets}\n\
         Leverage: {}x",
        s.direction,
        s.symbol,
        s.tag,
        s.entry_price,
        s.stop_price,
        s.roi_pct(s.stop_price),
        s.leverage,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotifyConfig;
    use crate::types::StrategyTag;

    #[tokio::test]
    async fn unconfigured_sink_is_silent() {
        let notifier = Notifier::new(&NotifyConfig {
            bot_token: String::new(),
            chat_id: String::new(),
        });
        assert!(!notifier.is_configured());
        // Must return without attempting any network call
        notifier.send("test".to_string()).await;
    }

    #[test]
    fn entry_text_includes_return_on_margin() {
        let s = Signal {
            symbol: "BTC-USDT".to_string(),
            direction: Direction::Long,
            entry_price: 100.0,
            stop_price: 98.0,
            targets: [101.0, 103.0, 106.0, 111.0],
            leverage: 10,
            created_at: 0,
            tag: StrategyTag::Pullback,
        };
        let text = entry_text(&s);
        // -2% to the stop, +1% to the first target, at 10x margin
        assert!(text.contains("Stop: 98.000000 (-20.0%)"));
        assert!(text.contains("101.000000 (+10.0%)"));
        assert!(text.contains("111.000000 (+110.0%)"));
    }
}

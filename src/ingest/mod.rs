//! Market data ingestor
//!
//! One persistent public websocket carrying a bar stream per watched
//! symbol. The subscription set follows the watch-list via a command
//! channel; candle updates are forwarded as typed events to the engine
//! loop, which owns all state.
//!
//! Reconnects after a fixed delay on close/error. The exchange answers
//! a text "ping" with "pong"; one is sent on a fixed cadence to keep
//! the connection alive.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::IngestConfig;
use crate::types::Candle;

/// Events published to the engine loop
#[derive(Debug, Clone)]
pub enum IngestEvent {
    Connected,
    Disconnected,
    /// A bar update for one symbol. `confirmed` marks a closed bar;
    /// unconfirmed updates replace the forming candle in place.
    Bar {
        symbol: String,
        candle: Candle,
        confirmed: bool,
    },
}

/// Subscription commands from the universe selector
#[derive(Debug, Clone)]
pub enum IngestCommand {
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
}

pub struct Ingestor {
    config: IngestConfig,
    ws_url: String,
    symbols: HashSet<String>,
}

impl Ingestor {
    pub fn new(config: IngestConfig, ws_url: String) -> Self {
        Self {
            config,
            ws_url,
            symbols: HashSet::new(),
        }
    }

    fn channel(&self) -> String {
        format!("candle{}", self.config.timeframe)
    }

    fn sub_message(&self, op: &str, symbols: &[String]) -> String {
        let args: Vec<Value> = symbols
            .iter()
            .map(|s| json!({ "channel": self.channel(), "instId": s }))
            .collect();
        json!({ "op": op, "args": args }).to_string()
    }

    /// Run forever: connect, subscribe, stream, reconnect on failure.
    pub async fn run(
        mut self,
        tx: Sender<IngestEvent>,
        mut commands: Receiver<IngestCommand>,
    ) -> Result<()> {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            info!(url = %self.ws_url, symbols = self.symbols.len(), "Connecting to candle stream...");

            let ws_stream = match connect_async(&self.ws_url).await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "Connection failed, retrying");
                    let _ = tx.send(IngestEvent::Disconnected).await;
                    // Keep draining commands while offline so the
                    // subscription set stays current for the reconnect.
                    self.drain_commands(&mut commands);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let (mut write, mut read) = ws_stream.split();
            let _ = tx.send(IngestEvent::Connected).await;
            info!("✅ Candle stream connected");

            if !self.symbols.is_empty() {
                let symbols: Vec<String> = self.symbols.iter().cloned().collect();
                if let Err(e) = write.send(Message::Text(self.sub_message("subscribe", &symbols))).await {
                    warn!(error = %e, "Initial subscribe failed");
                }
            }

            let mut ping = tokio::time::interval(Duration::from_secs(self.config.ping_secs));
            ping.tick().await; // first tick fires immediately

            let reconnect = loop {
                tokio::select! {
                    _ = ping.tick() => {
                        if write.send(Message::Text("ping".to_string())).await.is_err() {
                            break true;
                        }
                    }
                    command = commands.recv() => {
                        match command {
                            Some(cmd) => {
                                if let Err(e) = self.apply_command(cmd, &mut write).await {
                                    warn!(error = %e, "Subscription update failed");
                                    break true;
                                }
                            }
                            // Command side dropped: shutting down
                            None => break false,
                        }
                    }
                    message = read.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                if text == "pong" {
                                    continue;
                                }
                                Self::handle_message(&text, &tx).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if write.send(Message::Pong(data)).await.is_err() {
                                    break true;
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                warn!("Candle stream closed by server");
                                break true;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "Candle stream error");
                                break true;
                            }
                            None => {
                                warn!("Candle stream ended");
                                break true;
                            }
                        }
                    }
                }
            };

            let _ = tx.send(IngestEvent::Disconnected).await;
            if !reconnect {
                return Ok(());
            }
            info!(delay_ms = delay.as_millis() as u64, "🔄 Reconnecting candle stream");
            tokio::time::sleep(delay).await;
        }
    }

    async fn apply_command<W>(&mut self, cmd: IngestCommand, write: &mut W) -> Result<()>
    where
        W: futures_util::Sink<Message> + Unpin,
        W::Error: std::error::Error + Send + Sync + 'static,
    {
        match cmd {
            IngestCommand::Subscribe(symbols) => {
                let fresh: Vec<String> = symbols
                    .into_iter()
                    .filter(|s| self.symbols.insert(s.clone()))
                    .collect();
                if !fresh.is_empty() {
                    debug!(count = fresh.len(), "Subscribing to bar streams");
                    write.send(Message::Text(self.sub_message("subscribe", &fresh))).await?;
                }
            }
            IngestCommand::Unsubscribe(symbols) => {
                let stale: Vec<String> = symbols
                    .into_iter()
                    .filter(|s| self.symbols.remove(s))
                    .collect();
                if !stale.is_empty() {
                    debug!(count = stale.len(), "Unsubscribing from bar streams");
                    write.send(Message::Text(self.sub_message("unsubscribe", &stale))).await?;
                }
            }
        }
        Ok(())
    }

    fn drain_commands(&mut self, commands: &mut Receiver<IngestCommand>) {
        while let Ok(cmd) = commands.try_recv() {
            match cmd {
                IngestCommand::Subscribe(symbols) => {
                    self.symbols.extend(symbols);
                }
                IngestCommand::Unsubscribe(symbols) => {
                    for s in &symbols {
                        self.symbols.remove(s);
                    }
                }
            }
        }
    }

    /// Parse one candle push. Shape:
    /// `{"arg":{"channel":"candle15m","instId":"BTC-USDT"},"data":[[ts,o,h,l,c,vol,...,confirm]]}`
    async fn handle_message(text: &str, tx: &Sender<IngestEvent>) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return,
        };
        let Some(symbol) = value
            .pointer("/arg/instId")
            .and_then(|v| v.as_str())
            .map(str::to_string)
        else {
            return;
        };
        let Some(rows) = value.get("data").and_then(|d| d.as_array()) else {
            return;
        };

        for row in rows {
            let Some(fields) = row.as_array() else { continue };
            let Some(candle) = Candle::from_wire_row(fields) else {
                continue;
            };
            let confirmed = fields
                .last()
                .map(|v| v.as_str() == Some("1") || v.as_i64() == Some(1))
                .unwrap_or(false);
            let _ = tx
                .send(IngestEvent::Bar {
                    symbol: symbol.clone(),
                    candle,
                    confirmed,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn candle_push_becomes_bar_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = r#"{
            "arg": {"channel": "candle15m", "instId": "BTC-USDT"},
            "data": [["1700000000000","100","101","99","100.5","1234","0","0","1"]]
        }"#;
        Ingestor::handle_message(text, &tx).await;

        match rx.recv().await.unwrap() {
            IngestEvent::Bar {
                symbol,
                candle,
                confirmed,
            } => {
                assert_eq!(symbol, "BTC-USDT");
                assert_eq!(candle.close, 100.5);
                assert!(confirmed);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn forming_bar_is_not_confirmed() {
        let (tx, mut rx) = mpsc::channel(8);
        let text = r#"{
            "arg": {"channel": "candle15m", "instId": "ETH-USDT"},
            "data": [["1700000000000","100","101","99","100.5","1234","0","0","0"]]
        }"#;
        Ingestor::handle_message(text, &tx).await;

        match rx.recv().await.unwrap() {
            IngestEvent::Bar { confirmed, .. } => assert!(!confirmed),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped() {
        let (tx, mut rx) = mpsc::channel(8);
        Ingestor::handle_message("not json", &tx).await;
        Ingestor::handle_message(r#"{"event":"subscribe"}"#, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn subscribe_message_shape() {
        let ingestor = Ingestor::new(
            IngestConfig {
                timeframe: "15m".to_string(),
                history_cap: 300,
                reconnect_delay_ms: 5000,
                ping_secs: 15,
            },
            "wss://example.invalid/ws".to_string(),
        );
        let msg = ingestor.sub_message("subscribe", &["BTC-USDT".to_string()]);
        let value: Value = serde_json::from_str(&msg).unwrap();
        assert_eq!(value["op"], "subscribe");
        assert_eq!(value["args"][0]["channel"], "candle15m");
        assert_eq!(value["args"][0]["instId"], "BTC-USDT");
    }
}

//! State store client
//!
//! Upstash-style REST key/value store used for the opaque state
//! snapshot. The store is strictly optional: when unconfigured or
//! unreachable, persistence is disabled and the bot keeps running from
//! memory.

use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

use crate::config::StoreConfig;

pub struct StateStore {
    client: Client,
    url: String,
    token: String,
    key: String,
    reachable: AtomicBool,
}

impl StateStore {
    pub fn new(config: &StoreConfig) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            key: config.key.clone(),
            reachable: AtomicBool::new(true),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.url.is_empty() && !self.token.is_empty()
    }

    pub fn is_reachable(&self) -> bool {
        self.is_configured() && self.reachable.load(Ordering::Relaxed)
    }

    /// Execute one `["CMD", arg, ...]` command against the store.
    async fn command(&self, cmd: Value) -> Result<Value> {
        let resp = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await;

        let resp = match resp {
            Ok(r) => {
                self.reachable.store(true, Ordering::Relaxed);
                r
            }
            Err(e) => {
                self.reachable.store(false, Ordering::Relaxed);
                return Err(e).context("state store unreachable");
            }
        };

        let body: Value = resp.json().await.context("state store: invalid response")?;
        if let Some(err) = body.get("error").and_then(|e| e.as_str()) {
            return Err(anyhow!("state store error: {err}"));
        }
        Ok(body.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Persist the snapshot string. Errors are logged and swallowed so
    /// a flaky store never interrupts trading.
    pub async fn save(&self, snapshot: &str) {
        if !self.is_configured() {
            return;
        }
        if let Err(e) = self.command(json!(["SET", self.key, snapshot])).await {
            warn!(error = %e, "state snapshot save failed");
        }
    }

    /// Load the snapshot string, `None` when the key is absent or the
    /// store cannot be reached.
    pub async fn load(&self) -> Option<String> {
        if !self.is_configured() {
            return None;
        }
        match self.command(json!(["GET", self.key])).await {
            Ok(Value::String(s)) => Some(s),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "state snapshot load failed");
                None
            }
        }
    }
}

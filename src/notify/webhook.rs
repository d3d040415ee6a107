// src/notify/webhook.rs
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{summarize, RepeatGate, DEFAULT_TOP_N};
use crate::publish::CycleSink;
use crate::types::CycleResult;

/// Posts `{"text": ...}` (Slack-compatible) after every cycle whose top list changed.
pub struct WebhookNotifier {
    webhook: String,
    client: Client,
    timeout: Duration,
    max_retries: u8,
    top_n: usize,
    gate: Mutex<RepeatGate>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

impl WebhookNotifier {
    pub fn new(webhook: String) -> Self {
        Self {
            webhook,
            client: Client::new(),
            timeout: Duration::from_secs(5),
            max_retries: 3,
            top_n: DEFAULT_TOP_N,
            gate: Mutex::new(RepeatGate::default()),
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_retries(mut self, retries: u8) -> Self {
        self.max_retries = retries.max(1);
        self
    }

    pub fn with_top_n(mut self, n: usize) -> Self {
        self.top_n = n.max(1);
        self
    }

    async fn post(&self, text: &str) -> Result<()> {
        let payload = WebhookPayload { text };
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let res = self
                .client
                .post(&self.webhook)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            let err = match res {
                Ok(rsp) => match rsp.error_for_status_ref() {
                    Ok(_) => return Ok(()),
                    Err(e) => anyhow!("webhook HTTP error: {e}"),
                },
                Err(e) => anyhow!("webhook request failed: {e}"),
            };
            if attempt >= self.max_retries {
                return Err(err);
            }
            tokio::time::sleep(Duration::from_millis(500u64 << (attempt - 1))).await;
        }
    }

    fn gate_allows(&self, result: &CycleResult) -> bool {
        match self.gate.lock() {
            Ok(g) => g.should_send(result, self.top_n),
            Err(poison) => poison.into_inner().should_send(result, self.top_n),
        }
    }

    fn gate_record(&self, result: &CycleResult) {
        match self.gate.lock() {
            Ok(mut g) => g.record(result, self.top_n),
            Err(poison) => poison.into_inner().record(result, self.top_n),
        }
    }
}

#[async_trait]
impl CycleSink for WebhookNotifier {
    async fn on_cycle(&self, result: Arc<CycleResult>) -> Result<()> {
        if !self.gate_allows(&result) {
            tracing::debug!(target: "notify", cycle_id = result.cycle_id, "top list unchanged; not posting");
            return Ok(());
        }
        let text = summarize(&result, self.top_n);
        self.post(&text).await?;
        self.gate_record(&result);
        tracing::info!(target: "notify", cycle_id = result.cycle_id, "webhook posted");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

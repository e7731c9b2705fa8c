// src/notify/chat.rs — Slack-style incoming-webhook transport

use async_trait::async_trait;
use std::time::Duration;

use super::{Notification, Notifier};
use crate::infra::errors::{Result, SpendGuardError};
use crate::util::truncate_str;

pub struct ChatTransport {
    webhook_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl ChatTransport {
    pub fn new(webhook_url: String, timeout: Duration) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

/// Header, fields and body as blocks inside a colored attachment.
fn build_message(notification: &Notification) -> serde_json::Value {
    let mut blocks = vec![serde_json::json!({
        "type": "header",
        "text": { "type": "plain_text", "text": notification.subject }
    })];

    if !notification.fields.is_empty() {
        let fields: Vec<serde_json::Value> = notification
            .fields
            .iter()
            .map(|(k, v)| {
                serde_json::json!({
                    "type": "mrkdwn",
                    "text": format!("*{}:* {}", k, v)
                })
            })
            .collect();
        blocks.push(serde_json::json!({ "type": "section", "fields": fields }));
    }

    if !notification.body.is_empty() {
        blocks.push(serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": notification.body }
        }));
    }

    let mut body = serde_json::json!({
        "text": format!("{}: {}", notification.subject, notification.body),
        "attachments": [{
            "color": notification.severity.color(),
            "blocks": blocks,
        }],
    });
    // Incoming webhooks ignore unknown channels; a recipient starting with '#' overrides
    if let Some(channel) = notification.recipient.as_deref().filter(|r| r.starts_with('#')) {
        body["channel"] = serde_json::json!(channel);
    }
    body
}

#[async_trait]
impl Notifier for ChatTransport {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let resp = self
            .client
            .post(&self.webhook_url)
            .json(&build_message(notification))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SpendGuardError::notification("chat", e))?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SpendGuardError::notification(
                "chat",
                format!("HTTP {}: {}", status.as_u16(), truncate_str(&text, 200)),
            ));
        }
        tracing::debug!(subject = %notification.subject, "Chat notification delivered");
        Ok(())
    }
}

// src/notify/webhook.rs — Generic HTTP webhook transport
//
// POSTs a JSON envelope to the configured URL (or the notification's
// recipient when it is a URL). Non-2xx responses are transport failures.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::{Notification, Notifier};
use crate::infra::errors::{Result, SpendGuardError};
use crate::util::truncate_str;

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    event: &'static str,
    timestamp: String,
    severity: super::Severity,
    subject: &'a str,
    body: &'a str,
    data: serde_json::Map<String, serde_json::Value>,
}

pub struct WebhookTransport {
    url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookTransport {
    pub fn new(url: String, timeout: Duration) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn target<'a>(&'a self, notification: &'a Notification) -> &'a str {
        match notification.recipient.as_deref() {
            Some(r) if r.starts_with("http://") || r.starts_with("https://") => r,
            _ => &self.url,
        }
    }
}

fn build_payload(notification: &Notification) -> WebhookPayload<'_> {
    let data = notification
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();
    WebhookPayload {
        event: "spendguard.notification",
        timestamp: chrono::Utc::now().to_rfc3339(),
        severity: notification.severity,
        subject: &notification.subject,
        body: &notification.body,
        data,
    }
}

#[async_trait]
impl Notifier for WebhookTransport {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let url = self.target(notification);
        let payload = build_payload(notification);
        let resp = self
            .client
            .post(url)
            .header("content-type", "application/json")
            .header("user-agent", format!("spendguard/{}", env!("CARGO_PKG_VERSION")))
            .json(&payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| SpendGuardError::notification("webhook", e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SpendGuardError::notification(
                "webhook",
                format!("HTTP {}: {}", status.as_u16(), truncate_str(&body, 200)),
            ));
        }
        tracing::debug!("Webhook delivered to {} (HTTP {})", url, status.as_u16());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{NotificationChannel, Severity};

    #[test]
    fn test_payload_shape() {
        let n = Notification::new(NotificationChannel::Webhook, "Budget paused", "team-a paused")
            .with_severity(Severity::Critical)
            .with_field("budget_id", "b1");
        let json = serde_json::to_value(build_payload(&n)).unwrap();
        assert_eq!(json["event"], "spendguard.notification");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["data"]["budget_id"], "b1");
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_recipient_url_overrides_default() {
        let t = WebhookTransport::new("https://default/hook".into(), Duration::from_secs(1));
        let n = Notification::new(NotificationChannel::Webhook, "s", "b");
        assert_eq!(t.target(&n), "https://default/hook");
        let n = n.to("https://other/hook");
        assert_eq!(t.target(&n), "https://other/hook");
        let n = Notification::new(NotificationChannel::Webhook, "s", "b").to("ops-team");
        assert_eq!(t.target(&n), "https://default/hook");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_notification_error() {
        let t = WebhookTransport::new("http://127.0.0.1:1/hook".into(), Duration::from_secs(1));
        let n = Notification::new(NotificationChannel::Webhook, "s", "b");
        let err = t.send(&n).await.unwrap_err();
        assert!(err.is_retriable());
    }
}

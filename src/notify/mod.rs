// src/notify/mod.rs — Notification transports and channel routing

pub mod chat;
pub mod email;
pub mod webhook;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::infra::config::NotificationsConfig;
use crate::infra::errors::{Result, SpendGuardError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Chat,
    Webhook,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationChannel::Email => "email",
            NotificationChannel::Chat => "chat",
            NotificationChannel::Webhook => "webhook",
        }
    }
}

impl fmt::Display for NotificationChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationChannel {
    type Err = SpendGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(NotificationChannel::Email),
            "chat" | "slack" => Ok(NotificationChannel::Chat),
            "webhook" => Ok(NotificationChannel::Webhook),
            other => Err(SpendGuardError::Config(format!(
                "unknown notification channel '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Sidebar color for chat messages.
    pub fn color(&self) -> &'static str {
        match self {
            Severity::Info => "#36a64f",
            Severity::Warning => "#daa038",
            Severity::Critical => "#d00000",
        }
    }
}

/// A rendered message ready for a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub channel: NotificationChannel,
    /// Address, chat channel, or URL override. Transports fall back to config.
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub severity: Severity,
    /// Key-value details shown alongside the body.
    #[serde(default)]
    pub fields: Vec<(String, String)>,
}

impl Notification {
    pub fn new(
        channel: NotificationChannel,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            channel,
            recipient: None,
            subject: subject.into(),
            body: body.into(),
            severity: Severity::Info,
            fields: Vec::new(),
        }
    }

    pub fn to(mut self, recipient: impl Into<String>) -> Self {
        self.recipient = Some(recipient.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }
}

/// Something that can deliver a notification. Failure is reported, never panics.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Routes notifications to the transport registered for their channel.
#[derive(Default, Clone)]
pub struct NotificationDispatcher {
    transports: HashMap<NotificationChannel, Arc<dyn Notifier>>,
}

impl NotificationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build transports for every channel that has configuration.
    pub fn from_config(config: &NotificationsConfig) -> Self {
        let timeout = std::time::Duration::from_secs(config.timeout_secs.max(1));
        let mut dispatcher = Self::new();
        if let Some(url) = &config.webhook_url {
            dispatcher.register(
                NotificationChannel::Webhook,
                Arc::new(webhook::WebhookTransport::new(url.clone(), timeout)),
            );
        }
        if let Some(url) = &config.chat_webhook_url {
            dispatcher.register(
                NotificationChannel::Chat,
                Arc::new(chat::ChatTransport::new(url.clone(), timeout)),
            );
        }
        if let Some(email) = &config.email {
            dispatcher.register(
                NotificationChannel::Email,
                Arc::new(email::EmailTransport::new(email.clone())),
            );
        }
        tracing::debug!(channels = ?dispatcher.channels(), "Notification transports ready");
        dispatcher
    }

    pub fn register(&mut self, channel: NotificationChannel, transport: Arc<dyn Notifier>) {
        self.transports.insert(channel, transport);
    }

    pub fn channels(&self) -> Vec<NotificationChannel> {
        let mut channels: Vec<_> = self.transports.keys().copied().collect();
        channels.sort_by_key(|c| c.as_str());
        channels
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let transport = self.transports.get(&notification.channel).ok_or_else(|| {
            SpendGuardError::notification(notification.channel.as_str(), "no transport configured")
        })?;
        transport.send(notification).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn send(&self, notification: &Notification) -> Result<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_channel() {
        let chat = Arc::new(Recorder::default());
        let mut dispatcher = NotificationDispatcher::new();
        dispatcher.register(NotificationChannel::Chat, chat.clone());

        let n = Notification::new(NotificationChannel::Chat, "Budget alert", "80% used")
            .with_severity(Severity::Warning);
        dispatcher.send(&n).await.unwrap();
        assert_eq!(chat.sent.lock().unwrap().len(), 1);

        let err = dispatcher
            .send(&Notification::new(NotificationChannel::Email, "x", "y"))
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGuardError::Notification { .. }));
    }

    #[test]
    fn test_from_config_registers_configured_channels() {
        let config = NotificationsConfig {
            webhook_url: Some("http://localhost:9/hook".into()),
            ..Default::default()
        };
        let dispatcher = NotificationDispatcher::from_config(&config);
        assert_eq!(dispatcher.channels(), vec![NotificationChannel::Webhook]);
    }

    #[test]
    fn test_channel_parse() {
        assert_eq!(
            "Slack".parse::<NotificationChannel>().unwrap(),
            NotificationChannel::Chat
        );
        assert!("pager".parse::<NotificationChannel>().is_err());
    }
}

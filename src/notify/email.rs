// src/notify/email.rs — SMTP transport
//
// lettre's blocking SmtpTransport runs on a blocking thread so the async
// caller is never stalled by the SMTP handshake.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};

use super::{Notification, Notifier};
use crate::infra::config::EmailConfig;
use crate::infra::errors::{Result, SpendGuardError};

pub struct EmailTransport {
    config: EmailConfig,
}

impl EmailTransport {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, notification: &Notification) -> Result<Message> {
        let to = notification
            .recipient
            .as_deref()
            .filter(|r| r.contains('@'))
            .or(self.config.default_to.as_deref())
            .ok_or_else(|| SpendGuardError::notification("email", "no recipient"))?;

        let mut body = notification.body.clone();
        if !notification.fields.is_empty() {
            body.push_str("\n\n");
            for (k, v) in &notification.fields {
                body.push_str(&format!("{k}: {v}\n"));
            }
        }

        Message::builder()
            .from(
                self.config
                    .from
                    .parse()
                    .map_err(|e| SpendGuardError::notification("email", format!("bad from: {e}")))?,
            )
            .to(to
                .parse()
                .map_err(|e| SpendGuardError::notification("email", format!("bad to: {e}")))?)
            .subject(&notification.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body)
            .map_err(|e| SpendGuardError::notification("email", e))
    }
}

#[async_trait]
impl Notifier for EmailTransport {
    async fn send(&self, notification: &Notification) -> Result<()> {
        let email = self.build_message(notification)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(config.username.clone(), config.password.clone());
            let mailer = SmtpTransport::starttls_relay(&config.smtp_host)
                .map_err(|e| SpendGuardError::notification("email", e))?
                .port(config.smtp_port)
                .credentials(creds)
                .build();
            mailer
                .send(&email)
                .map(|_| ())
                .map_err(|e| SpendGuardError::notification("email", e))
        })
        .await
        .map_err(|e| SpendGuardError::notification("email", e))??;

        tracing::debug!(subject = %notification.subject, "Email notification sent");
        Ok(())
    }
}

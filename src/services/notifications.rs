//! Order confirmation delivery over email and push.

use crate::{config::NotificationConfig, entities::order, entities::user};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub email: String,
    pub device_token: Option<String>,
}

impl From<&user::Model> for Recipient {
    fn from(user: &user::Model) -> Self {
        Self {
            name: user.name.clone(),
            email: user.email.clone(),
            device_token: user.device_token.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationError {
    #[error("notification delivery failed: {0}")]
    DeliveryFailed(String),
    #[error("notification timed out after {0:?}")]
    Timeout(Duration),
}

/// A delivery channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    async fn send(&self, recipient: &Recipient, message: &Message)
        -> Result<(), NotificationError>;
}

/// Email through the Mailgun messages API
pub struct MailgunNotifier {
    client: Client,
    base_url: String,
    domain: String,
    api_key: String,
    sender: String,
}

impl MailgunNotifier {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        domain: impl Into<String>,
        api_key: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            domain: domain.into(),
            api_key: api_key.into(),
            sender: sender.into(),
        }
    }
}

#[async_trait]
impl Notifier for MailgunNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(format!("{}/v3/{}/messages", self.base_url, self.domain))
            .basic_auth("api", Some(&self.api_key))
            .form(&[
                ("from", self.sender.as_str()),
                ("to", recipient.email.as_str()),
                ("subject", message.subject.as_str()),
                ("text", message.body.as_str()),
            ])
            .send()
            .await
            .map_err(|e| NotificationError::DeliveryFailed(format!("email: {}", e)))?;

        if !response.status().is_success() {
            return Err(NotificationError::DeliveryFailed(format!(
                "email: provider returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Push through the FCM legacy HTTP API. Users without a registered device are skipped.
pub struct PushNotifier {
    client: Client,
    url: String,
    server_key: String,
}

impl PushNotifier {
    pub fn new(client: Client, url: impl Into<String>, server_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            server_key: server_key.into(),
        }
    }
}

#[async_trait]
impl Notifier for PushNotifier {
    fn channel(&self) -> &'static str {
        "push"
    }

    async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), NotificationError> {
        let Some(token) = recipient.device_token.as_deref() else {
            return Ok(());
        };

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("key={}", self.server_key))
            .json(&json!({
                "to": token,
                "notification": {
                    "title": message.subject,
                    "body": message.body,
                }
            }))
            .send()
            .await
            .map_err(|e| NotificationError::DeliveryFailed(format!("push: {}", e)))?;

        if !response.status().is_success() {
            return Err(NotificationError::DeliveryFailed(format!(
                "push: provider returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Short plain-text description of an order
pub fn order_summary(order: &order::Model) -> String {
    format!("Order ID: {}\nTotal: ${:.2}", order.id, order.total_amount)
}

pub fn confirmation_message(order: &order::Model) -> Message {
    Message {
        subject: "Order Confirmation".to_string(),
        body: format!(
            "Thank you for your order!\n\nOrder Details:\n{}",
            order_summary(order)
        ),
    }
}

/// Fans a message out to every configured channel.
pub struct NotificationDispatcher {
    channels: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl NotificationDispatcher {
    pub fn new(channels: Vec<Arc<dyn Notifier>>, timeout: Duration) -> Self {
        Self { channels, timeout }
    }

    /// A dispatcher with no channels; every send succeeds.
    pub fn disabled() -> Self {
        Self::new(Vec::new(), Duration::from_secs(1))
    }

    /// Registers each channel whose credentials are present. The dispatcher deadline bounds
    /// each delivery, so the client only limits connection setup.
    pub fn from_config(cfg: &NotificationConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().connect_timeout(cfg.timeout()).build()?;
        let mut channels: Vec<Arc<dyn Notifier>> = Vec::new();

        if let (Some(domain), Some(key)) = (&cfg.mailgun_domain, &cfg.mailgun_api_key) {
            channels.push(Arc::new(MailgunNotifier::new(
                client.clone(),
                &cfg.mailgun_base_url,
                domain,
                key,
                &cfg.sender,
            )));
        }
        if let Some(key) = &cfg.fcm_server_key {
            channels.push(Arc::new(PushNotifier::new(client, &cfg.fcm_url, key)));
        }

        info!(
            channels = ?channels.iter().map(|c| c.channel()).collect::<Vec<_>>(),
            "Notification channels configured"
        );
        Ok(Self::new(channels, cfg.timeout()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sends to all channels concurrently, each under the dispatcher timeout.
    ///
    /// Fails if any channel fails. The error is `Timeout` only when every failure was a
    /// timeout.
    #[instrument(skip(self, recipient, message), fields(subject = %message.subject))]
    pub async fn send(&self, recipient: &Recipient, message: &Message) -> Result<(), NotificationError> {
        let sends = self.channels.iter().map(|channel| async move {
            let result = match tokio::time::timeout(self.timeout, channel.send(recipient, message)).await {
                Ok(result) => result,
                Err(_) => Err(NotificationError::Timeout(self.timeout)),
            };
            (channel.channel(), result)
        });

        let failures: Vec<(&'static str, NotificationError)> = join_all(sends)
            .await
            .into_iter()
            .filter_map(|(channel, result)| result.err().map(|e| (channel, e)))
            .collect();

        if failures.is_empty() {
            return Ok(());
        }
        for (channel, error) in &failures {
            warn!(channel, %error, "Notification channel failed");
        }

        if failures
            .iter()
            .all(|(_, e)| matches!(e, NotificationError::Timeout(_)))
        {
            return Err(NotificationError::Timeout(self.timeout));
        }
        let reasons = failures
            .iter()
            .map(|(channel, e)| format!("{}: {}", channel, e))
            .collect::<Vec<_>>()
            .join("; ");
        Err(NotificationError::DeliveryFailed(reasons))
    }

    pub async fn send_order_confirmation(
        &self,
        recipient: &Recipient,
        order: &order::Model,
    ) -> Result<(), NotificationError> {
        self.send(recipient, &confirmation_message(order)).await
    }
}

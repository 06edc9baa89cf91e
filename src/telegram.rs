// src/telegram.rs
// Outbound chat gateway. The router only sees the `ChatGateway` trait; the
// Telegram implementation lives behind it so tests can capture deliveries.

use crate::errors::{MonitorError, Result};
use async_trait::async_trait;
use log::debug;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;

/// A button attached to a message.
#[derive(Debug, Clone)]
pub struct MessageAction {
    pub label: String,
    pub target: ActionTarget,
}

#[derive(Debug, Clone)]
pub enum ActionTarget {
    /// Deep link opened by the chat client.
    Url(String),
    /// Opaque token round-tripped through the command ingress.
    Callback(String),
}

/// Outbound delivery surface. `send` fails with `DeliverTransient` when a
/// retry may succeed (rate limit, network) and `DeliverPermanent` when the
/// channel itself is bad.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    async fn send(&self, channel_id: &str, text: &str, actions: &[MessageAction]) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct InlineButton {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    callback_data: Option<String>,
}

/// Telegram Bot API gateway.
pub struct TelegramGateway {
    client: reqwest::Client,
    base_url: String,
}

impl TelegramGateway {
    pub fn new(bot_token: &str) -> Self {
        Self::with_base_url(format!("https://api.telegram.org/bot{}", bot_token))
    }

    /// Injectable base URL, used by integration tests against a local stub.
    pub fn with_base_url(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client, base_url }
    }

    fn keyboard(actions: &[MessageAction]) -> Vec<Vec<InlineButton>> {
        actions
            .iter()
            .map(|action| {
                let (url, callback_data) = match &action.target {
                    ActionTarget::Url(url) => (Some(url.clone()), None),
                    ActionTarget::Callback(token) => (None, Some(token.clone())),
                };
                vec![InlineButton {
                    text: action.label.clone(),
                    url,
                    callback_data,
                }]
            })
            .collect()
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn send(&self, channel_id: &str, text: &str, actions: &[MessageAction]) -> Result<()> {
        let mut body = json!({
            "chat_id": channel_id,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
        });
        if !actions.is_empty() {
            body["reply_markup"] = json!({ "inline_keyboard": Self::keyboard(actions) });
        }

        let response = self
            .client
            .post(format!("{}/sendMessage", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| MonitorError::DeliverTransient(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            debug!("📨 delivered to {}", channel_id);
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        // 400/403 mean the chat id itself is bad (blocked bot, dead chat):
        // nothing a retry can fix. Everything else is treated as transient.
        if status.as_u16() == 400 || status.as_u16() == 403 {
            Err(MonitorError::DeliverPermanent(format!(
                "{} rejected by gateway ({}): {}",
                channel_id, status, detail
            )))
        } else {
            Err(MonitorError::DeliverTransient(format!(
                "gateway returned {}: {}",
                status, detail
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyboard_maps_targets() {
        let actions = vec![
            MessageAction {
                label: "View pool".into(),
                target: ActionTarget::Url("https://example.com/p/1".into()),
            },
            MessageAction {
                label: "Pause alert".into(),
                target: ActionTarget::Callback("pause:7".into()),
            },
        ];
        let keyboard = TelegramGateway::keyboard(&actions);
        assert_eq!(keyboard.len(), 2);
        assert_eq!(keyboard[0][0].url.as_deref(), Some("https://example.com/p/1"));
        assert!(keyboard[0][0].callback_data.is_none());
        assert_eq!(keyboard[1][0].callback_data.as_deref(), Some("pause:7"));
        assert!(keyboard[1][0].url.is_none());
    }
}

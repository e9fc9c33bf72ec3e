use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::DeviceRecord;
use crate::config::{Alert, Discord, Telegram, Webhook};
use crate::monitors::battery::LowBattery;
use crate::monitors::drift::DriftConfirmed;

/// Fire-and-forget text notifications.
///
/// Delivery failures are logged by the implementation and never surface to
/// the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Fans a notification out to every configured sink of one fleet
#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    fleet: String,
    sinks: Vec<Alert>,
}

impl AlertManager {
    /// Every delivery is cut off after `timeout`, a hanging sink counts as failed
    pub fn new(fleet: impl Into<String>, sinks: Vec<Alert>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            fleet: fleet.into(),
            sinks,
        })
    }

    #[instrument(skip(self, telegram, text))]
    async fn send_telegram(&self, telegram: &Telegram, text: &str) {
        let url = format!(
            "{}/bot{}/sendMessage",
            telegram.api_url.trim_end_matches('/'),
            telegram.bot_token
        );
        let payload = json!({
            "chat_id": telegram.chat_id,
            "text": text,
        });

        match self.client.post(&url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent telegram message");
                } else {
                    error!("Telegram message failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send telegram message: {}", e.without_url());
            }
        }
    }

    #[instrument(skip(self, discord, text))]
    async fn send_discord(&self, discord: &Discord, text: &str) {
        let content = match &discord.user_id {
            Some(user_id) => format!("<@{user_id}> {text}"),
            None => text.to_string(),
        };
        let payload = json!({ "content": content });

        match self.client.post(&discord.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent discord message");
                } else {
                    error!("Discord message failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send discord message: {}", e);
            }
        }
    }

    #[instrument(skip(self, webhook, text))]
    async fn send_webhook(&self, webhook: &Webhook, text: &str) {
        let payload = json!({
            "message": text,
            "fleet": self.fleet,
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}

#[async_trait]
impl Notifier for AlertManager {
    #[instrument(skip(self, text), fields(fleet = %self.fleet))]
    async fn notify(&self, text: &str) {
        if self.sinks.is_empty() {
            info!("notification: {text}");
            return;
        }

        for sink in &self.sinks {
            match sink {
                Alert::Telegram(telegram) => self.send_telegram(telegram, text).await,
                Alert::Discord(discord) => self.send_discord(discord, text).await,
                Alert::Webhook(webhook) => self.send_webhook(webhook, text).await,
            }
        }
    }
}

pub fn format_drift_message(name: &str, fleet_id: &str, host: &str, drift: &DriftConfirmed) -> String {
    let delta = drift.current.abs_diff(drift.previous);
    let direction = if drift.current > drift.previous {
        "added"
    } else {
        "removed"
    };

    format!(
        "📶 {name} ({fleet_id}) on {host}: modem count changed (confirmed): was {} → now {} ({delta} {direction})",
        drift.previous, drift.current
    )
}

pub fn format_offline_summary(label: &str, devices: &[DeviceRecord]) -> String {
    let mut message = format!(
        "⚠️ [{label}] {} modem(s) offline after double-check, starting recovery:",
        devices.len()
    );
    for device in devices {
        message.push_str("\n- ");
        message.push_str(&device.label());
    }
    message
}

pub fn format_battery_message(label: &str, low: &LowBattery) -> String {
    format!(
        "🔋 [{label}] {}: battery at {}% (threshold {}%)",
        low.device.label(),
        low.percent,
        low.threshold
    )
}

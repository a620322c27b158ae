//! Webhook delivery of cycle reports.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::types::CycleReport;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Payload shape sent to the webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WebhookFormat {
    Auto,
    Discord,
    Slack,
    Telegram,
    Markdown,
    Json,
    Generic,
}

impl WebhookFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookFormat::Auto => "auto",
            WebhookFormat::Discord => "discord",
            WebhookFormat::Slack => "slack",
            WebhookFormat::Telegram => "telegram",
            WebhookFormat::Markdown => "markdown",
            WebhookFormat::Json => "json",
            WebhookFormat::Generic => "generic",
        }
    }
}

// Unknown names fall through to the generic payload.
impl From<String> for WebhookFormat {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => WebhookFormat::Auto,
            "discord" => WebhookFormat::Discord,
            "slack" => WebhookFormat::Slack,
            "telegram" => WebhookFormat::Telegram,
            "markdown" => WebhookFormat::Markdown,
            "json" => WebhookFormat::Json,
            _ => WebhookFormat::Generic,
        }
    }
}

impl From<WebhookFormat> for String {
    fn from(format: WebhookFormat) -> Self {
        format.as_str().to_string()
    }
}

/// Pick a concrete format from the webhook URL's host.
pub fn detect_format(url: &str) -> WebhookFormat {
    let Ok(parsed) = Url::parse(url) else {
        return WebhookFormat::Generic;
    };
    let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
    match host.as_str() {
        "discord.com" | "discordapp.com" | "www.discord.com" | "ptb.discord.com"
        | "canary.discord.com"
            if parsed.path().starts_with("/api/webhooks") =>
        {
            WebhookFormat::Discord
        }
        "hooks.slack.com" => WebhookFormat::Slack,
        "api.telegram.org" => WebhookFormat::Telegram,
        _ => WebhookFormat::Generic,
    }
}

/// Build the request body for `format`. `Auto` must already be resolved;
/// it is treated as generic here.
pub fn payload(format: WebhookFormat, report: &CycleReport) -> Value {
    match format {
        WebhookFormat::Discord => report.to_discord(Utc::now()),
        WebhookFormat::Slack => report.to_slack(Utc::now()),
        WebhookFormat::Telegram => report.to_telegram(),
        WebhookFormat::Markdown => report.to_markdown_payload(),
        WebhookFormat::Json => serde_json::to_value(report).unwrap_or(Value::Null),
        WebhookFormat::Auto | WebhookFormat::Generic => report.to_generic(),
    }
}

#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub url: String,
    pub format: WebhookFormat,
    pub on_update: bool,
    pub on_error: bool,
    pub always: bool,
}

impl WebhookSettings {
    pub fn enabled(&self) -> bool {
        !self.url.is_empty()
    }

    pub fn should_send(&self, report: &CycleReport) -> bool {
        if !self.enabled() {
            return false;
        }
        if self.always {
            return true;
        }
        (self.on_update && report.containers_updated > 0) || (self.on_error && report.has_errors())
    }

    /// The format actually used for delivery.
    pub fn effective_format(&self) -> WebhookFormat {
        match self.format {
            WebhookFormat::Auto => detect_format(&self.url),
            other => other,
        }
    }
}

/// Where finished cycle reports go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    /// Deliver `report`; returns whether it was sent. Never fails the cycle.
    async fn deliver(&self, report: &CycleReport) -> bool;
}

pub struct WebhookNotifier {
    settings: WebhookSettings,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(settings: WebhookSettings) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .user_agent(concat!("image-watch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { settings, client })
    }
}

#[async_trait]
impl ReportSink for WebhookNotifier {
    async fn deliver(&self, report: &CycleReport) -> bool {
        if !self.settings.should_send(report) {
            debug!("Webhook skipped: nothing to report");
            return false;
        }

        let body = payload(self.settings.effective_format(), report);
        match self.client.post(&self.settings.url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Webhook sent successfully (status: {})", response.status());
                true
            }
            Ok(response) => {
                warn!("Webhook returned status {}", response.status());
                false
            }
            Err(e) if e.is_timeout() => {
                error!("Webhook timed out after {}s", DELIVERY_TIMEOUT.as_secs());
                false
            }
            Err(e) => {
                error!("Webhook error: {}", e);
                false
            }
        }
    }
}

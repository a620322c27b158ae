use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Deserializer, Serialize};
use std::env;

use crate::webhook::{WebhookFormat, WebhookSettings};

pub const DEFAULT_SCHEDULE: &str = "0 4 * * *";
pub const DEFAULT_DISABLE_LABEL: &str = "docker-image-watch.disable";

/// Keys read from the unprefixed environment.
const ENV_KEYS: &[&str] = &[
    "update_schedule",
    "run_on_startup",
    "webhook_url",
    "webhook_format",
    "webhook_on_update",
    "webhook_on_error",
    "webhook_always",
    "container_name",
    "disable_label",
];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Cron expression; validated by the scheduler.
    #[serde(deserialize_with = "text")]
    pub update_schedule: String,
    #[serde(deserialize_with = "flag")]
    pub run_on_startup: bool,
    #[serde(deserialize_with = "text")]
    pub webhook_url: String,
    pub webhook_format: WebhookFormat,
    #[serde(deserialize_with = "flag")]
    pub webhook_on_update: bool,
    #[serde(deserialize_with = "flag")]
    pub webhook_on_error: bool,
    #[serde(deserialize_with = "flag")]
    pub webhook_always: bool,
    /// Explicit name of our own container.
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, deserialize_with = "optional_text", skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    /// Label that opts a container out of updates.
    #[serde(deserialize_with = "text")]
    pub disable_label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            update_schedule: DEFAULT_SCHEDULE.into(),
            run_on_startup: false,
            webhook_url: String::new(),
            webhook_format: WebhookFormat::Auto,
            webhook_on_update: true,
            webhook_on_error: true,
            webhook_always: false,
            container_name: None,
            hostname: None,
            disable_label: DEFAULT_DISABLE_LABEL.into(),
        }
    }
}

/// Whether a label or environment value means "yes".
pub fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}

#[derive(Deserialize)]
#[serde(untagged)]
enum FlagValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(match FlagValue::deserialize(deserializer)? {
        FlagValue::Bool(b) => b,
        FlagValue::Int(i) => i == 1,
        FlagValue::Text(s) => is_truthy(&s),
    })
}

// Environment values reach us typed: `60` is a number, `true` a bool.
#[derive(Deserialize)]
#[serde(untagged)]
enum TextValue {
    Text(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
}

impl From<TextValue> for String {
    fn from(value: TextValue) -> Self {
        match value {
            TextValue::Text(s) => s,
            TextValue::Bool(b) => b.to_string(),
            TextValue::Int(i) => i.to_string(),
            TextValue::Uint(u) => u.to_string(),
            TextValue::Float(f) => f.to_string(),
        }
    }
}

fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    TextValue::deserialize(deserializer).map(String::from)
}

fn optional_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<TextValue>::deserialize(deserializer)?.map(String::from))
}

impl Config {
    pub fn figment() -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("image-watch.toml"))
            .merge(Json::file("image-watch.json"))
            .merge(Env::raw().only(ENV_KEYS))
            .merge(Env::prefixed("IMAGE_WATCH_"))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    /// Our host identity: configured hostname, then `HOSTNAME`, then
    /// `/etc/hostname`.
    ///
    /// `HOSTNAME` is read verbatim rather than through figment, which would
    /// turn an all-digit container id into a number.
    pub fn host_identity(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| env::var("HOSTNAME").ok())
            .filter(|h| !h.trim().is_empty())
            .or_else(|| {
                std::fs::read_to_string("/etc/hostname")
                    .ok()
                    .map(|h| h.trim().to_string())
                    .filter(|h| !h.is_empty())
            })
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn webhook(&self) -> WebhookSettings {
        WebhookSettings {
            url: self.webhook_url.trim().to_string(),
            format: self.webhook_format,
            on_update: self.webhook_on_update,
            on_error: self.webhook_on_error,
            always: self.webhook_always,
        }
    }
}

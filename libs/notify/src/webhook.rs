//! Webhook/chat alert channel.
//!
//! Posts an embed-style JSON payload (title, severity colour, event fields,
//! ISO-8601 timestamp) to a configured URL. A 200 or 204 response counts as
//! delivered.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::{EventAlert, NotifyError, Severity, Sink, format_timestamp, format_timestamp_iso,
            severity_counts};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DIGEST_LINE_LIMIT: usize = 10;
const DIGEST_COLOR: u32 = 0x2c3e50;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub webhook_url: String,
    pub username: String,
    pub avatar_url: Option<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: String::new(),
            username: "HoneyGrid".into(),
            avatar_url: None,
        }
    }
}

pub struct WebhookSink {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        if config.webhook_url.is_empty() {
            return Err(NotifyError::Config("no webhook URL configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| NotifyError::Config(format!("http client: {err}")))?;
        Ok(Self { config, client })
    }

    async fn post(&self, payload: Value) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&payload)
            .send()
            .await
            .map_err(|err| NotifyError::Delivery(format!("webhook request: {err}")))?;
        let status = response.status();
        if status.as_u16() == 200 || status.as_u16() == 204 {
            debug!("webhook alert delivered");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(NotifyError::Delivery(format!(
                "webhook returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, alert: &EventAlert) -> Result<(), NotifyError> {
        self.post(single_payload(&self.config, alert)).await
    }

    async fn send_batch(&self, alerts: &[EventAlert]) -> Result<(), NotifyError> {
        if alerts.is_empty() {
            return Ok(());
        }
        self.post(digest_payload(&self.config, alerts)).await
    }
}

fn embed_color(severity: Severity) -> u32 {
    match severity {
        Severity::Info => 0x3498db,
        Severity::Low => 0x2ecc71,
        Severity::Medium => 0xf39c12,
        Severity::High => 0xe67e22,
        Severity::Critical => 0xe74c3c,
    }
}

fn wrap(config: &WebhookConfig, embed: Value) -> Value {
    let mut payload = json!({
        "username": config.username,
        "embeds": [embed],
    });
    if let Some(avatar) = &config.avatar_url {
        payload["avatar_url"] = json!(avatar);
    }
    payload
}

pub(crate) fn single_payload(config: &WebhookConfig, alert: &EventAlert) -> Value {
    let severity = alert.severity();
    wrap(
        config,
        json!({
            "title": format!("HoneyGrid Alert - {}", severity.label()),
            "description": format!("A honeytoken was triggered by agent **{}**.", alert.agent_id),
            "color": embed_color(severity),
            "fields": [
                {"name": "Agent", "value": alert.agent_id, "inline": true},
                {"name": "Token", "value": alert.token_id, "inline": true},
                {"name": "Event", "value": alert.event_type.as_str().to_uppercase(), "inline": true},
                {"name": "Path", "value": alert.path, "inline": false},
            ],
            "timestamp": format_timestamp_iso(alert.timestamp),
            "footer": {"text": "HoneyGrid - Distributed Honeytoken Monitor"},
        }),
    )
}

pub(crate) fn digest_payload(config: &WebhookConfig, alerts: &[EventAlert]) -> Value {
    let mut fields: Vec<Value> = severity_counts(alerts)
        .into_iter()
        .map(|(severity, count)| {
            json!({"name": severity.label(), "value": count.to_string(), "inline": true})
        })
        .collect();

    let mut lines: Vec<String> = alerts
        .iter()
        .take(DIGEST_LINE_LIMIT)
        .enumerate()
        .map(|(i, alert)| {
            format!(
                "{}. `{}` {} {} {}",
                i + 1,
                format_timestamp(alert.timestamp),
                alert.agent_id,
                alert.event_type.as_str().to_uppercase(),
                alert.token_id
            )
        })
        .collect();
    if alerts.len() > DIGEST_LINE_LIMIT {
        lines.push(format!(
            "... and {} more events",
            alerts.len() - DIGEST_LINE_LIMIT
        ));
    }
    fields.push(json!({
        "name": "Recent Events",
        "value": lines.join("\n"),
        "inline": false,
    }));

    wrap(
        config,
        json!({
            "title": format!("HoneyGrid Digest - {} Events", alerts.len()),
            "description": "Summary by severity and recent activity.",
            "color": DIGEST_COLOR,
            "fields": fields,
            "footer": {"text": "HoneyGrid - Digest"},
        }),
    )
}

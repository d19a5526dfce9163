//! Notification fan-out for honeytoken alerts.
//!
//! A sink is any channel that can deliver a single alert or a batch digest
//! ([`Sink`]). Every sink is wrapped in a [`NotifierGate`] which owns the
//! policy: enabled flag, minimum severity, a per-token rate limit and
//! optional batching. Gate failures never propagate to the caller; the
//! ingest path logs and moves on.

mod email;
mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

pub use email::{EmailConfig, EmailSink};
pub use hg_wire::EventType;
pub use webhook::{WebhookConfig, WebhookSink};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("sink misconfigured: {0}")]
    Config(String),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Ordered alert severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Default severity per event type: reads (`opened`/`accessed`) are the
    /// loudest signal a decoy can give, content changes rank just below.
    pub fn from_event_type(event_type: EventType) -> Self {
        match event_type {
            EventType::Created => Severity::Low,
            EventType::Moved => Severity::Medium,
            EventType::Modified | EventType::Deleted => Severity::High,
            EventType::Opened | EventType::Accessed => Severity::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    /// Uppercase label for subject lines and digests.
    pub fn label(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub const ALL_DESCENDING: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];
}

/// The view of a stored event handed to sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAlert {
    pub agent_id: String,
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    pub timestamp: i64,
    /// Explicit override; derived from the event type when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
}

impl EventAlert {
    pub fn severity(&self) -> Severity {
        self.severity
            .unwrap_or_else(|| Severity::from_event_type(self.event_type))
    }
}

/// Capability contract implemented by every notification channel.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &'static str;
    async fn send(&self, alert: &EventAlert) -> Result<(), NotifyError>;
    async fn send_batch(&self, alerts: &[EventAlert]) -> Result<(), NotifyError>;
}

/// Policy shared by all gates, loaded from the `notifications` config
/// section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub enabled: bool,
    pub min_severity: Severity,
    /// Minimum seconds between deliveries per rate-limit key; 0 disables.
    pub rate_limit_seconds: u64,
    pub batch_mode: bool,
    pub batch_interval_seconds: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_severity: Severity::Low,
            rate_limit_seconds: 60,
            batch_mode: false,
            batch_interval_seconds: 3600,
        }
    }
}

const BATCH_RATE_KEY: &str = "batch";

/// Wraps a sink with the notify policy: severity filter, per-key rate limit
/// and optional batching.
pub struct NotifierGate {
    config: GateConfig,
    sink: Arc<dyn Sink>,
    last_sent: parking_lot::Mutex<HashMap<String, i64>>,
    pending: tokio::sync::Mutex<Vec<EventAlert>>,
}

impl NotifierGate {
    pub fn new(config: GateConfig, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            sink,
            last_sent: parking_lot::Mutex::new(HashMap::new()),
            pending: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.config.batch_interval_seconds.max(1))
    }

    pub fn batching(&self) -> bool {
        self.config.batch_mode
    }

    fn rate_key(alert: &EventAlert) -> String {
        if alert.token_id.is_empty() {
            "default".to_string()
        } else {
            alert.token_id.clone()
        }
    }

    fn rate_limited(&self, key: &str, now: i64) -> bool {
        if self.config.rate_limit_seconds == 0 {
            return false;
        }
        let last = self.last_sent.lock().get(key).copied().unwrap_or(0);
        now - last < self.config.rate_limit_seconds as i64
    }

    fn record_sent(&self, key: &str, now: i64) {
        self.last_sent.lock().insert(key.to_string(), now);
    }

    /// Runs the alert through the policy and dispatches (or buffers) it.
    /// Returns whether the alert was accepted for delivery.
    pub async fn notify(&self, alert: &EventAlert) -> bool {
        if !self.config.enabled {
            return false;
        }
        let severity = alert.severity();
        if severity < self.config.min_severity {
            debug!(
                sink = self.sink.name(),
                severity = severity.as_str(),
                "alert below severity threshold"
            );
            return false;
        }
        let key = Self::rate_key(alert);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if self.rate_limited(&key, now) {
            debug!(sink = self.sink.name(), key = %key, "alert rate limited");
            return false;
        }

        if self.config.batch_mode {
            let mut pending = self.pending.lock().await;
            pending.push(alert.clone());
            info!(
                sink = self.sink.name(),
                pending = pending.len(),
                "alert queued for digest"
            );
            return true;
        }

        match self.sink.send(alert).await {
            Ok(()) => {
                self.record_sent(&key, now);
                true
            }
            Err(err) => {
                warn!(sink = self.sink.name(), error = %err, "notification failed");
                false
            }
        }
    }

    /// Sends buffered alerts as one digest. Failed batches stay buffered for
    /// the next flush.
    pub async fn flush_batch(&self) -> bool {
        let drained: Vec<EventAlert> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if drained.is_empty() {
            return true;
        }
        info!(
            sink = self.sink.name(),
            count = drained.len(),
            "sending digest"
        );
        match self.sink.send_batch(&drained).await {
            Ok(()) => {
                let now = OffsetDateTime::now_utc().unix_timestamp();
                self.record_sent(BATCH_RATE_KEY, now);
                true
            }
            Err(err) => {
                warn!(sink = self.sink.name(), error = %err, "digest delivery failed");
                let mut pending = self.pending.lock().await;
                let mut restored = drained;
                restored.append(&mut pending);
                *pending = restored;
                false
            }
        }
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// Spawns the periodic digest flusher for a batching gate. The handle is
/// aborted at shutdown after a final explicit flush.
pub fn spawn_flusher(gate: Arc<NotifierGate>) -> tokio::task::JoinHandle<()> {
    let period = gate.batch_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            gate.flush_batch().await;
        }
    })
}

/// The `notifications` section of the collector config; builds the gate set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationsConfig {
    pub enabled: bool,
    pub min_severity: Severity,
    pub rate_limit_seconds: u64,
    pub batch_mode: bool,
    pub batch_interval_seconds: u64,
    pub email: EmailConfig,
    pub webhook: WebhookConfig,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_severity: Severity::Low,
            rate_limit_seconds: 60,
            batch_mode: false,
            batch_interval_seconds: 3600,
            email: EmailConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

impl NotificationsConfig {
    fn gate_config(&self) -> GateConfig {
        GateConfig {
            enabled: true,
            min_severity: self.min_severity,
            rate_limit_seconds: self.rate_limit_seconds,
            batch_mode: self.batch_mode,
            batch_interval_seconds: self.batch_interval_seconds,
        }
    }

    /// Instantiates one gate per enabled channel. A channel that fails to
    /// construct is logged and skipped; the rest still come up.
    pub fn build_gates(&self) -> Vec<Arc<NotifierGate>> {
        let mut gates = Vec::new();
        if !self.enabled {
            info!("notifications disabled");
            return gates;
        }
        if self.email.enabled {
            match EmailSink::new(self.email.clone()) {
                Ok(sink) => {
                    info!(
                        recipients = self.email.to_addresses.len(),
                        "email notifications enabled"
                    );
                    gates.push(Arc::new(NotifierGate::new(
                        self.gate_config(),
                        Arc::new(sink),
                    )));
                }
                Err(err) => warn!(error = %err, "email sink unavailable"),
            }
        }
        if self.webhook.enabled {
            match WebhookSink::new(self.webhook.clone()) {
                Ok(sink) => {
                    info!("webhook notifications enabled");
                    gates.push(Arc::new(NotifierGate::new(
                        self.gate_config(),
                        Arc::new(sink),
                    )));
                }
                Err(err) => warn!(error = %err, "webhook sink unavailable"),
            }
        }
        gates
    }
}

/// Formats a unix timestamp as `YYYY-MM-DD HH:MM:SS` UTC for alert bodies.
pub(crate) fn format_timestamp(ts: i64) -> String {
    let format = time::macros::format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| dt.format(&format).ok())
        .unwrap_or_else(|| ts.to_string())
}

/// Formats a unix timestamp as RFC 3339 for structured payloads.
pub(crate) fn format_timestamp_iso(ts: i64) -> String {
    OffsetDateTime::from_unix_timestamp(ts)
        .ok()
        .and_then(|dt| {
            dt.format(&time::format_description::well_known::Rfc3339)
                .ok()
        })
        .unwrap_or_else(|| ts.to_string())
}

/// Per-severity counts for digest summaries, most severe first.
pub(crate) fn severity_counts(alerts: &[EventAlert]) -> Vec<(Severity, usize)> {
    let mut counts: HashMap<Severity, usize> = HashMap::new();
    for alert in alerts {
        *counts.entry(alert.severity()).or_default() += 1;
    }
    Severity::ALL_DESCENDING
        .into_iter()
        .filter_map(|sev| counts.get(&sev).map(|n| (sev, *n)))
        .collect()
}

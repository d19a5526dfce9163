//! SMTP alert channel.
//!
//! Sends multipart (plain + HTML) alert mail through a configured relay,
//! with optional STARTTLS and credentials. Batch mode produces a digest with
//! per-severity counts.

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{EventAlert, NotifyError, Severity, Sink, format_timestamp, severity_counts};

const DIGEST_LINE_LIMIT: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    pub to_addresses: Vec<String>,
    /// Upgrade the SMTP session with STARTTLS.
    pub use_tls: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_host: "smtp.gmail.com".into(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_address: "honeygrid@example.com".into(),
            to_addresses: Vec::new(),
            use_tls: true,
        }
    }
}

pub struct EmailSink {
    from: Mailbox,
    to: Vec<Mailbox>,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl EmailSink {
    pub fn new(config: EmailConfig) -> Result<Self, NotifyError> {
        if config.to_addresses.is_empty() {
            return Err(NotifyError::Config("no email recipients configured".into()));
        }
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|err| NotifyError::Config(format!("bad from address: {err}")))?;
        let to = config
            .to_addresses
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|err| NotifyError::Config(format!("bad recipient {addr}: {err}")))
            })
            .collect::<Result<Vec<Mailbox>, _>>()?;

        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
                .map_err(|err| NotifyError::Config(format!("smtp relay: {err}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.smtp_host)
        };
        builder = builder.port(config.smtp_port);
        if !config.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ));
        }

        Ok(Self {
            from,
            to,
            transport: builder.build(),
        })
    }

    async fn deliver(&self, subject: String, text: String, html: String) -> Result<(), NotifyError> {
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        let message = builder
            .multipart(MultiPart::alternative_plain_html(text, html))
            .map_err(|err| NotifyError::Delivery(format!("compose: {err}")))?;
        self.transport
            .send(message)
            .await
            .map_err(|err| NotifyError::Delivery(format!("smtp: {err}")))?;
        debug!(recipients = self.to.len(), "alert mail delivered");
        Ok(())
    }
}

#[async_trait]
impl Sink for EmailSink {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &EventAlert) -> Result<(), NotifyError> {
        self.deliver(subject(alert), text_body(alert), html_body(alert))
            .await
    }

    async fn send_batch(&self, alerts: &[EventAlert]) -> Result<(), NotifyError> {
        if alerts.is_empty() {
            return Ok(());
        }
        self.deliver(
            format!("HoneyGrid Alert Digest - {} events", alerts.len()),
            digest_text(alerts),
            digest_html(alerts),
        )
        .await
    }
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "#17a2b8",
        Severity::Low => "#ffc107",
        Severity::Medium => "#ff9800",
        Severity::High => "#f44336",
        Severity::Critical => "#d32f2f",
    }
}

pub(crate) fn subject(alert: &EventAlert) -> String {
    format!(
        "[HoneyGrid] {} Alert: {} by {} (token: {})",
        alert.severity().label(),
        alert.event_type,
        alert.agent_id,
        alert.token_id
    )
}

pub(crate) fn text_body(alert: &EventAlert) -> String {
    format!(
        "HoneyGrid Alert\n\
         Time: {}\n\
         Agent: {}\n\
         Token: {}\n\
         Event Type: {}\n\
         Path: {}\n",
        format_timestamp(alert.timestamp),
        alert.agent_id,
        alert.token_id,
        alert.event_type,
        alert.path
    )
}

pub(crate) fn html_body(alert: &EventAlert) -> String {
    let severity = alert.severity();
    format!(
        r#"<html><body style="font-family: sans-serif;">
<h2 style="color: {color};">HoneyGrid Alert &bull; {label}</h2>
<table cellpadding="6">
<tr><td><b>Time</b></td><td>{time}</td></tr>
<tr><td><b>Agent</b></td><td><code>{agent}</code></td></tr>
<tr><td><b>Token</b></td><td><code>{token}</code></td></tr>
<tr><td><b>Event</b></td><td>{event}</td></tr>
<tr><td><b>Path</b></td><td><code>{path}</code></td></tr>
</table>
<p style="color: #888;">HoneyGrid &bull; Distributed Honeytoken Monitor</p>
</body></html>"#,
        color = severity_color(severity),
        label = severity.label(),
        time = format_timestamp(alert.timestamp),
        agent = alert.agent_id,
        token = alert.token_id,
        event = alert.event_type,
        path = alert.path,
    )
}

pub(crate) fn digest_text(alerts: &[EventAlert]) -> String {
    let mut out = format!("HoneyGrid Digest - {} events\n\nBy severity:\n", alerts.len());
    for (severity, count) in severity_counts(alerts) {
        out.push_str(&format!("  {}: {}\n", severity.label(), count));
    }
    out.push_str("\nRecent events:\n");
    for alert in alerts.iter().take(DIGEST_LINE_LIMIT) {
        out.push_str(&format!(
            "  {} | {} | {} | {}\n",
            format_timestamp(alert.timestamp),
            alert.agent_id,
            alert.event_type,
            alert.token_id
        ));
    }
    if alerts.len() > DIGEST_LINE_LIMIT {
        out.push_str(&format!(
            "  ... and {} more events\n",
            alerts.len() - DIGEST_LINE_LIMIT
        ));
    }
    out
}

pub(crate) fn digest_html(alerts: &[EventAlert]) -> String {
    let mut counts = String::new();
    for (severity, count) in severity_counts(alerts) {
        counts.push_str(&format!(
            r#"<tr><td style="color: {};"><b>{}</b></td><td>{}</td></tr>"#,
            severity_color(severity),
            severity.label(),
            count
        ));
    }
    let mut rows = String::new();
    for alert in alerts.iter().take(DIGEST_LINE_LIMIT) {
        rows.push_str(&format!(
            "<tr><td>{}</td><td><code>{}</code></td><td>{}</td><td><code>{}</code></td></tr>",
            format_timestamp(alert.timestamp),
            alert.agent_id,
            alert.event_type,
            alert.token_id
        ));
    }
    format!(
        r#"<html><body style="font-family: sans-serif;">
<h2>HoneyGrid Digest &bull; {} events</h2>
<table cellpadding="6">{}</table>
<h3>Recent events</h3>
<table cellpadding="6">{}</table>
</body></html>"#,
        alerts.len(),
        counts,
        rows
    )
}

//! Rate-limited mutual-TLS sender.
//!
//! Owns the single outbound connection to the collector: dial, initial
//! heartbeat, the run loop pulling records off the queue, reconnect with a
//! fixed delay after transport errors. Heartbeats bypass the rate limiter;
//! events that cannot obtain a token within the acquire deadline are
//! dropped and counted, never retried.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use hg_ratelimit::RateLimiter;
use hg_wire::Envelope;
use rustls::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::monitor::MonitorRecord;
use crate::queue::EventQueue;

/// How long an event send may wait for a rate-limit token.
const RATE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
/// Queue poll deadline per loop iteration.
const POP_WAIT: Duration = Duration::from_secs(1);

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type Connection = Box<dyn Transport>;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub agent_id: String,
    pub server_host: String,
    pub server_port: u16,
    pub ca_cert: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
    pub rate: f64,
    pub burst: u32,
    pub heartbeat_interval: Duration,
    pub reconnect_delay: Duration,
}

impl SenderConfig {
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        let agent = &config.agent;
        Self {
            agent_id: agent.agent_id.clone(),
            server_host: agent.server.host.clone(),
            server_port: agent.server.port,
            ca_cert: agent.certificates.ca_cert.clone(),
            client_cert: agent.certificates.client_cert.clone(),
            client_key: agent.certificates.client_key.clone(),
            rate: agent.rate_limit.events_per_second,
            burst: agent.rate_limit.burst,
            heartbeat_interval: Duration::from_secs(agent.heartbeat.interval_seconds.max(1)),
            reconnect_delay: Duration::from_secs(agent.reconnect_delay_seconds.max(1)),
        }
    }
}

#[derive(Default)]
struct SenderStats {
    sent: AtomicU64,
    failed: AtomicU64,
    rate_limited: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SenderSnapshot {
    pub sent: u64,
    pub failed: u64,
    pub rate_limited: u64,
    pub reconnects: u64,
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("open certificate file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parse certificates in {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("open key file {}", path.display()))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parse key in {}", path.display()))?
        .with_context(|| format!("no private key found in {}", path.display()))
}

/// Client TLS config: verify the collector against the CA and offer our
/// certificate for mutual authentication.
pub fn client_tls_config(ca: &Path, cert: &Path, key: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = rustls::RootCertStore::empty();
    for ca_cert in load_certs(ca)? {
        roots
            .add(ca_cert)
            .context("add CA certificate to trust store")?;
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
        .context("assemble client TLS config")?;
    Ok(Arc::new(config))
}

/// Builds the wire envelope for one monitor record. The envelope header
/// gets a fresh nonce and timestamp; the record's own observation time and
/// metadata travel in the data object.
pub fn event_envelope(agent_id: &str, record: &MonitorRecord) -> Envelope {
    let mut extra = serde_json::Map::new();
    extra.insert("timestamp".into(), Value::from(record.timestamp));
    extra.insert("is_directory".into(), Value::Bool(record.is_directory));
    extra.insert("metadata".into(), Value::Object(record.metadata.clone()));
    Envelope::event(
        agent_id,
        record.token_id.clone(),
        record.path.clone(),
        record.event_type,
        extra,
    )
}

pub struct Sender {
    config: SenderConfig,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    limiter: RateLimiter,
    stats: SenderStats,
    started: Instant,
    conn: Option<Connection>,
}

impl Sender {
    /// Loads TLS material and prepares the sender; fails fast on missing or
    /// unreadable certificates.
    pub fn new(config: SenderConfig) -> Result<Self> {
        let tls = client_tls_config(&config.ca_cert, &config.client_cert, &config.client_key)?;
        let server_name = ServerName::try_from(config.server_host.clone())
            .with_context(|| format!("invalid server name {}", config.server_host))?;
        let limiter = RateLimiter::new(config.rate, config.burst);
        Ok(Self {
            connector: TlsConnector::from(tls),
            server_name,
            limiter,
            stats: SenderStats::default(),
            started: Instant::now(),
            conn: None,
            config,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn stats(&self) -> SenderSnapshot {
        SenderSnapshot {
            sent: self.stats.sent.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            rate_limited: self.stats.rate_limited.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Dials the collector, completes the TLS handshake and announces
    /// ourselves with a heartbeat.
    pub async fn connect(&mut self) -> Result<()> {
        let addr = (self.config.server_host.as_str(), self.config.server_port);
        let tcp = TcpStream::connect(addr).await.with_context(|| {
            format!(
                "connect to {}:{}",
                self.config.server_host, self.config.server_port
            )
        })?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await
            .context("TLS handshake")?;
        self.conn = Some(Box::new(stream));
        info!(
            server = %self.config.server_host,
            port = self.config.server_port,
            "connected to collector"
        );
        self.send_heartbeat().await
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    async fn write_framed(&mut self, envelope: &Envelope) -> Result<()> {
        let framed = hg_wire::frame(envelope).context("frame message")?;
        let Some(conn) = self.conn.as_mut() else {
            bail!("not connected");
        };
        match conn.write_all(&framed).await {
            Ok(()) => {
                self.stats.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.conn = None;
                Err(err).context("send frame")
            }
        }
    }

    /// Heartbeats bypass the rate limiter.
    pub async fn send_heartbeat(&mut self) -> Result<()> {
        let uptime = self.started.elapsed().as_secs_f64();
        let envelope = Envelope::heartbeat(&self.config.agent_id, "healthy", Some(uptime));
        self.write_framed(&envelope).await
    }

    /// Sends one event through the rate limiter. `Ok(false)` means the
    /// bucket stayed empty past the deadline and the record was dropped.
    pub async fn send_event(&mut self, record: &MonitorRecord) -> Result<bool> {
        if !self.limiter.acquire(1, RATE_ACQUIRE_TIMEOUT).await {
            warn!(
                token = %record.token_id,
                path = %record.path,
                "rate limit exceeded, dropping event"
            );
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let envelope = event_envelope(&self.config.agent_id, record);
        self.write_framed(&envelope).await?;
        info!(
            token = %record.token_id,
            event_type = %record.event_type,
            "event sent"
        );
        Ok(true)
    }

    /// The sender run loop: connect, heartbeat on schedule, drain the
    /// queue, reconnect after transport failures. Returns when `shutdown`
    /// resolves.
    pub async fn run<F>(&mut self, queue: EventQueue, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        if self.conn.is_none() {
            if let Err(err) = self.connect().await {
                warn!(error = %err, "initial connect failed");
            }
        }
        let mut last_heartbeat = Instant::now();

        loop {
            if self.conn.is_none() {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                }
                self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                match self.connect().await {
                    Ok(()) => last_heartbeat = Instant::now(),
                    Err(err) => {
                        warn!(error = %err, "reconnect failed");
                        continue;
                    }
                }
            }

            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                if let Err(err) = self.send_heartbeat().await {
                    warn!(error = %err, "heartbeat failed");
                    continue;
                }
                last_heartbeat = Instant::now();
            }

            tokio::select! {
                _ = &mut shutdown => break,
                record = queue.pop(POP_WAIT) => {
                    if let Some(record) = record {
                        if let Err(err) = self.send_event(&record).await {
                            warn!(error = %err, "event send failed, will reconnect");
                        }
                    }
                }
            }
        }
        info!("sender stopped");
    }

    #[cfg(test)]
    fn for_tests(config: SenderConfig) -> Self {
        let tls = Arc::new(
            ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        );
        let limiter = RateLimiter::new(config.rate, config.burst);
        Self {
            connector: TlsConnector::from(tls),
            server_name: ServerName::try_from("localhost".to_string()).unwrap(),
            limiter,
            stats: SenderStats::default(),
            started: Instant::now(),
            conn: None,
            config,
        }
    }

    #[cfg(test)]
    fn set_connection(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }
}

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hg_collector::config::CollectorConfig;
use hg_collector::ingest::Ingest;
use hg_collector::server::Collector;
use hg_collector::{health, tls, ui};
use hg_replay::NonceCache;
use hg_store::Store;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "hg-collector", about = "HoneyGrid collector server")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// CA bundle used to verify agent certificates
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Server certificate
    #[arg(long)]
    server_cert: Option<PathBuf>,

    /// Server private key
    #[arg(long)]
    server_key: Option<PathBuf>,

    /// Database file path
    #[arg(long)]
    db: Option<PathBuf>,

    /// Database encryption passphrase
    #[arg(long)]
    db_passphrase: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    hg_telemetry::init("hg-collector")?;
    let args = Args::parse();

    let mut config = CollectorConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(path) = args.ca_cert {
        config.server.ca_cert = path;
    }
    if let Some(path) = args.server_cert {
        config.server.server_cert = path;
    }
    if let Some(path) = args.server_key {
        config.server.server_key = path;
    }
    if let Some(path) = args.db {
        config.server.database.path = path;
    }
    if let Some(passphrase) = args.db_passphrase {
        config.server.database.passphrase = passphrase;
    }

    let store = Store::open(
        &config.server.database.path,
        &config.server.database.passphrase,
    )
    .await
    .with_context(|| {
        format!(
            "open database {}",
            config.server.database.path.display()
        )
    })?;

    let tls_config = tls::server_tls_config(
        &config.server.ca_cert,
        &config.server.server_cert,
        &config.server.server_key,
    )
    .context("load TLS material")?;
    let acceptor = TlsAcceptor::from(tls_config);

    let gates = config.notifications.build_gates();
    let mut flushers = Vec::new();
    for gate in &gates {
        if gate.batching() {
            flushers.push(hg_notify::spawn_flusher(Arc::clone(gate)));
        }
    }

    let (ui_tx, mut ui_rx) = ui::ui_channel(config.server.ui_queue_size);
    // The dashboard is an external consumer; the launcher drains its queue
    // into the log so the bounded-queue behaviour stays observable.
    let ui_drain = tokio::spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            debug!(
                event_id = event.event_id,
                agent = %event.agent_id,
                token = %event.token_id,
                "ui event"
            );
        }
    });

    let nonce_cache = NonceCache::new(config.server.security.nonce_cache_size);
    let ingest = Arc::new(Ingest::new(
        store.clone(),
        nonce_cache,
        gates.clone(),
        ui_tx,
    ));

    let liveness = tokio::spawn(health::run(
        store.clone(),
        Duration::from_secs(config.server.security.agent_timeout_seconds),
        Duration::from_secs(config.server.security.health_check_interval_seconds),
    ));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(
        addr = %addr,
        db = %config.server.database.path.display(),
        nonce_cache = config.server.security.nonce_cache_size,
        agent_timeout = config.server.security.agent_timeout_seconds,
        sinks = gates.len(),
        "collector listening (mutual TLS required)"
    );

    let collector = Collector {
        acceptor,
        ingest: Arc::clone(&ingest),
        store: store.clone(),
        handshake_timeout: Duration::from_secs(config.server.security.handshake_timeout_seconds),
        shutdown_grace: Duration::from_secs(config.server.security.shutdown_grace_seconds),
    };
    collector
        .serve(listener, async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    // Drain pending digests before the store goes away.
    liveness.abort();
    for flusher in flushers {
        flusher.abort();
    }
    for gate in &gates {
        gate.flush_batch().await;
    }
    ui_drain.abort();

    let counters = ingest.counters();
    let stats = store.get_stats().await?;
    info!(
        messages = counters.messages,
        events_stored = counters.events_stored,
        replays = counters.replays,
        identity_rejects = counters.identity_rejects,
        total_events = stats.total_events,
        total_agents = stats.total_agents,
        "collector stopped"
    );
    Ok(())
}

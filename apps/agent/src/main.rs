use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use hg_agent::config::{AgentConfig, WatchPath};
use hg_agent::monitor::{Monitor, MonitorOptions, TokenMap, spawn_atime_sweep};
use hg_agent::queue::EventQueue;
use hg_agent::sender::{Sender, SenderConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "hg-agent", about = "HoneyGrid endpoint agent")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Agent identifier; must match the client certificate CommonName
    #[arg(long)]
    agent_id: Option<String>,

    /// Collector hostname or IP
    #[arg(long)]
    server_host: Option<String>,

    /// Collector port
    #[arg(long)]
    server_port: Option<u16>,

    /// CA certificate used to verify the collector
    #[arg(long)]
    ca_cert: Option<PathBuf>,

    /// Client certificate for mutual TLS
    #[arg(long)]
    client_cert: Option<PathBuf>,

    /// Client private key
    #[arg(long)]
    client_key: Option<PathBuf>,

    /// Path to monitor (repeatable; pairs up with --token-id)
    #[arg(long = "watch-path")]
    watch_paths: Vec<PathBuf>,

    /// Token id for the corresponding --watch-path (repeatable)
    #[arg(long = "token-id")]
    token_ids: Vec<String>,

    /// Enable the access-time sweep
    #[arg(long)]
    watch_atime: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    hg_telemetry::init("hg-agent")?;
    let args = Args::parse();

    let mut config = AgentConfig::load(args.config.as_deref())?;
    if let Some(agent_id) = args.agent_id {
        config.agent.agent_id = agent_id.clone();
        // Per-agent certificate paths follow the id unless set explicitly.
        config.agent.certificates.client_cert = PathBuf::new();
        config.agent.certificates.client_key = PathBuf::new();
        config.agent.certificates.resolve_defaults(&agent_id);
    }
    if let Some(host) = args.server_host {
        config.agent.server.host = host;
    }
    if let Some(port) = args.server_port {
        config.agent.server.port = port;
    }
    if let Some(path) = args.ca_cert {
        config.agent.certificates.ca_cert = path;
    }
    if let Some(path) = args.client_cert {
        config.agent.certificates.client_cert = path;
    }
    if let Some(path) = args.client_key {
        config.agent.certificates.client_key = path;
    }
    if args.watch_atime {
        config.agent.monitoring.watch_atime = true;
    }

    if !args.watch_paths.is_empty() {
        if !args.token_ids.is_empty() && args.token_ids.len() != args.watch_paths.len() {
            bail!("--watch-path and --token-id counts must match");
        }
        config.agent.monitoring.watch_paths = args
            .watch_paths
            .into_iter()
            .enumerate()
            .map(|(i, path)| WatchPath {
                path,
                token_id: args
                    .token_ids
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("token-{i:03}")),
            })
            .collect();
    }

    let mut token_map = TokenMap::new();
    for watch in &config.agent.monitoring.watch_paths {
        token_map.insert(&watch.path, watch.token_id.clone());
        info!(path = %watch.path.display(), token = %watch.token_id, "watching");
    }
    if token_map.is_empty() {
        info!("no watch paths configured; reporting heartbeats only");
    }

    let queue = EventQueue::new(config.agent.monitoring.queue_size);
    let monitor = Monitor::new(
        queue.clone(),
        token_map,
        MonitorOptions {
            hash_tracking: config.agent.monitoring.hash_tracking,
            capture_process_info: config.agent.monitoring.capture_process_info,
        },
    );
    // External watchers drive this handle; it is the integration seam for a
    // platform filesystem-event source.
    let _handle = monitor.handle();

    let atime_sweep = config.agent.monitoring.watch_atime.then(|| {
        info!("access-time sweep enabled");
        spawn_atime_sweep(
            monitor.clone(),
            Duration::from_secs(config.agent.monitoring.atime_interval_seconds.max(1)),
        )
    });

    let mut sender = Sender::new(SenderConfig::from_agent_config(&config))?;
    info!(
        agent = %config.agent.agent_id,
        server = %config.agent.server.host,
        port = config.agent.server.port,
        "agent starting"
    );

    sender
        .run(queue.clone(), async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await;

    if let Some(sweep) = atime_sweep {
        sweep.abort();
    }

    let stats = sender.stats();
    info!(
        sent = stats.sent,
        failed = stats.failed,
        rate_limited = stats.rate_limited,
        reconnects = stats.reconnects,
        queue_dropped = queue.dropped(),
        "agent stopped"
    );
    Ok(())
}

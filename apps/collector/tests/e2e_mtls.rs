//! End-to-end over real loopback mTLS: a certificate-authenticated agent
//! sender talking to the full listener. Verifies that the identity recorded
//! on persisted events is the CommonName from the client certificate.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use hg_agent::monitor::MonitorRecord;
use hg_agent::sender::{Sender, SenderConfig};
use hg_collector::ingest::Ingest;
use hg_collector::server::Collector;
use hg_collector::tls::server_tls_config;
use hg_collector::ui::ui_channel;
use hg_replay::NonceCache;
use hg_store::{AgentStatus, Store};
use hg_wire::EventType;
use serde_json::Map;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct Pki {
    dir: TempDir,
}

impl Pki {
    fn generate(agent_id: &str) -> Self {
        let bundle = hg_certgen::generate(
            "honeygrid-collector",
            &hg_certgen::loopback_sans(),
            &[agent_id.to_string()],
        )
        .unwrap();
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("ca.crt"), &bundle.ca.cert).unwrap();
        fs::write(dir.path().join("server.crt"), &bundle.server.cert).unwrap();
        fs::write(dir.path().join("server.key"), &bundle.server.key).unwrap();
        let (_, client) = &bundle.clients[0];
        fs::write(dir.path().join("client.crt"), &client.cert).unwrap();
        fs::write(dir.path().join("client.key"), &client.key).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn certificate_bound_agent_delivers_event() {
    let pki = Pki::generate("agent-001");
    let db_dir = TempDir::new().unwrap();
    let store = Store::open(db_dir.path().join("test.db"), "pw").await.unwrap();

    let tls = server_tls_config(
        Path::new(&pki.path("ca.crt")),
        Path::new(&pki.path("server.crt")),
        Path::new(&pki.path("server.key")),
    )
    .unwrap();

    let (ui_tx, _ui_rx) = ui_channel(16);
    let ingest = Arc::new(Ingest::new(
        store.clone(),
        NonceCache::new(64),
        Vec::new(),
        ui_tx,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let collector = Collector {
        acceptor: TlsAcceptor::from(tls),
        ingest: Arc::clone(&ingest),
        store: store.clone(),
        handshake_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
    };
    let server = tokio::spawn(collector.serve(listener, async {
        shutdown_rx.await.ok();
    }));

    let mut sender = Sender::new(SenderConfig {
        agent_id: "agent-001".into(),
        server_host: "127.0.0.1".into(),
        server_port: addr.port(),
        ca_cert: pki.path("ca.crt"),
        client_cert: pki.path("client.crt"),
        client_key: pki.path("client.key"),
        rate: 10.0,
        burst: 20,
        heartbeat_interval: Duration::from_secs(30),
        reconnect_delay: Duration::from_secs(1),
    })
    .unwrap();

    sender.connect().await.unwrap();

    // The initial heartbeat registers the agent as healthy.
    assert!(
        wait_for(|| {
            let store = store.clone();
            async move {
                matches!(
                    store.get_agent("agent-001").await.unwrap(),
                    Some(agent) if agent.status == AgentStatus::Healthy
                )
            }
        })
        .await,
        "agent did not register via heartbeat"
    );

    let mut metadata = Map::new();
    metadata.insert("process_name".into(), serde_json::json!("cat"));
    let sent = sender
        .send_event(&MonitorRecord {
            token_id: "t-1".into(),
            path: "/srv/decoys/payroll.xlsx".into(),
            event_type: EventType::Opened,
            timestamp: hg_wire::now_ts(),
            is_directory: false,
            metadata,
        })
        .await
        .unwrap();
    assert!(sent);

    assert!(
        wait_for(|| {
            let store = store.clone();
            async move { !store.get_recent_events(10, None).await.unwrap().is_empty() }
        })
        .await,
        "event never reached the store"
    );

    let events = store.get_recent_events(10, None).await.unwrap();
    assert_eq!(events.len(), 1);
    // Identity binding: the stored agent id is the certificate CN.
    assert_eq!(events[0].agent_id, "agent-001");
    assert_eq!(events[0].event_type, EventType::Opened);
    assert_eq!(events[0].path, "/srv/decoys/payroll.xlsx");
    assert_eq!(events[0].data["metadata"]["process_name"], "cat");

    let agent = store.get_agent("agent-001").await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Warning);

    sender.disconnect();
    assert!(
        wait_for(|| {
            let store = store.clone();
            async move {
                matches!(
                    store.get_agent("agent-001").await.unwrap(),
                    Some(agent) if agent.status == AgentStatus::Offline
                )
            }
        })
        .await,
        "agent not marked offline after disconnect"
    );

    shutdown_tx.send(()).ok();
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn unauthenticated_client_is_rejected() {
    let pki = Pki::generate("agent-001");
    let db_dir = TempDir::new().unwrap();
    let store = Store::open(db_dir.path().join("test.db"), "pw").await.unwrap();

    let tls = server_tls_config(
        Path::new(&pki.path("ca.crt")),
        Path::new(&pki.path("server.crt")),
        Path::new(&pki.path("server.key")),
    )
    .unwrap();

    let (ui_tx, _ui_rx) = ui_channel(16);
    let ingest = Arc::new(Ingest::new(
        store.clone(),
        NonceCache::new(64),
        Vec::new(),
        ui_tx,
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let collector = Collector {
        acceptor: TlsAcceptor::from(tls),
        ingest,
        store: store.clone(),
        handshake_timeout: Duration::from_secs(5),
        shutdown_grace: Duration::from_secs(2),
    };
    let server = tokio::spawn(collector.serve(listener, async {
        shutdown_rx.await.ok();
    }));

    // A different PKI: this client's certificate is not signed by the
    // collector's CA, so the handshake must fail.
    let rogue = Pki::generate("agent-rogue");
    let mut sender = Sender::new(SenderConfig {
        agent_id: "agent-rogue".into(),
        server_host: "127.0.0.1".into(),
        server_port: addr.port(),
        // Trusts the real collector CA so the server cert verifies...
        ca_cert: pki.path("ca.crt"),
        // ...but presents a certificate from an unrelated CA.
        client_cert: rogue.path("client.crt"),
        client_key: rogue.path("client.key"),
        rate: 10.0,
        burst: 20,
        heartbeat_interval: Duration::from_secs(30),
        reconnect_delay: Duration::from_secs(1),
    })
    .unwrap();

    // With TLS 1.3 the client may finish its half of the handshake before
    // the server's rejection alert lands, so connect() itself is allowed to
    // succeed; the session must never materialise either way.
    let _ = sender.connect().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(store.get_agent("agent-rogue").await.unwrap().is_none());
    assert!(store.get_all_agents().await.unwrap().is_empty());

    shutdown_tx.send(()).ok();
    server.await.unwrap().unwrap();
}

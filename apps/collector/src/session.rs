//! Per-connection session: register the agent, read frames, dispatch, and
//! mark the agent offline on exit.
//!
//! The session is generic over the stream so tests can drive it through
//! in-memory duplex pipes with an injected identity; the listener hands it
//! the TLS stream and the certificate-bound CommonName.

use std::net::SocketAddr;
use std::sync::Arc;

use hg_store::{AgentStatus, Store};
use hg_wire::WireError;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, warn};

use crate::ingest::Ingest;

/// Runs one established session to completion. Returns the number of
/// messages processed.
pub async fn run_session<S>(
    mut stream: S,
    agent_id: String,
    peer: SocketAddr,
    ingest: Arc<Ingest>,
    store: Store,
) -> anyhow::Result<u64>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut metadata = Map::new();
    metadata.insert("port".into(), Value::from(peer.port()));
    store
        .register_agent(&agent_id, None, Some(peer.ip().to_string()), metadata)
        .await?;
    info!(agent = %agent_id, peer = %peer, "session established");

    let mut processed: u64 = 0;
    loop {
        let payload = match hg_wire::read_frame(&mut stream).await {
            Ok(payload) => payload,
            Err(WireError::Eof) => {
                info!(agent = %agent_id, "connection closed by peer");
                break;
            }
            Err(err) => {
                warn!(agent = %agent_id, error = %err, "closing connection on framing error");
                break;
            }
        };

        match hg_wire::parse(&payload) {
            Ok(envelope) => {
                ingest.process(&agent_id, &envelope).await;
                processed += 1;
            }
            Err(err) => {
                // Per-message validation failure: drop it, keep reading.
                warn!(agent = %agent_id, error = %err, "invalid message dropped");
            }
        }
    }

    if let Err(err) = store
        .update_agent_status(&agent_id, AgentStatus::Offline)
        .await
    {
        warn!(agent = %agent_id, error = %err, "failed to mark agent offline");
    }
    info!(agent = %agent_id, processed, "session closed");
    Ok(processed)
}

//! TLS accept loop and graceful shutdown.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hg_store::Store;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use crate::ingest::Ingest;
use crate::{session, tls};

pub struct Collector {
    pub acceptor: TlsAcceptor,
    pub ingest: Arc<Ingest>,
    pub store: Store,
    pub handshake_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Collector {
    /// Accepts connections until `shutdown` resolves, then waits out
    /// in-flight sessions for the configured grace period.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut sessions: JoinSet<()> = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((tcp, peer)) => {
                            let acceptor = self.acceptor.clone();
                            let ingest = Arc::clone(&self.ingest);
                            let store = self.store.clone();
                            let handshake_timeout = self.handshake_timeout;
                            sessions.spawn(async move {
                                handle_connection(acceptor, tcp, peer, ingest, store, handshake_timeout)
                                    .await;
                            });
                        }
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                        }
                    }
                }
            }
        }

        if !sessions.is_empty() {
            info!(
                in_flight = sessions.len(),
                grace_secs = self.shutdown_grace.as_secs(),
                "waiting for in-flight sessions"
            );
            let drain = async {
                while sessions.join_next().await.is_some() {}
            };
            if timeout(self.shutdown_grace, drain).await.is_err() {
                warn!("grace period elapsed, aborting remaining sessions");
                sessions.abort_all();
            }
        }
        Ok(())
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    peer: SocketAddr,
    ingest: Arc<Ingest>,
    store: Store,
    handshake_timeout: Duration,
) {
    let tls_stream = match timeout(handshake_timeout, acceptor.accept(tcp)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(peer = %peer, error = %err, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, "TLS handshake timed out");
            return;
        }
    };

    let agent_id = {
        let (_, conn) = tls_stream.get_ref();
        tls::peer_common_name(conn).unwrap_or_else(|| tls::anonymous_identity(peer))
    };

    if let Err(err) = session::run_session(tls_stream, agent_id.clone(), peer, ingest, store).await
    {
        warn!(agent = %agent_id, error = %err, "session ended with error");
    }
}

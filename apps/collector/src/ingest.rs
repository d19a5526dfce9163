//! The ingest pipeline: identity check, replay screening, dispatch by
//! message type, persistence and fan-out.
//!
//! Every outcome that drops a message keeps the connection open; only the
//! framing layer (in the session) closes connections. Sink dispatch is
//! spawned off the ingest task so notifier network I/O never delays the
//! next frame.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use hg_notify::{EventAlert, NotifierGate};
use hg_replay::NonceCache;
use hg_store::{AgentStatus, NewEvent, Store, StoreError};
use hg_wire::{Envelope, EventData, Payload};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::ui::{UiEvent, UiSender};

/// What happened to one message; used by the session log and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Stored(i64),
    Heartbeat,
    Status,
    Ignored,
    IdentityMismatch,
    Replay,
    Invalid,
    StorageFailed,
}

#[derive(Default)]
pub struct IngestCounters {
    messages: AtomicU64,
    events_stored: AtomicU64,
    heartbeats: AtomicU64,
    replays: AtomicU64,
    identity_rejects: AtomicU64,
    ui_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSnapshot {
    pub messages: u64,
    pub events_stored: u64,
    pub heartbeats: u64,
    pub replays: u64,
    pub identity_rejects: u64,
    pub ui_dropped: u64,
}

impl IngestCounters {
    pub fn snapshot(&self) -> IngestSnapshot {
        IngestSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            events_stored: self.events_stored.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            identity_rejects: self.identity_rejects.load(Ordering::Relaxed),
            ui_dropped: self.ui_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Shared ingest state; one instance serves every session.
pub struct Ingest {
    store: Store,
    nonce_cache: NonceCache,
    gates: Arc<Vec<Arc<NotifierGate>>>,
    ui: UiSender,
    counters: IngestCounters,
}

impl Ingest {
    pub fn new(
        store: Store,
        nonce_cache: NonceCache,
        gates: Vec<Arc<NotifierGate>>,
        ui: UiSender,
    ) -> Self {
        Self {
            store,
            nonce_cache,
            gates: Arc::new(gates),
            ui,
            counters: IngestCounters::default(),
        }
    }

    pub fn counters(&self) -> IngestSnapshot {
        self.counters.snapshot()
    }

    pub fn nonce_cache(&self) -> &NonceCache {
        &self.nonce_cache
    }

    /// Processes one validated envelope received on a session bound to
    /// `session_agent`.
    pub async fn process(&self, session_agent: &str, envelope: &Envelope) -> Outcome {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);

        // Certificate binding: the claimed agent id must match the CN the
        // session authenticated with.
        if envelope.header.agent_id != session_agent {
            warn!(
                session = %session_agent,
                claimed = %envelope.header.agent_id,
                "agent id mismatch, dropping message (impersonation attempt)"
            );
            self.counters.identity_rejects.fetch_add(1, Ordering::Relaxed);
            return Outcome::IdentityMismatch;
        }

        let nonce = &envelope.header.nonce;
        if self.nonce_cache.contains(nonce) {
            warn!(agent = %session_agent, nonce = %nonce, "replayed nonce, dropping message");
            self.counters.replays.fetch_add(1, Ordering::Relaxed);
            return Outcome::Replay;
        }
        self.nonce_cache.add(nonce);

        match envelope.payload() {
            Ok(Payload::Event(event)) => self.handle_event(session_agent, envelope, event).await,
            Ok(Payload::Heartbeat(heartbeat)) => {
                self.counters.heartbeats.fetch_add(1, Ordering::Relaxed);
                let status = AgentStatus::parse(&heartbeat.status).unwrap_or_else(|| {
                    debug!(
                        agent = %session_agent,
                        status = %heartbeat.status,
                        "unknown heartbeat status, treating as warning"
                    );
                    AgentStatus::Warning
                });
                debug!(agent = %session_agent, status = %status, "heartbeat");
                if let Err(err) = self.store.update_agent_status(session_agent, status).await {
                    error!(agent = %session_agent, error = %err, "heartbeat status update failed");
                }
                Outcome::Heartbeat
            }
            Ok(Payload::Status(data)) => {
                info!(agent = %session_agent, data = %data, "agent status report");
                Outcome::Status
            }
            Ok(Payload::DeployResponse(data)) => {
                debug!(agent = %session_agent, data = %data, "deploy response ignored");
                Outcome::Ignored
            }
            Err(err) => {
                warn!(agent = %session_agent, error = %err, "malformed payload dropped");
                Outcome::Invalid
            }
        }
    }

    async fn handle_event(
        &self,
        agent_id: &str,
        envelope: &Envelope,
        event: EventData,
    ) -> Outcome {
        warn!(
            agent = %agent_id,
            token = %event.token_id,
            path = %event.path,
            event_type = %event.event_type,
            "honeytoken triggered"
        );

        let data = match &envelope.data {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        let new_event = NewEvent {
            agent_id: agent_id.to_string(),
            token_id: event.token_id.clone(),
            path: event.path.clone(),
            event_type: event.event_type,
            nonce: envelope.header.nonce.clone(),
            timestamp: Some(envelope.header.timestamp),
            data,
        };

        let event_id = match self.store.insert_event(new_event).await {
            Ok(id) => id,
            Err(StoreError::DuplicateNonce(nonce)) => {
                // Evicted from the cache but still in the table: the unique
                // constraint is the authoritative defence.
                warn!(agent = %agent_id, nonce = %nonce, "replayed nonce rejected by store");
                self.counters.replays.fetch_add(1, Ordering::Relaxed);
                return Outcome::Replay;
            }
            Err(err) => {
                error!(agent = %agent_id, error = %err, "failed to store event");
                return Outcome::StorageFailed;
            }
        };
        self.counters.events_stored.fetch_add(1, Ordering::Relaxed);
        info!(agent = %agent_id, event_id, "event stored");

        let alert = EventAlert {
            agent_id: agent_id.to_string(),
            token_id: event.token_id.clone(),
            path: event.path.clone(),
            event_type: event.event_type,
            timestamp: envelope.header.timestamp,
            severity: None,
        };
        if !self.gates.is_empty() {
            let gates = Arc::clone(&self.gates);
            let alert = alert.clone();
            tokio::spawn(async move {
                for gate in gates.iter() {
                    gate.notify(&alert).await;
                }
            });
        }

        let ui_event = UiEvent {
            event_id,
            agent_id: agent_id.to_string(),
            token_id: event.token_id,
            path: event.path,
            event_type: event.event_type,
            timestamp: envelope.header.timestamp,
        };
        if self.ui.try_send(ui_event).is_err() {
            self.counters.ui_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("ui queue full, dropping copy");
        }

        Outcome::Stored(event_id)
    }
}

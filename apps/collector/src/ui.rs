//! Bounded side-queue feeding the operator dashboard.
//!
//! The dashboard itself is an external consumer; ingest pushes best-effort
//! copies of stored events here and silently drops them when the queue is
//! full, since persistence has already succeeded by then.

use hg_wire::EventType;
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UiEvent {
    pub event_id: i64,
    pub agent_id: String,
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    pub timestamp: i64,
}

pub type UiSender = mpsc::Sender<UiEvent>;
pub type UiReceiver = mpsc::Receiver<UiEvent>;

pub fn ui_channel(capacity: usize) -> (UiSender, UiReceiver) {
    mpsc::channel(capacity.max(1))
}

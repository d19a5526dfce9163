//! Wire protocol between HoneyGrid agents and the collector.
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed by
//! a JSON payload of exactly that many bytes:
//!
//! ```text
//! [u32 length (big-endian)][JSON payload]
//! ```
//!
//! The payload is an envelope with a `header` (nonce, timestamp, agent id,
//! message type) and a free-form `data` object whose shape depends on the
//! message type. JSON is the wire format only; callers work with [`Envelope`]
//! and the typed [`Payload`] views.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Length prefix size in bytes.
pub const LEN_PREFIX: usize = 4;
/// Maximum payload size accepted on the wire (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Nonce size in raw bytes (before base64).
pub const NONCE_SIZE: usize = 12;
/// Maximum allowed clock skew between peers, in seconds.
pub const TIMESTAMP_TOLERANCE: i64 = 60;

/// Errors produced by the codec.
///
/// `Framing`, `TooLarge` and `Eof` are connection-fatal; `InvalidMessage`
/// drops the offending message but the connection stays open.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid frame length: {0}")]
    Framing(u32),
    #[error("message size {0} exceeds maximum {MAX_MESSAGE_SIZE}")]
    TooLarge(usize),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("connection closed")]
    Eof,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether the error must terminate the connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, WireError::InvalidMessage(_))
    }
}

/// Message types understood by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Event,
    Heartbeat,
    Status,
    DeployResponse,
}

impl MsgType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MsgType::Event => "event",
            MsgType::Heartbeat => "heartbeat",
            MsgType::Status => "status",
            MsgType::DeployResponse => "deploy_response",
        }
    }
}

/// Filesystem event kinds reported against a honeytoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Modified,
    Opened,
    Accessed,
    Moved,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Created => "created",
            EventType::Modified => "modified",
            EventType::Opened => "opened",
            EventType::Accessed => "accessed",
            EventType::Moved => "moved",
            EventType::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(EventType::Created),
            "modified" => Some(EventType::Modified),
            "opened" => Some(EventType::Opened),
            "accessed" => Some(EventType::Accessed),
            "moved" => Some(EventType::Moved),
            "deleted" => Some(EventType::Deleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope header carried by every message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    /// Base64 of [`NONCE_SIZE`] random bytes; the replay-protection key.
    pub nonce: String,
    /// Sender wall-clock, unix seconds.
    pub timestamp: i64,
    pub agent_id: String,
    pub msg_type: MsgType,
}

/// A complete protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub header: Header,
    pub data: Value,
}

/// Typed view over `data`, selected by the header's message type.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Event(EventData),
    Heartbeat(HeartbeatData),
    Status(Value),
    DeployResponse(Value),
}

/// Required fields of an `event` message; extra keys are preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatData {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<f64>,
}

/// Current wall-clock as unix seconds.
pub fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Generates a fresh base64-encoded [`NONCE_SIZE`]-byte nonce from the
/// process CSPRNG.
pub fn generate_nonce() -> String {
    let mut buf = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut buf);
    B64.encode(buf)
}

impl Envelope {
    /// Builds a message with a fresh nonce and the current timestamp.
    pub fn new(agent_id: impl Into<String>, msg_type: MsgType, data: Value) -> Self {
        Self {
            header: Header {
                nonce: generate_nonce(),
                timestamp: now_ts(),
                agent_id: agent_id.into(),
                msg_type,
            },
            data,
        }
    }

    pub fn event(
        agent_id: impl Into<String>,
        token_id: impl Into<String>,
        path: impl Into<String>,
        event_type: EventType,
        extra: Map<String, Value>,
    ) -> Self {
        let mut data = Map::new();
        data.insert("token_id".into(), Value::String(token_id.into()));
        data.insert("path".into(), Value::String(path.into()));
        data.insert("event_type".into(), Value::String(event_type.as_str().into()));
        for (k, v) in extra {
            data.entry(k).or_insert(v);
        }
        Self::new(agent_id, MsgType::Event, Value::Object(data))
    }

    pub fn heartbeat(agent_id: impl Into<String>, status: &str, uptime: Option<f64>) -> Self {
        let mut data = Map::new();
        data.insert("status".into(), Value::String(status.into()));
        if let Some(uptime) = uptime {
            data.insert("uptime".into(), uptime.into());
        }
        Self::new(agent_id, MsgType::Heartbeat, Value::Object(data))
    }

    /// Validates the envelope against `now` (V2–V5).
    ///
    /// Structural failures (V1, missing header/data, unknown msg_type) are
    /// caught earlier during deserialization in [`parse_at`].
    pub fn validate_at(&self, now: i64) -> Result<(), WireError> {
        let nonce = B64
            .decode(&self.header.nonce)
            .map_err(|err| WireError::InvalidMessage(format!("invalid nonce encoding: {err}")))?;
        if nonce.len() != NONCE_SIZE {
            return Err(WireError::InvalidMessage(format!(
                "invalid nonce size: {} (expected {NONCE_SIZE})",
                nonce.len()
            )));
        }
        let skew = (now - self.header.timestamp).abs();
        if skew > TIMESTAMP_TOLERANCE {
            return Err(WireError::InvalidMessage(format!(
                "timestamp out of tolerance: {skew}s (max {TIMESTAMP_TOLERANCE}s)"
            )));
        }
        if self.header.agent_id.is_empty() {
            return Err(WireError::InvalidMessage("empty agent_id".into()));
        }
        if !self.data.is_object() {
            return Err(WireError::InvalidMessage("data must be an object".into()));
        }
        Ok(())
    }

    /// Decodes `data` into the typed payload for this message type.
    pub fn payload(&self) -> Result<Payload, WireError> {
        match self.header.msg_type {
            MsgType::Event => serde_json::from_value(self.data.clone())
                .map(Payload::Event)
                .map_err(|err| WireError::InvalidMessage(format!("bad event data: {err}"))),
            MsgType::Heartbeat => serde_json::from_value(self.data.clone())
                .map(Payload::Heartbeat)
                .map_err(|err| WireError::InvalidMessage(format!("bad heartbeat data: {err}"))),
            MsgType::Status => Ok(Payload::Status(self.data.clone())),
            MsgType::DeployResponse => Ok(Payload::DeployResponse(self.data.clone())),
        }
    }
}

/// Serializes an envelope into a framed byte buffer ready for the socket.
pub fn frame(envelope: &Envelope) -> Result<Vec<u8>, WireError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|err| WireError::InvalidMessage(format!("serialize: {err}")))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(payload.len()));
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Reads one frame off the stream and returns the raw payload bytes.
///
/// A clean or mid-frame EOF maps to [`WireError::Eof`]; a zero or oversize
/// length prefix is a framing error and the caller must close the
/// connection.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_PREFIX];
    read_exact_or_eof(reader, &mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(WireError::Framing(0));
    }
    if len as usize > MAX_MESSAGE_SIZE {
        return Err(WireError::TooLarge(len as usize));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_or_eof(reader, &mut payload).await?;
    Ok(payload)
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError>
where
    R: AsyncRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => Err(WireError::Eof),
        Err(err) => Err(WireError::Io(err)),
    }
}

/// Parses and validates a payload against the current clock.
pub fn parse(payload: &[u8]) -> Result<Envelope, WireError> {
    parse_at(payload, now_ts())
}

/// Parses and validates a payload against an explicit clock, for callers
/// and tests that control time.
pub fn parse_at(payload: &[u8], now: i64) -> Result<Envelope, WireError> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| WireError::InvalidMessage(format!("invalid utf-8: {err}")))?;
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|err| WireError::InvalidMessage(format!("invalid json: {err}")))?;
    envelope.validate_at(now)?;
    Ok(envelope)
}

//! Collector internals: configuration, TLS bootstrap, per-connection
//! sessions, the ingest pipeline, the liveness sweep and the UI side-queue.
//!
//! The binary in `main.rs` wires these together; integration tests drive
//! [`session::run_session`] over in-memory streams and the full listener
//! over loopback mTLS.

pub mod config;
pub mod health;
pub mod ingest;
pub mod server;
pub mod session;
pub mod tls;
pub mod ui;

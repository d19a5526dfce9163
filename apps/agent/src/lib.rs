//! Agent internals: honeytoken monitoring, the bounded record queue and the
//! rate-limited mutual-TLS sender.
//!
//! The native filesystem watcher is an external collaborator. It drives
//! [`monitor::MonitorHandle`], which translates raw observations into typed
//! records. The sender consumes those records and streams them to the
//! collector.

pub mod config;
pub mod monitor;
pub mod process;
pub mod queue;
pub mod sender;

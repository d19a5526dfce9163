//! Honeytoken monitoring: path-to-token resolution, process capture,
//! content-hash tracking and the optional access-time sweep.
//!
//! The OS file watcher is the external collaborator; it reports raw
//! observations through [`MonitorHandle`] and this module turns them into
//! [`MonitorRecord`]s on the queue. An observation resolves to a token by
//! exact path, by being inside a monitored directory, or by sitting next to
//! a monitored file: attackers probing around a decoy are signal too.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use hg_wire::EventType;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::process;
use crate::queue::EventQueue;

/// A typed observation ready for the sender.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorRecord {
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    pub timestamp: i64,
    pub is_directory: bool,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct WatchEntry {
    pub path: PathBuf,
    pub token_id: String,
    pub is_dir: bool,
}

/// Canonicalises a path that may no longer exist (deleted decoys): fall
/// back to the canonical parent plus the file name.
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// Mapping from monitored paths to token ids.
#[derive(Debug, Default)]
pub struct TokenMap {
    entries: Vec<WatchEntry>,
}

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl AsRef<Path>, token_id: impl Into<String>) {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "watch path does not exist");
        }
        let normalized = normalize(path);
        self.entries.push(WatchEntry {
            is_dir: normalized.is_dir(),
            path: normalized,
            token_id: token_id.into(),
        });
    }

    pub fn entries(&self) -> &[WatchEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolves an observed path to a token: exact match first, then
    /// directory containment, then same-directory siblings of a monitored
    /// file.
    pub fn resolve(&self, observed: &Path) -> Option<String> {
        let observed = normalize(observed);
        for entry in &self.entries {
            if entry.path == observed {
                return Some(entry.token_id.clone());
            }
        }
        for entry in &self.entries {
            if entry.is_dir {
                if observed.starts_with(&entry.path) {
                    return Some(entry.token_id.clone());
                }
            } else if observed.parent() == entry.path.parent() {
                return Some(entry.token_id.clone());
            }
        }
        None
    }
}

/// SHA-256 content tracking for monitored files.
#[derive(Default)]
pub struct HashTracker {
    hashes: Mutex<HashMap<PathBuf, String>>,
}

impl HashTracker {
    /// Hashes a file's contents in chunks; `None` when unreadable.
    pub fn calculate(path: &Path) -> Option<String> {
        let mut file = std::fs::File::open(path).ok()?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 4096];
        loop {
            let read = file.read(&mut buf).ok()?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Some(hex::encode(hasher.finalize()))
    }

    pub fn original(&self, path: &Path) -> Option<String> {
        self.hashes.lock().unwrap().get(path).cloned()
    }

    pub fn store(&self, path: &Path, hash: String) {
        self.hashes.lock().unwrap().insert(path.to_path_buf(), hash);
    }
}

/// Feature toggles for the monitor.
#[derive(Debug, Clone, Copy)]
pub struct MonitorOptions {
    pub hash_tracking: bool,
    pub capture_process_info: bool,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            hash_tracking: true,
            capture_process_info: true,
        }
    }
}

/// Shared monitor state behind every [`MonitorHandle`].
pub struct Monitor {
    map: TokenMap,
    queue: EventQueue,
    hashes: HashTracker,
    options: MonitorOptions,
}

impl Monitor {
    pub fn new(queue: EventQueue, map: TokenMap, options: MonitorOptions) -> Arc<Self> {
        Arc::new(Self {
            map,
            queue,
            hashes: HashTracker::default(),
            options,
        })
    }

    pub fn handle(self: &Arc<Self>) -> MonitorHandle {
        MonitorHandle(Arc::clone(self))
    }

    pub fn watched(&self) -> &[WatchEntry] {
        self.map.entries()
    }

    fn emit(
        &self,
        path: &Path,
        event_type: EventType,
        is_directory: bool,
        mut metadata: Map<String, Value>,
    ) {
        let Some(token_id) = self.map.resolve(path) else {
            return;
        };

        if self.options.capture_process_info && !is_directory {
            if let Some(info) = process::capture_for_path(path) {
                info.apply_to(&mut metadata);
            }
        }

        if self.options.hash_tracking && !is_directory {
            match event_type {
                EventType::Created => {
                    if let Some(hash) = HashTracker::calculate(path) {
                        metadata.insert("file_hash_original".into(), Value::String(hash.clone()));
                        self.hashes.store(path, hash);
                    }
                }
                EventType::Modified | EventType::Opened | EventType::Accessed => {
                    let current = HashTracker::calculate(path);
                    let original = self.hashes.original(path);
                    let content_modified = match (&original, &current) {
                        (None, _) => false,
                        (Some(_), None) => true,
                        (Some(original), Some(current)) => original != current,
                    };
                    if let Some(original) = &original {
                        metadata
                            .insert("file_hash_original".into(), Value::String(original.clone()));
                    }
                    if let Some(current) = &current {
                        metadata.insert("file_hash_current".into(), Value::String(current.clone()));
                        self.hashes.store(path, current.clone());
                    }
                    metadata.insert("content_modified".into(), Value::Bool(content_modified));
                }
                EventType::Moved | EventType::Deleted => {}
            }
        }

        let record = MonitorRecord {
            token_id,
            path: path.display().to_string(),
            event_type,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            is_directory,
            metadata,
        };
        debug!(
            token = %record.token_id,
            path = %record.path,
            event_type = %record.event_type,
            "observation recorded"
        );
        self.queue.push(record);
    }
}

/// Entry points for the external filesystem watcher.
#[derive(Clone)]
pub struct MonitorHandle(Arc<Monitor>);

impl MonitorHandle {
    pub fn on_created(&self, path: &Path, is_directory: bool) {
        self.0.emit(path, EventType::Created, is_directory, Map::new());
    }

    pub fn on_modified(&self, path: &Path, is_directory: bool) {
        // Directory modification notifications fire for every child change.
        if is_directory {
            return;
        }
        self.0.emit(path, EventType::Modified, false, Map::new());
    }

    pub fn on_deleted(&self, path: &Path, is_directory: bool) {
        self.0.emit(path, EventType::Deleted, is_directory, Map::new());
    }

    pub fn on_moved(&self, src: &Path, dest: &Path, is_directory: bool) {
        let mut metadata = Map::new();
        metadata.insert(
            "dest_path".into(),
            Value::String(dest.display().to_string()),
        );
        self.0.emit(src, EventType::Moved, is_directory, metadata);
    }
}

/// Spawns the access-time poller: emits an `accessed` record whenever a
/// monitored path's atime advances. Best-effort; only meaningful on
/// filesystems that track access times.
pub fn spawn_atime_sweep(
    monitor: Arc<Monitor>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_seen: HashMap<PathBuf, SystemTime> = HashMap::new();
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(100)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let paths: Vec<PathBuf> = monitor
                .map
                .entries()
                .iter()
                .map(|entry| entry.path.clone())
                .collect();
            for path in paths {
                let Ok(meta) = std::fs::metadata(&path) else {
                    continue;
                };
                let Ok(atime) = meta.accessed() else {
                    continue;
                };
                if let Some(previous) = last_seen.get(&path) {
                    if atime > *previous {
                        let mut metadata = Map::new();
                        metadata.insert("atime_changed".into(), Value::Bool(true));
                        monitor.emit(&path, EventType::Accessed, meta.is_dir(), metadata);
                    }
                }
                last_seen.insert(path, atime);
            }
        }
    })
}

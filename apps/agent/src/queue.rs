//! Bounded queue between the monitor (producer) and the sender (consumer).
//!
//! There is no on-disk spool: when the collector is unreachable the queue
//! fills and the oldest record is dropped to make room, so a reconnecting
//! agent ships the freshest evidence first-in order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use crate::monitor::MonitorRecord;

#[derive(Clone)]
pub struct EventQueue {
    inner: Arc<Inner>,
}

struct Inner {
    buf: Mutex<VecDeque<MonitorRecord>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                buf: Mutex::new(VecDeque::new()),
                capacity: capacity.max(1),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Enqueues a record, evicting the oldest one when full.
    pub fn push(&self, record: MonitorRecord) {
        {
            let mut buf = self.inner.buf.lock().unwrap();
            if buf.len() == self.inner.capacity {
                buf.pop_front();
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("record queue full, dropping oldest");
            }
            buf.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    fn try_pop(&self) -> Option<MonitorRecord> {
        self.inner.buf.lock().unwrap().pop_front()
    }

    /// Dequeues the next record, waiting up to `wait` for one to arrive.
    pub async fn pop(&self, wait: Duration) -> Option<MonitorRecord> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.notify.notified();
            if let Some(record) = self.try_pop() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.buf.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

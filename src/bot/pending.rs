//! In-memory photo queues keyed by (tenant, sender).
//!
//! Two independent queues: photos a staff member is uploading for a new
//! listing, and catalog photos waiting to be sent after the next reply.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::store::TenantId;

type QueueKey = (TenantId, String);

#[derive(Debug)]
struct Entry {
    paths: Vec<String>,
    touched: Instant,
}

impl Entry {
    fn new() -> Self {
        Self { paths: Vec::new(), touched: Instant::now() }
    }

    fn expired(&self, ttl: Duration) -> bool {
        self.touched.elapsed() >= ttl
    }
}

/// Result of offering a photo to the upload queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotoAdded {
    /// Queued; `count` photos are now pending.
    Accepted { count: usize },
    /// Queued, and the queue is now full.
    LimitReached { count: usize },
    /// Not queued, the queue was already full.
    Rejected { count: usize },
}

pub struct PendingQueues {
    uploads: Mutex<HashMap<QueueKey, Entry>>,
    outbound: Mutex<HashMap<QueueKey, Entry>>,
    max_photos: usize,
    ttl: Duration,
}

fn key(tenant: TenantId, sender: &str) -> QueueKey {
    (tenant, sender.to_string())
}

/// Look up a live entry, dropping it first if it has expired.
fn live<'a>(map: &'a mut HashMap<QueueKey, Entry>, key: &QueueKey, ttl: Duration) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(|e| e.expired(ttl)) {
        map.remove(key);
    }
    map.get_mut(key)
}

impl PendingQueues {
    pub fn new(max_photos: usize, ttl: Duration) -> Self {
        Self {
            uploads: Mutex::new(HashMap::new()),
            outbound: Mutex::new(HashMap::new()),
            max_photos,
            ttl,
        }
    }

    pub fn max_photos(&self) -> usize {
        self.max_photos
    }

    /// Whether another upload photo would be accepted.
    pub async fn has_room(&self, tenant: TenantId, sender: &str) -> bool {
        let mut uploads = self.uploads.lock().await;
        live(&mut uploads, &key(tenant, sender), self.ttl).is_none_or(|e| e.paths.len() < self.max_photos)
    }

    pub async fn add_upload(&self, tenant: TenantId, sender: &str, path: String) -> PhotoAdded {
        let mut uploads = self.uploads.lock().await;
        let k = key(tenant, sender);
        if live(&mut uploads, &k, self.ttl).is_none() {
            uploads.insert(k.clone(), Entry::new());
        }
        let Some(entry) = uploads.get_mut(&k) else {
            return PhotoAdded::Rejected { count: 0 };
        };

        if entry.paths.len() >= self.max_photos {
            return PhotoAdded::Rejected { count: entry.paths.len() };
        }
        entry.paths.push(path);
        entry.touched = Instant::now();

        let count = entry.paths.len();
        if count >= self.max_photos {
            PhotoAdded::LimitReached { count }
        } else {
            PhotoAdded::Accepted { count }
        }
    }

    /// Pending upload photos, oldest first.
    pub async fn uploads(&self, tenant: TenantId, sender: &str) -> Vec<String> {
        let mut uploads = self.uploads.lock().await;
        live(&mut uploads, &key(tenant, sender), self.ttl)
            .map(|e| e.paths.clone())
            .unwrap_or_default()
    }

    /// Remove the first `n` pending photos (the ones a listing just used).
    pub async fn consume_uploads(&self, tenant: TenantId, sender: &str, n: usize) {
        let mut uploads = self.uploads.lock().await;
        let k = key(tenant, sender);
        if let Some(entry) = uploads.get_mut(&k) {
            let n = n.min(entry.paths.len());
            entry.paths.drain(..n);
            if entry.paths.is_empty() {
                uploads.remove(&k);
            }
        }
    }

    /// Drop every pending upload photo. Returns the dropped paths.
    pub async fn clear_uploads(&self, tenant: TenantId, sender: &str) -> Vec<String> {
        let mut uploads = self.uploads.lock().await;
        uploads.remove(&key(tenant, sender)).map(|e| e.paths).unwrap_or_default()
    }

    /// Replace the sender's outbound image queue.
    pub async fn queue_outbound(&self, tenant: TenantId, sender: &str, paths: Vec<String>) {
        let mut outbound = self.outbound.lock().await;
        outbound.insert(key(tenant, sender), Entry { paths, touched: Instant::now() });
    }

    pub async fn take_outbound(&self, tenant: TenantId, sender: &str) -> Vec<String> {
        let mut outbound = self.outbound.lock().await;
        match outbound.remove(&key(tenant, sender)) {
            Some(entry) if !entry.expired(self.ttl) => entry.paths,
            _ => Vec::new(),
        }
    }

    /// Evict expired entries from both queues. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let ttl = self.ttl;
        let mut removed = 0;
        for queue in [&self.uploads, &self.outbound] {
            let mut map = queue.lock().await;
            let before = map.len();
            map.retain(|_, e| !e.expired(ttl));
            removed += before - map.len();
        }
        removed
    }

    /// Run `sweep` every `interval` until the process exits.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let queues = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            loop {
                interval.tick().await;
                let removed = queues.sweep().await;
                if removed > 0 {
                    info!("🧹 Evicted {} expired photo queue(s)", removed);
                } else {
                    debug!("Photo queue sweep: nothing expired");
                }
            }
        })
    }
}

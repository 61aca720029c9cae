use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use uuid::Uuid;

#[derive(Clone)]
struct FileRefEntry {
    bytes: Bytes,
    content_type: String,
    created_at: Instant,
    ttl: Duration,
}

impl FileRefEntry {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) > self.ttl
    }
}

/// Short-lived keyed byte store bridging HTTP uploads into WS-submitted jobs.
/// Refs are multi-read within their TTL, which is the safer interpretation for
/// client retries than single-use semantics.
pub struct FileRefStore {
    entries: DashMap<String, FileRefEntry>,
    default_ttl: Duration,
}

impl FileRefStore {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn put(&self, bytes: Bytes, content_type: String) -> String {
        let key = Uuid::new_v4().simple().to_string();
        self.entries.insert(
            key.clone(),
            FileRefEntry {
                bytes,
                content_type,
                created_at: Instant::now(),
                ttl: self.default_ttl,
            },
        );
        key
    }

    /// Returns the bytes for `reference` iff it exists and has not yet expired.
    /// Does not remove the entry: a `fileRef` may be read by more than one job
    /// within its TTL window.
    pub fn take(&self, reference: &str) -> Option<Bytes> {
        let entry = self.entries.get(reference)?;
        if entry.expired(Instant::now()) {
            return None;
        }
        Some(entry.bytes.clone())
    }

    pub fn content_type(&self, reference: &str) -> Option<String> {
        let entry = self.entries.get(reference)?;
        if entry.expired(Instant::now()) {
            return None;
        }
        Some(entry.content_type.clone())
    }

    /// Removes every entry older than its TTL. Intended to be called on a
    /// fixed cadence by a background sweeper task.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.expired(now));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

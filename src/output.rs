use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Clone)]
pub struct OutputBlob {
    pub bytes: Bytes,
    pub mime: String,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed output store. Written by the Worker Pool on job success,
/// served by the HTTP Bridge. Immutable once a key is written: re-writing the
/// same key with the same bytes is a harmless no-op.
#[derive(Default)]
pub struct OutputStore {
    blobs: DashMap<String, OutputBlob>,
}

impl OutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: String, bytes: Bytes, mime: String) {
        self.blobs.entry(key).or_insert_with(|| OutputBlob {
            bytes,
            mime,
            created_at: Utc::now(),
        });
    }

    pub fn get(&self, key: &str) -> Option<OutputBlob> {
        self.blobs.get(key).map(|b| b.clone())
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

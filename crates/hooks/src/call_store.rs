//! Bounded map from correlation key to call id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

struct CallRecord {
    call_id: String,
    inserted: Instant,
    seq: u64,
}

struct Inner {
    records: HashMap<String, CallRecord>,
    next_seq: u64,
}

/// In-flight call records owned by one correlator.
///
/// Records older than `ttl` are treated as gone, and once `max_entries` is
/// reached the oldest record is evicted to make room. Neither limit affects
/// a before/after pair that completes normally.
pub struct CallStore {
    inner: Mutex<Inner>,
    max_entries: usize,
    ttl: Duration,
}

impl CallStore {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                next_seq: 0,
            }),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    /// Record `call_id` under `key`. An existing record for the same key is replaced.
    pub fn insert(&self, key: String, call_id: String) {
        let mut inner = self.lock();
        let now = Instant::now();
        prune_expired(&mut inner.records, now, self.ttl);

        if !inner.records.contains_key(&key) && inner.records.len() >= self.max_entries {
            let oldest = inner
                .records
                .iter()
                .min_by_key(|(_, r)| r.seq)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!(key = %oldest, "Evicting oldest call record");
                inner.records.remove(&oldest);
            }
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.records.insert(
            key,
            CallRecord {
                call_id,
                inserted: now,
                seq,
            },
        );
    }

    /// Remove and return the call id stored under `key`, if it is still live.
    pub fn take(&self, key: &str) -> Option<String> {
        let mut inner = self.lock();
        let record = inner.records.remove(key)?;
        if record.inserted.elapsed() > self.ttl {
            return None;
        }
        Some(record.call_id)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned store only ever holds plain data; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn prune_expired(records: &mut HashMap<String, CallRecord>, now: Instant, ttl: Duration) {
    records.retain(|_, r| now.duration_since(r.inserted) <= ttl);
}

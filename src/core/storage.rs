use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use super::identifier::DhtKey;

pub type Value = Vec<u8>;

/// Records older than this are dropped by the expiry sweeper.
pub const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Record {
    value: Value,
    published_at: Instant,
}

/// Local record store, keyed by the raw key bytes. Every write refreshes
/// the publication timestamp, so the latest write always wins.
#[derive(Debug, Default)]
pub struct RecordStore {
    map: HashMap<DhtKey, Record>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self { map: HashMap::new() }
    }

    pub fn insert(&mut self, key: DhtKey, value: Value) {
        self.map.insert(
            key,
            Record {
                value,
                published_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, key: &DhtKey) -> Option<&Value> {
        self.map.get(key).map(|r| &r.value)
    }

    pub fn contains(&self, key: &DhtKey) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &DhtKey) -> Option<Value> {
        self.map.remove(key).map(|r| r.value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Clone out the full `(key, value)` set. Republish works from this
    /// snapshot so replication never runs against a borrowed store.
    pub fn snapshot(&self) -> Vec<(DhtKey, Value)> {
        self.map
            .iter()
            .map(|(k, r)| (k.clone(), r.value.clone()))
            .collect()
    }

    /// Drop every record past its TTL. Returns how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map
            .retain(|_, record| now.duration_since(record.published_at) <= RECORD_TTL);
        before - self.map.len()
    }
}

//! In-memory engine.
//!
//! Same semantics as the redb engine without durability. Writers publish
//! while holding the map's write lock, and subscribers snapshot and
//! register under the read lock, so the snapshot/feed cut needs no extra
//! locking.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;
use tracing::debug;

use super::backend::Datastore;
use super::normalize_prefixes;
use super::types::{
    GetRequest, KeyValue, Reclaim, SetRequest, StopFlag, expiry_for, is_expired, now_millis,
    segment_qualifies, validate_discard_ratio,
};
use crate::error::Result;
use crate::hub::{ChangeHub, Subscription};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

impl MemoryEntry {
    fn live_value(&self, now: u64) -> Option<&[u8]> {
        (!is_expired(self.expires_at, now)).then_some(self.value.as_slice())
    }
}

type Entries = BTreeMap<Vec<u8>, MemoryEntry>;

/// Ephemeral engine backed by an ordered map.
pub struct MemoryStore {
    entries: RwLock<Entries>,
    hub: ChangeHub,
    segment_entries: usize,
}

impl MemoryStore {
    pub fn new(segment_entries: usize, subscriber_buffer: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            hub: ChangeHub::new(subscriber_buffer),
            segment_entries: segment_entries.max(1),
        }
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(
            crate::constants::DEFAULT_RECLAIM_SEGMENT_ENTRIES,
            crate::constants::DEFAULT_SUBSCRIBER_BUFFER,
        )
    }
}

fn scan_prefix(entries: &Entries, prefix: &[u8], now: u64, out: &mut Vec<KeyValue>) {
    let range = entries
        .range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded))
        .take_while(|(key, _)| key.starts_with(prefix));
    for (key, entry) in range {
        if let Some(value) = entry.live_value(now) {
            out.push(KeyValue::new(key.clone(), value));
        }
    }
}

impl Datastore for MemoryStore {
    fn get(&self, requests: &[GetRequest]) -> Result<Vec<KeyValue>> {
        let entries = self.entries.read();
        let now = now_millis();

        let mut found = Vec::new();
        for request in requests {
            if request.is_prefix {
                scan_prefix(&entries, &request.key, now, &mut found);
            } else if let Some(value) = entries
                .get(request.key.as_slice())
                .and_then(|entry| entry.live_value(now))
            {
                found.push(KeyValue::new(request.key.clone(), value));
            }
        }
        Ok(found)
    }

    fn set(&self, request: &SetRequest) -> Result<()> {
        if request.entries.is_empty() {
            return Ok(());
        }

        let expires_at = expiry_for(request.ttl, now_millis());
        let mut entries = self.entries.write();
        for entry in &request.entries {
            entries.insert(
                entry.key.clone(),
                MemoryEntry {
                    value: entry.value.clone(),
                    expires_at,
                },
            );
        }
        self.hub.publish(&request.entries);
        Ok(())
    }

    fn subscribe(&self, prefixes: &[Vec<u8>]) -> Result<Subscription> {
        let prefixes = normalize_prefixes(prefixes);
        let entries = self.entries.read();
        let subscription = self.hub.register(prefixes.clone())?;

        let now = now_millis();
        let snapshot = prefixes
            .iter()
            .map(|prefix| {
                let mut batch = Vec::new();
                scan_prefix(&entries, prefix, now, &mut batch);
                batch
            })
            .collect();
        drop(entries);

        Ok(subscription.with_snapshot(snapshot))
    }

    fn reclaim(&self, discard_ratio: f64, stop: &StopFlag) -> Result<Reclaim> {
        validate_discard_ratio(discard_ratio)?;

        let stale: Vec<Vec<Vec<u8>>> = {
            let entries = self.entries.read();
            let now = now_millis();
            let keys: Vec<&Vec<u8>> = entries.keys().collect();
            keys.chunks(self.segment_entries)
                .filter_map(|segment| {
                    let expired: Vec<Vec<u8>> = segment
                        .iter()
                        .filter(|key| {
                            entries
                                .get(key.as_slice())
                                .is_some_and(|entry| is_expired(entry.expires_at, now))
                        })
                        .map(|key| (*key).clone())
                        .collect();
                    segment_qualifies(expired.len(), segment.len(), discard_ratio)
                        .then_some(expired)
                })
                .collect()
        };

        let mut segments = 0;
        let mut removed = 0;
        for keys in &stale {
            if stop.is_stopped() {
                debug!(remaining = stale.len() - segments, "Reclamation stopped early");
                break;
            }
            let mut entries = self.entries.write();
            let now = now_millis();
            for key in keys {
                if entries
                    .get(key)
                    .is_some_and(|entry| is_expired(entry.expires_at, now))
                {
                    entries.remove(key);
                    removed += 1;
                }
            }
            segments += 1;
        }

        if segments == 0 {
            Ok(Reclaim::NoOp)
        } else {
            Ok(Reclaim::Reclaimed {
                segments,
                entries: removed,
            })
        }
    }

    fn close(&self) {
        self.hub.close("store closed");
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.len())
            .field("hub", &self.hub)
            .finish()
    }
}

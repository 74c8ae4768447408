//! Answer cache keyed by `(name, qtype)`
//!
//! Entries hold the answer records and an absolute expiry taken from the
//! first record's TTL. Expired entries are never served. The map is
//! concurrent with per-key insert/load; a periodic cleaner drops expired
//! entries and connection switching clears it in bulk.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use hickory_proto::op::Query;
use hickory_proto::rr::{Record, RecordType};
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Default maximum number of cache entries
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Upper bound on how long anything stays cached
pub const MAX_TTL_SECS: u64 = 86400;

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CacheKey {
    /// ASCII, lowercased, fully qualified
    name: String,
    record_type: RecordType,
}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        u16::from(self.record_type).hash(state);
    }
}

impl CacheKey {
    pub fn new(name: impl Into<String>, record_type: RecordType) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            record_type,
        }
    }

    pub fn from_query(query: &Query) -> Self {
        Self::new(query.name().to_ascii(), query.query_type())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub records: Vec<Record>,
    pub expires_at: Instant,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Counters snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub entries: usize,
}

pub struct DnsCache {
    entries: DashMap<CacheKey, CacheEntry>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl DnsCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: if max_entries == 0 {
                DEFAULT_MAX_ENTRIES
            } else {
                max_entries
            },
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<Record>> {
        self.get_at(key, Instant::now())
    }

    /// Cached records for `key` if still fresh at `now`
    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Vec<Record>> {
        let fresh = match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(entry.records.clone()),
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match fresh {
            Some(records) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(records)
            }
            None => {
                if self
                    .entries
                    .remove_if(key, |_, entry| entry.is_expired_at(now))
                    .is_some()
                {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, records: Vec<Record>) -> bool {
        self.insert_at(key, records, Instant::now())
    }

    /// Cache `records` until the first record's TTL runs out
    ///
    /// Returns false when nothing was cached (no records, zero TTL or full).
    pub fn insert_at(&self, key: CacheKey, records: Vec<Record>, now: Instant) -> bool {
        let Some(first) = records.first() else {
            return false;
        };
        let ttl = u64::from(first.ttl()).min(MAX_TTL_SECS);
        if ttl == 0 {
            return false;
        }

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            self.cleanup_expired_at(now);
            if self.entries.len() >= self.max_entries {
                log::debug!("DNS cache full, not caching {}", key.name);
                return false;
            }
        }

        self.entries.insert(
            key,
            CacheEntry {
                records,
                expires_at: now + Duration::from_secs(ttl),
            },
        );
        true
    }

    /// Drop expired entries, returning how many went
    pub fn cleanup_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Instant::now())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop expired entries every `period` until shutdown
    pub async fn run_cleaner(self: Arc<Self>, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let removed = self.cleanup_expired();
                    if removed > 0 {
                        log::debug!("DNS cache: {} expired entries removed", removed);
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

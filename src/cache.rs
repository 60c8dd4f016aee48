use std::collections::HashMap;

use jiff::{SignedDuration, Timestamp};
use tokio::sync::Mutex;

use crate::store::error::StoreError;

/// Durable-write capability the cache persists through. The SQLite store
/// implements it, tests count writes with a mock.
pub trait ReadingStore {
    fn append_state(
        &self,
        entity_id: i64,
        state: &str,
        created: Timestamp,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn latest_state(
        &self,
        entity_id: i64,
        not_before: Timestamp,
    ) -> impl Future<Output = Result<Option<(String, Timestamp)>, StoreError>> + Send;
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: String,
    /// timestamp of the observation that opened the coalescing window;
    /// this is also what the persisted row for the window carries
    observed_at: Timestamp,
    expires_at: Timestamp,
}

/// Write-coalescing cache: at most one durable write per entity per TTL
/// window, while reads always see the most recent observation. One Mutex
/// guards the whole store so a concurrent miss can never double-persist
/// a window.
pub struct CoalescingCache {
    entries: Mutex<HashMap<i64, CacheEntry>>,
    ttl: SignedDuration,
    /// durable fallback reads ignore rows older than this
    freshness: SignedDuration,
}

impl CoalescingCache {
    pub fn new(ttl_minutes: i64, freshness_minutes: i64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: SignedDuration::from_mins(ttl_minutes),
            freshness: SignedDuration::from_mins(freshness_minutes),
        }
    }

    /// Record a new observation. A cache miss (first observation or
    /// expired window) persists the reading and opens a new window; a hit
    /// only refreshes the in-memory value, keeping the window's original
    /// timestamp and expiry. The get+persist+set sequence runs as one
    /// critical section.
    pub async fn observe(
        &self,
        store: &impl ReadingStore,
        entity_id: i64,
        value: &str,
        observed_at: Timestamp,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        match valid_entry(&mut entries, entity_id, observed_at) {
            Some(entry) => entry.value = value.to_string(),
            None => {
                store.append_state(entity_id, value, observed_at).await?;
                entries.insert(
                    entity_id,
                    CacheEntry {
                        value: value.to_string(),
                        observed_at,
                        expires_at: observed_at + self.ttl,
                    },
                );
            }
        }
        Ok(())
    }

    /// Current value for an entity: a cache hit answers without touching
    /// durable storage, a miss falls back to the newest durable row
    /// within the freshness window.
    pub async fn current(
        &self,
        store: &impl ReadingStore,
        entity_id: i64,
        now: Timestamp,
    ) -> Result<Option<(String, Timestamp)>, StoreError> {
        {
            let mut entries = self.entries.lock().await;
            if let Some(entry) = valid_entry(&mut entries, entity_id, now) {
                return Ok(Some((entry.value.clone(), entry.observed_at)));
            }
        }
        store.latest_state(entity_id, now - self.freshness).await
    }
}

/// Expired entries are removed on access.
fn valid_entry(
    entries: &mut HashMap<i64, CacheEntry>,
    entity_id: i64,
    now: Timestamp,
) -> Option<&mut CacheEntry> {
    if entries.get(&entity_id).is_some_and(|e| e.expires_at < now) {
        entries.remove(&entity_id);
    }
    entries.get_mut(&entity_id)
}

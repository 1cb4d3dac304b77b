use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// TTL for facts that rarely change mid-session: the raw `showvminfo` dump,
/// guest properties, and the VBoxManage version string. Bounds the number of
/// external invocations during a burst of UI queries.
pub const FACT_TTL: Duration = Duration::from_secs(15);

/// TTL for the VM running-state entry. Shorter, so a start or poweroff is
/// noticed quickly.
pub const STATE_TTL: Duration = Duration::from_secs(5);

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// TTL cache for VBoxManage responses. Each invocation of the binary takes
/// seconds, so read-mostly facts are cached under a per-query key and served
/// from memory until their entry expires.
///
/// Safe for concurrent `get`/`set`/`reset`; a query and a cache-invalidating
/// mutation can race.
#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the stored value for `key`, or `None` if absent or expired.
    /// Values come back exactly as stored, no reformatting.
    pub async fn get(&self, key: &str) -> Option<String> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Store `value` under `key` for `ttl`, overwriting any previous entry.
    pub async fn set(&self, key: &str, value: &str, ttl: Duration) {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop all entries. Called after a mutating operation so subsequent
    /// queries are not served stale pre-mutation facts.
    pub async fn reset(&self) {
        debug!("resetting VBoxManage response cache");
        self.entries.write().await.clear();
    }
}

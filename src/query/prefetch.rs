//! First-paint snapshot cache.
//!
//! A producer outside this layer periodically writes the default first page
//! of each list view to a client-local store. The facade reads it for
//! instant initial paint and still runs the real fetch to revalidate.
//! Expired or malformed entries are treated as absent, never as errors.

use crate::shared::models::EntityKind;
use chrono::{DateTime, Utc};
use log::debug;
use redis::Commands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The persistent key-value store the snapshots live in.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

pub struct RedisSnapshotStore {
    client: Arc<redis::Client>,
}

impl RedisSnapshotStore {
    pub fn new(client: Arc<redis::Client>) -> Self {
        Self { client }
    }
}

impl SnapshotStore for RedisSnapshotStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut conn = match self.client.get_connection() {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Prefetch store unreachable: {e}");
                return None;
            }
        };
        conn.get::<_, Option<String>>(key).ok().flatten()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    /// Unix seconds at write time.
    timestamp: i64,
    items: serde_json::Value,
    total: i64,
    ttl_secs: i64,
}

#[derive(Clone)]
pub struct PrefetchCache {
    store: Option<Arc<dyn SnapshotStore>>,
    clock: Arc<dyn Clock>,
}

impl PrefetchCache {
    pub fn new(store: Option<Arc<dyn SnapshotStore>>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn disabled() -> Self {
        Self {
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn read<T: DeserializeOwned>(&self, kind: EntityKind, org: Uuid) -> Option<(Vec<T>, i64)> {
        let store = self.store.as_ref()?;
        let raw = store.get(&snapshot_key(kind, org))?;
        decode_snapshot(&raw, self.clock.now())
    }
}

pub fn snapshot_key(kind: EntityKind, org: Uuid) -> String {
    format!("prefetch:{kind}:{org}")
}

fn decode_snapshot<T: DeserializeOwned>(raw: &str, now: DateTime<Utc>) -> Option<(Vec<T>, i64)> {
    let envelope: SnapshotEnvelope = serde_json::from_str(raw).ok()?;
    let age_secs = now.timestamp() - envelope.timestamp;
    if age_secs >= envelope.ttl_secs {
        debug!("Prefetch snapshot expired ({age_secs}s old)");
        return None;
    }
    let items: Vec<T> = serde_json::from_value(envelope.items).ok()?;
    Some((items, envelope.total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub struct FixedClock(pub DateTime<Utc>);

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    pub struct MemoryStore(pub Mutex<HashMap<String, String>>);

    impl SnapshotStore for MemoryStore {
        fn get(&self, key: &str) -> Option<String> {
            self.0.lock().ok()?.get(key).cloned()
        }
    }

    fn cache_with(
        key: String,
        raw: String,
        now: DateTime<Utc>,
    ) -> PrefetchCache {
        let mut map = HashMap::new();
        map.insert(key, raw);
        PrefetchCache::new(
            Some(Arc::new(MemoryStore(Mutex::new(map)))),
            Arc::new(FixedClock(now)),
        )
    }

    fn envelope(written_at: i64, ttl_secs: i64) -> String {
        json!({
            "timestamp": written_at,
            "items": [{"id": Uuid::new_v4(), "label": "x"}],
            "total": 1,
            "ttl_secs": ttl_secs,
        })
        .to_string()
    }

    #[derive(Debug, serde::Deserialize)]
    struct Item {
        #[allow(dead_code)]
        id: Uuid,
        label: String,
    }

    #[test]
    fn test_fresh_snapshot_is_served() {
        let org = Uuid::new_v4();
        let now = Utc::now();
        let cache = cache_with(
            snapshot_key(EntityKind::Lead, org),
            envelope(now.timestamp() - 30, 60),
            now,
        );
        let (items, total) = cache.read::<Item>(EntityKind::Lead, org).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].label, "x");
        assert_eq!(total, 1);
    }

    #[test]
    fn test_expired_snapshot_is_absent() {
        let org = Uuid::new_v4();
        let now = Utc::now();
        let cache = cache_with(
            snapshot_key(EntityKind::Lead, org),
            envelope(now.timestamp() - 120, 60),
            now,
        );
        assert!(cache.read::<Item>(EntityKind::Lead, org).is_none());
    }

    #[test]
    fn test_malformed_snapshot_is_absent() {
        let org = Uuid::new_v4();
        let now = Utc::now();
        let cache = cache_with(
            snapshot_key(EntityKind::Lead, org),
            "{not json".to_string(),
            now,
        );
        assert!(cache.read::<Item>(EntityKind::Lead, org).is_none());
    }

    #[test]
    fn test_missing_key_and_disabled_store() {
        let org = Uuid::new_v4();
        let cache = cache_with("other".to_string(), envelope(0, 60), Utc::now());
        assert!(cache.read::<Item>(EntityKind::Lead, org).is_none());
        assert!(PrefetchCache::disabled()
            .read::<Item>(EntityKind::Lead, org)
            .is_none());
    }

    #[test]
    fn test_key_is_namespaced_by_kind_and_org() {
        let org = Uuid::new_v4();
        assert_ne!(
            snapshot_key(EntityKind::Lead, org),
            snapshot_key(EntityKind::Project, org)
        );
    }
}

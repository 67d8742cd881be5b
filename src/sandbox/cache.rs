//! Result cache keyed by the content hash of code and context.
//!
//! A plain expiring map behind one `RwLock`. Entries are immutable snapshots,
//! so concurrent callers can at worst observe a stale entry, never a torn one.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::sandbox::harness::ContextBindings;
use crate::types::{ExecutionResult, RequestDescriptor, Strategy};

/// A cached result with its insertion time.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The stored result.
    pub result: Arc<ExecutionResult>,
    /// When it was stored.
    pub inserted_at: Instant,
}

/// Expiring map from content hash to execution result.
///
/// Expired entries are swept on insert at most once per TTL, so the map
/// never holds more than one TTL's worth of distinct contexts for long.
#[derive(Debug)]
pub struct ResultCache {
    ttl: Duration,
    entries: RwLock<Entries>,
}

#[derive(Debug)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    last_purge: Instant,
}

impl Entries {
    fn purge(&mut self, ttl: Duration) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        self.last_purge = Instant::now();
        before - self.map.len()
    }
}

impl ResultCache {
    /// Create a cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(Entries {
                map: HashMap::new(),
                last_purge: Instant::now(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the entry for `key` if it is still within the TTL.
    pub fn get(&self, key: &str) -> Option<Arc<ExecutionResult>> {
        self.read()
            .map
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| Arc::clone(&entry.result))
    }

    /// Store a successful result. Failed results are ignored.
    pub fn insert(&self, key: String, result: Arc<ExecutionResult>) -> bool {
        if !result.success {
            return false;
        }
        let mut entries = self.write();
        if entries.last_purge.elapsed() >= self.ttl {
            let purged = entries.purge(self.ttl);
            if purged > 0 {
                tracing::debug!(purged, "purged expired cache entries");
            }
        }
        entries.map.insert(
            key,
            CacheEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        true
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.write().purge(self.ttl)
    }

    /// Clear all cached results.
    pub fn clear(&self) {
        self.write().map.clear();
    }

    /// Number of stored entries, expired or not.
    pub fn len(&self) -> usize {
        self.read().map.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    strategy: Strategy,
    code: &'a str,
    mock_data: &'a serde_json::Value,
    env: &'a std::collections::BTreeMap<String, String>,
    req: &'a RequestDescriptor,
    collection_id: &'a Option<String>,
}

/// Content hash of (strategy, code, mock data, variables, request).
///
/// The execution id is left out; it is unique per call.
pub fn cache_key(strategy: Strategy, code: &str, bindings: &ContextBindings) -> String {
    let material = KeyMaterial {
        strategy,
        code,
        mock_data: &bindings.mock_data,
        env: &bindings.env,
        req: &bindings.req,
        collection_id: &bindings.collection_id,
    };
    // Map keys serialize in sorted order, so equal contexts hash equally.
    let encoded = serde_json::to_vec(&material).unwrap_or_else(|_| code.as_bytes().to_vec());
    sha256_hex(&encoded)
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn result(success: bool) -> Arc<ExecutionResult> {
        Arc::new(ExecutionResult {
            execution_id: "e1".into(),
            success,
            output: json!({ "ok": success }),
            error: None,
            logs: vec![],
            elapsed: Duration::from_millis(3),
            strategy: Strategy::Light,
            downgraded: false,
            save_directive: None,
        })
    }

    fn bindings(execution_id: &str) -> ContextBindings {
        ContextBindings {
            mock_data: json!([{ "id": 1 }]),
            env: BTreeMap::from([("K".to_string(), "V".to_string())]),
            req: RequestDescriptor::default(),
            collection_id: Some("c1".into()),
            execution_id: execution_id.into(),
            max_log_lines: 100,
        }
    }

    #[test]
    fn test_cache_new() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(cache.is_empty());
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_hit_returns_same_result() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let stored = result(true);
        assert!(cache.insert("k".into(), Arc::clone(&stored)));

        let hit = cache.get("k").unwrap();
        assert!(Arc::ptr_eq(&hit, &stored));
    }

    #[test]
    fn test_failures_are_not_cached() {
        let cache = ResultCache::new(Duration::from_secs(60));
        assert!(!cache.insert("k".into(), result(false)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let cache = ResultCache::new(Duration::ZERO);
        cache.insert("k".into(), result(true));
        assert!(cache.get("k").is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_insert_sweeps_expired_entries() {
        let cache = ResultCache::new(Duration::from_millis(1));
        for i in 0..1000 {
            cache.insert(format!("k{}", i), result(true));
        }
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("k0").is_none());

        cache.insert("fresh".into(), result(true));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_live_entries_survive_sweep() {
        let cache = ResultCache::new(Duration::from_secs(60));
        cache.insert("a".into(), result(true));
        cache.insert("b".into(), result(true));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_key_ignores_execution_id() {
        let a = cache_key(Strategy::Light, "return 1;", &bindings("e1"));
        let b = cache_key(Strategy::Light, "return 1;", &bindings("e2"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = cache_key(Strategy::Light, "return 2;", &bindings("e1"));
        let d = cache_key(Strategy::Heavy, "return 1;", &bindings("e1"));
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}

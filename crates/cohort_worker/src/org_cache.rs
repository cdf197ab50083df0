//! Organization cache: LRU + optional TTL, request coalescing, and the
//! create-race recovery path.
//!
//! An organization is cached under up to two keys (`id:<orgId>` and
//! `ext:<externalId>`) pointing at semantically equal entries, which is what
//! makes the coordinator's add-only merge safe. Concurrent lookups for the
//! same key share one in-flight operation: the first caller does the work,
//! everyone else subscribes to its result.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Utc;
use cohort_protocol::{CacheStats, OrgCacheEntry, SerializedOrgCache, DEFAULT_ORG_CACHE_CAPACITY};
use cohort_target::{Organization, RateLimiterHandle, TargetApi, TargetError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::retry::with_rate_limit_retry;

/// Attempts to re-read an org after losing the create race.
const CREATE_RACE_ATTEMPTS: u32 = 3;
/// Backoff between re-reads: 500ms * attempt.
const CREATE_RACE_BACKOFF_MS: u64 = 500;

/// Target-side failure detail, cloneable so one failure can fan out to every
/// coalesced waiter and still land verbatim in error records.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolveFailure {
    pub message: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub request_id: Option<String>,
}

impl ResolveFailure {
    pub fn from_target(error: &TargetError) -> Self {
        Self {
            message: error.to_string(),
            status: error.status(),
            code: error.code().map(|s| s.to_string()),
            request_id: error.request_id().map(|s| s.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{}", .0.message)]
    Failed(ResolveFailure),
}

impl From<TargetError> for ResolveError {
    fn from(error: TargetError) -> Self {
        match error {
            TargetError::Cancelled => ResolveError::Cancelled,
            other => ResolveError::Failed(ResolveFailure::from_target(&other)),
        }
    }
}

/// One `resolve()` request.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrgLookup<'a> {
    pub org_id: Option<&'a str>,
    pub org_external_id: Option<&'a str>,
    pub create_if_missing: bool,
    pub org_name: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub struct OrgCacheConfig {
    pub capacity: usize,
    pub ttl: Option<Duration>,
    pub dry_run: bool,
}

impl Default for OrgCacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_ORG_CACHE_CAPACITY,
            ttl: None,
            dry_run: false,
        }
    }
}

type Coalesced = Result<Option<String>, ResolveError>;

struct Slot {
    entry: OrgCacheEntry,
    last_used: u64,
    inserted_at: Instant,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    pending: HashMap<String, broadcast::Sender<Coalesced>>,
    stats: CacheStats,
    seq: u64,
}

impl Inner {
    fn touch(&mut self, key: &str) -> Option<String> {
        self.seq += 1;
        let seq = self.seq;
        self.entries.get_mut(key).map(|slot| {
            slot.last_used = seq;
            slot.entry.id.clone()
        })
    }

    fn insert_org(&mut self, org: &Organization, capacity: usize) {
        let entry = OrgCacheEntry {
            id: org.id.clone(),
            external_id: org.external_id.clone(),
            name: org.name.clone(),
            cached_at: Utc::now(),
        };
        self.insert_entry(entry, capacity);
    }

    fn insert_entry(&mut self, entry: OrgCacheEntry, capacity: usize) {
        let mut keys = vec![format!("id:{}", entry.id)];
        if let Some(external_id) = &entry.external_id {
            keys.push(format!("ext:{external_id}"));
        }
        for key in keys {
            self.seq += 1;
            self.entries.insert(
                key,
                Slot {
                    entry: entry.clone(),
                    last_used: self.seq,
                    inserted_at: Instant::now(),
                },
            );
        }
        self.evict_to(capacity);
    }

    /// Evict least-recently-used keys until at or under capacity.
    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                    self.stats.evictions += 1;
                }
                None => break,
            }
        }
    }

    fn remove_expired(&mut self, key: &str, ttl: Option<Duration>) {
        if let Some(ttl) = ttl {
            let expired = self
                .entries
                .get(key)
                .map(|slot| slot.inserted_at.elapsed() > ttl)
                .unwrap_or(false);
            if expired {
                self.entries.remove(key);
            }
        }
    }
}

pub struct OrgCache {
    target: Arc<dyn TargetApi>,
    limiter: RateLimiterHandle,
    config: OrgCacheConfig,
    inner: Mutex<Inner>,
}

impl OrgCache {
    pub fn new(
        target: Arc<dyn TargetApi>,
        limiter: RateLimiterHandle,
        config: OrgCacheConfig,
    ) -> Self {
        Self {
            target,
            limiter,
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("org cache poisoned")
    }

    /// Resolve an organization reference to its target-side id.
    ///
    /// Exactly one of `org_id` / `org_external_id` may be set; neither set
    /// resolves to `None` without touching the cache or the target.
    pub async fn resolve(&self, lookup: OrgLookup<'_>) -> Result<Option<String>, ResolveError> {
        let key = match (lookup.org_id, lookup.org_external_id) {
            (Some(_), Some(_)) => {
                return Err(ResolveError::InvalidArgument(
                    "both org_id and org_external_id provided".to_string(),
                ))
            }
            (None, None) => return Ok(None),
            (Some(id), None) => format!("id:{id}"),
            (None, Some(external_id)) => format!("ext:{external_id}"),
        };

        // Fast path and coalescing decision under one lock.
        let mut waiter = None;
        {
            let mut inner = self.lock();
            inner.remove_expired(&key, self.config.ttl);
            if let Some(id) = inner.touch(&key) {
                inner.stats.hits += 1;
                return Ok(Some(id));
            }
            if let Some(tx) = inner.pending.get(&key) {
                let sub = tx.subscribe();
                inner.stats.hits += 1;
                waiter = Some(sub);
            } else {
                inner.stats.misses += 1;
                let (tx, _) = broadcast::channel(8);
                inner.pending.insert(key.clone(), tx);
            }
        }

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(result) => result,
                // Leader dropped without publishing; treat as cancelled.
                Err(_) => Err(ResolveError::Cancelled),
            };
        }

        let outcome = self.lookup_uncached(&lookup).await;

        let result: Coalesced = match &outcome {
            Ok(Some(org)) => Ok(Some(org.id.clone())),
            Ok(None) => Ok(None),
            Err(error) => Err(error.clone()),
        };
        let mut inner = self.lock();
        if let Ok(Some(org)) = &outcome {
            inner.insert_org(org, self.config.capacity);
        }
        if let Some(tx) = inner.pending.remove(&key) {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// The uncoalesced lookup: GET by id, or GET by external id with an
    /// optional create, recovering from the create race.
    async fn lookup_uncached(
        &self,
        lookup: &OrgLookup<'_>,
    ) -> Result<Option<Organization>, ResolveError> {
        if self.config.dry_run {
            return Ok(Some(dry_run_org(lookup)));
        }

        if let Some(org_id) = lookup.org_id {
            let target = Arc::clone(&self.target);
            let org = with_rate_limit_retry(&self.limiter, || {
                let target = Arc::clone(&target);
                let org_id = org_id.to_string();
                async move { target.get_org(&org_id).await }
            })
            .await?;
            return Ok(org);
        }

        let external_id = lookup
            .org_external_id
            .expect("lookup key guarantees an external id");
        if let Some(org) = self.get_by_external_id(external_id).await? {
            return Ok(Some(org));
        }

        let name = match (lookup.create_if_missing, lookup.org_name) {
            (true, Some(name)) => name,
            _ => return Ok(None),
        };

        let target = Arc::clone(&self.target);
        let create = with_rate_limit_retry(&self.limiter, || {
            let target = Arc::clone(&target);
            let name = name.to_string();
            let external_id = external_id.to_string();
            async move { target.create_org(&name, Some(&external_id)).await }
        })
        .await;

        match create {
            Ok(org) => {
                debug!(org_id = %org.id, external_id, "created organization");
                Ok(Some(org))
            }
            Err(error) if error.is_external_id_conflict() => {
                // Lost the create race; the winner's org should become
                // readable shortly.
                for attempt in 1..=CREATE_RACE_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(
                        CREATE_RACE_BACKOFF_MS * u64::from(attempt),
                    ))
                    .await;
                    if let Some(org) = self.get_by_external_id(external_id).await? {
                        return Ok(Some(org));
                    }
                    warn!(external_id, attempt, "org not yet visible after create race");
                }
                Err(error.into())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn get_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Organization>, ResolveError> {
        let target = Arc::clone(&self.target);
        let org = with_rate_limit_retry(&self.limiter, || {
            let target = Arc::clone(&target);
            let external_id = external_id.to_string();
            async move { target.get_org_by_external_id(&external_id).await }
        })
        .await?;
        Ok(org)
    }

    /// Insert a known entry (warm-start, merge).
    pub fn insert(&self, entry: OrgCacheEntry) {
        let mut inner = self.lock();
        inner.insert_entry(entry, self.config.capacity);
    }

    /// Add-only merge: entries whose keys are already cached are skipped.
    pub fn merge_entries(&self, entries: Vec<OrgCacheEntry>) {
        let mut inner = self.lock();
        for entry in entries {
            let key = format!("id:{}", entry.id);
            if !inner.entries.contains_key(&key) {
                inner.insert_entry(entry, self.config.capacity);
            }
        }
    }

    /// Unique entries (one per organization, covering both keys).
    pub fn snapshot(&self) -> Vec<OrgCacheEntry> {
        let inner = self.lock();
        let mut seen = std::collections::HashSet::new();
        let mut entries: Vec<OrgCacheEntry> = Vec::new();
        let mut slots: Vec<&Slot> = inner.entries.values().collect();
        slots.sort_by_key(|slot| slot.last_used);
        for slot in slots {
            if seen.insert(slot.entry.id.clone()) {
                entries.push(slot.entry.clone());
            }
        }
        entries
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn serialize(&self) -> SerializedOrgCache {
        SerializedOrgCache {
            entries: self.snapshot(),
            stats: self.stats(),
        }
    }

    /// Warm-start from a serialized cache. Entries get a fresh `cached_at`.
    pub fn restore(&self, serialized: &SerializedOrgCache) {
        let mut inner = self.lock();
        inner.stats = serialized.stats;
        for entry in &serialized.entries {
            let mut entry = entry.clone();
            entry.cached_at = Utc::now();
            inner.insert_entry(entry, self.config.capacity);
        }
    }
}

fn dry_run_org(lookup: &OrgLookup<'_>) -> Organization {
    match (lookup.org_id, lookup.org_external_id) {
        (Some(org_id), _) => Organization {
            id: org_id.to_string(),
            name: None,
            external_id: None,
        },
        (None, Some(external_id)) => Organization {
            id: format!("org_dryrun_{external_id}"),
            name: lookup.org_name.map(|s| s.to_string()),
            external_id: Some(external_id.to_string()),
        },
        (None, None) => unreachable!("resolve() returns early when nothing is specified"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_target::mock::MockTarget;
    use cohort_target::RateLimiter;

    fn cache_with(target: Arc<MockTarget>, config: OrgCacheConfig) -> OrgCache {
        let limiter = RateLimiter::spawn(1_000, Some(1_000));
        OrgCache::new(target, limiter, config)
    }

    fn by_ext(external_id: &str) -> OrgLookup<'_> {
        OrgLookup {
            org_external_id: Some(external_id),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_both_ids_is_invalid() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        let result = cache
            .resolve(OrgLookup {
                org_id: Some("org_1"),
                org_external_id: Some("ext_1"),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(ResolveError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_nothing_specified_resolves_none() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        assert_eq!(cache.resolve(OrgLookup::default()).await.unwrap(), None);
        assert_eq!(target.calls("get_org"), 0);
    }

    #[tokio::test]
    async fn test_lookup_caches_under_both_keys() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", Some("ext_1"));
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());

        let id = cache.resolve(by_ext("ext_1")).await.unwrap();
        assert_eq!(id.as_deref(), Some("org_1"));

        // Second resolve by id is a pure cache hit.
        let id = cache
            .resolve(OrgLookup {
                org_id: Some("org_1"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("org_1"));
        assert_eq!(target.calls("get_org"), 0);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_unknown_org_resolves_none() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        assert_eq!(cache.resolve(by_ext("ext_nope")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_if_missing() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        let id = cache
            .resolve(OrgLookup {
                org_external_id: Some("ext_1"),
                create_if_missing: true,
                org_name: Some("Acme"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(id.is_some());
        assert_eq!(target.org_count(), 1);
        assert_eq!(target.calls("create_org"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_coalesce_to_one_call() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", Some("ext_1"));
        target.set_latency(Duration::from_millis(30));
        let cache = Arc::new(cache_with(Arc::clone(&target), OrgCacheConfig::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.resolve(by_ext("ext_1")).await
            }));
        }
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            assert_eq!(id.as_deref(), Some("org_1"));
        }
        assert_eq!(target.calls("get_org_by_external_id"), 1);
    }

    #[tokio::test]
    async fn test_create_race_recovers_via_lookup() {
        // Two independent caches simulate two workers racing on the same
        // external id.
        let target = Arc::new(MockTarget::new());
        target.set_latency(Duration::from_millis(20));
        let a = Arc::new(cache_with(Arc::clone(&target), OrgCacheConfig::default()));
        let b = Arc::new(cache_with(Arc::clone(&target), OrgCacheConfig::default()));

        let lookup = || OrgLookup {
            org_external_id: Some("ext_1"),
            create_if_missing: true,
            org_name: Some("Acme"),
            ..Default::default()
        };
        let (ra, rb) = tokio::join!(
            { let a = Arc::clone(&a); async move { a.resolve(lookup()).await } },
            { let b = Arc::clone(&b); async move { b.resolve(lookup()).await } },
        );
        let ra = ra.unwrap().unwrap();
        let rb = rb.unwrap().unwrap();
        assert_eq!(ra, rb);
        assert_eq!(target.org_count(), 1);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(
            Arc::clone(&target),
            OrgCacheConfig {
                capacity: 2,
                ..Default::default()
            },
        );
        for i in 0..3 {
            cache.insert(OrgCacheEntry {
                id: format!("org_{i}"),
                external_id: None,
                name: None,
                cached_at: Utc::now(),
            });
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.stats().evictions >= 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_forces_lookup() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", Some("ext_1"));
        let cache = cache_with(
            Arc::clone(&target),
            OrgCacheConfig {
                ttl: Some(Duration::from_millis(30)),
                ..Default::default()
            },
        );
        cache.resolve(by_ext("ext_1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.resolve(by_ext("ext_1")).await.unwrap();
        assert_eq!(target.calls("get_org_by_external_id"), 2);
    }

    #[tokio::test]
    async fn test_dry_run_makes_no_calls() {
        let target = Arc::new(MockTarget::new());
        let cache = cache_with(
            Arc::clone(&target),
            OrgCacheConfig {
                dry_run: true,
                ..Default::default()
            },
        );
        let id = cache.resolve(by_ext("ext_9")).await.unwrap();
        assert_eq!(id.as_deref(), Some("org_dryrun_ext_9"));
        let id = cache
            .resolve(OrgLookup {
                org_id: Some("org_A"),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(id.as_deref(), Some("org_A"));
        assert_eq!(target.calls("get_org_by_external_id"), 0);
        assert_eq!(target.calls("get_org"), 0);
    }

    #[tokio::test]
    async fn test_serialize_restore_roundtrip() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", Some("ext_1"));
        let cache = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        cache.resolve(by_ext("ext_1")).await.unwrap();

        let serialized = cache.serialize();
        let restored = cache_with(Arc::clone(&target), OrgCacheConfig::default());
        restored.restore(&serialized);

        // Identical modulo cached_at, which is refreshed on restore.
        let before: Vec<(String, Option<String>)> = serialized
            .entries
            .iter()
            .map(|e| (e.id.clone(), e.external_id.clone()))
            .collect();
        let after: Vec<(String, Option<String>)> = restored
            .snapshot()
            .iter()
            .map(|e| (e.id.clone(), e.external_id.clone()))
            .collect();
        assert_eq!(before, after);
        assert_eq!(restored.stats(), serialized.stats);

        // Restored entries serve hits without target calls.
        let id = restored.resolve(by_ext("ext_1")).await.unwrap();
        assert_eq!(id.as_deref(), Some("org_1"));
        assert_eq!(target.calls("get_org_by_external_id"), 1);
    }
}

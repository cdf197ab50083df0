//! Role cache: same LRU + coalescing discipline as the org cache, plus
//! organization-level warming.
//!
//! A slug alone cannot be resolved; an org context is what makes the "list
//! roles for organization" warm-up possible. Warming is idempotent: each org
//! is listed at most once per cache, and concurrent warm requests for the
//! same org share one in-flight listing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use cohort_protocol::{CacheStats, RoleCacheEntry, RoleKind, DEFAULT_ORG_CACHE_CAPACITY};
use cohort_target::{RateLimiterHandle, Role, TargetApi};
use tokio::sync::broadcast;
use tracing::debug;

use crate::org_cache::ResolveError;
use crate::retry::with_rate_limit_retry;

type WarmResult = Result<(), ResolveError>;

struct Slot {
    entry: RoleCacheEntry,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Slot>,
    warmed_orgs: HashSet<String>,
    warming: HashMap<String, broadcast::Sender<WarmResult>>,
    stats: CacheStats,
    seq: u64,
}

impl Inner {
    fn get(&mut self, key: &str) -> Option<RoleCacheEntry> {
        self.seq += 1;
        let seq = self.seq;
        self.entries.get_mut(key).map(|slot| {
            slot.last_used = seq;
            slot.entry.clone()
        })
    }

    fn insert(&mut self, entry: RoleCacheEntry, capacity: usize) {
        self.seq += 1;
        let key = entry.cache_key();
        self.entries.insert(
            key,
            Slot {
                entry,
                last_used: self.seq,
            },
        );
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
}

pub struct RoleCache {
    target: Arc<dyn TargetApi>,
    limiter: RateLimiterHandle,
    capacity: usize,
    dry_run: bool,
    inner: Mutex<Inner>,
}

impl RoleCache {
    pub fn new(target: Arc<dyn TargetApi>, limiter: RateLimiterHandle, dry_run: bool) -> Self {
        Self {
            target,
            limiter,
            capacity: DEFAULT_ORG_CACHE_CAPACITY,
            dry_run,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("role cache poisoned")
    }

    /// Resolve a role slug, scoped to an org when one is given. Org-scoped
    /// lookups fall back to an environment role of the same slug, and warm
    /// the org's roles on first miss.
    pub async fn resolve(
        &self,
        slug: &str,
        org_id: Option<&str>,
    ) -> Result<Option<RoleCacheEntry>, ResolveError> {
        if self.dry_run {
            return Ok(Some(dry_run_role(slug, org_id)));
        }

        {
            let mut inner = self.lock();
            if let Some(entry) = lookup_keys(&mut inner, slug, org_id) {
                inner.stats.hits += 1;
                return Ok(Some(entry));
            }
            inner.stats.misses += 1;
        }

        let Some(org_id) = org_id else {
            // No org context: nothing to warm from.
            return Ok(None);
        };

        self.warm_from_organization(org_id).await?;

        let mut inner = self.lock();
        Ok(lookup_keys(&mut inner, slug, Some(org_id)))
    }

    /// List the org's roles into the cache. Idempotent and coalesced; cheap
    /// after the first call.
    pub async fn warm_from_organization(&self, org_id: &str) -> Result<(), ResolveError> {
        if self.dry_run {
            return Ok(());
        }

        let mut waiter = None;
        {
            let mut inner = self.lock();
            if inner.warmed_orgs.contains(org_id) {
                return Ok(());
            }
            if let Some(tx) = inner.warming.get(org_id) {
                waiter = Some(tx.subscribe());
            } else {
                let (tx, _) = broadcast::channel(8);
                inner.warming.insert(org_id.to_string(), tx);
            }
        }

        if let Some(mut rx) = waiter {
            return match rx.recv().await {
                Ok(result) => result,
                Err(_) => Err(ResolveError::Cancelled),
            };
        }

        let target = Arc::clone(&self.target);
        let listed = with_rate_limit_retry(&self.limiter, || {
            let target = Arc::clone(&target);
            let org_id = org_id.to_string();
            async move { target.list_org_roles(&org_id).await }
        })
        .await;

        let result: WarmResult = match listed {
            Ok(roles) => {
                debug!(org_id, count = roles.len(), "warmed roles from organization");
                let mut inner = self.lock();
                for role in roles {
                    inner.insert(role_entry(role), self.capacity);
                }
                inner.warmed_orgs.insert(org_id.to_string());
                Ok(())
            }
            Err(error) => Err(error.into()),
        };

        let mut inner = self.lock();
        if let Some(tx) = inner.warming.remove(org_id) {
            let _ = tx.send(result.clone());
        }
        result
    }

    /// Insert a known entry (merge from a worker delta).
    pub fn insert(&self, entry: RoleCacheEntry) {
        let mut inner = self.lock();
        inner.insert(entry, self.capacity);
    }

    /// Add-only merge.
    pub fn merge_entries(&self, entries: Vec<RoleCacheEntry>) {
        let mut inner = self.lock();
        for entry in entries {
            let key = entry.cache_key();
            if !inner.entries.contains_key(&key) {
                inner.insert(entry, self.capacity);
            }
        }
    }

    pub fn snapshot(&self) -> Vec<RoleCacheEntry> {
        let inner = self.lock();
        let mut slots: Vec<&Slot> = inner.entries.values().collect();
        slots.sort_by_key(|slot| slot.last_used);
        slots.iter().map(|slot| slot.entry.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        self.lock().stats
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

fn lookup_keys(inner: &mut Inner, slug: &str, org_id: Option<&str>) -> Option<RoleCacheEntry> {
    if let Some(org_id) = org_id {
        if let Some(entry) = inner.get(&format!("org:{org_id}:{slug}")) {
            return Some(entry);
        }
    }
    inner.get(&format!("env:{slug}"))
}

fn role_entry(role: Role) -> RoleCacheEntry {
    RoleCacheEntry {
        slug: role.slug,
        id: role.id,
        name: role.name,
        permissions: role.permissions,
        kind: role.kind,
        org_id: role.org_id,
    }
}

fn dry_run_role(slug: &str, org_id: Option<&str>) -> RoleCacheEntry {
    RoleCacheEntry {
        slug: slug.to_string(),
        id: format!("role_dryrun_{slug}"),
        name: slug.to_string(),
        permissions: Vec::new(),
        kind: if org_id.is_some() {
            RoleKind::Organization
        } else {
            RoleKind::Environment
        },
        org_id: org_id.map(|s| s.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_target::mock::MockTarget;
    use cohort_target::RateLimiter;
    use std::time::Duration;

    fn cache(target: Arc<MockTarget>) -> RoleCache {
        RoleCache::new(target, RateLimiter::spawn(1_000, Some(1_000)), false)
    }

    #[tokio::test]
    async fn test_resolve_warms_once() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", None);
        target.seed_org_role("org_1", "admin", &["users:read"]);
        target.seed_org_role("org_1", "member", &[]);
        let cache = cache(Arc::clone(&target));

        let admin = cache.resolve("admin", Some("org_1")).await.unwrap();
        assert!(admin.is_some());
        let member = cache.resolve("member", Some("org_1")).await.unwrap();
        assert!(member.is_some());
        assert_eq!(target.calls("list_org_roles"), 1);
    }

    #[tokio::test]
    async fn test_unknown_slug_resolves_none() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", None);
        let cache = cache(Arc::clone(&target));
        assert!(cache.resolve("ghost", Some("org_1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_no_org_context_resolves_none() {
        let target = Arc::new(MockTarget::new());
        let cache = cache(Arc::clone(&target));
        assert!(cache.resolve("admin", None).await.unwrap().is_none());
        assert_eq!(target.calls("list_org_roles"), 0);
    }

    #[tokio::test]
    async fn test_env_role_fallback() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", None);
        let cache = cache(Arc::clone(&target));
        cache.insert(RoleCacheEntry {
            slug: "auditor".to_string(),
            id: "role_env".to_string(),
            name: "Auditor".to_string(),
            permissions: Vec::new(),
            kind: RoleKind::Environment,
            org_id: None,
        });
        let entry = cache.resolve("auditor", Some("org_1")).await.unwrap();
        assert_eq!(entry.unwrap().id, "role_env");
    }

    #[tokio::test]
    async fn test_concurrent_warm_coalesces() {
        let target = Arc::new(MockTarget::new());
        target.seed_org("org_1", "Acme", None);
        target.seed_org_role("org_1", "admin", &[]);
        target.set_latency(Duration::from_millis(30));
        let cache = Arc::new(cache(Arc::clone(&target)));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.resolve("admin", Some("org_1")).await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_some());
        }
        assert_eq!(target.calls("list_org_roles"), 1);
    }

    #[tokio::test]
    async fn test_dry_run_fabricates_roles() {
        let target = Arc::new(MockTarget::new());
        let cache = RoleCache::new(
            Arc::clone(&target) as Arc<dyn TargetApi>,
            RateLimiter::spawn(1_000, Some(1_000)),
            true,
        );
        let entry = cache.resolve("admin", Some("org_1")).await.unwrap().unwrap();
        assert_eq!(entry.id, "role_dryrun_admin");
        assert_eq!(target.calls("list_org_roles"), 0);
    }
}

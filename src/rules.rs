use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::resolver::RuleSet;
use crate::store::Store;

struct CachedRules {
    rule_set: Arc<RuleSet>,
    fetched_at: Instant,
}

/// Owner-scoped, read-only snapshots of the configured rules. Resolution
/// always works against the snapshot current at the moment it was fetched;
/// refreshes happen between messages, never mid-resolution.
pub struct RuleCache {
    store: Arc<dyn Store>,
    ttl: Duration,
    snapshots: RwLock<HashMap<String, CachedRules>>,
}

impl RuleCache {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> RuleCache {
        RuleCache {
            store,
            ttl,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Snapshot for one owner, refreshed from the store when stale. A refresh
    /// failure after one retry keeps serving the last good snapshot rather
    /// than failing the conversation pipeline.
    pub async fn snapshot(&self, owner_id: &str) -> Result<Arc<RuleSet>, StoreError> {
        {
            let snapshots = self.snapshots.read().await;
            if let Some(cached) = snapshots.get(owner_id) {
                if cached.fetched_at.elapsed() < self.ttl {
                    return Ok(cached.rule_set.clone());
                }
            }
        }

        match self.fetch(owner_id).await {
            Ok(rule_set) => Ok(rule_set),
            Err(err) => {
                let snapshots = self.snapshots.read().await;
                if let Some(cached) = snapshots.get(owner_id) {
                    tracing::warn!(owner = %owner_id, error = %err, "rule refresh failed, serving stale snapshot");
                    Ok(cached.rule_set.clone())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Drop the cached snapshot so the next resolution sees fresh rules.
    /// Called by the dashboard after rule CRUD.
    pub async fn invalidate(&self, owner_id: &str) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(owner_id);
    }

    async fn fetch(&self, owner_id: &str) -> Result<Arc<RuleSet>, StoreError> {
        // Idempotent read: retry once with a short backoff.
        let rules = match self.store.list_rules(owner_id).await {
            Ok(rules) => rules,
            Err(first_err) => {
                tracing::debug!(owner = %owner_id, error = %first_err, "rule list failed, retrying once");
                tokio::time::sleep(Duration::from_millis(50)).await;
                self.store.list_rules(owner_id).await?
            }
        };

        let rule_set = Arc::new(RuleSet::assemble(owner_id, rules));
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(
            owner_id.to_string(),
            CachedRules {
                rule_set: rule_set.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(rule_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{MatchingType, ResponseKind, Rule};

    fn rule(id: &str, owner: &str) -> Rule {
        Rule {
            id: id.to_string(),
            owner_id: owner.to_string(),
            keywords: vec!["hello".to_string()],
            matching_type: MatchingType::WordMatch,
            response: "hi".to_string(),
            response_kind: ResponseKind::Text,
            button_label: None,
            advanced: false,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(rule("r1", "owner-1")).await;
        let cache = RuleCache::new(store.clone(), Duration::from_secs(60));

        let first = cache.snapshot("owner-1").await.unwrap();
        assert_eq!(first.rules.len(), 1);

        // A rule added behind the cache's back is invisible until invalidate.
        store.insert_rule(rule("r2", "owner-1")).await;
        let second = cache.snapshot("owner-1").await.unwrap();
        assert_eq!(second.rules.len(), 1);

        cache.invalidate("owner-1").await;
        let third = cache.snapshot("owner-1").await.unwrap();
        assert_eq!(third.rules.len(), 2);

        store.remove_rule("r1").await;
        cache.invalidate("owner-1").await;
        let fourth = cache.snapshot("owner-1").await.unwrap();
        assert_eq!(fourth.rules.len(), 1);
    }

    #[tokio::test]
    async fn snapshots_are_scoped_per_owner() {
        let store = Arc::new(MemoryStore::new());
        store.insert_rule(rule("r1", "owner-1")).await;
        store.insert_rule(rule("r2", "owner-2")).await;
        let cache = RuleCache::new(store, Duration::from_secs(60));

        assert_eq!(cache.snapshot("owner-1").await.unwrap().rules.len(), 1);
        assert_eq!(cache.snapshot("owner-2").await.unwrap().rules.len(), 1);
        assert!(cache.snapshot("owner-3").await.unwrap().is_empty());
    }
}

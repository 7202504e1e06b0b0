//! Atomically-swapped rule snapshot.

use crate::rule::{AppId, RuleChange, TunnelId};
use crate::store::{RuleError, RuleStore};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

type Snapshot = Arc<HashMap<AppId, TunnelId>>;

/// In-memory snapshot of the application→tunnel mapping.
///
/// Lookups clone an `Arc` under a read lock and then work on an immutable
/// map, so the hot path never blocks on storage I/O and never observes a
/// partially-rebuilt rule set. Writers build a fresh map off to the side
/// and swap it in whole.
pub struct RuleCache {
    store: Arc<dyn RuleStore>,
    snapshot: RwLock<Snapshot>,
}

impl RuleCache {
    /// Create an empty cache backed by `store`. Call [`RuleCache::refresh`]
    /// to populate it.
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            store,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// O(1) hot-path lookup. `None` means no rule: route direct.
    pub fn lookup_tunnel(&self, app_id: &AppId) -> Option<TunnelId> {
        let snapshot = self.current();
        snapshot.get(app_id).cloned()
    }

    /// Rebuild the snapshot wholesale from the store and swap it in.
    ///
    /// On a read failure the previous snapshot is kept (stale but
    /// available) and the error is returned.
    pub fn refresh(&self) -> Result<(), RuleError> {
        match self.store.load_all() {
            Ok(rules) => {
                let map: HashMap<AppId, TunnelId> = rules
                    .into_iter()
                    .map(|rule| (rule.app_id, rule.tunnel_id))
                    .collect();
                debug!(rules = map.len(), "rule cache refreshed");
                self.swap(Arc::new(map));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "rule refresh failed, keeping previous snapshot");
                Err(e)
            }
        }
    }

    /// Apply one change notification: copy-on-write rebuild, whole-map swap.
    pub fn apply(&self, change: &RuleChange) {
        let mut map: HashMap<AppId, TunnelId> = (*self.current()).clone();
        match change {
            RuleChange::Set { app_id, tunnel_id } => {
                map.insert(app_id.clone(), tunnel_id.clone());
            }
            RuleChange::Cleared { app_id } => {
                map.remove(app_id);
            }
        }
        self.swap(Arc::new(map));
    }

    /// Reset to the empty snapshot.
    pub fn clear(&self) {
        self.swap(Arc::new(HashMap::new()));
    }

    pub fn len(&self) -> usize {
        self.current().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current().is_empty()
    }

    fn current(&self) -> Snapshot {
        self.snapshot.read().expect("rule snapshot lock poisoned").clone()
    }

    fn swap(&self, next: Snapshot) {
        *self.snapshot.write().expect("rule snapshot lock poisoned") = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::AppRule;
    use crate::store::MemoryRuleStore;

    struct FailingStore;

    impl RuleStore for FailingStore {
        fn load_all(&self) -> Result<Vec<AppRule>, RuleError> {
            Err(RuleError::Store("backing store unavailable".into()))
        }

        fn changes(&self) -> tokio::sync::mpsc::UnboundedReceiver<RuleChange> {
            tokio::sync::mpsc::unbounded_channel().1
        }
    }

    #[test]
    fn refresh_then_lookup() {
        let store = Arc::new(MemoryRuleStore::new());
        store.set_rule("pkg.a", "T1");
        store.set_rule("pkg.b", "T2");

        let cache = RuleCache::new(store);
        assert!(cache.lookup_tunnel(&"pkg.a".into()).is_none());

        cache.refresh().unwrap();
        assert_eq!(cache.lookup_tunnel(&"pkg.a".into()), Some("T1".into()));
        assert_eq!(cache.lookup_tunnel(&"pkg.b".into()), Some("T2".into()));
        assert!(cache.lookup_tunnel(&"pkg.c".into()).is_none());
    }

    #[test]
    fn failed_refresh_keeps_previous_snapshot() {
        let cache = RuleCache::new(Arc::new(FailingStore));
        cache.apply(&RuleChange::Set {
            app_id: "pkg.a".into(),
            tunnel_id: "T1".into(),
        });

        assert!(cache.refresh().is_err());
        assert_eq!(cache.lookup_tunnel(&"pkg.a".into()), Some("T1".into()));
    }

    #[test]
    fn apply_set_and_cleared() {
        let cache = RuleCache::new(Arc::new(MemoryRuleStore::new()));
        cache.apply(&RuleChange::Set {
            app_id: "pkg.a".into(),
            tunnel_id: "T1".into(),
        });
        assert_eq!(cache.lookup_tunnel(&"pkg.a".into()), Some("T1".into()));

        cache.apply(&RuleChange::Set {
            app_id: "pkg.a".into(),
            tunnel_id: "T2".into(),
        });
        assert_eq!(cache.lookup_tunnel(&"pkg.a".into()), Some("T2".into()));

        cache.apply(&RuleChange::Cleared { app_id: "pkg.a".into() });
        assert!(cache.lookup_tunnel(&"pkg.a".into()).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_resets_to_empty() {
        let store = Arc::new(MemoryRuleStore::new());
        store.set_rule("pkg.a", "T1");
        let cache = RuleCache::new(store);
        cache.refresh().unwrap();
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.lookup_tunnel(&"pkg.a".into()).is_none());
    }
}

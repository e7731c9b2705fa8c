// src/core/decision_cache.rs — Short-lived cache of guard decisions
//
// Entries expire by wall-clock comparison on read. Nothing evicts them in the
// background; a newer decision for the same key overwrites the old one.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::guard::GuardDecision;
use crate::budget::BudgetKey;

struct CachedDecision {
    decision: Arc<GuardDecision>,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct DecisionCache {
    entries: HashMap<BudgetKey, CachedDecision>,
}

impl DecisionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached decision for `key`, if it has not expired at `now`.
    pub fn get(&self, key: &BudgetKey, now: DateTime<Utc>) -> Option<Arc<GuardDecision>> {
        self.entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| Arc::clone(&entry.decision))
    }

    pub fn insert(&mut self, key: BudgetKey, decision: Arc<GuardDecision>, expires_at: DateTime<Utc>) {
        self.entries.insert(
            key,
            CachedDecision {
                decision,
                expires_at,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop every entry belonging to one requester.
    pub fn invalidate_user(&mut self, user_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.user_id != user_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetScope;
    use crate::core::guard::GuardAction;
    use chrono::Duration;

    fn decision() -> Arc<GuardDecision> {
        Arc::new(GuardDecision::new(GuardAction::Allow, "ok", Utc::now()))
    }

    #[test]
    fn test_hit_before_expiry() {
        let mut cache = DecisionCache::new();
        let key = BudgetKey::new("u1", BudgetScope::User, None);
        let now = Utc::now();
        let d = decision();
        cache.insert(key.clone(), d.clone(), now + Duration::seconds(5));
        let hit = cache.get(&key, now + Duration::seconds(4)).unwrap();
        assert!(Arc::ptr_eq(&hit, &d));
        assert!(cache.get(&key, now + Duration::seconds(5)).is_none());
        // Expired entries are not evicted, only ignored
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_user_keeps_others() {
        let mut cache = DecisionCache::new();
        let far = Utc::now() + Duration::minutes(1);
        cache.insert(BudgetKey::new("u1", BudgetScope::User, None), decision(), far);
        cache.insert(
            BudgetKey::new("u1", BudgetScope::Team, Some("t".into())),
            decision(),
            far,
        );
        cache.insert(BudgetKey::new("u2", BudgetScope::User, None), decision(), far);
        assert_eq!(cache.invalidate_user("u1"), 2);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}

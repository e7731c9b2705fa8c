// src/budget/memory.rs — In-process budget repository
//
// Backs embedded deployments and tests. Counts lookups so callers can verify
// caching behaviour, and can be switched into a failing mode to simulate an
// unavailable store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{Budget, BudgetChange, BudgetKey, BudgetRepository, BudgetUpdate};
use crate::infra::errors::{Result, SpendGuardError};

#[derive(Default)]
pub struct MemoryBudgetRepository {
    budgets: Mutex<HashMap<String, Budget>>,
    lookups: AtomicU64,
    updates: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryBudgetRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budgets(budgets: impl IntoIterator<Item = Budget>) -> Self {
        let repo = Self::new();
        for b in budgets {
            repo.insert(b);
        }
        repo
    }

    pub fn insert(&self, budget: Budget) {
        if let Ok(mut map) = self.budgets.lock() {
            map.insert(budget.id.clone(), budget);
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<Budget> {
        self.budgets.lock().ok()?.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Budget> {
        let mut all: Vec<Budget> = self
            .budgets
            .lock()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Number of `find_active_budget` + `get_budget` calls served.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    /// Make every call fail with `StoreUnavailable` until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SpendGuardError::StoreUnavailable(
                "memory repository switched offline".into(),
            ));
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Budget>>> {
        self.budgets
            .lock()
            .map_err(|_| SpendGuardError::StoreUnavailable("budget map poisoned".into()))
    }
}

#[async_trait]
impl BudgetRepository for MemoryBudgetRepository {
    async fn find_active_budget(&self, key: &BudgetKey) -> Result<Option<Budget>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let map = self.lock()?;
        Ok(map
            .values()
            .filter(|b| b.is_active() && &b.key() == key)
            .min_by(|a, b| a.id.cmp(&b.id))
            .cloned())
    }

    async fn get_budget(&self, id: &str) -> Result<Option<Budget>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        Ok(self.lock()?.get(id).cloned())
    }

    async fn update_budget(&self, id: &str, update: &BudgetUpdate) -> Result<BudgetChange> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        let mut map = self.lock()?;
        let budget = map
            .get_mut(id)
            .ok_or_else(|| SpendGuardError::BudgetNotFound { id: id.to_string() })?;
        let before = budget.clone();
        update.apply_to(budget);
        Ok(BudgetChange {
            before,
            after: budget.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetScope, BudgetStatus};

    #[tokio::test]
    async fn test_find_active_skips_paused() {
        let mut paused = Budget::new("b-paused", "u1", BudgetScope::User, 10.0);
        paused.status = BudgetStatus::Paused;
        let repo = MemoryBudgetRepository::with_budgets([paused]);
        let key = BudgetKey::new("u1", BudgetScope::User, None);
        assert!(repo.find_active_budget(&key).await.unwrap().is_none());

        repo.insert(Budget::new("b-active", "u1", BudgetScope::User, 10.0));
        let found = repo.find_active_budget(&key).await.unwrap().unwrap();
        assert_eq!(found.id, "b-active");
        assert_eq!(repo.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_scope_id_must_match() {
        let repo = MemoryBudgetRepository::with_budgets([Budget::new(
            "b1",
            "u1",
            BudgetScope::Agent,
            10.0,
        )
        .with_scope_id("agent-1")]);
        let wrong = BudgetKey::new("u1", BudgetScope::Agent, Some("agent-2".into()));
        assert!(repo.find_active_budget(&wrong).await.unwrap().is_none());
        let right = BudgetKey::new("u1", BudgetScope::Agent, Some("agent-1".into()));
        assert!(repo.find_active_budget(&right).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_and_missing() {
        let repo =
            MemoryBudgetRepository::with_budgets([Budget::new("b1", "u1", BudgetScope::User, 10.0)]);
        let updated = repo
            .update_budget(
                "b1",
                &BudgetUpdate {
                    current_spend: Some(4.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.before.current_spend, 0.0);
        assert_eq!(updated.after.current_spend, 4.0);

        let err = repo
            .update_budget("nope", &BudgetUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SpendGuardError::BudgetNotFound { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_mode() {
        let repo =
            MemoryBudgetRepository::with_budgets([Budget::new("b1", "u1", BudgetScope::User, 10.0)]);
        repo.set_unavailable(true);
        let err = repo.get_budget("b1").await.unwrap_err();
        assert!(err.is_retriable());
        repo.set_unavailable(false);
        assert!(repo.get_budget("b1").await.unwrap().is_some());
    }
}

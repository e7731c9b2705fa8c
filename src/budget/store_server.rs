// src/budget/store_server.rs — Async message passing for Store
//
// rusqlite connections are not Sync, so a single task owns the Store and
// serves commands over a channel. StoreHandle is the cloneable front door and
// implements the BudgetRepository contract.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::store::{AuditRow, Store};
use super::{Budget, BudgetChange, BudgetKey, BudgetRepository, BudgetUpdate};
use crate::infra::errors::{Result, SpendGuardError};

#[derive(Debug)]
pub enum StoreCommand {
    InsertBudget {
        budget: Box<Budget>,
        resp: oneshot::Sender<Result<()>>,
    },
    GetBudget {
        id: String,
        resp: oneshot::Sender<Result<Option<Budget>>>,
    },
    FindActiveBudget {
        key: BudgetKey,
        resp: oneshot::Sender<Result<Option<Budget>>>,
    },
    ListBudgets {
        resp: oneshot::Sender<Result<Vec<Budget>>>,
    },
    UpdateBudget {
        id: String,
        update: BudgetUpdate,
        resp: oneshot::Sender<Result<BudgetChange>>,
    },
    /// Fire-and-forget: audit writes never hold up the caller.
    InsertAudit {
        kind: String,
        subject_id: Option<String>,
        success: bool,
        payload: String,
    },
    QueryAudit {
        limit: u32,
        resp: oneshot::Sender<Result<Vec<AuditRow>>>,
    },
}

/// A handle to the Store that uses message passing.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

fn unavailable<E: std::fmt::Display>(e: E) -> SpendGuardError {
    SpendGuardError::StoreUnavailable(e.to_string())
}

impl StoreHandle {
    pub fn new(tx: mpsc::Sender<StoreCommand>) -> Self {
        Self { tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreCommand,
    ) -> Result<T> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx.send(build(resp_tx)).await.map_err(unavailable)?;
        resp_rx.await.map_err(unavailable)?
    }

    pub async fn insert_budget(&self, budget: Budget) -> Result<()> {
        self.request(|resp| StoreCommand::InsertBudget {
            budget: Box::new(budget),
            resp,
        })
        .await
    }

    pub async fn list_budgets(&self) -> Result<Vec<Budget>> {
        self.request(|resp| StoreCommand::ListBudgets { resp }).await
    }

    pub async fn query_audit(&self, limit: u32) -> Result<Vec<AuditRow>> {
        self.request(|resp| StoreCommand::QueryAudit { limit, resp })
            .await
    }

    /// Queue an audit row without waiting. Drops (with a warning) when the
    /// channel is full.
    pub fn append_audit(
        &self,
        kind: &str,
        subject_id: Option<&str>,
        success: bool,
        payload: String,
    ) {
        let cmd = StoreCommand::InsertAudit {
            kind: kind.to_string(),
            subject_id: subject_id.map(str::to_string),
            success,
            payload,
        };
        if let Err(e) = self.tx.try_send(cmd) {
            tracing::warn!("Dropping audit record ({kind}): {e}");
        }
    }
}

#[async_trait]
impl BudgetRepository for StoreHandle {
    async fn find_active_budget(&self, key: &BudgetKey) -> Result<Option<Budget>> {
        let key = key.clone();
        self.request(|resp| StoreCommand::FindActiveBudget { key, resp })
            .await
    }

    async fn get_budget(&self, id: &str) -> Result<Option<Budget>> {
        let id = id.to_string();
        self.request(|resp| StoreCommand::GetBudget { id, resp }).await
    }

    async fn update_budget(&self, id: &str, update: &BudgetUpdate) -> Result<BudgetChange> {
        let id = id.to_string();
        let update = update.clone();
        self.request(|resp| StoreCommand::UpdateBudget { id, update, resp })
            .await
    }
}

/// Helper to spawn the store server and return a handle.
pub fn spawn_store_server(store: Store) -> (StoreHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = StoreHandle::new(tx);
    let join_handle = tokio::spawn(run_store_server(store, rx));
    (handle, join_handle)
}

/// The background task that owns the Store.
pub async fn run_store_server(store: Store, mut rx: mpsc::Receiver<StoreCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            StoreCommand::InsertBudget { budget, resp } => {
                let _ = resp.send(store.insert_budget(&budget));
            }
            StoreCommand::GetBudget { id, resp } => {
                let _ = resp.send(store.get_budget(&id));
            }
            StoreCommand::FindActiveBudget { key, resp } => {
                let _ = resp.send(store.find_active_budget(&key));
            }
            StoreCommand::ListBudgets { resp } => {
                let _ = resp.send(store.list_budgets());
            }
            StoreCommand::UpdateBudget { id, update, resp } => {
                let _ = resp.send(store.update_budget(&id, &update));
            }
            StoreCommand::InsertAudit {
                kind,
                subject_id,
                success,
                payload,
            } => {
                if let Err(e) = store.insert_audit(&kind, subject_id.as_deref(), success, &payload)
                {
                    tracing::warn!("Failed to write audit record ({kind}): {e}");
                }
            }
            StoreCommand::QueryAudit { limit, resp } => {
                let _ = resp.send(store.query_audit(limit));
            }
        }
    }
    tracing::debug!("Store server stopped: all handles dropped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetScope, BudgetStatus};

    #[tokio::test]
    async fn test_handle_roundtrip() {
        let (handle, _join) = spawn_store_server(Store::in_memory().unwrap());
        handle
            .insert_budget(Budget::new("b1", "u1", BudgetScope::User, 100.0).with_spend(10.0))
            .await
            .unwrap();

        let key = BudgetKey::new("u1", BudgetScope::User, None);
        let found = handle.find_active_budget(&key).await.unwrap().unwrap();
        assert_eq!(found.id, "b1");

        let updated = handle
            .update_budget(
                "b1",
                &BudgetUpdate {
                    status: Some(BudgetStatus::Paused),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.after.status, BudgetStatus::Paused);
        assert!(handle.find_active_budget(&key).await.unwrap().is_none());
        assert_eq!(handle.list_budgets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_audit_append_is_visible() {
        let (handle, _join) = spawn_store_server(Store::in_memory().unwrap());
        handle.append_audit("guard_decision", Some("b1"), true, "{}".into());
        // Commands are served in order, so the query observes the insert
        let rows = handle.query_audit(5).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].subject_id.as_deref(), Some("b1"));
    }

    #[tokio::test]
    async fn test_dropped_server_reports_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = StoreHandle::new(tx);
        let err = handle.get_budget("b1").await.unwrap_err();
        assert!(matches!(err, SpendGuardError::StoreUnavailable(_)));
    }
}

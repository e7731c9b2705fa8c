// src/budget/store.rs — SQLite operations

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

use super::{schema, Budget, BudgetChange, BudgetKey, BudgetUpdate};
use crate::infra::errors::{Result, SpendGuardError};

const BUDGET_COLUMNS: &str = "id, name, user_id, scope, scope_id, limit_amount, current_spend,
     period, status, hard_limit, alert_80_sent, alert_100_sent, updated_at";

/// A row from the audit log.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub id: i64,
    pub kind: String,
    pub subject_id: Option<String>,
    pub success: bool,
    pub payload: String,
    pub recorded_at: String,
}

/// Low-level SQLite operations for budgets and the audit log.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        schema::run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    /// In-memory database with schema applied (for tests).
    pub fn in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::run_migrations(&conn)?;
        Ok(Self::new(conn))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    // -- Budgets --

    pub fn insert_budget(&self, budget: &Budget) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO budgets (id, name, user_id, scope, scope_id, limit_amount, current_spend,
             period, status, hard_limit, alert_80_sent, alert_100_sent, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)",
            params![
                budget.id,
                budget.name,
                budget.user_id,
                budget.scope.as_str(),
                budget.scope_id,
                budget.limit_amount,
                budget.current_spend,
                budget.period.as_str(),
                budget.status.as_str(),
                budget.hard_limit,
                budget.alert_80_sent,
                budget.alert_100_sent,
                now
            ],
        )?;
        Ok(())
    }

    pub fn get_budget(&self, id: &str) -> Result<Option<Budget>> {
        let sql = format!("SELECT {BUDGET_COLUMNS} FROM budgets WHERE id = ?1");
        let budget = self
            .conn
            .query_row(&sql, params![id], budget_from_row)
            .optional()?;
        Ok(budget)
    }

    pub fn find_active_budget(&self, key: &BudgetKey) -> Result<Option<Budget>> {
        let sql = format!(
            "SELECT {BUDGET_COLUMNS} FROM budgets
             WHERE user_id = ?1 AND scope = ?2 AND status = 'active'
               AND ((?3 IS NULL AND scope_id IS NULL) OR scope_id = ?3)
             ORDER BY id LIMIT 1"
        );
        let budget = self
            .conn
            .query_row(
                &sql,
                params![key.user_id, key.scope.as_str(), key.scope_id],
                budget_from_row,
            )
            .optional()?;
        Ok(budget)
    }

    pub fn list_budgets(&self) -> Result<Vec<Budget>> {
        let sql = format!("SELECT {BUDGET_COLUMNS} FROM budgets ORDER BY id");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], budget_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Read, apply and write in one transaction.
    pub fn update_budget(&self, id: &str, update: &BudgetUpdate) -> Result<BudgetChange> {
        let tx = self.conn.unchecked_transaction()?;
        let before = self
            .get_budget(id)?
            .ok_or_else(|| SpendGuardError::BudgetNotFound { id: id.to_string() })?;
        let mut budget = before.clone();
        update.apply_to(&mut budget);
        tx.execute(
            "UPDATE budgets SET limit_amount = ?1, current_spend = ?2, period = ?3, status = ?4,
             alert_80_sent = ?5, alert_100_sent = ?6, updated_at = ?7
             WHERE id = ?8",
            params![
                budget.limit_amount,
                budget.current_spend,
                budget.period.as_str(),
                budget.status.as_str(),
                budget.alert_80_sent,
                budget.alert_100_sent,
                budget.updated_at.to_rfc3339(),
                id
            ],
        )?;
        tx.commit()?;
        Ok(BudgetChange {
            before,
            after: budget,
        })
    }

    // -- Audit log --

    pub fn insert_audit(
        &self,
        kind: &str,
        subject_id: Option<&str>,
        success: bool,
        payload: &str,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO audit_log (kind, subject_id, success, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind, subject_id, success, payload, now],
        )?;
        Ok(())
    }

    pub fn query_audit(&self, limit: u32) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, kind, subject_id, success, payload, recorded_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    kind: row.get(1)?,
                    subject_id: row.get(2)?,
                    success: row.get(3)?,
                    payload: row.get(4)?,
                    recorded_at: row.get(5)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_column<T: std::str::FromStr>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn budget_from_row(row: &Row<'_>) -> rusqlite::Result<Budget> {
    let updated_raw: String = row.get(12)?;
    let updated_at = DateTime::parse_from_rfc3339(&updated_raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(12, Type::Text, Box::new(e)))?;

    Ok(Budget {
        id: row.get(0)?,
        name: row.get(1)?,
        user_id: row.get(2)?,
        scope: parse_column(row, 3)?,
        scope_id: row.get(4)?,
        limit_amount: row.get(5)?,
        current_spend: row.get(6)?,
        period: parse_column(row, 7)?,
        status: parse_column(row, 8)?,
        hard_limit: row.get(9)?,
        alert_80_sent: row.get(10)?,
        alert_100_sent: row.get(11)?,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{BudgetPeriod, BudgetScope, BudgetStatus};

    fn store_with(budget: &Budget) -> Store {
        let store = Store::in_memory().unwrap();
        store.insert_budget(budget).unwrap();
        store
    }

    #[test]
    fn test_insert_and_get() {
        let b = Budget::new("b1", "u1", BudgetScope::Team, 250.0)
            .with_scope_id("team-a")
            .with_spend(12.5)
            .with_period(BudgetPeriod::Weekly);
        let store = store_with(&b);
        let loaded = store.get_budget("b1").unwrap().unwrap();
        assert_eq!(loaded.scope, BudgetScope::Team);
        assert_eq!(loaded.scope_id.as_deref(), Some("team-a"));
        assert_eq!(loaded.period, BudgetPeriod::Weekly);
        assert!((loaded.current_spend - 12.5).abs() < 1e-9);
        assert!(store.get_budget("missing").unwrap().is_none());
    }

    #[test]
    fn test_find_active_matches_null_scope_id() {
        let store = store_with(&Budget::new("b1", "u1", BudgetScope::User, 10.0));
        let key = BudgetKey::new("u1", BudgetScope::User, None);
        assert_eq!(store.find_active_budget(&key).unwrap().unwrap().id, "b1");

        let scoped = BudgetKey::new("u1", BudgetScope::User, Some("x".into()));
        assert!(store.find_active_budget(&scoped).unwrap().is_none());
    }

    #[test]
    fn test_update_budget_persists() {
        let store = store_with(&Budget::new("b1", "u1", BudgetScope::User, 10.0));
        let updated = store
            .update_budget(
                "b1",
                &BudgetUpdate {
                    status: Some(BudgetStatus::Paused),
                    alert_80_sent: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.before.status, BudgetStatus::Active);
        assert_eq!(updated.after.status, BudgetStatus::Paused);

        let loaded = store.get_budget("b1").unwrap().unwrap();
        assert_eq!(loaded.status, BudgetStatus::Paused);
        assert!(loaded.alert_80_sent);

        // Paused budgets are no longer found as active
        let key = BudgetKey::new("u1", BudgetScope::User, None);
        assert!(store.find_active_budget(&key).unwrap().is_none());
    }

    #[test]
    fn test_update_missing_budget() {
        let store = Store::in_memory().unwrap();
        let err = store
            .update_budget("ghost", &BudgetUpdate::default())
            .unwrap_err();
        assert!(matches!(err, SpendGuardError::BudgetNotFound { .. }));
    }

    #[test]
    fn test_audit_roundtrip() {
        let store = Store::in_memory().unwrap();
        store
            .insert_audit("task_result", Some("t-1"), true, "{}")
            .unwrap();
        store
            .insert_audit("action_result", Some("r-1"), false, "{\"error\":\"x\"}")
            .unwrap();
        let rows = store.query_audit(10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, "action_result");
        assert!(!rows[0].success);
    }
}

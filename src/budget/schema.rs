// src/budget/schema.rs — Schema + migrations

use rusqlite::{params, Connection};
use tracing::info;

/// A database migration with version, name, and SQL statements.
pub struct Migration {
    pub version: u32,
    pub name: &'static str,
    pub up: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "budgets",
        up: "CREATE TABLE budgets (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                user_id TEXT NOT NULL,
                scope TEXT NOT NULL CHECK (scope IN ('user','team','agent','workflow','global')),
                scope_id TEXT,
                limit_amount REAL NOT NULL CHECK (limit_amount >= 0),
                current_spend REAL NOT NULL DEFAULT 0 CHECK (current_spend >= 0),
                period TEXT NOT NULL CHECK (period IN ('daily','weekly','monthly')),
                status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active','paused')),
                hard_limit INTEGER NOT NULL DEFAULT 1,
                alert_80_sent INTEGER NOT NULL DEFAULT 0,
                alert_100_sent INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX idx_budgets_lookup ON budgets (user_id, scope, scope_id, status);",
    },
    Migration {
        version: 2,
        name: "audit_log",
        up: "CREATE TABLE audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                subject_id TEXT,
                success INTEGER NOT NULL,
                payload TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX idx_audit_recorded ON audit_log (recorded_at);",
    },
];

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        info!(
            "Applying migration {}: {}",
            migration.version, migration.name
        );

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;
    }

    Ok(())
}

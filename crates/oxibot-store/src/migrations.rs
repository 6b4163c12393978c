//! Ordered schema migrations, applied once on open.
//!
//! Grounded on the `(version, name, sql)` migration-table pattern used by
//! the pack's embedded-SQL stores: each migration is a static SQL blob
//! loaded with `include_str!`, applied in a single transaction when
//! possible, and retried statement-by-statement (tolerating "already
//! exists" noise) when the bulk transaction fails — so re-opening an older
//! database upgrades cleanly without manual intervention.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::StoreError;

/// A single, idempotent-when-retried schema change.
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub sql: &'static str,
}

/// All migrations for the conversation store, in ascending version order.
pub static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial",
    sql: include_str!("migrations/001_initial.sql"),
}];

fn current_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )?;
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        (),
        |row| row.get(0),
    )
}

/// Apply every migration with `version` greater than the database's current
/// recorded version, in order. Safe to call on every open.
pub fn apply_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<(), StoreError> {
    let mut current = current_version(conn)?;

    let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    for migration in pending {
        debug!(version = migration.version, name = migration.name, "applying migration");

        let tx_result = {
            let tx = conn.transaction()?;
            let applied = tx.execute_batch(migration.sql);
            match applied {
                Ok(()) => tx.commit().map(|_| true),
                Err(_) => {
                    // Roll back and fall through to the per-statement retry below.
                    drop(tx);
                    Ok(false)
                }
            }
        };

        let bulk_succeeded = tx_result?;
        if !bulk_succeeded {
            warn!(
                version = migration.version,
                "bulk migration failed, retrying statement-by-statement"
            );
            apply_statements_individually(conn, migration)?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.name, chrono::Utc::now().to_rfc3339()],
        )?;
        current = migration.version;
        info!(version = current, name = migration.name, "migration applied");
    }

    Ok(())
}

fn apply_statements_individually(conn: &Connection, migration: &Migration) -> Result<(), StoreError> {
    for statement in migration.sql.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if let Err(err) = conn.execute(statement, ()) {
            let message = err.to_string().to_lowercase();
            if message.contains("already exists") || message.contains("duplicate column") {
                continue;
            }
            return Err(StoreError::Migration(format!(
                "migration {} statement failed: {err}",
                migration.version
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_create_expected_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map((), |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        for expected in ["audit_log", "conversations", "memories", "messages", "paired_users"] {
            assert!(tables.iter().any(|t| t == expected), "missing table {expected}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();

        let version = current_version(&conn).unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn reopening_a_fresh_database_lands_on_highest_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        apply_migrations(&mut conn, MIGRATIONS).unwrap();
        let version = current_version(&conn).unwrap();
        assert_eq!(version, MIGRATIONS.iter().map(|m| m.version).max().unwrap());
    }
}

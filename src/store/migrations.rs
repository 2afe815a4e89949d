//! Schema versions for the ledger database.
//!
//! Applied steps are tracked in `_migrations`. A step's DDL and its version
//! row are committed in one batch, so a crash never leaves a half-applied
//! version behind.

use libsql::Connection;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Never edit a step that has shipped.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "processed_messages",
        sql: "CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                outcome TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );",
    },
    Migration {
        version: 2,
        name: "processed_at_index",
        sql: "CREATE INDEX IF NOT EXISTS idx_processed_messages_processed_at
                ON processed_messages(processed_at);",
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Bring the schema up to `latest_version()`.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create _migrations: {e}")))?;

    let applied = applied_version(conn).await?;
    let mut pending = MIGRATIONS.iter().filter(|m| m.version > applied).peekable();
    if pending.peek().is_none() {
        tracing::debug!(version = applied, "Ledger schema up to date");
        return Ok(());
    }

    for step in pending {
        tracing::info!(version = step.version, name = step.name, "Applying ledger migration");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO _migrations (version, name) VALUES ({}, '{}');\nCOMMIT;",
            step.sql, step.version, step.name
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Leave the connection usable for the caller's error path.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "V{} ({}): {e}",
                step.version, step.name
            )));
        }
    }
    Ok(())
}

/// Highest applied version, 0 on a fresh database.
pub async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read_err = |e: libsql::Error| DatabaseError::Migration(format!("read schema version: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read_err)?;
    match rows.next().await.map_err(read_err)? {
        Some(row) => row.get::<i64>(0).map_err(read_err),
        None => Ok(0),
    }
}

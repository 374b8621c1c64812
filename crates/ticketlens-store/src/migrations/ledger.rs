//! The `migrations` ledger table
//!
//! Databases created by older builds may lack the `description` and/or
//! `checksum` columns. The layout is resolved once into a
//! [`LedgerSchemaVersion`]; readers synthesise values for the missing columns
//! and writers only touch columns that exist. Every layout has `version`,
//! `applied_at` and `execution_time`.

use crate::migrations::model::{AppliedMigration, Migration};
use rusqlite::types::ValueRef;
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::Serialize;
use std::collections::HashSet;

pub const LEDGER_TABLE: &str = "migrations";

const CREATE_LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS migrations (
    version         TEXT PRIMARY KEY,
    description     TEXT NOT NULL,
    applied_at      TEXT DEFAULT CURRENT_TIMESTAMP,
    checksum        TEXT,
    execution_time  INTEGER DEFAULT 0
)";

pub const LEGACY_DESCRIPTION: &str = "Legacy Migration";

/// Column layout of an existing ledger table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LedgerSchemaVersion {
    /// Neither `description` nor `checksum`
    Legacy,
    DescriptionOnly,
    ChecksumOnly,
    /// The canonical layout written by this crate
    Current,
}

impl LedgerSchemaVersion {
    pub fn from_columns(has_description: bool, has_checksum: bool) -> Self {
        match (has_description, has_checksum) {
            (false, false) => LedgerSchemaVersion::Legacy,
            (true, false) => LedgerSchemaVersion::DescriptionOnly,
            (false, true) => LedgerSchemaVersion::ChecksumOnly,
            (true, true) => LedgerSchemaVersion::Current,
        }
    }

    pub fn has_description(self) -> bool {
        matches!(
            self,
            LedgerSchemaVersion::DescriptionOnly | LedgerSchemaVersion::Current
        )
    }

    pub fn has_checksum(self) -> bool {
        matches!(
            self,
            LedgerSchemaVersion::ChecksumOnly | LedgerSchemaVersion::Current
        )
    }
}

/// Create the ledger if needed and resolve its layout
pub fn ensure(conn: &Connection) -> rusqlite::Result<LedgerSchemaVersion> {
    conn.execute_batch(CREATE_LEDGER_SQL)?;
    Ok(resolve(conn)?.unwrap_or(LedgerSchemaVersion::Current))
}

/// Resolve the layout without creating anything; `None` when the table is absent
pub fn resolve(conn: &Connection) -> rusqlite::Result<Option<LedgerSchemaVersion>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([LEDGER_TABLE], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<_>>>()?;

    if columns.is_empty() {
        return Ok(None);
    }
    Ok(Some(LedgerSchemaVersion::from_columns(
        columns.contains("description"),
        columns.contains("checksum"),
    )))
}

/// Read ledger rows in the order they were written
pub fn read(conn: &Connection, schema: LedgerSchemaVersion) -> rusqlite::Result<Vec<AppliedMigration>> {
    let description = if schema.has_description() {
        "description"
    } else {
        "NULL"
    };
    let checksum = if schema.has_checksum() {
        "checksum"
    } else {
        "NULL"
    };
    let sql = format!(
        "SELECT version, {}, applied_at, {}, COALESCE(execution_time, 0) FROM {} ORDER BY rowid",
        description, checksum, LEDGER_TABLE
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok(AppliedMigration {
            version: row.get(0)?,
            description: row
                .get::<_, Option<String>>(1)?
                .unwrap_or_else(|| LEGACY_DESCRIPTION.to_string()),
            applied_at: timestamp_text(row.get_ref(2)?),
            checksum: row.get(3)?,
            execution_time_ms: row.get(4)?,
        })
    })?;
    rows.collect()
}

// Older ledgers stored applied_at as a unix timestamp
fn timestamp_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Null | ValueRef::Blob(_) => String::new(),
    }
}

/// Record a migration as applied
pub fn insert(
    conn: &Connection,
    schema: LedgerSchemaVersion,
    migration: &Migration,
    execution_time_ms: i64,
) -> rusqlite::Result<()> {
    let applied_at = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

    let mut columns = vec!["version", "applied_at", "execution_time"];
    let mut values: Vec<&dyn ToSql> = vec![
        &migration.version as &dyn ToSql,
        &applied_at as &dyn ToSql,
        &execution_time_ms as &dyn ToSql,
    ];
    if schema.has_description() {
        columns.push("description");
        values.push(&migration.description);
    }
    let checksum = migration.checksum();
    if schema.has_checksum() {
        columns.push("checksum");
        values.push(&checksum);
    }

    let placeholders = (1..=columns.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        LEDGER_TABLE,
        columns.join(", "),
        placeholders
    );
    conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Remove a migration's ledger row
pub fn delete(conn: &Connection, version: &str) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM migrations WHERE version = ?1", [version])
}

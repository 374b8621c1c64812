//! Database connection management
//!
//! The live handle is always an in-memory SQLite database. File-backed
//! sessions load the file into it with the online-backup API and write it
//! back through [`crate::persistence`].

use crate::errors::{from_rusqlite, Result};
use rusqlite::backup::Backup;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// Pages copied per backup step
const BACKUP_PAGES_PER_STEP: i32 = 256;

/// Open an in-memory SQLite database
pub fn open_in_memory() -> Result<Connection> {
    Connection::open_in_memory().map_err(|e| from_rusqlite("open", e))
}

/// Open the working copy for a file-backed session
///
/// Returns the in-memory handle and whether the file already existed.
/// A missing file is not an error; it is created on the first save.
pub fn open_working_copy(path: &Path) -> Result<(Connection, bool)> {
    let mut conn = open_in_memory()?;
    if !path.exists() {
        tracing::debug!(db_path = %path.display(), "database file absent, starting empty");
        return Ok((conn, false));
    }

    let source = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| from_rusqlite("open", e).with_entity_id(path.display().to_string()))?;

    copy_database(&source, &mut conn)
        .map_err(|e| from_rusqlite("load", e).with_entity_id(path.display().to_string()))?;

    tracing::debug!(db_path = %path.display(), "loaded database file into working copy");
    Ok((conn, true))
}

/// Copy every page of `src` into `dst`, replacing its contents
pub fn copy_database(src: &Connection, dst: &mut Connection) -> rusqlite::Result<()> {
    let backup = Backup::new(src, dst)?;
    backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)
}

/// Apply connection PRAGMAs
///
/// Returns the journal mode SQLite actually selected. In-memory databases
/// report `memory` whatever mode was requested.
pub fn configure(conn: &Connection, journal_mode: &str, synchronous: &str) -> Result<String> {
    conn.pragma_update(None, "foreign_keys", true)
        .map_err(|e| from_rusqlite("configure", e))?;

    let effective: String = conn
        .pragma_update_and_check(None, "journal_mode", journal_mode, |row| row.get(0))
        .map_err(|e| from_rusqlite("configure", e))?;

    conn.pragma_update(None, "synchronous", synchronous)
        .map_err(|e| from_rusqlite("configure", e))?;

    tracing::debug!(
        journal_mode = %journal_mode,
        effective_journal_mode = %effective,
        synchronous = %synchronous,
        "connection configured"
    );
    Ok(effective)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_working_copy_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("absent.db");

        let (_conn, existed) = open_working_copy(&path).unwrap();

        assert!(!existed);
        assert!(!path.exists(), "opening must not create the file");
    }

    #[test]
    fn test_open_working_copy_loads_file_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tickets.db");
        {
            let disk = Connection::open(&path).unwrap();
            disk.execute_batch("CREATE TABLE t (v TEXT); INSERT INTO t VALUES ('hello');")
                .unwrap();
        }

        let (conn, existed) = open_working_copy(&path).unwrap();

        assert!(existed);
        let v: String = conn.query_row("SELECT v FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(v, "hello");

        // Writes to the working copy do not touch the file
        conn.execute("INSERT INTO t VALUES ('memory only')", []).unwrap();
        let disk = Connection::open(&path).unwrap();
        let count: i64 = disk.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_configure_reports_effective_mode() {
        let conn = open_in_memory().unwrap();
        let effective = configure(&conn, "WAL", "NORMAL").unwrap();
        assert_eq!(effective.to_lowercase(), "memory");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }
}

//! CLI integration tests
//!
//! These tests drive the `ticketlens` binary against temporary database files.

use rusqlite::Connection;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn ticketlens(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ticketlens"))
        .current_dir(dir)
        .args(["--log-format", "test"])
        .args(args)
        .output()
        .expect("Failed to execute CLI")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "CLI command should succeed. Stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout_lines(output: &Output) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line should be JSON"))
        .collect()
}

fn ledger_count(db: &Path) -> i64 {
    let conn = Connection::open(db).unwrap();
    conn.query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
        .unwrap()
}

fn backup_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".bak"))
        .collect()
}

#[test]
fn test_migrate_creates_database_file() {
    // Given: An empty directory
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("tickets.db");

    // When: `ticketlens migrate --db tickets.db`
    let output = ticketlens(temp_dir.path(), &["migrate", "--db", db.to_str().unwrap()]);

    // Then: One JSON line per applied migration and a file on disk
    assert_success(&output);
    let lines = stdout_lines(&output);
    assert_eq!(lines.len(), 6);
    assert!(lines.iter().all(|l| l["success"] == serde_json::json!(true)));
    assert_eq!(ledger_count(&db), 6);

    // And: Running it again applies nothing
    let again = ticketlens(temp_dir.path(), &["migrate", "--db", db.to_str().unwrap()]);
    assert_success(&again);
    assert!(stdout_lines(&again).is_empty());

    // And: Nothing was pending, so nothing was backed up
    assert!(backup_files(temp_dir.path()).is_empty());
}

#[test]
fn test_status_and_rollback() {
    // Given: A migrated database
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("tickets.db");
    let db_arg = db.to_str().unwrap();
    assert_success(&ticketlens(temp_dir.path(), &["migrate", "--db", db_arg]));

    // When: Rolling back to 004
    let output = ticketlens(temp_dir.path(), &["rollback", "--to", "004", "--db", db_arg]);

    // Then: 006 and 005 were reverted, in that order
    assert_success(&output);
    let versions: Vec<_> = stdout_lines(&output)
        .iter()
        .map(|l| l["version"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(versions, vec!["006", "005"]);

    // And: Status lists them as pending
    let status = ticketlens(temp_dir.path(), &["status", "--db", db_arg]);
    assert_success(&status);
    let status = &stdout_lines(&status)[0];
    assert_eq!(status["pending"], serde_json::json!(["005", "006"]));

    // And: Neither command re-applied migrations nor wrote a backup
    assert_eq!(ledger_count(&db), 4);
    assert!(backup_files(temp_dir.path()).is_empty());
}

#[test]
fn test_query_prints_rows_and_persists_writes() {
    // Given: A migrated database
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("tickets.db");
    let db_arg = db.to_str().unwrap();
    assert_success(&ticketlens(temp_dir.path(), &["migrate", "--db", db_arg]));

    // When: A row is inserted with parameters and read back
    let insert = ticketlens(
        temp_dir.path(),
        &[
            "query",
            "INSERT INTO settings (key, value) VALUES (?, ?)",
            "--param",
            "theme",
            "--param",
            "dark",
            "--db",
            db_arg,
        ],
    );
    assert_success(&insert);
    let select = ticketlens(
        temp_dir.path(),
        &["query", "SELECT key, value FROM settings", "--db", db_arg],
    );

    // Then: The row survived between processes
    assert_success(&select);
    let rows = stdout_lines(&select);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["key"], serde_json::json!("theme"));
    assert_eq!(rows[0]["value"], serde_json::json!("dark"));
}

#[test]
fn test_config_file_supplies_path() {
    // Given: A config file with camelCase keys
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("from-config.db");
    let config = temp_dir.path().join("ticketlens.toml");
    fs::write(
        &config,
        format!(
            "path = {:?}\nbackupOnMigration = false\njournalMode = \"delete\"\n",
            db.to_str().unwrap()
        ),
    )
    .unwrap();

    // When: migrate runs with --config only
    let output = ticketlens(
        temp_dir.path(),
        &["migrate", "--config", config.to_str().unwrap()],
    );

    // Then: The configured file was created
    assert_success(&output);
    assert_eq!(ledger_count(&db), 6);
}

#[test]
fn test_backup_to_explicit_path() {
    // Given: A migrated database
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("tickets.db");
    let out = temp_dir.path().join("backups").join("copy.db");
    assert_success(&ticketlens(
        temp_dir.path(),
        &["migrate", "--db", db.to_str().unwrap()],
    ));

    // When: `ticketlens backup --out backups/copy.db`
    let output = ticketlens(
        temp_dir.path(),
        &[
            "backup",
            "--db",
            db.to_str().unwrap(),
            "--out",
            out.to_str().unwrap(),
        ],
    );

    // Then: The copy is a complete database
    assert_success(&output);
    assert_eq!(ledger_count(&out), 6);
}

#[test]
fn test_errors_exit_non_zero() {
    // Given: A migrated database
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("tickets.db");
    let db_arg = db.to_str().unwrap();

    // When: The statement is invalid
    let output = ticketlens(
        temp_dir.path(),
        &["query", "SELECT * FROM no_such_table", "--db", db_arg],
    );

    // Then: Exit code 1 and the error on stderr
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Error:"));
    assert!(stderr.contains("no_such_table"));

    // And: An unknown rollback order is rejected
    let output = ticketlens(
        temp_dir.path(),
        &["rollback", "--order", "sideways", "--db", db_arg],
    );
    assert_eq!(output.status.code(), Some(1));
}

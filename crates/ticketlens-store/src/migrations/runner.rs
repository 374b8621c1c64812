//! Migration runner
//!
//! Applies migrations in dependency order with checksums, idempotency and
//! rollback. Each `up`/`down` runs in a savepoint together with its ledger
//! write, so a failed step leaves neither schema changes nor a ledger row.
//!
//! ## Logging Ownership
//!
//! `run_migrations` and `rollback_migrations` own lifecycle logging through
//! `log_op_start!`/`log_op_end!`/`log_op_error!`. Helpers log with
//! `tracing::debug!` only; advisory conditions use `tracing::warn!`.

use crate::errors::{checksum_mismatch, from_rusqlite, migration_error, Result};
use crate::migrations::checksums::migration_checksum;
use crate::migrations::embedded::default_migrations;
use crate::migrations::ledger::{self, LedgerSchemaVersion};
use crate::migrations::model::{
    AppliedMigration, DriftPolicy, Migration, MigrationResult, MigrationStatus, MigrationStep,
    RollbackOrder,
};
use rusqlite::Connection;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use ticketlens_core::errors::{ExError, ExErrorKind};
use ticketlens_core::{log_op_end, log_op_error, log_op_start};

const APPLY_SAVEPOINT: &str = "ticketlens_migration";

#[derive(Debug, Clone, Copy)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn op(self) -> &'static str {
        match self {
            Direction::Up => "migration_up",
            Direction::Down => "migration_down",
        }
    }
}

/// Applies and reverts a registered set of migrations
#[derive(Debug, Clone)]
pub struct MigrationRunner {
    migrations: Vec<Migration>,
    drift_policy: DriftPolicy,
    rollback_order: RollbackOrder,
}

impl MigrationRunner {
    /// Register migrations, computing each one's checksum
    pub fn new(migrations: Vec<Migration>) -> Self {
        let migrations = migrations
            .into_iter()
            .map(|mut m| {
                let checksum = migration_checksum(&m.up, m.down.as_ref());
                m.set_checksum(checksum);
                m
            })
            .collect();
        Self {
            migrations,
            drift_policy: DriftPolicy::default(),
            rollback_order: RollbackOrder::default(),
        }
    }

    /// Runner over the built-in ticket schema
    pub fn with_defaults() -> Self {
        Self::new(default_migrations())
    }

    pub fn with_drift_policy(mut self, policy: DriftPolicy) -> Self {
        self.drift_policy = policy;
        self
    }

    pub fn with_rollback_order(mut self, order: RollbackOrder) -> Self {
        self.rollback_order = order;
        self
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    pub fn get(&self, version: &str) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    pub fn drift_policy(&self) -> DriftPolicy {
        self.drift_policy
    }

    pub fn rollback_order(&self) -> RollbackOrder {
        self.rollback_order
    }

    /// Check versions are unique and every dependency is registered
    pub fn validate_dependencies(&self) -> Result<()> {
        let mut versions = HashSet::new();
        for migration in &self.migrations {
            if !versions.insert(migration.version.as_str()) {
                return Err(ExError::new(ExErrorKind::DuplicateMigration)
                    .with_op("validate_dependencies")
                    .with_entity_id(migration.version.clone())
                    .with_message(format!(
                        "Migration version {} is registered more than once",
                        migration.version
                    )));
            }
        }

        for migration in &self.migrations {
            if let Some(missing) = migration
                .dependencies
                .iter()
                .find(|dep| !versions.contains(dep.as_str()))
            {
                return Err(ExError::new(ExErrorKind::MissingDependency)
                    .with_op("validate_dependencies")
                    .with_entity_id(migration.version.clone())
                    .with_message(format!(
                        "Migration {} depends on missing migration {}",
                        migration.version, missing
                    )));
            }
        }
        Ok(())
    }

    /// Order migrations so every one follows its dependencies
    ///
    /// Independent migrations keep their registration order.
    pub fn sort_by_dependencies(&self) -> Result<Vec<&Migration>> {
        let index: HashMap<&str, &Migration> = self
            .migrations
            .iter()
            .map(|m| (m.version.as_str(), m))
            .collect();

        let mut processing = HashSet::new();
        let mut processed = HashSet::new();
        let mut ordered = Vec::with_capacity(self.migrations.len());

        for migration in &self.migrations {
            visit(
                migration,
                &index,
                &mut processing,
                &mut processed,
                &mut ordered,
            )?;
        }
        Ok(ordered)
    }

    /// Create the ledger table if needed and resolve its layout
    pub fn initialize_ledger(&self, conn: &Connection) -> Result<LedgerSchemaVersion> {
        let schema = ledger::ensure(conn).map_err(|e| from_rusqlite("initialize_ledger", e))?;
        tracing::debug!(ledger_schema = ?schema, "migration ledger ready");
        Ok(schema)
    }

    /// Ledger rows; a ledger that cannot be read counts as empty
    pub fn applied_migrations(
        &self,
        conn: &Connection,
        schema: LedgerSchemaVersion,
    ) -> Vec<AppliedMigration> {
        match ledger::read(conn, schema) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::debug!(error = %e, "migration ledger unreadable, treating as empty");
                Vec::new()
            }
        }
    }

    /// Compare a ledger checksum against the registered migration
    pub fn validate_integrity(&self, migration: &Migration, applied: &AppliedMigration) -> Result<()> {
        let recorded = match applied.checksum.as_deref() {
            Some(recorded) if recorded != migration.checksum() => recorded,
            _ => return Ok(()),
        };

        match self.drift_policy {
            DriftPolicy::Warn => {
                tracing::warn!(
                    migration_version = %migration.version,
                    recorded_checksum = %recorded,
                    current_checksum = %migration.checksum(),
                    "applied migration has changed since it was recorded"
                );
                Ok(())
            }
            DriftPolicy::Fail => Err(checksum_mismatch(
                &migration.version,
                recorded,
                migration.checksum(),
            )),
        }
    }

    /// Apply every pending migration
    ///
    /// Returns one result per migration attempted in this call. The first
    /// failure aborts the run.
    pub fn run_migrations(&self, conn: &Connection) -> Result<Vec<MigrationResult>> {
        log_op_start!("run_migrations", registered = self.migrations.len());
        let start = Instant::now();

        let results = self.run_migrations_impl(conn).map_err(|e| {
            log_op_error!(
                "run_migrations",
                e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "run_migrations",
            duration_ms = start.elapsed().as_millis() as u64,
            applied = results.len()
        );
        Ok(results)
    }

    fn run_migrations_impl(&self, conn: &Connection) -> Result<Vec<MigrationResult>> {
        self.validate_dependencies()?;
        let schema = self.initialize_ledger(conn)?;
        let applied = self.applied_migrations(conn, schema);
        let ordered = self.sort_by_dependencies()?;

        let applied_by_version: HashMap<&str, &AppliedMigration> =
            applied.iter().map(|a| (a.version.as_str(), a)).collect();

        for migration in &ordered {
            if let Some(record) = applied_by_version.get(migration.version.as_str()) {
                self.validate_integrity(migration, record)?;
            }
        }

        let mut results = Vec::new();
        for migration in ordered {
            if applied_by_version.contains_key(migration.version.as_str()) {
                continue;
            }

            let started = Instant::now();
            let outcome = in_savepoint(conn, || {
                migration.up.apply(conn)?;
                let elapsed = started.elapsed().as_millis() as i64;
                ledger::insert(conn, schema, migration, elapsed)
                    .map_err(|e| from_rusqlite("record_migration", e))?;
                Ok(elapsed)
            });

            match outcome {
                Ok(elapsed) => {
                    tracing::debug!(
                        migration_version = %migration.version,
                        execution_time_ms = elapsed,
                        "migration applied"
                    );
                    results.push(MigrationResult {
                        version: migration.version.clone(),
                        success: true,
                        error: None,
                        execution_time_ms: elapsed,
                    });
                }
                Err(cause) => {
                    return Err(migration_error(
                        &migration.version,
                        Direction::Up.op(),
                        cause,
                    ));
                }
            }
        }
        Ok(results)
    }

    /// Revert applied migrations down to `target` (exclusive), or all of them
    pub fn rollback_migrations(
        &self,
        conn: &Connection,
        target: Option<&str>,
    ) -> Result<Vec<MigrationResult>> {
        log_op_start!(
            "rollback_migrations",
            rollback_target = target.unwrap_or(""),
            order = ?self.rollback_order
        );
        let start = Instant::now();

        let results = self.rollback_migrations_impl(conn, target).map_err(|e| {
            log_op_error!(
                "rollback_migrations",
                e,
                duration_ms = start.elapsed().as_millis() as u64
            );
            e
        })?;

        log_op_end!(
            "rollback_migrations",
            duration_ms = start.elapsed().as_millis() as u64,
            reverted = results.len()
        );
        Ok(results)
    }

    fn rollback_migrations_impl(
        &self,
        conn: &Connection,
        target: Option<&str>,
    ) -> Result<Vec<MigrationResult>> {
        let schema = self.initialize_ledger(conn)?;
        let applied: Vec<String> = self
            .applied_migrations(conn, schema)
            .into_iter()
            .map(|a| a.version)
            .collect();

        let plan = match self.rollback_order {
            RollbackOrder::Lexicographic => lexicographic_plan(applied, target),
            RollbackOrder::ReverseDependency => self.dependency_plan(&applied, target)?,
        };

        let mut results = Vec::new();
        for version in plan {
            let Some(migration) = self.get(&version) else {
                tracing::warn!(
                    migration_version = %version,
                    "applied migration is not registered, skipping rollback"
                );
                continue;
            };
            let Some(down) = migration.down.as_ref() else {
                tracing::warn!(
                    migration_version = %version,
                    "migration has no down step, skipping rollback"
                );
                continue;
            };

            let started = Instant::now();
            let outcome = in_savepoint(conn, || {
                down.apply(conn)?;
                ledger::delete(conn, &version).map_err(|e| from_rusqlite("record_rollback", e))?;
                Ok(started.elapsed().as_millis() as i64)
            });

            match outcome {
                Ok(elapsed) => {
                    tracing::debug!(migration_version = %version, "migration reverted");
                    results.push(MigrationResult {
                        version,
                        success: true,
                        error: None,
                        execution_time_ms: elapsed,
                    });
                }
                Err(cause) => return Err(migration_error(&version, Direction::Down.op(), cause)),
            }
        }
        Ok(results)
    }

    fn dependency_plan(&self, applied: &[String], target: Option<&str>) -> Result<Vec<String>> {
        if let Some(target) = target {
            if !applied.iter().any(|v| v == target) {
                return Err(ExError::new(ExErrorKind::InvalidInput)
                    .with_op("rollback_migrations")
                    .with_entity_id(target.to_string())
                    .with_message(format!("Target migration {} is not applied", target)));
            }
        }

        let applied_set: HashSet<&str> = applied.iter().map(String::as_str).collect();
        let ordered = self.sort_by_dependencies()?;

        // Applied but unregistered versions have no known dependents; revert them first
        let mut plan: Vec<String> = applied
            .iter()
            .filter(|v| self.get(v).is_none())
            .rev()
            .cloned()
            .collect();

        for migration in ordered.into_iter().rev() {
            if Some(migration.version.as_str()) == target {
                break;
            }
            if applied_set.contains(migration.version.as_str()) {
                plan.push(migration.version.clone());
            }
        }
        Ok(plan)
    }

    /// Registered, applied and pending migrations
    ///
    /// Does not create the ledger.
    pub fn status(&self, conn: &Connection) -> Result<MigrationStatus> {
        let applied = match ledger::resolve(conn).map_err(|e| from_rusqlite("status", e))? {
            Some(schema) => self.applied_migrations(conn, schema),
            None => Vec::new(),
        };
        let applied_versions: HashSet<&str> = applied.iter().map(|a| a.version.as_str()).collect();
        let pending = self
            .migrations
            .iter()
            .filter(|m| !applied_versions.contains(m.version.as_str()))
            .map(|m| m.version.clone())
            .collect();

        Ok(MigrationStatus {
            registered: self.migrations.iter().map(Migration::info).collect(),
            applied,
            pending,
        })
    }
}

impl Default for MigrationRunner {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn visit<'a>(
    migration: &'a Migration,
    index: &HashMap<&str, &'a Migration>,
    processing: &mut HashSet<&'a str>,
    processed: &mut HashSet<&'a str>,
    ordered: &mut Vec<&'a Migration>,
) -> Result<()> {
    let version = migration.version.as_str();
    if processed.contains(version) {
        return Ok(());
    }
    if processing.contains(version) {
        return Err(ExError::new(ExErrorKind::CycleDetected)
            .with_op("sort_by_dependencies")
            .with_entity_id(version.to_string())
            .with_message(format!(
                "Circular dependency detected at migration {}",
                version
            )));
    }

    processing.insert(version);
    for dep in &migration.dependencies {
        if let Some(&dependency) = index.get(dep.as_str()) {
            visit(dependency, index, processing, processed, ordered)?;
        }
    }
    processing.remove(version);
    processed.insert(version);
    ordered.push(migration);
    Ok(())
}

fn lexicographic_plan(mut applied: Vec<String>, target: Option<&str>) -> Vec<String> {
    applied.sort_unstable_by(|a, b| b.cmp(a));
    match target {
        Some(target) => applied
            .into_iter()
            .take_while(|v| v.as_str() > target)
            .collect(),
        None => applied,
    }
}

/// Run `f` inside a savepoint, rolling back to it on failure
fn in_savepoint<T>(conn: &Connection, f: impl FnOnce() -> Result<T>) -> Result<T> {
    conn.execute_batch(&format!("SAVEPOINT {}", APPLY_SAVEPOINT))
        .map_err(|e| from_rusqlite("savepoint", e))?;

    match f() {
        Ok(value) => {
            conn.execute_batch(&format!("RELEASE SAVEPOINT {}", APPLY_SAVEPOINT))
                .map_err(|e| from_rusqlite("savepoint", e))?;
            Ok(value)
        }
        Err(err) => {
            let undo = format!(
                "ROLLBACK TO SAVEPOINT {sp}; RELEASE SAVEPOINT {sp}",
                sp = APPLY_SAVEPOINT
            );
            if let Err(rollback_err) = conn.execute_batch(&undo) {
                tracing::error!(
                    error = %rollback_err,
                    "failed to roll back migration savepoint"
                );
            }
            Err(err)
        }
    }
}

/// Convenience for tests and callers building ad-hoc migration lists
pub fn sql_migration(version: &str, description: &str, up: &'static str, down: &'static str) -> Migration {
    Migration::new(version, description, MigrationStep::sql(up)).with_down(MigrationStep::sql(down))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |r| r.get::<_, i64>(0),
        )
        .unwrap()
            > 0
    }

    #[test]
    fn test_sort_keeps_registration_order_for_independent_migrations() {
        let runner = MigrationRunner::new(vec![
            sql_migration("001", "a", "SELECT 1", "SELECT 1"),
            sql_migration("002", "b", "SELECT 1", "SELECT 1").depends_on(["001"]),
            sql_migration("003", "c", "SELECT 1", "SELECT 1").depends_on(["001"]),
        ]);

        let order: Vec<_> = runner
            .sort_by_dependencies()
            .unwrap()
            .iter()
            .map(|m| m.version.as_str())
            .collect();
        assert_eq!(order, vec!["001", "002", "003"]);
    }

    #[test]
    fn test_sort_moves_dependency_first() {
        let runner = MigrationRunner::new(vec![
            sql_migration("b", "b", "SELECT 1", "SELECT 1").depends_on(["a"]),
            sql_migration("a", "a", "SELECT 1", "SELECT 1"),
        ]);

        let order: Vec<_> = runner
            .sort_by_dependencies()
            .unwrap()
            .iter()
            .map(|m| m.version.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_cycle_names_migration() {
        let runner = MigrationRunner::new(vec![
            sql_migration("001", "a", "SELECT 1", "SELECT 1").depends_on(["002"]),
            sql_migration("002", "b", "SELECT 1", "SELECT 1").depends_on(["001"]),
        ]);

        let err = runner.sort_by_dependencies().unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::CycleDetected);
        assert_eq!(err.entity_id(), Some("001"));
    }

    #[test]
    fn test_missing_dependency_is_reported() {
        let runner = MigrationRunner::new(vec![
            sql_migration("001", "a", "SELECT 1", "SELECT 1").depends_on(["000"]),
        ]);

        let err = runner.validate_dependencies().unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::MissingDependency);
        assert_eq!(err.entity_id(), Some("001"));
        assert!(err.message().contains("000"));
    }

    #[test]
    fn test_duplicate_version_is_reported() {
        let runner = MigrationRunner::new(vec![
            sql_migration("001", "a", "SELECT 1", "SELECT 1"),
            sql_migration("001", "b", "SELECT 2", "SELECT 2"),
        ]);

        let err = runner.validate_dependencies().unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::DuplicateMigration);
    }

    #[test]
    fn test_checksum_assigned_at_registration() {
        let runner = MigrationRunner::new(vec![sql_migration(
            "001",
            "a",
            "CREATE TABLE a (id INTEGER)",
            "DROP TABLE a",
        )]);
        assert_eq!(runner.migrations()[0].checksum().len(), 64);
    }

    #[test]
    fn test_failed_up_leaves_no_partial_schema() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(vec![sql_migration(
            "001",
            "half",
            "CREATE TABLE half (id INTEGER); INSERT INTO nowhere VALUES (1);",
            "DROP TABLE half",
        )]);

        let err = runner.run_migrations(&conn).unwrap_err();

        assert_eq!(err.kind(), ExErrorKind::MigrationFailed);
        assert_eq!(err.op(), Some("migration_up"));
        assert!(!table_exists(&conn, "half"));
        let schema = runner.initialize_ledger(&conn).unwrap();
        assert!(runner.applied_migrations(&conn, schema).is_empty());
    }

    #[test]
    fn test_lexicographic_plan_stops_at_target() {
        let applied = vec!["001".to_string(), "003".to_string(), "002".to_string()];
        assert_eq!(
            lexicographic_plan(applied.clone(), Some("001")),
            vec!["003".to_string(), "002".to_string()]
        );
        assert_eq!(lexicographic_plan(applied, None).len(), 3);
    }

    #[test]
    fn test_status_does_not_create_ledger() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::with_defaults();

        let status = runner.status(&conn).unwrap();

        assert!(status.applied.is_empty());
        assert_eq!(status.pending.len(), runner.migrations().len());
        assert!(!table_exists(&conn, "migrations"));
    }

    #[test]
    fn test_drift_warn_continues() {
        let conn = Connection::open_in_memory().unwrap();
        let runner = MigrationRunner::new(vec![sql_migration(
            "001",
            "a",
            "CREATE TABLE a (id INTEGER)",
            "DROP TABLE a",
        )]);
        runner.run_migrations(&conn).unwrap();
        conn.execute("UPDATE migrations SET checksum = 'tampered'", [])
            .unwrap();

        let results = runner.run_migrations(&conn).unwrap();
        assert!(results.is_empty());
    }
}

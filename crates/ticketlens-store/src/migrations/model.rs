//! Migration records, results and runner policies

use crate::errors::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use ticketlens_core::errors::{ExError, ExErrorKind};

type ApplyFn = Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// One direction of a schema change
#[derive(Clone)]
pub enum MigrationStep {
    /// A SQL script run with `execute_batch`; the script text is its fingerprint
    Sql(Cow<'static, str>),
    /// A Rust procedure; `fingerprint` identifies its logic for checksumming
    Code { fingerprint: String, apply: ApplyFn },
}

impl MigrationStep {
    pub fn sql(script: impl Into<Cow<'static, str>>) -> Self {
        MigrationStep::Sql(script.into())
    }

    pub fn code<F>(fingerprint: impl Into<String>, apply: F) -> Self
    where
        F: Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    {
        MigrationStep::Code {
            fingerprint: fingerprint.into(),
            apply: Arc::new(apply),
        }
    }

    /// Text that identifies this step's logic
    pub fn fingerprint(&self) -> &str {
        match self {
            MigrationStep::Sql(script) => script.as_ref(),
            MigrationStep::Code { fingerprint, .. } => fingerprint.as_str(),
        }
    }

    /// Run the step against a live connection
    pub fn apply(&self, conn: &Connection) -> Result<()> {
        match self {
            MigrationStep::Sql(script) => conn.execute_batch(script.as_ref()).map_err(|e| {
                ExError::new(ExErrorKind::Statement).with_message(e.to_string())
            }),
            MigrationStep::Code { apply, .. } => apply(conn),
        }
    }
}

impl fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStep::Sql(script) => f.debug_tuple("Sql").field(script).finish(),
            MigrationStep::Code { fingerprint, .. } => f
                .debug_struct("Code")
                .field("fingerprint", fingerprint)
                .finish_non_exhaustive(),
        }
    }
}

/// A versioned schema change
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub up: MigrationStep,
    pub down: Option<MigrationStep>,
    checksum: String,
}

impl Migration {
    pub fn new(version: impl Into<String>, description: impl Into<String>, up: MigrationStep) -> Self {
        Self {
            version: version.into(),
            description: description.into(),
            dependencies: Vec::new(),
            up,
            down: None,
            checksum: String::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, versions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(versions.into_iter().map(Into::into));
        self
    }

    pub fn with_down(mut self, down: MigrationStep) -> Self {
        self.down = Some(down);
        self
    }

    /// Content hash of `up` and `down`, assigned when the migration is registered
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub(crate) fn set_checksum(&mut self, checksum: String) {
        self.checksum = checksum;
    }

    pub fn info(&self) -> MigrationInfo {
        MigrationInfo {
            version: self.version.clone(),
            description: self.description.clone(),
            dependencies: self.dependencies.clone(),
            checksum: self.checksum.clone(),
            reversible: self.down.is_some(),
        }
    }
}

/// Outcome of one attempted `up` or `down`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationResult {
    pub version: String,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: i64,
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppliedMigration {
    pub version: String,
    pub description: String,
    pub applied_at: String,
    pub checksum: Option<String>,
    pub execution_time_ms: i64,
}

/// Registered migration summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationInfo {
    pub version: String,
    pub description: String,
    pub dependencies: Vec<String>,
    pub checksum: String,
    pub reversible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub registered: Vec<MigrationInfo>,
    pub applied: Vec<AppliedMigration>,
    pub pending: Vec<String>,
}

/// What to do when a ledger checksum differs from the registered migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriftPolicy {
    /// Log a warning and keep going
    #[default]
    Warn,
    /// Abort before applying anything
    Fail,
}

impl FromStr for DriftPolicy {
    type Err = ExError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "warn" => Ok(DriftPolicy::Warn),
            "fail" => Ok(DriftPolicy::Fail),
            other => Err(ExError::new(ExErrorKind::InvalidInput)
                .with_op("parse_drift_policy")
                .with_message(format!("unknown drift policy '{}'", other))),
        }
    }
}

/// Order in which applied migrations are reverted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollbackOrder {
    /// Descending version string; stops at the first version `<=` the target
    #[default]
    Lexicographic,
    /// Reverse topological order; stops when the target version is reached
    ReverseDependency,
}

impl FromStr for RollbackOrder {
    type Err = ExError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lexicographic" => Ok(RollbackOrder::Lexicographic),
            "reversedependency" | "reverse-dependency" | "dependency" => {
                Ok(RollbackOrder::ReverseDependency)
            }
            other => Err(ExError::new(ExErrorKind::InvalidInput)
                .with_op("parse_rollback_order")
                .with_message(format!("unknown rollback order '{}'", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_step_fingerprint_is_script() {
        let step = MigrationStep::sql("CREATE TABLE t (id INTEGER)");
        assert_eq!(step.fingerprint(), "CREATE TABLE t (id INTEGER)");
    }

    #[test]
    fn test_code_step_runs_closure() {
        let conn = Connection::open_in_memory().unwrap();
        let step = MigrationStep::code("create_t_v1", |conn: &Connection| {
            conn.execute_batch("CREATE TABLE t (id INTEGER)")
                .map_err(|e| ExError::new(ExErrorKind::Statement).with_message(e.to_string()))
        });

        step.apply(&conn).unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(format!("{:?}", step).contains("create_t_v1"));
    }

    #[test]
    fn test_sql_step_error_is_statement_kind() {
        let conn = Connection::open_in_memory().unwrap();
        let err = MigrationStep::sql("CRATE TABLE oops").apply(&conn).unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::Statement);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!("FAIL".parse::<DriftPolicy>().unwrap(), DriftPolicy::Fail);
        assert_eq!(
            "reverseDependency".parse::<RollbackOrder>().unwrap(),
            RollbackOrder::ReverseDependency
        );
        assert_eq!(
            "dependency".parse::<RollbackOrder>().unwrap(),
            RollbackOrder::ReverseDependency
        );
        assert!("sideways".parse::<RollbackOrder>().is_err());
    }
}

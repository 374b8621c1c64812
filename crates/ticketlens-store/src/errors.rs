//! Error handling for ticketlens-store
//!
//! Low-level SQLite/IO failures surface as `StoreError`; everything crossing
//! the public API is an `ExError` built by the helpers below.

use ticketlens_core::errors::{ExError, ExErrorKind};

/// Result type alias using ExError
pub type Result<T> = std::result::Result<T, ExError>;

/// Errors raised by the connection and file-snapshot helpers
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl StoreError {
    /// Classify and tag with the failing operation
    pub fn into_ex(self, kind: ExErrorKind, op: &str) -> ExError {
        let cause_kind = match &self {
            StoreError::Sqlite(_) => ExErrorKind::Statement,
            StoreError::Io(_) => ExErrorKind::Io,
            StoreError::Join(_) => ExErrorKind::Internal,
        };
        let message = self.to_string();
        ExError::new(kind)
            .with_op(op.to_string())
            .with_message(message.clone())
            .with_source(ExError::new(cause_kind).with_message(message))
    }
}

/// Create a database error from rusqlite::Error
pub fn from_rusqlite(op: &str, err: rusqlite::Error) -> ExError {
    ExError::new(ExErrorKind::Statement)
        .with_op(op.to_string())
        .with_message(err.to_string())
}

/// Create an error for a statement that failed, keeping a short excerpt of the SQL
pub fn statement_error(op: &str, sql: &str, err: rusqlite::Error) -> ExError {
    ExError::new(ExErrorKind::Statement)
        .with_op(op.to_string())
        .with_message(format!("{} (sql: {})", err, sql_excerpt(sql)))
}

/// Create a migration error wrapping the failing step's error
pub fn migration_error(version: &str, op: &str, cause: ExError) -> ExError {
    ExError::new(ExErrorKind::MigrationFailed)
        .with_op(op.to_string())
        .with_entity_id(version.to_string())
        .with_message(format!("Migration {} failed: {}", version, cause.message()))
        .with_source(cause)
}

/// Create a checksum drift error
pub fn checksum_mismatch(version: &str, recorded: &str, current: &str) -> ExError {
    ExError::new(ExErrorKind::MigrationDrift)
        .with_op("validate_integrity")
        .with_entity_id(version.to_string())
        .with_message(format!(
            "Checksum mismatch for migration {}: recorded {}, registered {}",
            version, recorded, current
        ))
}

/// Create the error returned by every data operation outside the Ready state
pub fn not_initialized(op: &str) -> ExError {
    ExError::new(ExErrorKind::NotInitialized)
        .with_op(op.to_string())
        .with_message("Database is not initialized")
}

fn sql_excerpt(sql: &str) -> String {
    const MAX: usize = 120;
    let collapsed = sql.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= MAX {
        collapsed
    } else {
        let cut: String = collapsed.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

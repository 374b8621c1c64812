//! Migration framework
//!
//! Provides:
//! - Migration runner with dependency ordering, checksums and rollback
//! - Schema-tolerant ledger reads
//! - Embedded SQL migrations for the ticket schema

mod checksums;
mod embedded;
pub mod ledger;
mod model;
mod runner;

pub use checksums::migration_checksum;
pub use embedded::default_migrations;
pub use ledger::LedgerSchemaVersion;
pub use model::{
    AppliedMigration, DriftPolicy, Migration, MigrationInfo, MigrationResult, MigrationStatus,
    MigrationStep, RollbackOrder,
};
pub use runner::{sql_migration, MigrationRunner};

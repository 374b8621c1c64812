//! TicketLens Store - embedded SQLite persistence core
//!
//! Provides:
//! - Connection helpers and file snapshots over the SQLite online-backup API
//! - Migration runner with dependency ordering, checksums and rollback
//! - Built-in schema migrations for the ticket reporting tables
//! - Session manager owning the single database handle, with nested
//!   transactions, coalesced saves, auto-save and backups

pub mod db;
pub mod errors;
pub mod migrations;
pub mod persistence;
pub mod session;

// Re-export key types
pub use errors::Result;
pub use migrations::{Migration, MigrationRunner, MigrationStep};
pub use session::{
    DatabaseManager, Params, Record, SessionConfig, SessionOptions, SessionState, TxContext,
};

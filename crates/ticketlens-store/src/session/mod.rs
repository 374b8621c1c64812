//! Session manager
//!
//! `DatabaseManager` is the only owner of the database handle. It opens the
//! database, brings its schema up to date, and serves statements and
//! transactions until it is closed. File-backed sessions are saved back to
//! disk on demand, periodically, and after each committed transaction.

mod config;
mod manager;
mod statement;
mod transaction;

pub use config::{SessionConfig, SessionOptions, Storage};
pub use manager::{DatabaseManager, SessionState};
pub use statement::{Params, Record};
pub use transaction::{TransactionStack, TransactionState, TxContext};

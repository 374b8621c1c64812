//! Nested transactions over a single connection
//!
//! The outermost level issues `BEGIN`/`COMMIT`/`ROLLBACK`; every nested level
//! uses a named savepoint. Savepoint names are `sp_<depth>_<seq>` with `seq`
//! drawn from a process-wide counter, so no two levels ever share a name.

use crate::errors::{from_rusqlite, Result};
use crate::session::statement::{self, Params, Record};
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use ticketlens_core::errors::{ExError, ExErrorKind};

static SAVEPOINT_SEQ: AtomicU64 = AtomicU64::new(1);

/// One open transaction level
#[derive(Debug, Clone)]
pub struct TransactionState {
    pub id: u64,
    pub started_at: Instant,
    /// `None` for the outermost level
    pub savepoint: Option<String>,
}

/// Open transaction levels, innermost last
#[derive(Debug, Default)]
pub struct TransactionStack {
    entries: Mutex<Vec<TransactionState>>,
    next_id: AtomicU64,
}

impl TransactionStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.lock().len()
    }

    pub fn snapshot(&self) -> Vec<TransactionState> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, savepoint: Option<String>) -> StackEntry<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.lock().push(TransactionState {
            id,
            started_at: Instant::now(),
            savepoint,
        });
        StackEntry { stack: self, id }
    }

    fn remove(&self, id: u64) {
        let mut entries = self.lock();
        if let Some(pos) = entries.iter().rposition(|e| e.id == id) {
            entries.remove(pos);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<TransactionState>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pops its level when dropped, on success and failure alike
struct StackEntry<'a> {
    stack: &'a TransactionStack,
    id: u64,
}

impl Drop for StackEntry<'_> {
    fn drop(&mut self) {
        self.stack.remove(self.id);
    }
}

/// Handle passed to transaction callbacks
pub struct TxContext<'a> {
    conn: &'a Connection,
    stack: &'a TransactionStack,
    enabled: bool,
    depth: usize,
    savepoint: Option<String>,
}

impl<'a> TxContext<'a> {
    pub fn execute(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        statement::execute(self.conn, "execute", sql, &params)
    }

    pub fn query(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        statement::execute(self.conn, "query", sql, &params)
    }

    pub fn run(&self, sql: &str) -> Result<()> {
        statement::run(self.conn, sql)
    }

    /// Open a nested level backed by a savepoint
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext<'_>) -> Result<T>,
    {
        run_in_transaction(self.conn, self.stack, self.enabled, f).map(|(value, _)| value)
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    /// 1 for the outermost level; 0 when transactions are disabled
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }
}

/// Run `f` inside a transaction level
///
/// Returns the callback's value and whether this was the outermost level, so
/// the caller knows a commit reached the database.
pub fn run_in_transaction<T, F>(
    conn: &Connection,
    stack: &TransactionStack,
    enabled: bool,
    f: F,
) -> Result<(T, bool)>
where
    F: FnOnce(&TxContext<'_>) -> Result<T>,
{
    if !enabled {
        let ctx = TxContext {
            conn,
            stack,
            enabled,
            depth: 0,
            savepoint: None,
        };
        return f(&ctx).map(|value| (value, true));
    }

    let outer_depth = stack.depth();
    let savepoint = (outer_depth > 0).then(|| {
        format!(
            "sp_{}_{}",
            outer_depth,
            SAVEPOINT_SEQ.fetch_add(1, Ordering::Relaxed)
        )
    });

    let begin = match &savepoint {
        None => "BEGIN".to_string(),
        Some(name) => format!("SAVEPOINT {}", name),
    };
    conn.execute_batch(&begin)
        .map_err(|e| wrap(from_rusqlite("begin", e), savepoint.as_deref()))?;

    let _entry = stack.push(savepoint.clone());
    let mut level = OpenLevel {
        conn,
        savepoint: savepoint.as_deref(),
        done: false,
    };
    tracing::debug!(
        depth = outer_depth + 1,
        savepoint = savepoint.as_deref().unwrap_or(""),
        "transaction level opened"
    );

    let ctx = TxContext {
        conn,
        stack,
        enabled,
        depth: outer_depth + 1,
        savepoint: savepoint.clone(),
    };

    match f(&ctx) {
        Ok(value) => {
            let commit = match &savepoint {
                None => "COMMIT".to_string(),
                Some(name) => format!("RELEASE SAVEPOINT {}", name),
            };
            if let Err(e) = conn.execute_batch(&commit) {
                let err = from_rusqlite("commit", e);
                level.roll_back();
                return Err(wrap(err, savepoint.as_deref()));
            }
            level.done = true;
            Ok((value, savepoint.is_none()))
        }
        Err(err) => {
            level.roll_back();
            Err(wrap(err, savepoint.as_deref()))
        }
    }
}

/// Rolls its level back when dropped unless it was committed or already
/// rolled back; a panicking callback never leaves `BEGIN` open.
struct OpenLevel<'a> {
    conn: &'a Connection,
    savepoint: Option<&'a str>,
    done: bool,
}

impl OpenLevel<'_> {
    fn roll_back(&mut self) {
        self.done = true;
        roll_back(self.conn, self.savepoint);
    }
}

impl Drop for OpenLevel<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(
                savepoint = self.savepoint.unwrap_or(""),
                "transaction level abandoned, rolling back"
            );
            self.roll_back();
        }
    }
}

// A failed rollback is logged; the caller still sees the original error
fn roll_back(conn: &Connection, savepoint: Option<&str>) {
    let sql = match savepoint {
        None => "ROLLBACK".to_string(),
        Some(name) => format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name}"),
    };
    if let Err(e) = conn.execute_batch(&sql) {
        tracing::error!(
            savepoint = savepoint.unwrap_or(""),
            error = %e,
            "transaction rollback failed"
        );
    }
}

fn wrap(cause: ExError, savepoint: Option<&str>) -> ExError {
    let err = ExError::new(ExErrorKind::Transaction)
        .with_op("transaction")
        .with_message(format!("Transaction failed: {}", cause.message()))
        .with_source(cause);
    match savepoint {
        Some(name) => err.with_entity_id(name.to_string()),
        None => err,
    }
}

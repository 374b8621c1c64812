//! Session lifecycle, data access and persistence
//!
//! ## Logging Ownership
//!
//! `initialize`, `save_to_disk`, `create_backup` and `close` own lifecycle
//! logging. Retries, swallowed backup failures and failed auto-save ticks
//! are `tracing::warn!`.

use crate::db;
use crate::errors::{not_initialized, Result, StoreError};
use crate::migrations::{MigrationResult, MigrationRunner, MigrationStatus};
use crate::persistence;
use crate::session::config::{SessionConfig, SessionOptions, Storage};
use crate::session::statement::{self, Params, Record};
use crate::session::transaction::{run_in_transaction, TransactionStack, TxContext};
use futures::future::{BoxFuture, FutureExt, Shared};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use ticketlens_core::errors::{ExError, ExErrorKind};
use ticketlens_core::{log_op_end, log_op_error, log_op_start};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type SharedSave = Shared<BoxFuture<'static, Result<()>>>;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    Closing,
    Closed,
}

struct Inner {
    runner: MigrationRunner,
    conn: Arc<tokio::sync::Mutex<Option<Connection>>>,
    state: Mutex<SessionState>,
    config: Mutex<Option<SessionConfig>>,
    stack: TransactionStack,
    pending_save: Mutex<Option<SharedSave>>,
    autosave: Mutex<Option<JoinHandle<()>>>,
    persist_count: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
    last_migration_results: Mutex<Vec<MigrationResult>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let autosave = self
            .autosave
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = autosave.take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to one database session
///
/// Clones share the same session.
#[derive(Clone)]
pub struct DatabaseManager {
    inner: Arc<Inner>,
}

impl Default for DatabaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseManager {
    /// Session over the built-in ticket schema
    pub fn new() -> Self {
        Self::with_runner(MigrationRunner::with_defaults())
    }

    /// Session that applies `runner`'s migrations on initialize
    pub fn with_runner(runner: MigrationRunner) -> Self {
        Self {
            inner: Arc::new(Inner {
                runner,
                conn: Arc::new(tokio::sync::Mutex::new(None)),
                state: Mutex::new(SessionState::Uninitialized),
                config: Mutex::new(None),
                stack: TransactionStack::new(),
                pending_save: Mutex::new(None),
                autosave: Mutex::new(None),
                persist_count: AtomicU64::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                last_migration_results: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *lock(&self.inner.state)
    }

    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    /// Configuration resolved by the last `initialize`
    pub fn config(&self) -> Option<SessionConfig> {
        lock(&self.inner.config).clone()
    }

    pub fn transaction_depth(&self) -> usize {
        self.inner.stack.depth()
    }

    /// Number of completed writes to the database file
    pub fn persist_count(&self) -> u64 {
        self.inner.persist_count.load(Ordering::SeqCst)
    }

    /// Migrations applied by the last successful `initialize`
    pub fn last_migration_results(&self) -> Vec<MigrationResult> {
        lock(&self.inner.last_migration_results).clone()
    }

    /// Open the database, apply pending migrations and become ready
    ///
    /// With `runMigrations` off the schema is left as found. A no-op when
    /// already ready. Failures are retried with linear backoff
    /// unless they come from a defect in the migration list itself.
    pub async fn initialize(&self, options: SessionOptions) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let config = options.resolve()?;
        log_op_start!(
            "initialize",
            db_path = %config.path().map(|p| p.display().to_string()).unwrap_or_default(),
            in_memory = !config.is_file_backed()
        );
        let start = Instant::now();

        let mut attempt = 0;
        let last_err = loop {
            attempt += 1;
            match self.try_initialize(&config).await {
                Ok(()) => {
                    log_op_end!(
                        "initialize",
                        duration_ms = start.elapsed().as_millis() as u64,
                        attempts = attempt
                    );
                    return Ok(());
                }
                Err(e) => {
                    self.teardown().await;
                    if e.kind().is_structural() || attempt >= config.max_retries {
                        break e;
                    }
                    tracing::warn!(
                        attempt,
                        max_retries = config.max_retries,
                        err.code = e.code(),
                        error = %e,
                        "database initialization attempt failed, retrying"
                    );
                    tokio::time::sleep(config.retry_delay * attempt).await;
                }
            }
        };

        let err = ExError::new(ExErrorKind::Initialization)
            .with_op("initialize")
            .with_message(format!(
                "Database initialization failed after {} attempt(s): {}",
                attempt,
                last_err.message()
            ))
            .with_source(last_err);
        log_op_error!(
            "initialize",
            err,
            duration_ms = start.elapsed().as_millis() as u64
        );
        Err(err)
    }

    async fn try_initialize(&self, config: &SessionConfig) -> Result<()> {
        *lock(&self.inner.config) = Some(config.clone());

        let runner = self
            .inner
            .runner
            .clone()
            .with_drift_policy(config.drift_policy)
            .with_rollback_order(config.rollback_order);
        let open_config = config.clone();
        let (conn, results) =
            tokio::task::spawn_blocking(move || open_and_migrate(&open_config, &runner))
                .await
                .map_err(|e| StoreError::from(e).into_ex(ExErrorKind::Internal, "initialize"))??;

        *self.inner.conn.lock().await = Some(conn);
        *lock(&self.inner.last_migration_results) = results;
        *lock(&self.inner.state) = SessionState::Ready;

        if config.is_file_backed() {
            self.save_to_disk().await?;
            if config.auto_save {
                self.start_auto_save(config);
            }
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.stop_auto_save();
        *self.inner.conn.lock().await = None;
        self.inner.stack.clear();
        *lock(&self.inner.state) = SessionState::Uninitialized;
    }

    /// Lend the raw connection to `f`
    pub async fn with_database<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> T,
    {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "with_database")?;
        Ok(f(conn))
    }

    /// Run `f` in a transaction; nest further levels with [`TxContext::transaction`]
    ///
    /// The connection stays locked until `f` returns, so unrelated callers
    /// are serialized.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext<'_>) -> Result<T>,
    {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "transaction")?;
        let config = self.current_config("transaction")?;

        let (value, outermost) =
            run_in_transaction(conn, &self.inner.stack, config.enable_transactions, f)?;
        drop(guard);

        if outermost && config.auto_save && config.is_file_backed() {
            self.schedule_save();
        }
        Ok(value)
    }

    pub async fn execute(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "execute")?;
        statement::execute(conn, "execute", sql, &params)
    }

    /// Same as [`execute`](Self::execute), for read-oriented call sites
    pub async fn query(&self, sql: &str, params: Params) -> Result<Vec<Record>> {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "query")?;
        statement::execute(conn, "query", sql, &params)
    }

    pub async fn run(&self, sql: &str) -> Result<()> {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "run")?;
        statement::run(conn, sql)
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "migration_status")?;
        self.effective_runner()?.status(conn)
    }

    /// Revert migrations above `target` using the configured rollback order
    pub async fn rollback_migrations(&self, target: Option<&str>) -> Result<Vec<MigrationResult>> {
        let guard = self.inner.conn.lock().await;
        let conn = self.ready_connection(&guard, "rollback_migrations")?;
        let results = self.effective_runner()?.rollback_migrations(conn, target)?;
        drop(guard);

        let config = self.current_config("rollback_migrations")?;
        if config.auto_save && config.is_file_backed() {
            self.schedule_save();
        }
        Ok(results)
    }

    /// Write the working copy to the database file
    ///
    /// A no-op for in-memory sessions. Concurrent callers share one write.
    pub async fn save_to_disk(&self) -> Result<()> {
        if !matches!(self.state(), SessionState::Ready | SessionState::Closing) {
            return Err(not_initialized("save_to_disk"));
        }
        let config = self.current_config("save_to_disk")?;
        let Storage::File(path) = config.storage else {
            return Ok(());
        };

        let save = {
            let mut slot = lock(&self.inner.pending_save);
            match slot.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let save = self.spawn_save(path);
                    *slot = Some(save.clone());
                    save
                }
            }
        };
        save.await
    }

    // Called with the pending-save slot locked
    fn spawn_save(&self, path: PathBuf) -> SharedSave {
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let result = write_file(&inner, path).await;
            *lock(&inner.pending_save) = None;
            result
        });
        async move {
            task.await
                .map_err(|e| StoreError::from(e).into_ex(ExErrorKind::Persistence, "save_to_disk"))?
        }
        .boxed()
        .shared()
    }

    /// Save unless a save is already in flight; failures are logged
    pub async fn debounced_save(&self) {
        if lock(&self.inner.pending_save).is_some() {
            return;
        }
        if let Err(e) = self.save_to_disk().await {
            tracing::warn!(err.code = e.code(), error = %e, "background save failed");
        }
    }

    fn schedule_save(&self) {
        let manager = self.clone();
        tokio::spawn(async move { manager.debounced_save().await });
    }

    fn start_auto_save(&self, config: &SessionConfig) {
        let weak = Arc::downgrade(&self.inner);
        let period = config.auto_save_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                DatabaseManager { inner }.debounced_save().await;
            }
        });
        if let Some(previous) = lock(&self.inner.autosave).replace(handle) {
            previous.abort();
        }
    }

    fn stop_auto_save(&self) {
        if let Some(handle) = lock(&self.inner.autosave).take() {
            handle.abort();
        }
    }

    /// Snapshot the working copy to `path`, or next to the database file
    pub async fn create_backup(&self, path: Option<&Path>) -> Result<PathBuf> {
        log_op_start!("create_backup");
        let start = Instant::now();

        let result = self.create_backup_impl(path).await;
        match &result {
            Ok(target) => {
                log_op_end!(
                    "create_backup",
                    duration_ms = start.elapsed().as_millis() as u64,
                    backup_path = %target.display()
                );
            }
            Err(e) => {
                log_op_error!(
                    "create_backup",
                    *e,
                    duration_ms = start.elapsed().as_millis() as u64
                );
            }
        }
        result
    }

    async fn create_backup_impl(&self, path: Option<&Path>) -> Result<PathBuf> {
        if !self.is_ready() {
            return Err(not_initialized("create_backup"));
        }
        let config = self.current_config("create_backup")?;
        let target = match (path, config.path()) {
            (Some(explicit), _) => explicit.to_path_buf(),
            (None, Some(db_path)) => persistence::default_backup_path(db_path),
            (None, None) => {
                return Err(ExError::new(ExErrorKind::InvalidInput)
                    .with_op("create_backup")
                    .with_message("No backup path given and the session has no database file"))
            }
        };

        let guard = Arc::clone(&self.inner.conn).lock_owned().await;
        let written = target.clone();
        tokio::task::spawn_blocking(move || {
            let conn = (*guard).as_ref().ok_or_else(|| not_initialized("create_backup"))?;
            persistence::write_snapshot(conn, &written).map_err(|e| {
                e.into_ex(ExErrorKind::Persistence, "create_backup")
                    .with_entity_id(written.display().to_string())
            })
        })
        .await
        .map_err(|e| StoreError::from(e).into_ex(ExErrorKind::Persistence, "create_backup"))??;

        Ok(target)
    }

    /// Stop auto-save, flush to disk and release the handle
    ///
    /// Closing a session that is not ready does nothing.
    pub async fn close(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.is_ready() {
            return Ok(());
        }
        log_op_start!("close");
        let start = Instant::now();

        *lock(&self.inner.state) = SessionState::Closing;
        self.stop_auto_save();

        let in_flight = lock(&self.inner.pending_save).clone();
        if let Some(save) = in_flight {
            if let Err(e) = save.await {
                tracing::debug!(error = %e, "in-flight save failed before close");
            }
        }

        let mut outcome = self.save_to_disk().await;

        if let Some(conn) = self.inner.conn.lock().await.take() {
            if let Err((_, e)) = conn.close() {
                let err = StoreError::from(e).into_ex(ExErrorKind::Persistence, "close");
                outcome = outcome.and(Err(err));
            }
        }
        self.inner.stack.clear();
        *lock(&self.inner.state) = SessionState::Closed;

        match outcome {
            Ok(()) => {
                log_op_end!("close", duration_ms = start.elapsed().as_millis() as u64);
                Ok(())
            }
            Err(cause) => {
                let err = ExError::new(ExErrorKind::Persistence)
                    .with_op("close")
                    .with_message(format!("Failed to close database: {}", cause.message()))
                    .with_source(cause);
                log_op_error!(
                    "close",
                    err,
                    duration_ms = start.elapsed().as_millis() as u64
                );
                Err(err)
            }
        }
    }

    fn ready_connection<'g>(
        &self,
        guard: &'g Option<Connection>,
        op: &str,
    ) -> Result<&'g Connection> {
        if !self.is_ready() {
            return Err(not_initialized(op));
        }
        guard.as_ref().ok_or_else(|| not_initialized(op))
    }

    fn current_config(&self, op: &str) -> Result<SessionConfig> {
        self.config().ok_or_else(|| not_initialized(op))
    }

    fn effective_runner(&self) -> Result<MigrationRunner> {
        let config = self.current_config("migrations")?;
        Ok(self
            .inner
            .runner
            .clone()
            .with_drift_policy(config.drift_policy)
            .with_rollback_order(config.rollback_order))
    }
}

fn open_and_migrate(
    config: &SessionConfig,
    runner: &MigrationRunner,
) -> Result<(Connection, Vec<MigrationResult>)> {
    let (conn, existed) = match &config.storage {
        Storage::File(path) => db::open_working_copy(path)?,
        Storage::InMemory => (db::open_in_memory()?, false),
    };
    db::configure(&conn, &config.journal_mode, &config.synchronous)?;

    if !config.run_migrations {
        tracing::debug!("migrations disabled for this session");
        return Ok((conn, Vec::new()));
    }

    if config.backup_on_migration && existed && has_pending(runner, &conn) {
        if let Some(path) = config.path() {
            backup_before_migration(path);
        }
    }

    let results = runner.run_migrations(&conn)?;
    Ok((conn, results))
}

// An unreadable ledger counts as pending so the backup is still taken
fn has_pending(runner: &MigrationRunner, conn: &Connection) -> bool {
    runner
        .status(conn)
        .map(|status| !status.pending.is_empty())
        .unwrap_or(true)
}

// Never blocks startup
fn backup_before_migration(path: &Path) {
    let target = persistence::default_backup_path(path);
    match persistence::copy_file(path, &target) {
        Ok(()) => tracing::debug!(backup_path = %target.display(), "pre-migration backup written"),
        Err(e) => tracing::warn!(
            db_path = %path.display(),
            backup_path = %target.display(),
            error = %e,
            "pre-migration backup failed, continuing"
        ),
    }
}

async fn write_file(inner: &Inner, path: PathBuf) -> Result<()> {
    log_op_start!("save_to_disk", db_path = %path.display());
    let start = Instant::now();

    let guard = Arc::clone(&inner.conn).lock_owned().await;
    let result = tokio::task::spawn_blocking(move || {
        let conn = (*guard).as_ref().ok_or_else(|| not_initialized("save_to_disk"))?;
        persistence::write_snapshot(conn, &path).map_err(|e| {
            e.into_ex(ExErrorKind::Persistence, "save_to_disk")
                .with_entity_id(path.display().to_string())
        })
    })
    .await
    .map_err(|e| StoreError::from(e).into_ex(ExErrorKind::Persistence, "save_to_disk"))
    .and_then(|r| r);

    match &result {
        Ok(()) => {
            inner.persist_count.fetch_add(1, Ordering::SeqCst);
            log_op_end!(
                "save_to_disk",
                duration_ms = start.elapsed().as_millis() as u64
            );
        }
        Err(e) => {
            log_op_error!(
                "save_to_disk",
                *e,
                duration_ms = start.elapsed().as_millis() as u64
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_memory() -> SessionOptions {
        SessionOptions::default().in_memory()
    }

    #[tokio::test]
    async fn test_operations_before_initialize_fail() {
        let manager = DatabaseManager::new();

        let err = manager.run("SELECT 1").await.unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::NotInitialized);
        assert_eq!(err.op(), Some("run"));

        let err = manager.save_to_disk().await.unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::NotInitialized);

        let err = manager.transaction(|_| Ok(())).await.unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let manager = DatabaseManager::new();
        manager.initialize(in_memory()).await.unwrap();
        assert_eq!(manager.last_migration_results().len(), 6);

        manager
            .run("INSERT INTO settings (key, value) VALUES ('theme', 'dark')")
            .await
            .unwrap();
        manager.initialize(in_memory()).await.unwrap();

        // Same handle: the row is still there
        let rows = manager
            .query("SELECT value FROM settings", Params::None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_save_is_noop() {
        let manager = DatabaseManager::new();
        manager.initialize(in_memory()).await.unwrap();

        manager.save_to_disk().await.unwrap();
        assert_eq!(manager.persist_count(), 0);
    }

    #[tokio::test]
    async fn test_backup_without_any_path_fails() {
        let manager = DatabaseManager::new();
        manager.initialize(in_memory()).await.unwrap();

        let err = manager.create_backup(None).await.unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_operations() {
        let manager = DatabaseManager::new();
        manager.initialize(in_memory()).await.unwrap();

        manager.close().await.unwrap();
        manager.close().await.unwrap();

        assert_eq!(manager.state(), SessionState::Closed);
        let err = manager.query("SELECT 1", Params::None).await.unwrap_err();
        assert_eq!(err.kind(), ExErrorKind::NotInitialized);
    }

    #[tokio::test]
    async fn test_reinitialize_after_close() {
        let manager = DatabaseManager::new();
        manager.initialize(in_memory()).await.unwrap();
        manager.close().await.unwrap();

        manager.initialize(in_memory()).await.unwrap();
        assert!(manager.is_ready());
        assert_eq!(manager.last_migration_results().len(), 6);
    }
}

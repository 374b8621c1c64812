//! Session options and the resolved configuration

use crate::errors::Result;
use crate::migrations::{DriftPolicy, RollbackOrder};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ticketlens_core::errors::{ExError, ExErrorKind};

const JOURNAL_MODES: &[&str] = &["DELETE", "TRUNCATE", "PERSIST", "MEMORY", "WAL", "OFF"];
const SYNCHRONOUS_MODES: &[&str] = &["OFF", "NORMAL", "FULL", "EXTRA"];

/// Caller-supplied options; anything left unset takes its default
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SessionOptions {
    pub auto_save: Option<bool>,
    /// Milliseconds
    pub auto_save_interval: Option<u64>,
    pub max_retries: Option<u32>,
    /// Milliseconds; attempt `n` waits `retry_delay * n` before retrying
    pub retry_delay: Option<u64>,
    pub backup_on_migration: Option<bool>,
    /// Apply pending migrations on initialize; off for tools that inspect
    /// or revert the schema
    pub run_migrations: Option<bool>,
    pub enable_transactions: Option<bool>,
    pub path: Option<PathBuf>,
    pub in_memory: Option<bool>,
    pub journal_mode: Option<String>,
    pub synchronous: Option<String>,
    pub drift_policy: Option<DriftPolicy>,
    pub rollback_order: Option<RollbackOrder>,
}

impl SessionOptions {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| {
            ExError::new(ExErrorKind::Serialization)
                .with_op("load_config")
                .with_message(e.to_string())
        })
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ExError::from(e)
                .with_op("load_config")
                .with_entity_id(path.display().to_string())
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.in_memory = Some(true);
        self
    }

    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn merge(self, other: SessionOptions) -> Self {
        Self {
            auto_save: other.auto_save.or(self.auto_save),
            auto_save_interval: other.auto_save_interval.or(self.auto_save_interval),
            max_retries: other.max_retries.or(self.max_retries),
            retry_delay: other.retry_delay.or(self.retry_delay),
            backup_on_migration: other.backup_on_migration.or(self.backup_on_migration),
            run_migrations: other.run_migrations.or(self.run_migrations),
            enable_transactions: other.enable_transactions.or(self.enable_transactions),
            path: other.path.or(self.path),
            in_memory: other.in_memory.or(self.in_memory),
            journal_mode: other.journal_mode.or(self.journal_mode),
            synchronous: other.synchronous.or(self.synchronous),
            drift_policy: other.drift_policy.or(self.drift_policy),
            rollback_order: other.rollback_order.or(self.rollback_order),
        }
    }

    /// Merge over the defaults and validate
    pub fn resolve(&self) -> Result<SessionConfig> {
        let defaults = SessionConfig::default();

        let journal_mode = normalize(
            self.journal_mode.as_deref(),
            &defaults.journal_mode,
            JOURNAL_MODES,
            "journalMode",
        )?;
        let synchronous = normalize(
            self.synchronous.as_deref(),
            &defaults.synchronous,
            SYNCHRONOUS_MODES,
            "synchronous",
        )?;

        let storage = match (&self.path, self.in_memory.unwrap_or(false)) {
            (Some(path), false) => Storage::File(path.clone()),
            _ => Storage::InMemory,
        };

        let auto_save_interval = self
            .auto_save_interval
            .map(Duration::from_millis)
            .unwrap_or(defaults.auto_save_interval);
        if auto_save_interval.is_zero() {
            return Err(invalid("autoSaveInterval must be greater than zero"));
        }

        Ok(SessionConfig {
            auto_save: self.auto_save.unwrap_or(defaults.auto_save),
            auto_save_interval,
            max_retries: self.max_retries.unwrap_or(defaults.max_retries).max(1),
            retry_delay: self
                .retry_delay
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            backup_on_migration: self
                .backup_on_migration
                .unwrap_or(defaults.backup_on_migration),
            run_migrations: self.run_migrations.unwrap_or(defaults.run_migrations),
            enable_transactions: self
                .enable_transactions
                .unwrap_or(defaults.enable_transactions),
            storage,
            journal_mode,
            synchronous,
            drift_policy: self.drift_policy.unwrap_or(defaults.drift_policy),
            rollback_order: self.rollback_order.unwrap_or(defaults.rollback_order),
        })
    }
}

fn normalize(value: Option<&str>, default: &str, allowed: &[&str], key: &str) -> Result<String> {
    let Some(value) = value else {
        return Ok(default.to_string());
    };
    let upper = value.trim().to_ascii_uppercase();
    if allowed.contains(&upper.as_str()) {
        Ok(upper)
    } else {
        Err(invalid(&format!(
            "{} must be one of {}, got '{}'",
            key,
            allowed.join(", "),
            value
        )))
    }
}

fn invalid(message: &str) -> ExError {
    ExError::new(ExErrorKind::InvalidInput)
        .with_op("resolve_config")
        .with_message(message.to_string())
}

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Storage {
    InMemory,
    File(PathBuf),
}

/// Resolved session configuration, fixed for the life of one `initialize`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub auto_save: bool,
    pub auto_save_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backup_on_migration: bool,
    pub run_migrations: bool,
    pub enable_transactions: bool,
    pub storage: Storage,
    pub journal_mode: String,
    pub synchronous: String,
    pub drift_policy: DriftPolicy,
    pub rollback_order: RollbackOrder,
}

impl SessionConfig {
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::File(path) => Some(path),
            Storage::InMemory => None,
        }
    }

    pub fn is_file_backed(&self) -> bool {
        matches!(self.storage, Storage::File(_))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_save: true,
            auto_save_interval: Duration::from_millis(30_000),
            max_retries: 3,
            retry_delay: Duration::from_millis(1_000),
            backup_on_migration: true,
            run_migrations: true,
            enable_transactions: true,
            storage: Storage::InMemory,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            drift_policy: DriftPolicy::Warn,
            rollback_order: RollbackOrder::Lexicographic,
        }
    }
}

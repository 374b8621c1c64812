//! Subcommands
//!
//! Every command opens one session, does its work and closes the session,
//! which writes a file-backed database back to disk.

pub mod backup;
pub mod migrate;
pub mod query;
pub mod rollback;
pub mod status;

use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use ticketlens_store::{DatabaseManager, SessionOptions};

pub type CommandResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Database file; overrides `path` from the config file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// TOML file with session options (camelCase keys)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output: development, production or test
    #[arg(long, global = true, default_value = "development")]
    pub log_format: String,
}

impl GlobalArgs {
    /// Options from `--config`, with command-line flags layered on top
    pub fn session_options(&self) -> Result<SessionOptions, Box<dyn std::error::Error>> {
        let base = match &self.config {
            Some(path) => SessionOptions::from_toml_file(path)?,
            None => SessionOptions::default(),
        };
        let mut flags = SessionOptions {
            // One-shot commands save on close
            auto_save: Some(false),
            ..Default::default()
        };
        if let Some(db) = &self.db {
            flags = flags.with_path(db);
        }
        Ok(base.merge(flags))
    }

    /// Options for commands that read or revert the schema as found on disk
    pub fn schema_as_found(&self) -> Result<SessionOptions, Box<dyn std::error::Error>> {
        Ok(self.session_options()?.merge(SessionOptions {
            run_migrations: Some(false),
            ..Default::default()
        }))
    }
}

pub async fn open_session(options: SessionOptions) -> Result<DatabaseManager, Box<dyn std::error::Error>> {
    let manager = DatabaseManager::new();
    manager.initialize(options).await?;
    Ok(manager)
}

pub fn print_json<T: Serialize>(value: &T) -> CommandResult {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

//! TicketLens CLI
//!
//! Command-line interface for the TicketLens database

use clap::{Parser, Subcommand};
use ticketlens_core::logging_facility::{self, Profile};

mod commands;

#[derive(Debug, Parser)]
#[command(name = "ticketlens")]
#[command(about = "TicketLens - ticket database maintenance", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: commands::GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply pending migrations
    Migrate,
    /// Show registered, applied and pending migrations
    Status,
    /// Revert applied migrations
    Rollback(commands::rollback::RollbackArgs),
    /// Snapshot the database to a backup file
    Backup(commands::backup::BackupArgs),
    /// Run a SQL statement and print each row as JSON
    Query(commands::query::QueryArgs),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.global.log_format.parse::<Profile>() {
        Ok(profile) => {
            logging_facility::init(profile);
            match cli.command {
                Commands::Migrate => commands::migrate::execute(&cli.global).await,
                Commands::Status => commands::status::execute(&cli.global).await,
                Commands::Rollback(args) => commands::rollback::execute(&cli.global, args).await,
                Commands::Backup(args) => commands::backup::execute(&cli.global, args).await,
                Commands::Query(args) => commands::query::execute(&cli.global, args).await,
            }
        }
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

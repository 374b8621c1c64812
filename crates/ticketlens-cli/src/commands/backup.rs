//! Backup command
//!
//! Usage: ticketlens backup --db <PATH> [--out <PATH>]

use super::{open_session, CommandResult, GlobalArgs};
use clap::Args;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct BackupArgs {
    /// Backup file; defaults to `<db>.<timestamp>.bak`
    #[arg(long)]
    pub out: Option<PathBuf>,
}

pub async fn execute(global: &GlobalArgs, args: BackupArgs) -> CommandResult {
    let session = open_session(global.session_options()?).await?;
    let written = session.create_backup(args.out.as_deref()).await;
    session.close().await?;

    println!("✓ Backup written to {}", written?.display());
    Ok(())
}

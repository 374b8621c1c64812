//! Rollback command
//!
//! Usage: ticketlens rollback [--to <VERSION>] [--order lexicographic|dependency]

use super::{open_session, print_json, CommandResult, GlobalArgs};
use clap::Args;
use ticketlens_store::migrations::RollbackOrder;
use ticketlens_store::SessionOptions;

#[derive(Debug, Args)]
pub struct RollbackArgs {
    /// Keep this version and everything below it; omit to revert all
    #[arg(long)]
    pub to: Option<String>,

    /// Overrides `rollbackOrder` from the config file
    #[arg(long)]
    pub order: Option<String>,
}

pub async fn execute(global: &GlobalArgs, args: RollbackArgs) -> CommandResult {
    let mut options = global.schema_as_found()?;
    if let Some(order) = &args.order {
        options = options.merge(SessionOptions {
            rollback_order: Some(order.parse::<RollbackOrder>()?),
            ..Default::default()
        });
    }

    let session = open_session(options).await?;
    let results = session.rollback_migrations(args.to.as_deref()).await?;
    for result in &results {
        print_json(result)?;
    }
    session.close().await?;
    Ok(())
}

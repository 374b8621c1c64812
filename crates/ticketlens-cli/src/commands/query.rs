//! Query command
//!
//! Usage: ticketlens query <SQL> [--param <VALUE>]...

use super::{open_session, print_json, CommandResult, GlobalArgs};
use clap::Args;
use ticketlens_store::Params;

#[derive(Debug, Args)]
pub struct QueryArgs {
    /// Statement to run
    pub sql: String,

    /// Positional parameter, bound as text; repeat for each `?`
    #[arg(long = "param")]
    pub params: Vec<String>,
}

pub async fn execute(global: &GlobalArgs, args: QueryArgs) -> CommandResult {
    let session = open_session(global.session_options()?).await?;

    let params = if args.params.is_empty() {
        Params::None
    } else {
        Params::positional(args.params)
    };
    let rows = session.execute(&args.sql, params).await;
    session.close().await?;

    for row in rows? {
        print_json(&row)?;
    }
    Ok(())
}

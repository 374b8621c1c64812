//! Migrate command
//!
//! Usage: ticketlens migrate [--db <PATH>]

use super::{open_session, print_json, CommandResult, GlobalArgs};

/// Initialize a session, which applies pending migrations, then print one
/// JSON line per migration applied
pub async fn execute(global: &GlobalArgs) -> CommandResult {
    let session = open_session(global.session_options()?).await?;

    let results = session.last_migration_results();
    for result in &results {
        print_json(result)?;
    }
    if results.is_empty() {
        eprintln!("Database schema is up to date");
    }

    session.close().await?;
    Ok(())
}

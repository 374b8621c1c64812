//! Status command

use super::{open_session, print_json, CommandResult, GlobalArgs};

pub async fn execute(global: &GlobalArgs) -> CommandResult {
    let session = open_session(global.schema_as_found()?).await?;
    let status = session.migration_status().await?;
    print_json(&status)?;
    session.close().await?;
    Ok(())
}

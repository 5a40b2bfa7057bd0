//! `imgpipe migrate` command implementation

use colored::Colorize;

use super::connect;
use crate::error::Result;

pub async fn run(database_url: Option<&str>) -> Result<()> {
    let store = connect(database_url).await?;
    store.migrate().await?;
    println!("{}", "Migrations applied.".green());
    Ok(())
}

//! `imgpipe dataset` command implementation

use colored::Colorize;
use imgpipe_server::manifest::ManifestStore;

use super::connect;
use crate::error::Result;
use crate::output::{print_json, table, timestamp};

/// Get-or-create a dataset by name
pub async fn register(database_url: Option<&str>, name: &str, json: bool) -> Result<()> {
    let store = connect(database_url).await?;
    let dataset = store.register_dataset(name).await?;

    if json {
        return print_json(&dataset);
    }
    println!("{} {}", "Dataset:".cyan().bold(), dataset.name.green());
    println!("  ID:      {}", dataset.id);
    println!("  Created: {}", timestamp(&dataset.created_at));
    Ok(())
}

pub async fn list(database_url: Option<&str>, json: bool) -> Result<()> {
    let store = connect(database_url).await?;
    let datasets = store.list_datasets().await?;

    if json {
        return print_json(&datasets);
    }
    if datasets.is_empty() {
        println!("No datasets registered.");
        println!("Run 'imgpipe dataset register <name>' to create one.");
        return Ok(());
    }

    let mut t = table(["Name", "ID", "Created"]);
    for dataset in &datasets {
        t.add_row(vec![
            dataset.name.clone(),
            dataset.id.to_string(),
            timestamp(&dataset.created_at),
        ]);
    }
    println!("{t}");
    Ok(())
}

//! `imgpipe dead` and `imgpipe revive` command implementations

use colored::Colorize;
use imgpipe_common::types::StageRecord;
use imgpipe_server::manifest::ManifestStore;

use super::{connect, find_dataset};
use crate::error::Result;
use crate::output::{optional, print_json, table, timestamp, truncate};

/// List dead records
pub async fn list(
    database_url: Option<&str>,
    dataset: &str,
    stage: Option<i32>,
    json: bool,
) -> Result<()> {
    let store = connect(database_url).await?;
    let dataset = find_dataset(&store, dataset).await?;
    let records = store.list_dead(dataset.id, stage).await?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("{}", "No dead keys.".green());
        return Ok(());
    }

    println!("{}", render_dead(&records));
    println!(
        "Revive a key with 'imgpipe revive --dataset {} --stage <n> --key <key>'",
        dataset.name
    );
    Ok(())
}

/// Dead -> Pending
pub async fn revive(
    database_url: Option<&str>,
    dataset: &str,
    stage: i32,
    key: &str,
    json: bool,
) -> Result<()> {
    let store = connect(database_url).await?;
    let dataset = find_dataset(&store, dataset).await?;
    let record = store.revive(dataset.id, stage, key).await?;

    if json {
        return print_json(&record);
    }
    println!(
        "{} {} (stage {}) is {} again",
        "Revived:".cyan().bold(),
        record.object_key.green(),
        record.stage,
        record.state
    );
    Ok(())
}

fn render_dead(records: &[StageRecord]) -> String {
    let mut t = table(["Stage", "Key", "Attempts", "Last error", "Updated"]);
    for r in records {
        t.add_row(vec![
            r.stage.to_string(),
            r.object_key.clone(),
            r.attempt_count.to_string(),
            optional(r.last_error.as_deref().map(|e| truncate(e, 60))),
            timestamp(&r.updated_at),
        ]);
    }
    t.to_string()
}

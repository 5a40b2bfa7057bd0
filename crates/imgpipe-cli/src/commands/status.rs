//! `imgpipe status` command implementation
//!
//! Shows how many keys sit in each state, per stage.

use colored::Colorize;
use imgpipe_common::types::{RecordState, StageSummary};
use imgpipe_server::manifest::ManifestStore;
use serde::Serialize;

use super::{connect, find_dataset};
use crate::error::{CliError, Result};
use crate::output::{print_json, table};

/// augment, normalize, train, infer
pub const DEFAULT_STAGE_COUNT: i32 = 4;

#[derive(Debug, Serialize)]
struct StageStatus {
    stage: i32,
    #[serde(flatten)]
    summary: StageSummary,
    total: u64,
}

/// Stages to report: one, or `1..=stages`
fn stage_range(stage: Option<i32>, stages: i32) -> Result<Vec<i32>> {
    match stage {
        Some(s) if s < 1 => Err(CliError::InvalidArgument(format!(
            "stage numbers start at 1, got {s}"
        ))),
        Some(s) => Ok(vec![s]),
        None if stages < 1 => Err(CliError::InvalidArgument(format!(
            "--stages must be at least 1, got {stages}"
        ))),
        None => Ok((1..=stages).collect()),
    }
}

pub async fn run(
    database_url: Option<&str>,
    dataset: &str,
    stage: Option<i32>,
    stages: i32,
    json: bool,
) -> Result<()> {
    let stages = stage_range(stage, stages)?;
    let store = connect(database_url).await?;
    let dataset = find_dataset(&store, dataset).await?;

    let mut rows = Vec::with_capacity(stages.len());
    for stage in stages {
        let summary = store.stage_summary(dataset.id, stage).await?;
        rows.push(StageStatus {
            stage,
            total: summary.total(),
            summary,
        });
    }

    if json {
        return print_json(&rows);
    }

    println!("{} {}", "Dataset:".cyan().bold(), dataset.name.green());
    let mut header = vec!["Stage".to_string()];
    header.extend(RecordState::ALL.iter().map(|s| s.as_str().to_string()));
    header.push("total".to_string());

    let mut t = table(header);
    for row in &rows {
        let mut cells = vec![row.stage.to_string()];
        cells.extend(
            RecordState::ALL
                .iter()
                .map(|s| row.summary.get(*s).to_string()),
        );
        cells.push(row.total.to_string());
        t.add_row(cells);
    }
    println!("{t}");

    let dead: u64 = rows.iter().map(|r| r.summary.dead).sum();
    if dead > 0 {
        println!(
            "{}",
            format!("{dead} dead key(s); review with 'imgpipe dead --dataset {}'", dataset.name)
                .yellow()
        );
    }
    Ok(())
}

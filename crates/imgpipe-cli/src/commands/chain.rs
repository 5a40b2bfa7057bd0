//! `imgpipe chain` command implementation
//!
//! Shows published manifests for a dataset, or one key's lineage across
//! stages.

use colored::Colorize;
use imgpipe_common::types::Manifest;
use imgpipe_server::manifest::ManifestStore;

use super::{connect, find_dataset};
use crate::error::Result;
use crate::output::{optional, print_json, table, timestamp, truncate};

pub async fn run(
    database_url: Option<&str>,
    dataset: &str,
    key: Option<&str>,
    entries: bool,
    json: bool,
) -> Result<()> {
    let store = connect(database_url).await?;
    let dataset = find_dataset(&store, dataset).await?;

    let manifests = match key {
        Some(key) => store.get_key_lineage(dataset.id, key).await?,
        None => store.get_manifest_chain(dataset.id).await?,
    };

    if json {
        return print_json(&manifests);
    }
    if manifests.is_empty() {
        println!("No manifests published yet.");
        return Ok(());
    }

    println!("{}", render_manifests(&manifests));
    if entries {
        for manifest in &manifests {
            println!(
                "{} stage {} / {}",
                "Entries:".cyan().bold(),
                manifest.stage,
                manifest.source_key.green()
            );
            println!("{}", render_entries(manifest));
        }
    }
    Ok(())
}

fn render_manifests(manifests: &[Manifest]) -> String {
    let mut t = table(["Stage", "Key", "Entries", "Outputs", "Hash", "Published"]);
    for m in manifests {
        t.add_row(vec![
            m.stage.to_string(),
            m.source_key.clone(),
            m.entries.len().to_string(),
            m.output_uris().len().to_string(),
            truncate(&m.content_hash, 13),
            timestamp(&m.published_at),
        ]);
    }
    t.to_string()
}

fn render_entries(manifest: &Manifest) -> String {
    let mut t = table(["Source", "Outputs", "Variant", "Size", "Format"]);
    for e in &manifest.entries {
        let size = match (e.width, e.height) {
            (Some(w), Some(h)) => format!("{w}x{h}"),
            _ => "-".to_string(),
        };
        t.add_row(vec![
            e.source_uri.clone(),
            e.output_uris.join("\n"),
            optional(e.variant_name.as_deref()),
            size,
            optional(e.annotation_format.as_deref()),
        ]);
    }
    t.to_string()
}

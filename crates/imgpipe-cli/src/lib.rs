//! imgpipe CLI Library
//!
//! Operator command-line interface for the imgpipe manifest store.
//!
//! # Overview
//!
//! - **Schema**: apply migrations (`imgpipe migrate`)
//! - **Datasets**: register and list datasets (`imgpipe dataset`)
//! - **Progress**: per-stage record counts (`imgpipe status`)
//! - **Lineage**: manifests per stage or per key (`imgpipe chain`)
//! - **Dead letters**: review and revive parked keys (`imgpipe dead`,
//!   `imgpipe revive`)

pub mod commands;
pub mod error;
pub mod output;

// Re-export commonly used types
pub use error::{CliError, Result};

use clap::{Parser, Subcommand};

/// imgpipe - image pipeline manifest and lineage tool
#[derive(Parser, Debug)]
#[command(name = "imgpipe")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Manifest database URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    pub database_url: Option<String>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply database migrations
    Migrate,

    /// Manage datasets
    Dataset {
        #[command(subcommand)]
        command: DatasetCommand,
    },

    /// Show record counts per stage
    Status {
        /// Dataset name
        #[arg(short, long)]
        dataset: String,

        /// Only this stage (defaults to every stage up to --stages)
        #[arg(short, long)]
        stage: Option<i32>,

        /// Number of pipeline stages to report
        #[arg(long, default_value_t = commands::status::DEFAULT_STAGE_COUNT)]
        stages: i32,
    },

    /// Show published manifests
    Chain {
        /// Dataset name
        #[arg(short, long)]
        dataset: String,

        /// Only the lineage of this key
        #[arg(short, long)]
        key: Option<String>,

        /// List every manifest entry
        #[arg(long)]
        entries: bool,
    },

    /// List keys parked after exhausting their retries
    Dead {
        /// Dataset name
        #[arg(short, long)]
        dataset: String,

        /// Only this stage
        #[arg(short, long)]
        stage: Option<i32>,
    },

    /// Return a dead key to pending with a fresh attempt budget
    Revive {
        /// Dataset name
        #[arg(short, long)]
        dataset: String,

        /// Stage number
        #[arg(short, long)]
        stage: i32,

        /// Object key
        #[arg(short, long)]
        key: String,
    },
}

/// Dataset subcommands
#[derive(Subcommand, Debug)]
pub enum DatasetCommand {
    /// Register a dataset (no-op if it exists)
    Register {
        /// Dataset name
        name: String,
    },

    /// List datasets
    List,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_revive() {
        let cli = Cli::try_parse_from([
            "imgpipe", "revive", "--dataset", "drone", "--stage", "2", "--key", "a.jpg", "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Revive {
                dataset,
                stage,
                key,
            } => {
                assert_eq!(dataset, "drone");
                assert_eq!(stage, 2);
                assert_eq!(key, "a.jpg");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_status_defaults() {
        let cli = Cli::try_parse_from(["imgpipe", "status", "-d", "drone"]).unwrap();
        match cli.command {
            Commands::Status { stage, stages, .. } => {
                assert_eq!(stage, None);
                assert_eq!(stages, commands::status::DEFAULT_STAGE_COUNT);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_dataset_register() {
        let cli = Cli::try_parse_from(["imgpipe", "dataset", "register", "drone"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Dataset {
                command: DatasetCommand::Register { ref name }
            } if name == "drone"
        ));
    }

    #[test]
    fn test_revive_requires_key() {
        assert!(Cli::try_parse_from(["imgpipe", "revive", "-d", "drone", "-s", "1"]).is_err());
    }
}

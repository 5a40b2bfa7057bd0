//! Error types for the imgpipe CLI

use imgpipe_server::manifest::ManifestError;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Error, Debug)]
pub enum CliError {
    /// Manifest store operation failed
    #[error("Manifest store error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("Dataset '{0}' not found. Register it with 'imgpipe dataset register {0}'.")]
    DatasetNotFound(String),

    /// Configuration is missing or invalid
    #[error("Configuration error: {0}. Check DATABASE_URL and the DATABASE_* variables.")]
    Config(String),

    #[error("Failed to encode JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_not_found_suggests_register() {
        let message = CliError::DatasetNotFound("drone".into()).to_string();
        assert!(message.contains("imgpipe dataset register drone"));
    }
}

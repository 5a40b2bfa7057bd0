//! imgpipe Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the imgpipe workspace.
//!
//! # Overview
//!
//! - **Types**: datasets, per-stage records, manifests and their entries
//! - **Checksums**: SHA-256 helpers used for staging integrity checks and
//!   manifest content hashing
//! - **Logging**: one place to configure `tracing` for every binary
//! - **Error Handling**: the shared [`CommonError`] type
//!
//! # Example
//!
//! ```no_run
//! use imgpipe_common::checksum::sha256_file;
//!
//! fn verify(path: &str, expected: &str) -> imgpipe_common::Result<bool> {
//!     Ok(sha256_file(path)? == expected)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{CommonError, Result};

//! Object store access
//!
//! Every stage talks to the object store through [`ObjectStoreGateway`], a
//! narrow get/put/list/stat/delete interface addressed by `s3://bucket/key`
//! URIs. [`S3Gateway`] is the production implementation;
//! [`InMemoryObjectStore`] backs tests and local dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod config;
pub mod memory;
pub mod s3;

pub use config::StorageConfig;
pub use memory::{GatewayOp, InMemoryObjectStore};
pub use s3::S3Gateway;

/// Errors surfaced by an [`ObjectStoreGateway`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    /// Network hiccups, throttling, 5xx responses. Worth retrying.
    #[error("Transient I/O error on {uri}: {message}")]
    TransientIo { uri: String, message: String },

    #[error("Permission denied on {uri}: {message}")]
    PermissionDenied { uri: String, message: String },

    #[error("Invalid object URI '{0}'")]
    InvalidUri(String),
}

impl StorageError {
    pub fn transient(uri: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::TransientIo {
            uri: uri.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A parsed `s3://bucket/key` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectUri {
    pub bucket: String,
    pub key: String,
}

impl ObjectUri {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Final path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl FromStr for ObjectUri {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("s3://")
            .ok_or_else(|| StorageError::InvalidUri(s.to_string()))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(StorageError::InvalidUri(s.to_string()));
        }
        Ok(Self::new(bucket, key))
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Object metadata returned by `stat` and `put`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectStat {
    pub size: u64,
    /// Hex SHA-256 of the content, when the store knows it
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Narrow interface over an S3-compatible object store
#[async_trait]
pub trait ObjectStoreGateway: Send + Sync {
    async fn get(&self, uri: &ObjectUri) -> StorageResult<Vec<u8>>;

    /// Write an object, returning its size and SHA-256
    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> StorageResult<ObjectStat>;

    /// Keys (not URIs) under a bucket/prefix, in lexicographic order
    async fn list(&self, prefix: &ObjectUri) -> StorageResult<Vec<String>>;

    async fn stat(&self, uri: &ObjectUri) -> StorageResult<ObjectStat>;

    async fn delete(&self, uri: &ObjectUri) -> StorageResult<()>;

    /// `stat` that maps NotFound to `None`
    async fn try_stat(&self, uri: &ObjectUri) -> StorageResult<Option<ObjectStat>> {
        match self.stat(uri).await {
            Ok(stat) => Ok(Some(stat)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

use serde::{Deserialize, Serialize};
use std::env;

/// Connection settings for the S3-compatible store
///
/// Buckets are not part of this config; every call carries a full
/// `s3://bucket/key` URI so one gateway serves all stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    /// Static credentials. When absent the default AWS provider chain is used.
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            region: env::var("S3_REGION")
                .or_else(|_| env::var("AWS_REGION"))
                .unwrap_or_else(|_| "us-east-1".to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .ok(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .ok(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        }
    }

    pub fn for_minio(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }

    pub fn static_credentials(&self) -> Option<(&str, &str)> {
        match (&self.access_key, &self.secret_key) {
            (Some(access), Some(secret)) => Some((access.as_str(), secret.as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_for_minio() {
        let config = StorageConfig::for_minio("http://localhost:9000");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.path_style);
        assert_eq!(config.static_credentials(), Some(("minioadmin", "minioadmin")));
    }

    #[test]
    #[serial]
    fn test_from_env_falls_back_to_aws_names() {
        env::remove_var("S3_REGION");
        env::remove_var("S3_ACCESS_KEY");
        env::remove_var("S3_SECRET_KEY");
        env::set_var("AWS_REGION", "eu-west-1");
        env::set_var("AWS_ACCESS_KEY_ID", "key");
        env::set_var("AWS_SECRET_ACCESS_KEY", "secret");

        let config = StorageConfig::from_env();
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.static_credentials(), Some(("key", "secret")));

        env::remove_var("AWS_REGION");
        env::remove_var("AWS_ACCESS_KEY_ID");
        env::remove_var("AWS_SECRET_ACCESS_KEY");
    }
}

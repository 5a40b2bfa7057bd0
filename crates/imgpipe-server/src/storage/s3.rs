use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{http::HttpResponse, Credentials, Region},
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    primitives::ByteStream,
    Client,
};
use chrono::{DateTime, Utc};
use imgpipe_common::checksum::sha256_bytes;
use tracing::{debug, info, instrument};

use super::{ObjectStat, ObjectStoreGateway, ObjectUri, StorageConfig, StorageError, StorageResult};

/// User metadata key holding the hex SHA-256 written on every put
pub const CHECKSUM_METADATA_KEY: &str = "sha256";

/// [`ObjectStoreGateway`] over the AWS SDK, usable against AWS S3 or MinIO
#[derive(Clone)]
pub struct S3Gateway {
    client: Client,
}

impl S3Gateway {
    pub async fn new(config: &StorageConfig) -> Self {
        debug!(endpoint = ?config.endpoint, region = %config.region, "Initializing S3 gateway");

        let mut builder = match config.static_credentials() {
            Some((access_key, secret_key)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(
                    access_key,
                    secret_key,
                    None,
                    None,
                    "imgpipe-static",
                )),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            }
        };

        builder = builder
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        info!(region = %config.region, "S3 gateway initialized");

        Self::from_client(Client::from_conf(builder.build()))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ObjectStoreGateway for S3Gateway {
    #[instrument(skip(self), fields(uri = %uri))]
    async fn get(&self, uri: &ObjectUri) -> StorageResult<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&uri.bucket)
            .key(&uri.key)
            .send()
            .await
            .map_err(|e| classify(uri, e))?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::transient(uri, e))?
            .into_bytes()
            .to_vec();

        debug!(bytes = data.len(), "Downloaded object");
        Ok(data)
    }

    #[instrument(skip(self, data), fields(uri = %uri, bytes = data.len()))]
    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> StorageResult<ObjectStat> {
        let checksum = sha256_bytes(&data);
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(&uri.bucket)
            .key(&uri.key)
            .metadata(CHECKSUM_METADATA_KEY, &checksum)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| classify(uri, e))?;

        debug!(%checksum, "Uploaded object");
        Ok(ObjectStat {
            size,
            checksum: Some(checksum),
            last_modified: Some(Utc::now()),
        })
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &ObjectUri) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&prefix.bucket)
                .prefix(&prefix.key);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }

            let page = request.send().await.map_err(|e| classify(prefix, e))?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .map(str::to_string),
            );

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(count = keys.len(), "Listed objects");
        Ok(keys)
    }

    #[instrument(skip(self), fields(uri = %uri))]
    async fn stat(&self, uri: &ObjectUri) -> StorageResult<ObjectStat> {
        let response = self
            .client
            .head_object()
            .bucket(&uri.bucket)
            .key(&uri.key)
            .send()
            .await
            .map_err(|e| classify(uri, e))?;

        Ok(ObjectStat {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            checksum: response
                .metadata()
                .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
                .cloned(),
            last_modified: response
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
        })
    }

    #[instrument(skip(self), fields(uri = %uri))]
    async fn delete(&self, uri: &ObjectUri) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&uri.bucket)
            .key(&uri.key)
            .send()
            .await
            .map_err(|e| classify(uri, e))?;

        debug!("Deleted object");
        Ok(())
    }
}

/// Map an SDK failure onto the gateway taxonomy using the service error
/// code first and the raw HTTP status second
fn classify<E>(uri: &ObjectUri, err: SdkError<E, HttpResponse>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let code = err.code().map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();

    match (code.as_deref(), status) {
        (Some("NoSuchKey" | "NotFound" | "NoSuchBucket"), _) | (_, Some(404)) => {
            StorageError::NotFound(uri.to_string())
        }
        (
            Some("AccessDenied" | "Forbidden" | "InvalidAccessKeyId" | "SignatureDoesNotMatch"),
            _,
        )
        | (_, Some(403)) => StorageError::PermissionDenied {
            uri: uri.to_string(),
            message,
        },
        _ => StorageError::transient(uri, message),
    }
}

//! S3-compatible storage backend.
//!
//! Works against AWS S3, MinIO, R2 and similar. Range reads map directly onto
//! the HTTP `Range` header so a resumed device download only fetches the tail
//! of the image.

use async_trait::async_trait;
use aws_sdk_s3::{
    config::{Builder, Credentials, Region},
    error::{ProvideErrorMetadata, SdkError},
    operation::get_object::GetObjectError,
    primitives::ByteStream,
    Client,
};
use bytes::Bytes;
use std::ops::Range;

use super::backend::{StorageBackend, StorageError, StorageResult};

/// S3 storage backend configuration
#[derive(Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Optional prefix for all keys (e.g., "fleet-a/")
    pub prefix: Option<String>,
    pub region: String,
    /// Custom endpoint URL (for MinIO, R2, etc.)
    pub endpoint: Option<String>,
    /// Force path-style URLs (required for MinIO)
    pub force_path_style: bool,
    /// Static access/secret key; the AWS default chain is used when absent
    pub credentials: Option<(String, String)>,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("bucket", &self.bucket)
            .field("prefix", &self.prefix)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("force_path_style", &self.force_path_style)
            .field("credentials", &self.credentials.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl S3Config {
    /// Create config for AWS S3
    pub fn aws(bucket: String, region: String) -> Self {
        Self {
            bucket,
            prefix: None,
            region,
            endpoint: None,
            force_path_style: false,
            credentials: None,
        }
    }

    /// Create config for MinIO or other S3-compatible storage
    pub fn minio(bucket: String, endpoint: String) -> Self {
        Self {
            bucket,
            prefix: None,
            region: "us-east-1".to_string(), // MinIO ignores the region
            endpoint: Some(endpoint),
            force_path_style: true,
            credentials: None,
        }
    }

    pub fn with_prefix(mut self, prefix: String) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn with_credentials(mut self, access_key: String, secret_key: String) -> Self {
        self.credentials = Some((access_key, secret_key));
        self
    }
}

/// S3-compatible storage backend
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Storage {
    /// Create a new S3 storage backend, taking credentials from the environment
    pub async fn new(config: S3Config) -> Self {
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let builder = Builder::from(&sdk_config);
        Self::from_builder(builder, config)
    }

    /// Create S3 storage with explicit credentials
    pub async fn with_credentials(config: S3Config, access_key: &str, secret_key: &str) -> Self {
        let creds = Credentials::new(access_key, secret_key, None, None, "static");
        let builder = Builder::new()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .credentials_provider(creds);
        Self::from_builder(builder, config)
    }

    fn from_builder(mut builder: Builder, config: S3Config) -> Self {
        builder = builder
            .region(Region::new(config.region))
            .force_path_style(config.force_path_style);

        if let Some(endpoint) = config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            prefix: config.prefix,
        }
    }

    /// Build the full S3 key from namespace and key
    fn full_key(&self, namespace: &str, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}{}/{}", prefix, namespace, key),
            None => format!("{}/{}", namespace, key),
        }
    }

    async fn get_object(
        &self,
        namespace: &str,
        key: &str,
        range: Option<&Range<u64>>,
    ) -> StorageResult<ByteStream> {
        let mut request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(namespace, key));

        if let Some(range) = range {
            // S3 ranges are inclusive on both ends
            request = request.range(format!("bytes={}-{}", range.start, range.end - 1));
        }

        let output = request
            .send()
            .await
            .map_err(|e| map_get_error(e, namespace, key, range))?;
        Ok(output.body)
    }
}

fn map_get_error<R: std::fmt::Debug + Send + Sync + 'static>(
    err: SdkError<GetObjectError, R>,
    namespace: &str,
    key: &str,
    range: Option<&Range<u64>>,
) -> StorageError {
    let service_err = err.into_service_error();
    if service_err.is_no_such_key() {
        return StorageError::NotFound(format!("{}/{}", namespace, key));
    }
    match (service_err.code(), range) {
        (Some("InvalidRange"), Some(range)) => StorageError::InvalidRange(format!(
            "{}..{} for {}/{}",
            range.start, range.end, namespace, key
        )),
        _ => StorageError::Other(service_err.to_string()),
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes> {
        let body = self.get_object(namespace, key, None).await?;
        let data = body
            .collect()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn get_range(&self, namespace: &str, key: &str, range: Range<u64>) -> StorageResult<Bytes> {
        if range.start >= range.end {
            return Err(StorageError::InvalidRange(format!(
                "empty range {}..{}",
                range.start, range.end
            )));
        }
        let body = self.get_object(namespace, key, Some(&range)).await?;
        let data = body
            .collect()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>> {
        let body = self.get_object(namespace, key, None).await?;
        Ok(Box::new(body.into_async_read()))
    }

    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()> {
        // PutObject is atomic and durable once acknowledged
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(namespace, key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                match service_err.code() {
                    Some("QuotaExceeded") | Some("XMinioStorageFull") => {
                        StorageError::CapacityExhausted(service_err.to_string())
                    }
                    _ => StorageError::Other(service_err.to_string()),
                }
            })?;

        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(namespace, key))
            .send()
            .await
            .map_err(|e| StorageError::Other(e.into_service_error().to_string()))?;

        Ok(())
    }

    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(namespace, key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(StorageError::Other(service_err.to_string()))
                }
            }
        }
    }

    async fn size(&self, namespace: &str, key: &str) -> StorageResult<u64> {
        let output = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(namespace, key))
            .send()
            .await
            .map_err(|e| {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    StorageError::NotFound(format!("{}/{}", namespace, key))
                } else {
                    StorageError::Other(service_err.to_string())
                }
            })?;

        Ok(output.content_length().unwrap_or(0).max(0) as u64)
    }
}

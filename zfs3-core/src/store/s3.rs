/*!
Amazon S3 object store adapter.

Chunks are written with a single `PutObject` each, carrying the SHA-256 of the body so
the service rejects corrupted transfers. Works against AWS and S3-compatible services
through a custom endpoint.
*/

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials as AwsCredentials, Region};
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::StorageClass;
use aws_sdk_s3::Client as S3Client;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info};

use super::{validate_key, ObjectStore, PutReceipt};
use crate::config::{Credentials, StoreConfig};
use crate::{BackupError, Result};

/// S3 object store
///
/// # Authentication
/// Credentials come from [`StoreConfig::credentials`]:
/// 1. `Environment` uses the default AWS provider chain (environment variables,
///    shared config files, instance and task roles)
/// 2. `Profile` selects a named profile from the shared config files
/// 3. `Static` uses an explicit key pair
///
/// # Example
/// ```rust,no_run
/// use zfs3_core::config::StoreConfig;
/// use zfs3_core::store::S3ObjectStore;
///
/// # async fn open() -> zfs3_core::Result<()> {
/// let config = StoreConfig::s3_with_bucket("my-backups".to_string())
///     .with_endpoint("https://s3.eu-central-1.wasabisys.com");
/// let store = S3ObjectStore::new(&config).await?;
/// assert_eq!(store.bucket(), "my-backups");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Create a store for the bucket named in `config`
    ///
    /// # Errors
    /// Returns a validation error if the configuration has no bucket or if no
    /// credentials can be resolved.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| BackupError::validation("S3 backend requires a valid bucket name"))?;

        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        match &config.credentials {
            Credentials::Environment => {}
            Credentials::Profile(name) => loader = loader.profile_name(name),
            Credentials::Static {
                access_key_id,
                secret_access_key,
                session_token,
            } => {
                loader = loader.credentials_provider(AwsCredentials::new(
                    access_key_id,
                    secret_access_key,
                    session_token.clone(),
                    None,
                    "zfs3-static",
                ));
            }
        }
        let sdk_config = loader.load().await;

        if sdk_config.credentials_provider().is_none() {
            return Err(BackupError::validation(
                "AWS credentials not found. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY, or pass a profile",
            ));
        }

        let mut s3_config = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            // S3-compatible services rarely support virtual-hosted buckets
            s3_config = s3_config.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(s3_config.build());

        info!(
            bucket = %bucket,
            endpoint = config.endpoint.as_deref().unwrap_or("aws"),
            "Initialized S3 object store"
        );
        Ok(Self { client, bucket })
    }

    /// Wrap an existing client
    pub fn with_client(client: S3Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Bytes, storage_class: &str) -> Result<PutReceipt> {
        validate_key(key)?;
        let digest = Sha256::digest(&body);
        let sent_checksum = hex::encode(digest);
        let size = body.len() as u64;

        debug!(
            bucket = %self.bucket,
            key = %key,
            size = size,
            storage_class = %storage_class,
            "Starting S3 put_object operation"
        );

        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .storage_class(StorageClass::from(storage_class))
            .checksum_sha256(BASE64.encode(digest))
            .content_length(size as i64)
            .body(ByteStream::from(body))
            .send()
            .await;

        match result {
            Ok(output) => {
                // the service validated the header; echo its view when it reports one
                let checksum = match output.checksum_sha256() {
                    Some(reported) => hex_from_base64(reported)?,
                    None => sent_checksum,
                };
                debug!(bucket = %self.bucket, key = %key, "Stored chunk in S3");
                Ok(PutReceipt {
                    key: key.to_string(),
                    checksum,
                    size,
                    etag: output.e_tag().map(str::to_string),
                })
            }
            Err(e) => {
                let mapped = map_s3_error("put_object", e, key);
                error!(bucket = %self.bucket, key = %key, error = %mapped, "Failed to store chunk in S3");
                Err(mapped)
            }
        }
    }

    async fn get_object(&self, key: &str) -> Result<Bytes> {
        debug!(bucket = %self.bucket, key = %key, "Starting S3 get_object operation");

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("get_object", e, key))?;

        let data = output.body.collect().await.map_err(|e| {
            BackupError::upload(format!("Failed to read S3 object stream for '{key}': {e}"))
        })?;
        Ok(data.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(map_s3_error("head_object", e, key)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| map_s3_error("list_objects_v2", e, prefix))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|object| object.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        info!(bucket = %self.bucket, key = %key, "Deleting object from S3");
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| map_s3_error("delete_object", e, key))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}

/// Convert a base64 SHA-256 as reported by S3 into lowercase hex
pub(crate) fn hex_from_base64(encoded: &str) -> Result<String> {
    let raw = BASE64
        .decode(encoded)
        .map_err(|e| BackupError::upload(format!("S3 returned a malformed checksum '{encoded}': {e}")))?;
    Ok(hex::encode(raw))
}

/// Map AWS SDK errors to BackupError with appropriate context
pub(crate) fn map_s3_error<E, R>(op: &str, error: SdkError<E, R>, key: &str) -> BackupError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &error {
        SdkError::ConstructionFailure(_) => {
            BackupError::validation(format!("S3 {op} request could not be built (key: {key})"))
        }
        SdkError::DispatchFailure(dispatch_err) => {
            BackupError::upload(format!("S3 {op} request failed to dispatch: {dispatch_err:?}"))
        }
        SdkError::TimeoutError(_) => {
            BackupError::upload(format!("S3 {op} request timed out (key: {key})"))
        }
        SdkError::ResponseError(response_err) => {
            BackupError::upload(format!("S3 {op} response error: {response_err:?}"))
        }
        SdkError::ServiceError(service_err) => match service_err.err().code() {
            Some("NoSuchKey") | Some("NotFound") => {
                BackupError::not_found(format!("S3 object '{key}'"))
            }
            Some("NoSuchBucket") => BackupError::not_found("S3 bucket".to_string()),
            Some("AccessDenied") | Some("Forbidden") => BackupError::upload(
                "Access denied to S3 (check credentials and permissions)".to_string(),
            ),
            Some("BadDigest") | Some("XAmzContentSHA256Mismatch") => BackupError::upload(format!(
                "S3 rejected the body of '{key}': checksum mismatch"
            )),
            Some(code) => BackupError::upload(format!(
                "S3 service error ({code}): {}",
                service_err.err().message().unwrap_or("Unknown error")
            )),
            None => BackupError::upload(format!("S3 {op} service error: {service_err:?}")),
        },
        _ => BackupError::upload(format!("S3 {op} error: {error:?}")),
    }
}

#[cfg(test)]
#[path = "s3_tests.rs"]
mod s3_tests;

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::warn;

use crate::{ObjectMetadata, ObjectStoreClient, ObjectStoreError};

/// S3/MinIO-compatible object store client. Session-scoped:
/// credentials are resolved once at construction and are immutable
/// thereafter.
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    /// Builds a client against a custom endpoint (MinIO-style deployments
    /// pass an explicit `endpoint_url` here); pass an empty `access_key`
    /// to fall back to the default AWS credential provider chain.
    pub async fn new(
        endpoint_url: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        use_ssl: bool,
    ) -> Self {
        let mut builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(region.to_string()));

        if !access_key.is_empty() {
            builder = builder.credentials_provider(Credentials::new(
                access_key,
                secret_key,
                None,
                None,
                "etl-narrative-engine",
            ));
        }

        let shared_config = builder.load().await;

        let endpoint = if endpoint_url.is_empty() {
            None
        } else if use_ssl {
            Some(endpoint_url.replace("http://", "https://"))
        } else {
            Some(endpoint_url.to_string())
        };

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config)
            .force_path_style(true);
        if let Some(endpoint) = endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
        }
    }

    fn classify_get_error(err: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>) -> ObjectStoreError {
        match &err {
            SdkError::ServiceError(service_err) => {
                let e = service_err.err();
                if e.is_no_such_key() {
                    return ObjectStoreError::NotFound(err.to_string());
                }
                classify_generic_service_error(&err)
            }
            _ => classify_generic_dispatch_error(&err),
        }
    }

    fn classify_head_error(err: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>) -> ObjectStoreError {
        match &err {
            SdkError::ServiceError(service_err) => {
                let e = service_err.err();
                if e.is_not_found() {
                    return ObjectStoreError::NotFound(err.to_string());
                }
                classify_generic_service_error(&err)
            }
            _ => classify_generic_dispatch_error(&err),
        }
    }

    fn classify_put_error(err: SdkError<aws_sdk_s3::operation::put_object::PutObjectError>) -> ObjectStoreError {
        match &err {
            SdkError::ServiceError(_) => classify_generic_service_error(&err),
            _ => classify_generic_dispatch_error(&err),
        }
    }
}

fn classify_generic_service_error<E: std::fmt::Display>(err: &SdkError<E>) -> ObjectStoreError {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("accessdenied") || lower.contains("access denied") {
        ObjectStoreError::AccessDenied(message)
    } else if lower.contains("slowdown") || lower.contains("requestlimitexceeded") || lower.contains("throttl") {
        ObjectStoreError::RateLimited(message)
    } else {
        ObjectStoreError::Network(message)
    }
}

fn classify_generic_dispatch_error<E: std::fmt::Display>(err: &SdkError<E>) -> ObjectStoreError {
    let message = err.to_string();
    match err {
        SdkError::TimeoutError(_) => ObjectStoreError::Timeout(message),
        SdkError::DispatchFailure(_) => ObjectStoreError::Connection(message),
        _ => ObjectStoreError::Network(message),
    }
}

#[async_trait]
impl ObjectStoreClient for S3ObjectStore {
    async fn get(&self, bucket: &str, key: &str, max_size_bytes: u64) -> Result<Bytes, ObjectStoreError> {
        let head = self.client.head_object().bucket(bucket).key(key).send().await;
        if let Ok(head) = &head {
            let declared = head.content_length().unwrap_or(0).max(0) as u64;
            if declared > max_size_bytes {
                return Err(ObjectStoreError::SizeExceeded {
                    declared,
                    max: max_size_bytes,
                });
            }
        }

        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::classify_get_error)?;

        let declared = output.content_length().unwrap_or(0).max(0) as u64;
        if declared > max_size_bytes {
            return Err(ObjectStoreError::SizeExceeded {
                declared,
                max: max_size_bytes,
            });
        }

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Network(e.to_string()))?;
        Ok(data.into_bytes())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type)
            .send()
            .await
            .map_err(Self::classify_put_error)?;
        Ok(())
    }

    async fn head(&self, bucket: &str, key: &str) -> Result<Option<ObjectMetadata>, ObjectStoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectMetadata {
                size_bytes: output.content_length().unwrap_or(0).max(0) as u64,
                content_type: output.content_type().map(|s| s.to_string()),
                etag: output.e_tag().map(|s| s.to_string()),
            })),
            Err(err) => match Self::classify_head_error(err) {
                ObjectStoreError::NotFound(_) => Ok(None),
                other => {
                    warn!(error = %other, bucket, key, "head_object failed");
                    Err(other)
                }
            },
        }
    }
}

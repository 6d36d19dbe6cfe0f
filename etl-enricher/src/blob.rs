//! Object-store access for the reference blob, behind a trait so the refresh
//! path can be exercised without S3. The mock implementation is always
//! available, not test-gated, so other crates can use it too.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use aws_sdk_s3::Client as AwsS3SdkClient;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("blob operation failed: {0}")]
    OperationFailed(String),
    #[error("parse error: {0}")]
    Parse(String),
}

#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Get an object as a UTF-8 string.
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, BlobError>;
}

/// Real S3-backed client.
pub struct S3BlobClient {
    client: AwsS3SdkClient,
}

impl S3BlobClient {
    pub fn new(client: AwsS3SdkClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BlobClient for S3BlobClient {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = format!("failed to get object: {e}");
                if let aws_sdk_s3::operation::get_object::GetObjectError::NoSuchKey(_) =
                    e.into_service_error()
                {
                    BlobError::NotFound(key.to_string())
                } else {
                    BlobError::OperationFailed(message)
                }
            })?;

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::OperationFailed(format!("failed to read object body: {e}")))?;

        String::from_utf8(body.to_vec())
            .map_err(|e| BlobError::Parse(format!("object body is not valid UTF-8: {e}")))
    }
}

/// Mock blob client keyed by `bucket:key`, with interior mutability so tests
/// can replace an object between refresh cycles.
#[derive(Default)]
pub struct MockBlobClient {
    objects: Mutex<HashMap<String, Result<String, BlobError>>>,
}

impl MockBlobClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_object(self, bucket: &str, key: &str, response: Result<String, BlobError>) -> Self {
        self.set_object(bucket, key, response);
        self
    }

    pub fn set_object(&self, bucket: &str, key: &str, response: Result<String, BlobError>) {
        self.objects
            .lock()
            .expect("poisoned MockBlobClient mutex")
            .insert(format!("{bucket}:{key}"), response);
    }
}

#[async_trait]
impl BlobClient for MockBlobClient {
    async fn get_string(&self, bucket: &str, key: &str) -> Result<String, BlobError> {
        match self
            .objects
            .lock()
            .expect("poisoned MockBlobClient mutex")
            .get(&format!("{bucket}:{key}"))
        {
            Some(response) => response.clone(),
            None => Err(BlobError::NotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_blob_client_returns_configured_object() {
        let client =
            MockBlobClient::new().with_object("products", "products/products.json", Ok("[]".into()));

        let body = client
            .get_string("products", "products/products.json")
            .await
            .unwrap();
        assert_eq!(body, "[]");
    }

    #[tokio::test]
    async fn test_mock_blob_client_misses_unknown_keys() {
        let client = MockBlobClient::new();
        assert_eq!(
            client.get_string("products", "nope").await,
            Err(BlobError::NotFound("nope".to_string()))
        );
    }
}

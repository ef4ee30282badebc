//! Object storage abstraction for raw uploaded files.
//!
//! Blobs are addressed by object name inside a single configured bucket.
//! Production uses [`S3StorageClient`] against any S3-compatible endpoint;
//! tests use [`InMemoryStorage`].

pub mod memory;
pub mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;

pub use memory::InMemoryStorage;
pub use s3::S3StorageClient;

/// Streamed object body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("storage request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("storage {operation} failed (HTTP {status}): {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },
    #[error("storage misconfigured: {0}")]
    Config(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Make sure the configured bucket exists, creating it if needed.
    ///
    /// Idempotent: an existing bucket, or a creation attempt that reports the
    /// bucket already exists, is success.
    async fn ensure_bucket(&self) -> Result<(), StorageError>;

    /// Store `data` under `object_name` and return its resolvable URL.
    async fn upload_file(
        &self,
        object_name: &str,
        data: Bytes,
        content_type: &str,
    ) -> Result<String, StorageError>;

    async fn delete_file(&self, object_name: &str) -> Result<(), StorageError>;

    /// Time-limited URL granting read access to the object.
    async fn get_file_url(&self, object_name: &str) -> Result<String, StorageError>;

    async fn get_file_content(&self, object_name: &str) -> Result<ByteStream, StorageError>;
}

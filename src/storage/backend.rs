//! Storage backend trait definition.
//!
//! Firmware blobs are written once under their content hash and read back
//! either whole or by byte range, so resumable device downloads do not have
//! to pull the entire image again.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::ops::Range;
use thiserror::Error;

/// Storage error types
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object not found
    #[error("object not found: {0}")]
    NotFound(String),

    /// The device or quota backing the store has no room left
    #[error("storage capacity exhausted: {0}")]
    CapacityExhausted(String),

    /// Range lies outside the stored object
    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("io error: {0}")]
    Io(#[source] std::io::Error),

    #[error("storage error: {0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(e.to_string()),
            ErrorKind::StorageFull => StorageError::CapacityExhausted(e.to_string()),
            _ => StorageError::Io(e),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage backend trait for pluggable blob storage.
///
/// Keys are grouped by namespace (see [`namespaces`]). A `put` must be
/// durable when it returns, and a concurrent reader must never see a
/// partially written object.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Get an object by namespace and key
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Bytes>;

    /// Get a byte range from an object.
    ///
    /// Range is [start, end) - start inclusive, end exclusive.
    async fn get_range(&self, namespace: &str, key: &str, range: Range<u64>) -> StorageResult<Bytes>;

    /// Get a reader for streaming an object without buffering it
    async fn get_stream(
        &self,
        namespace: &str,
        key: &str,
    ) -> StorageResult<Box<dyn tokio::io::AsyncRead + Unpin + Send>>;

    /// Durably store an object, replacing any previous content under the key
    async fn put(&self, namespace: &str, key: &str, data: Bytes) -> StorageResult<()>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()>;

    /// Check if an object exists
    async fn exists(&self, namespace: &str, key: &str) -> StorageResult<bool>;

    /// Size of a stored object in bytes
    async fn size(&self, namespace: &str, key: &str) -> StorageResult<u64>;
}

/// Storage namespaces
pub mod namespaces {
    /// Firmware images, keyed by hex SHA-256
    pub const FIRMWARE: &str = "firmware";
}

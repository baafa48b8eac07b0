//! Storage backend traits

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::metadata::{is_sidecar_key, ObjectAttributes, ObjectMetadata};

/// Errors from storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Object not found: {bucket}/{key}")]
    ObjectNotFound { bucket: String, key: String },

    #[error("Bucket already exists: {0}")]
    BucketAlreadyExists(String),

    #[error("Bucket not empty: {0}")]
    BucketNotEmpty(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed sidecar: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// What a HEAD returns
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub metadata: Option<ObjectMetadata>,
}

/// A stored object
#[derive(Debug)]
pub struct StoredObject {
    pub info: ObjectInfo,
    pub data: Bytes,
}

/// Result of a PUT operation
#[derive(Debug)]
pub struct PutObjectResult {
    pub etag: String,
    pub version_id: Option<String>,
}

/// One entry of a recursive bucket walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    /// Directories end in `/`
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl ObjectEntry {
    pub fn is_directory(&self) -> bool {
        self.key.ends_with('/')
    }
}

/// Check a bucket name against the S3 naming rules
pub fn validate_bucket_name(name: &str) -> Result<(), StorageError> {
    let invalid = || StorageError::InvalidBucketName(name.to_string());

    if !(3..=63).contains(&name.len()) {
        return Err(invalid());
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return Err(invalid());
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let bytes = name.as_bytes();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return Err(invalid());
    }
    if name.contains("..") {
        return Err(invalid());
    }
    Ok(())
}

/// Reject keys that could escape the bucket or collide with sidecars
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let invalid = |why: &str| StorageError::InvalidKey(format!("{why}: {key:?}"));

    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.contains('\0') {
        return Err(invalid("NUL byte in key"));
    }
    if key.starts_with('/') {
        return Err(invalid("leading slash"));
    }

    for segment in key.strip_suffix('/').unwrap_or(key).split('/') {
        match segment {
            "" => return Err(invalid("empty path segment")),
            "." | ".." => return Err(invalid("relative path segment")),
            s if is_sidecar_key(s) => return Err(invalid("reserved suffix")),
            _ => {}
        }
    }
    Ok(())
}

/// Abstract storage backend trait
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Create a bucket
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Delete an empty bucket
    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError>;

    /// Check if a bucket exists
    async fn bucket_exists(&self, bucket: &str) -> bool;

    /// Store an object and its sidecar. Keys ending in `/` create a directory.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        attributes: ObjectAttributes,
    ) -> Result<PutObjectResult, StorageError>;

    /// Get an object
    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError>;

    /// Object attributes without the content
    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError>;

    /// The object's sidecar, if it has one
    async fn load_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, StorageError>;

    /// Delete an object and its sidecar. Returns whether anything was removed.
    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StorageError>;

    /// Every object and directory in the bucket, sorted by key
    async fn walk(&self, bucket: &str) -> Result<Vec<ObjectEntry>, StorageError>;
}

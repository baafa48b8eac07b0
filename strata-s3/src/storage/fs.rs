//! Filesystem storage backend
//!
//! Layout: `<root>/<bucket>/<key>` for content and
//! `<root>/<bucket>/<key>.strata-meta.json` for the sidecar. Keys ending in `/`
//! are plain directories with no sidecar.

use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use strata_core::fs::{is_temp_file_name, read_optional, write_atomic};
use tracing::{debug, info, warn};

use super::traits::*;
use crate::metadata::{compute_etag, is_sidecar_key, ObjectAttributes, ObjectMetadata, SIDECAR_SUFFIX};

/// Storage rooted at a directory on the local filesystem
#[derive(Debug, Clone)]
pub struct FsObjectStorage {
    root: PathBuf,
}

impl FsObjectStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Path of a bucket; names that fail validation can never exist
    fn bucket_path(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        validate_bucket_name(bucket).map_err(|_| StorageError::BucketNotFound(bucket.to_string()))?;
        Ok(self.root.join(bucket))
    }

    async fn require_bucket(&self, bucket: &str) -> Result<PathBuf, StorageError> {
        let path = self.bucket_path(bucket)?;
        if is_dir(&path).await {
            Ok(path)
        } else {
            Err(StorageError::BucketNotFound(bucket.to_string()))
        }
    }

    /// Directory keys map to the directory itself, without the trailing `/`
    async fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self
            .require_bucket(bucket)
            .await?
            .join(key.trim_end_matches('/')))
    }
}

fn sidecar_path(object_path: &Path) -> PathBuf {
    let mut path = object_path.as_os_str().to_owned();
    path.push(SIDECAR_SUFFIX);
    PathBuf::from(path)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

fn modified(metadata: &std::fs::Metadata) -> DateTime<Utc> {
    metadata
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| DateTime::<Utc>::from(SystemTime::now()))
}

async fn read_sidecar(object_path: &Path) -> Result<Option<ObjectMetadata>, StorageError> {
    match read_optional(&sidecar_path(object_path)).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn not_found(bucket: &str, key: &str) -> StorageError {
    StorageError::ObjectNotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    }
}

#[async_trait]
impl ObjectStorage for FsObjectStorage {
    async fn create_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        validate_bucket_name(bucket)?;
        let path = self.root.join(bucket);
        if is_dir(&path).await {
            return Err(StorageError::BucketAlreadyExists(bucket.to_string()));
        }

        tokio::fs::create_dir_all(&path).await?;
        info!(bucket, "Created bucket directory");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &str) -> Result<(), StorageError> {
        let path = self.require_bucket(bucket).await?;
        if !self.walk(bucket).await?.is_empty() {
            return Err(StorageError::BucketNotEmpty(bucket.to_string()));
        }

        tokio::fs::remove_dir_all(&path).await?;
        info!(bucket, "Deleted bucket directory");
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> bool {
        match self.bucket_path(bucket) {
            Ok(path) => is_dir(&path).await,
            Err(_) => false,
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        attributes: ObjectAttributes,
    ) -> Result<PutObjectResult, StorageError> {
        let path = self.object_path(bucket, key).await?;

        if key.ends_with('/') {
            tokio::fs::create_dir_all(&path).await?;
            debug!(bucket, key, "Created directory");
            return Ok(PutObjectResult {
                etag: compute_etag(&[]),
                version_id: None,
            });
        }

        let metadata = ObjectMetadata::for_upload(key, &data, attributes);
        write_atomic(&path, &data).await?;
        write_atomic(&sidecar_path(&path), &serde_json::to_vec_pretty(&metadata)?).await?;
        debug!(bucket, key, size = metadata.size, "Stored object");

        Ok(PutObjectResult {
            etag: metadata.etag,
            version_id: Some(metadata.version_id),
        })
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        let info = self.head_object(bucket, key).await?;
        if key.ends_with('/') {
            return Ok(StoredObject {
                info,
                data: Bytes::new(),
            });
        }

        let path = self.object_path(bucket, key).await?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(bucket, key)),
            Err(e) => return Err(e.into()),
        };

        Ok(StoredObject {
            info,
            data: Bytes::from(data),
        })
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectInfo, StorageError> {
        let path = self.object_path(bucket, key).await?;
        let fs_meta = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found(bucket, key)),
            Err(e) => return Err(e.into()),
        };

        if fs_meta.is_dir() != key.ends_with('/') {
            return Err(not_found(bucket, key));
        }

        let metadata = if fs_meta.is_dir() {
            None
        } else {
            read_sidecar(&path).await?
        };

        Ok(match metadata {
            Some(meta) => ObjectInfo {
                key: key.to_string(),
                size: meta.size,
                etag: Some(meta.etag.clone()),
                last_modified: meta.last_modified,
                metadata: Some(meta),
            },
            None => ObjectInfo {
                key: key.to_string(),
                size: if fs_meta.is_dir() { 0 } else { fs_meta.len() },
                etag: None,
                last_modified: modified(&fs_meta),
                metadata: None,
            },
        })
    }

    async fn load_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, StorageError> {
        let path = self.object_path(bucket, key).await?;
        if key.ends_with('/') {
            return Ok(None);
        }
        read_sidecar(&path).await
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> Result<bool, StorageError> {
        let path = self.object_path(bucket, key).await?;

        if key.ends_with('/') {
            return match tokio::fs::remove_dir(&path).await {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(e.into()),
            };
        }

        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(sidecar_path(&path)).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        debug!(bucket, key, removed, "Deleted object");
        Ok(removed)
    }

    async fn walk(&self, bucket: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        let root = self.require_bucket(bucket).await?;
        let mut entries = Vec::new();
        let mut pending = vec![(root, String::new())];

        while let Some((dir, prefix)) = pending.pop() {
            let mut reader = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = reader.next_entry().await? {
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    warn!(bucket, path = %entry.path().display(), "Skipping non UTF-8 file name");
                    continue;
                };
                if is_temp_file_name(name) || is_sidecar_key(name) {
                    continue;
                }

                let fs_meta = entry.metadata().await?;
                if fs_meta.is_dir() {
                    let key = format!("{prefix}{name}/");
                    entries.push(ObjectEntry {
                        key: key.clone(),
                        size: 0,
                        etag: None,
                        last_modified: modified(&fs_meta),
                    });
                    pending.push((entry.path(), key));
                } else if fs_meta.is_file() {
                    let key = format!("{prefix}{name}");
                    let sidecar = match read_sidecar(&entry.path()).await {
                        Ok(sidecar) => sidecar,
                        Err(e) => {
                            warn!(bucket, key = %key, error = %e, "Ignoring unreadable sidecar");
                            None
                        }
                    };
                    entries.push(match sidecar {
                        Some(meta) => ObjectEntry {
                            key,
                            size: meta.size,
                            etag: Some(meta.etag),
                            last_modified: meta.last_modified,
                        },
                        None => ObjectEntry {
                            key,
                            size: fs_meta.len(),
                            etag: None,
                            last_modified: modified(&fs_meta),
                        },
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

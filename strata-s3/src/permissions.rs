//! Durable per-bucket ACL documents
//!
//! One JSON document per bucket holds the owner, canned ACL and grant list.
//! Every mutation is a load-modify-store cycle under that bucket's lock, and
//! each store replaces the whole document atomically. The lock is an in-process
//! mutex plus an advisory lock on `<bucket>.acl.json.lock`, so the server and
//! the admin CLI can share a data directory.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use strata_core::fs::{lock_document, read_optional, write_atomic, DocumentLock};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::acl::{BucketPermissions, Grant};
use crate::storage::validate_bucket_name;

const DOCUMENT_EXTENSION: &str = "acl.json";

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("No permissions for bucket: {0}")]
    NotFound(String),

    #[error("Permissions already exist for bucket: {0}")]
    AlreadyExists(String),

    #[error("Grant for {grantee} already exists on bucket {bucket}")]
    GrantExists { bucket: String, grantee: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed permissions document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Held for the duration of one load-modify-store cycle
struct BucketGuard {
    _document: DocumentLock,
    _local: OwnedMutexGuard<()>,
}

/// File-backed store of [`BucketPermissions`]
#[derive(Debug)]
pub struct PermissionStore {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PermissionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: DashMap::new(),
        }
    }

    /// Names that fail bucket validation never have a document
    fn document_path(&self, bucket: &str) -> Result<PathBuf, PermissionError> {
        validate_bucket_name(bucket).map_err(|_| PermissionError::NotFound(bucket.to_string()))?;
        Ok(self.root.join(format!("{bucket}.{DOCUMENT_EXTENSION}")))
    }

    async fn lock_bucket(&self, bucket: &str) -> Result<BucketGuard, PermissionError> {
        let path = self.document_path(bucket)?;
        let local = self.locks.entry(bucket.to_string()).or_default().clone();
        let local = local.lock_owned().await;
        let document = lock_document(&path).await?;
        Ok(BucketGuard {
            _document: document,
            _local: local,
        })
    }

    /// Load a bucket's document. A missing document is `NotFound`.
    pub async fn load(&self, bucket: &str) -> Result<BucketPermissions, PermissionError> {
        match read_optional(&self.document_path(bucket)?).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(PermissionError::NotFound(bucket.to_string())),
        }
    }

    async fn store(&self, permissions: &BucketPermissions) -> Result<(), PermissionError> {
        let bytes = serde_json::to_vec_pretty(permissions)?;
        write_atomic(&self.document_path(&permissions.name)?, &bytes).await?;
        Ok(())
    }

    /// Persist the document of a newly provisioned bucket
    pub async fn create(&self, permissions: &BucketPermissions) -> Result<(), PermissionError> {
        let _guard = self.lock_bucket(&permissions.name).await?;

        if read_optional(&self.document_path(&permissions.name)?)
            .await?
            .is_some()
        {
            return Err(PermissionError::AlreadyExists(permissions.name.clone()));
        }

        info!(bucket = %permissions.name, owner = %permissions.owner.id, "Creating bucket permissions");
        self.store(permissions).await
    }

    /// Run `f` against the loaded document and store the result, under the bucket lock
    pub async fn modify<T>(
        &self,
        bucket: &str,
        f: impl FnOnce(&mut BucketPermissions) -> Result<T, PermissionError>,
    ) -> Result<T, PermissionError> {
        let _guard = self.lock_bucket(bucket).await?;

        let mut permissions = self.load(bucket).await?;
        let result = f(&mut permissions)?;
        self.store(&permissions).await?;
        Ok(result)
    }

    /// Append a grant. Fails if the grantee already holds one on this bucket.
    pub async fn save_new_grant(&self, bucket: &str, grant: Grant) -> Result<(), PermissionError> {
        self.modify(bucket, |permissions| {
            if permissions.grant_for(&grant.grantee_id).is_some() {
                return Err(PermissionError::GrantExists {
                    bucket: bucket.to_string(),
                    grantee: grant.grantee_id.clone(),
                });
            }
            debug!(bucket, grantee = %grant.grantee_id, permission = %grant.permission, "Saving new grant");
            permissions.grants.push(grant);
            Ok(())
        })
        .await
    }

    /// Replace the grantee's existing grant. Returns whether one was replaced;
    /// when none matches the document is left untouched.
    pub async fn update_grant(&self, bucket: &str, grant: Grant) -> Result<bool, PermissionError> {
        let _guard = self.lock_bucket(bucket).await?;

        let mut permissions = self.load(bucket).await?;
        let Some(existing) = permissions
            .grants
            .iter_mut()
            .find(|g| g.grantee_id == grant.grantee_id)
        else {
            debug!(bucket, grantee = %grant.grantee_id, "No grant to update");
            return Ok(false);
        };

        *existing = grant;
        self.store(&permissions).await?;
        Ok(true)
    }

    /// Update the grantee's grant or append a new one
    pub async fn upsert_grant(&self, bucket: &str, grant: Grant) -> Result<(), PermissionError> {
        self.modify(bucket, |permissions| {
            permissions.upsert_grant(grant);
            Ok(())
        })
        .await
    }

    /// Replace the whole document of an existing bucket
    pub async fn update_bucket_permissions(
        &self,
        bucket: &str,
        permissions: BucketPermissions,
    ) -> Result<(), PermissionError> {
        self.modify(bucket, move |current| {
            *current = permissions;
            current.name = bucket.to_string();
            Ok(())
        })
        .await
    }

    /// Remove a bucket's document; a missing document is not an error
    pub async fn delete(&self, bucket: &str) -> Result<(), PermissionError> {
        let Ok(path) = self.document_path(bucket) else {
            return Ok(());
        };
        let _guard = self.lock_bucket(bucket).await?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                info!(bucket, "Deleted bucket permissions");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Every stored document, ordered by bucket name
    pub async fn list(&self) -> Result<Vec<BucketPermissions>, PermissionError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{DOCUMENT_EXTENSION}");
        let mut documents = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(bucket) = name.to_str().and_then(|n| n.strip_suffix(&suffix)) else {
                continue;
            };
            // Temp files from in-flight writes start with '.'
            if bucket.starts_with('.') {
                continue;
            }
            match self.load(bucket).await {
                Ok(doc) => documents.push(doc),
                Err(PermissionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        documents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(documents)
    }
}

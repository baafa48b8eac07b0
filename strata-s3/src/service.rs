//! Strata S3 service assembly

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Duration;
use strata_auth::{CredentialStore, SigV4Verifier, SigningScope};

use crate::authz::Authorizer;
use crate::handlers::S3State;
use crate::permissions::PermissionStore;
use crate::storage::{FsObjectStorage, ObjectStorage};

/// Subdirectory of the data directory holding bucket ACL documents
pub const ACL_DIR: &str = "acl";
/// Subdirectory of the data directory holding bucket contents
pub const BUCKETS_DIR: &str = "buckets";

/// Settings for building the service
#[derive(Debug, Clone)]
pub struct S3Config {
    pub data_dir: PathBuf,
    pub scope: SigningScope,
    /// `None` disables the clock skew check
    pub max_skew: Option<Duration>,
    pub bypass_signatures: bool,
}

impl S3Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            scope: SigningScope::default(),
            max_skew: Some(Duration::minutes(15)),
            bypass_signatures: false,
        }
    }
}

/// The stores of one data directory
pub struct StrataS3 {
    credentials: Arc<CredentialStore>,
    permissions: Arc<PermissionStore>,
    storage: Arc<dyn ObjectStorage>,
}

impl StrataS3 {
    /// Open the stores under `data_dir`; nothing is created until first write
    pub fn open(data_dir: &Path) -> Self {
        Self {
            credentials: Arc::new(CredentialStore::in_dir(data_dir)),
            permissions: Arc::new(PermissionStore::new(data_dir.join(ACL_DIR))),
            storage: Arc::new(FsObjectStorage::new(data_dir.join(BUCKETS_DIR))),
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn permissions(&self) -> &Arc<PermissionStore> {
        &self.permissions
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Handler state wired to these stores
    pub fn into_state(self, config: &S3Config) -> S3State {
        let verifier = SigV4Verifier::new(self.credentials.clone(), config.scope.clone())
            .with_max_skew(config.max_skew);
        let authorizer = Authorizer::new(
            self.credentials.clone(),
            self.permissions.clone(),
            self.storage.clone(),
            verifier,
        )
        .with_signature_bypass(config.bypass_signatures);

        S3State {
            authorizer,
            storage: self.storage,
            permissions: self.permissions,
            credentials: self.credentials,
            region: config.scope.region.clone(),
        }
    }
}

impl S3State {
    /// Build handler state from a config
    pub fn from_config(config: &S3Config) -> Self {
        StrataS3::open(&config.data_dir).into_state(config)
    }
}

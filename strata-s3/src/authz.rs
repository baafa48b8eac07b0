//! Request authorization
//!
//! Every S3 request passes through [`Authorizer::authorize`], which walks a fixed
//! sequence of stages:
//!
//! 1. load the bucket's ACL document (bucket-scoped requests only)
//! 2. reject sidecar keys and load the object's metadata if present
//! 3. allow anonymously when the bucket ACL or the object's public flag permit it
//! 4. verify the SigV4 signature (header or presigned query)
//! 5. resolve the caller's identity
//! 6. check the caller's grant on the bucket
//!
//! Any failure is an opaque denial to the client; the stage and reason are logged.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use http::header::AUTHORIZATION;
use http::{HeaderMap, Method, Uri};
use strata_auth::{
    is_presigned, Credential, CredentialStore, PresignError, SigV4Error, SigV4Verifier,
    SignableRequest,
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::acl::{has_acl_headers, BucketPermissions, Grant, Permission};
use crate::metadata::{is_sidecar_key, ObjectMetadata};
use crate::permissions::{PermissionError, PermissionStore};
use crate::storage::{validate_key, ObjectStorage, StorageError};

/// Whether a route reads or writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    pub fn from_method(method: &Method) -> Option<Self> {
        match *method {
            Method::GET | Method::HEAD => Some(Self::Read),
            Method::PUT | Method::POST | Method::DELETE => Some(Self::Write),
            _ => None,
        }
    }

    fn permitted_by(self, permission: Permission, acl_operation: bool) -> bool {
        match (self, acl_operation) {
            (Self::Read, false) => permission.is_read(),
            (Self::Write, false) => permission.is_write(),
            (Self::Read, true) => permission.is_acl_reading(),
            (Self::Write, true) => permission.is_acl_modification(),
        }
    }
}

/// Stage at which a request was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    PermissionsLoaded,
    MetadataChecked,
    SignatureRequired,
    IdentityResolved,
    AclChecked,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionsLoaded => "permissions_loaded",
            Self::MetadataChecked => "metadata_checked",
            Self::SignatureRequired => "signature_required",
            Self::IdentityResolved => "identity_resolved",
            Self::AclChecked => "acl_checked",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("access denied at {stage}: {reason}")]
pub struct AccessDenied {
    pub stage: Stage,
    pub reason: String,
}

impl AccessDenied {
    pub fn new(stage: Stage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error(transparent)]
    Denied(#[from] AccessDenied),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(Method),

    #[error("{0}")]
    InvalidKey(String),
}

/// The parts of a request the authorizer looks at
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub bucket: Option<&'a str>,
    pub key: Option<&'a str>,
    /// The `?acl` sub-resource was addressed
    pub acl_query: bool,
}

impl<'a> AccessRequest<'a> {
    pub fn new(method: &'a Method, uri: &'a Uri, headers: &'a HeaderMap) -> Self {
        Self {
            method,
            uri,
            headers,
            bucket: None,
            key: None,
            acl_query: false,
        }
    }

    #[must_use]
    pub fn bucket(mut self, bucket: &'a str) -> Self {
        self.bucket = Some(bucket);
        self
    }

    #[must_use]
    pub fn key(mut self, key: &'a str) -> Self {
        self.key = Some(key);
        self
    }

    #[must_use]
    pub fn acl_query(mut self, acl_query: bool) -> Self {
        self.acl_query = acl_query;
        self
    }

    /// Reads or changes ACL state: `?acl`, or ACL headers on a bucket PUT
    pub fn is_acl_operation(&self) -> bool {
        self.acl_query
            || (self.key.is_none() && *self.method == Method::PUT && has_acl_headers(self.headers))
    }

    fn is_bucket_creation(&self) -> bool {
        self.key.is_none() && *self.method == Method::PUT && !self.acl_query
    }
}

/// How a request came to be allowed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Bucket ACL or object flag allows anonymous access
    Public,
    /// Caller's grant covers the access
    Granted,
    /// Root-level request by a known identity
    Root,
    /// Creation of a bucket that has no ACL document yet
    Provisioning,
}

/// What an allowed request carries into its handler
#[derive(Debug, Clone)]
pub struct AuthorizationResult {
    pub decision: Decision,
    pub session: Option<Credential>,
    pub permissions: Option<BucketPermissions>,
    pub metadata: Option<ObjectMetadata>,
}

impl AuthorizationResult {
    /// The caller's grant on the addressed bucket
    pub fn session_grant(&self) -> Option<&Grant> {
        let session = self.session.as_ref()?;
        self.permissions.as_ref()?.grant_for(&session.access_key_id)
    }

    /// Access key of the caller, if one was resolved
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|c| c.access_key_id.as_str())
    }
}

fn sigv4_denial(error: SigV4Error) -> AccessDenied {
    let stage = match error {
        SigV4Error::UnknownAccessKey(_) | SigV4Error::Credentials(_) => Stage::IdentityResolved,
        _ => Stage::SignatureRequired,
    };
    AccessDenied::new(stage, error.to_string())
}

/// Combines the credential, permission and object stores into access decisions
pub struct Authorizer {
    credentials: Arc<CredentialStore>,
    permissions: Arc<PermissionStore>,
    storage: Arc<dyn ObjectStorage>,
    verifier: SigV4Verifier,
    bypass_signatures: bool,
}

impl Authorizer {
    pub fn new(
        credentials: Arc<CredentialStore>,
        permissions: Arc<PermissionStore>,
        storage: Arc<dyn ObjectStorage>,
        verifier: SigV4Verifier,
    ) -> Self {
        Self {
            credentials,
            permissions,
            storage,
            verifier,
            bypass_signatures: false,
        }
    }

    /// Treat the raw `Authorization` header as an access key, skipping SigV4.
    /// For local development only.
    #[must_use]
    pub fn with_signature_bypass(mut self, bypass: bool) -> Self {
        if bypass {
            warn!("SIGNATURE VERIFICATION DISABLED: any caller naming an access key is trusted");
        }
        self.bypass_signatures = bypass;
        self
    }

    pub async fn authorize(
        &self,
        request: &AccessRequest<'_>,
    ) -> Result<AuthorizationResult, AuthzError> {
        let result = self.decide(request).await;

        match &result {
            Ok(allowed) => debug!(
                method = %request.method,
                bucket = ?request.bucket,
                key = ?request.key,
                decision = ?allowed.decision,
                session = ?allowed.session_id(),
                "Request authorized"
            ),
            Err(AuthzError::Denied(denied)) => warn!(
                method = %request.method,
                bucket = ?request.bucket,
                key = ?request.key,
                stage = %denied.stage,
                reason = %denied.reason,
                "Access denied"
            ),
            Err(_) => {}
        }
        result
    }

    async fn decide(&self, request: &AccessRequest<'_>) -> Result<AuthorizationResult, AuthzError> {
        let access = Access::from_method(request.method)
            .ok_or_else(|| AuthzError::MethodNotAllowed(request.method.clone()))?;

        let Some(bucket) = request.bucket else {
            let session = self.authenticate(request).await?;
            return Ok(AuthorizationResult {
                decision: Decision::Root,
                session: Some(session),
                permissions: None,
                metadata: None,
            });
        };

        let permissions = match self.permissions.load(bucket).await {
            Ok(permissions) => permissions,
            Err(PermissionError::NotFound(_)) if request.is_bucket_creation() => {
                let session = self.authenticate(request).await?;
                return Ok(AuthorizationResult {
                    decision: Decision::Provisioning,
                    session: Some(session),
                    permissions: None,
                    metadata: None,
                });
            }
            Err(e) => {
                return Err(AccessDenied::new(Stage::PermissionsLoaded, e.to_string()).into());
            }
        };

        let metadata = match request.key {
            Some(key) => self.check_object(bucket, key).await?,
            None => None,
        };

        let acl_operation = request.is_acl_operation();
        if !acl_operation {
            let public = match access {
                Access::Write => permissions.acl.allows_public_write(),
                Access::Read => {
                    permissions.acl.allows_public_read()
                        || metadata.as_ref().is_some_and(|m| m.public)
                }
            };
            if public {
                return Ok(AuthorizationResult {
                    decision: Decision::Public,
                    session: None,
                    permissions: Some(permissions),
                    metadata,
                });
            }
        }

        let session = self.authenticate(request).await?;

        let grant = permissions
            .grant_for(&session.access_key_id)
            .ok_or_else(|| AccessDenied::new(Stage::AclChecked, "no grant for caller"))?;
        if !access.permitted_by(grant.permission, acl_operation) {
            return Err(AccessDenied::new(
                Stage::AclChecked,
                format!(
                    "{} does not permit {access:?}{}",
                    grant.permission,
                    if acl_operation { " of ACL" } else { "" }
                ),
            )
            .into());
        }

        Ok(AuthorizationResult {
            decision: Decision::Granted,
            session: Some(session),
            permissions: Some(permissions),
            metadata,
        })
    }

    async fn check_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectMetadata>, AuthzError> {
        if is_sidecar_key(key) {
            return Err(AccessDenied::new(Stage::MetadataChecked, "key names a metadata sidecar").into());
        }
        validate_key(key).map_err(|e| AuthzError::InvalidKey(e.to_string()))?;

        match self.storage.load_metadata(bucket, key).await {
            Ok(metadata) => Ok(metadata),
            Err(StorageError::InvalidKey(reason)) => Err(AuthzError::InvalidKey(reason)),
            Err(e) => Err(AccessDenied::new(Stage::MetadataChecked, e.to_string()).into()),
        }
    }

    async fn authenticate(&self, request: &AccessRequest<'_>) -> Result<Credential, AccessDenied> {
        if self.bypass_signatures {
            return self.bypass_identity(request).await;
        }

        let signable = SignableRequest::new(request.method, request.uri, request.headers);
        if is_presigned(request.uri) {
            self.verifier
                .verify_presigned(&signable, &Utc::now())
                .await
                .map_err(|e| match e {
                    PresignError::SigV4(e) => sigv4_denial(e),
                    other => AccessDenied::new(Stage::SignatureRequired, other.to_string()),
                })
        } else {
            self.verifier.verify(&signable).await.map_err(sigv4_denial)
        }
    }

    async fn bypass_identity(&self, request: &AccessRequest<'_>) -> Result<Credential, AccessDenied> {
        let raw = request
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AccessDenied::new(Stage::SignatureRequired, "missing Authorization header"))?;

        match self.credentials.find(raw.trim()).await {
            Ok(Some(credential)) => Ok(credential),
            Ok(None) => Err(AccessDenied::new(Stage::IdentityResolved, "unknown access key")),
            Err(e) => Err(AccessDenied::new(Stage::IdentityResolved, e.to_string())),
        }
    }
}

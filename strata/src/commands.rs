//! Administrative commands run against a data directory

use anyhow::{anyhow, bail, Context};
use chrono::Utc;
use http::Method;
use strata_auth::presign::object_path;
use strata_auth::{presign_url, Credential, PresignRequest, SigningScope};
use strata_s3::acl::{BucketAcl, BucketPermissions, Grant, Permission};
use strata_s3::StrataS3;
use tracing::info;

async fn require_credential(stores: &StrataS3, access_key: &str) -> anyhow::Result<Credential> {
    stores
        .credentials()
        .find(access_key)
        .await?
        .ok_or_else(|| anyhow!("unknown access key: {access_key}"))
}

pub async fn create_credentials(stores: &StrataS3, name: &str) -> anyhow::Result<Credential> {
    let credential = stores.credentials().generate(name).await?;
    info!(access_key = %credential.access_key_id, name, "Created credentials");
    Ok(credential)
}

/// Stored credentials without their secrets
pub async fn list_credentials(stores: &StrataS3) -> anyhow::Result<Vec<(String, String)>> {
    Ok(stores
        .credentials()
        .load_all()
        .await?
        .into_iter()
        .map(|c| (c.access_key_id, c.display_name))
        .collect())
}

/// Create a bucket owned by `owner` with an optional canned ACL
pub async fn create_bucket(
    stores: &StrataS3,
    bucket: &str,
    owner: &str,
    acl: Option<&str>,
) -> anyhow::Result<BucketPermissions> {
    let owner = require_credential(stores, owner).await?;
    let acl = match acl {
        Some(value) => {
            BucketAcl::from_canned(value).ok_or_else(|| anyhow!("invalid canned ACL: {value}"))?
        }
        None => BucketAcl::Private,
    };

    stores
        .storage()
        .create_bucket(bucket)
        .await
        .with_context(|| format!("creating bucket {bucket}"))?;

    let mut permissions = BucketPermissions::new(bucket, &owner);
    permissions.acl = acl;
    stores.permissions().create(&permissions).await?;
    info!(bucket, owner = %owner.access_key_id, acl = acl.as_canned(), "Created bucket");
    Ok(permissions)
}

/// Give `access_key` a permission on `bucket`, replacing any grant it held
pub async fn grant(
    stores: &StrataS3,
    bucket: &str,
    access_key: &str,
    permission: &str,
) -> anyhow::Result<Grant> {
    let permission: Permission = permission.parse()?;
    let credential = require_credential(stores, access_key).await?;

    let grant = Grant::for_credential(&credential, permission);
    stores
        .permissions()
        .upsert_grant(bucket, grant.clone())
        .await
        .with_context(|| format!("granting on bucket {bucket}"))?;
    info!(bucket, grantee = %access_key, %permission, "Granted permission");
    Ok(grant)
}

/// Host and scheme of an endpoint such as `http://localhost:9000`
fn split_endpoint(endpoint: &str) -> (&str, &str) {
    let (scheme, rest) = endpoint.split_once("://").unwrap_or(("http", endpoint));
    (scheme, rest.trim_end_matches('/'))
}

/// What a presigned URL grants access to
#[derive(Debug, Clone)]
pub struct PresignTarget<'a> {
    /// Base URL clients will use, e.g. `http://localhost:9000`
    pub endpoint: &'a str,
    pub method: &'a str,
    pub bucket: &'a str,
    pub key: &'a str,
    pub access_key: &'a str,
    pub expires_secs: i64,
}

/// Presigned URL for one object
pub async fn presign(
    stores: &StrataS3,
    scope: &SigningScope,
    target: &PresignTarget<'_>,
) -> anyhow::Result<String> {
    let method: Method = target
        .method
        .to_ascii_uppercase()
        .parse()
        .with_context(|| format!("invalid method: {}", target.method))?;
    if target.key.is_empty() {
        bail!("object key must not be empty");
    }
    let credential = require_credential(stores, target.access_key).await?;

    let (scheme, host) = split_endpoint(target.endpoint);
    let path = object_path(target.bucket, target.key);
    let url = presign_url(
        &PresignRequest {
            method,
            host,
            path: &path,
            timestamp: Utc::now(),
            expires_secs: target.expires_secs,
        },
        &credential,
        scope,
    )?;

    Ok(format!("{scheme}://{host}{url}"))
}

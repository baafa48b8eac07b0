//! Bucket access-control model
//!
//! A bucket carries a canned ACL that applies to every caller, plus explicit
//! per-identity grants. Grants are what authenticated requests are checked
//! against; the canned ACL only opens the anonymous fast path.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use strata_auth::{Credential, CredentialError, CredentialStore};
use thiserror::Error;

use crate::permissions::PermissionError;

/// Header carrying a canned ACL
pub const X_AMZ_ACL: &str = "x-amz-acl";
const GRANT_HEADER_PREFIX: &str = "x-amz-grant-";

/// Capability held by a grant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Read,
    Write,
    ReadAcp,
    WriteAcp,
    FullControl,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::ReadAcp => "READ_ACP",
            Self::WriteAcp => "WRITE_ACP",
            Self::FullControl => "FULL_CONTROL",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::WriteAcp | Self::FullControl)
    }

    pub fn is_read(self) -> bool {
        matches!(self, Self::Read | Self::ReadAcp | Self::FullControl)
    }

    /// May change the bucket's ACL or grants
    pub fn is_acl_modification(self) -> bool {
        matches!(self, Self::WriteAcp | Self::FullControl)
    }

    /// May read the bucket's ACL document
    pub fn is_acl_reading(self) -> bool {
        matches!(self, Self::ReadAcp | Self::FullControl)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = AclError;

    /// Accepts `READ_ACP`, `read-acp` and similar spellings
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "READ" => Ok(Self::Read),
            "WRITE" => Ok(Self::Write),
            "READ_ACP" => Ok(Self::ReadAcp),
            "WRITE_ACP" => Ok(Self::WriteAcp),
            "FULL_CONTROL" => Ok(Self::FullControl),
            _ => Err(AclError::UnknownPermission(s.to_string())),
        }
    }
}

/// Canned bucket-wide ACL
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BucketAcl {
    #[default]
    Private,
    PublicRead,
    PublicWrite,
    PublicReadWrite,
}

impl BucketAcl {
    pub fn from_canned(value: &str) -> Option<Self> {
        match value.trim() {
            "private" => Some(Self::Private),
            "public-read" => Some(Self::PublicRead),
            "public-write" => Some(Self::PublicWrite),
            "public-read-write" => Some(Self::PublicReadWrite),
            _ => None,
        }
    }

    pub fn as_canned(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::PublicRead => "public-read",
            Self::PublicWrite => "public-write",
            Self::PublicReadWrite => "public-read-write",
        }
    }

    pub fn allows_public_read(&self) -> bool {
        matches!(self, Self::PublicRead | Self::PublicReadWrite)
    }

    pub fn allows_public_write(&self) -> bool {
        matches!(self, Self::PublicWrite | Self::PublicReadWrite)
    }
}

/// An identity's permission on one bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub grantee_id: String,
    pub grantee_display_name: String,
    pub permission: Permission,
    pub date_added: DateTime<Utc>,
}

impl Grant {
    pub fn new(
        grantee_id: impl Into<String>,
        grantee_display_name: impl Into<String>,
        permission: Permission,
    ) -> Self {
        Self {
            grantee_id: grantee_id.into(),
            grantee_display_name: grantee_display_name.into(),
            permission,
            date_added: Utc::now(),
        }
    }

    pub fn for_credential(credential: &Credential, permission: Permission) -> Self {
        Self::new(
            &credential.access_key_id,
            &credential.display_name,
            permission,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub id: String,
    pub display_name: String,
}

impl From<&Credential> for Owner {
    fn from(credential: &Credential) -> Self {
        Self {
            id: credential.access_key_id.clone(),
            display_name: credential.display_name.clone(),
        }
    }
}

/// The persisted ACL document of a bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketPermissions {
    pub name: String,
    pub owner: Owner,
    #[serde(default)]
    pub acl: BucketAcl,
    #[serde(default)]
    pub grants: Vec<Grant>,
    pub creation_date: DateTime<Utc>,
}

impl BucketPermissions {
    /// A private bucket whose owner holds `FULL_CONTROL`
    pub fn new(name: impl Into<String>, owner: &Credential) -> Self {
        Self {
            name: name.into(),
            owner: Owner::from(owner),
            acl: BucketAcl::Private,
            grants: vec![Grant::for_credential(owner, Permission::FullControl)],
            creation_date: Utc::now(),
        }
    }

    pub fn grant_for(&self, grantee_id: &str) -> Option<&Grant> {
        self.grants.iter().find(|g| g.grantee_id == grantee_id)
    }

    /// Replace the grantee's grant in place, or append one
    pub fn upsert_grant(&mut self, grant: Grant) {
        match self
            .grants
            .iter_mut()
            .find(|g| g.grantee_id == grant.grantee_id)
        {
            Some(existing) => *existing = grant,
            None => self.grants.push(grant),
        }
    }

    /// Owner or holder of any grant
    pub fn is_visible_to(&self, id: &str) -> bool {
        self.owner.id == id || self.grant_for(id).is_some()
    }
}

#[derive(Debug, Error)]
pub enum AclError {
    #[error("Unknown ACL header: {0}")]
    UnknownHeader(String),

    #[error("Unknown permission: {0}")]
    UnknownPermission(String),

    #[error("Invalid canned ACL: {0}")]
    InvalidCannedAcl(String),

    #[error("Malformed grantee in {header}: {value}")]
    MalformedGrantee { header: String, value: String },

    #[error("Grantee does not exist: {0}")]
    UnknownGrantee(String),

    #[error("Session may not modify this bucket's ACL")]
    InsufficientPermission,

    #[error(transparent)]
    Permissions(#[from] PermissionError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

/// The ACL headers a request may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclHeader {
    GrantRead,
    GrantWrite,
    GrantReadAcp,
    GrantWriteAcp,
    GrantFullControl,
    Canned,
}

impl AclHeader {
    pub const ALL: [AclHeader; 6] = [
        Self::GrantRead,
        Self::GrantWrite,
        Self::GrantReadAcp,
        Self::GrantWriteAcp,
        Self::GrantFullControl,
        Self::Canned,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::GrantRead => "x-amz-grant-read",
            Self::GrantWrite => "x-amz-grant-write",
            Self::GrantReadAcp => "x-amz-grant-read-acp",
            Self::GrantWriteAcp => "x-amz-grant-write-acp",
            Self::GrantFullControl => "x-amz-grant-full-control",
            Self::Canned => X_AMZ_ACL,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|h| h.name() == name)
    }

    /// Permission conferred by a grant header; `None` for the canned ACL header
    pub fn permission(self) -> Option<Permission> {
        match self {
            Self::GrantRead => Some(Permission::Read),
            Self::GrantWrite => Some(Permission::Write),
            Self::GrantReadAcp => Some(Permission::ReadAcp),
            Self::GrantWriteAcp => Some(Permission::WriteAcp),
            Self::GrantFullControl => Some(Permission::FullControl),
            Self::Canned => None,
        }
    }
}

fn is_acl_header_name(name: &str) -> bool {
    name == X_AMZ_ACL || name.starts_with(GRANT_HEADER_PREFIX)
}

/// True when the request tries to change ACL state
pub fn has_acl_headers(headers: &HeaderMap) -> bool {
    headers.keys().any(|name| is_acl_header_name(name.as_str()))
}

/// A grant requested by header, not yet resolved against the credential store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedGrant {
    pub grantee_id: String,
    pub permission: Permission,
}

/// ACL changes carried by a request's headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclChangeSet {
    pub canned: Option<BucketAcl>,
    pub grants: Vec<RequestedGrant>,
}

/// Parse `id="..."` grantee lists, e.g. `id="AK1", id="AK2"`
fn parse_grantees(header: &str, value: &str) -> Result<Vec<String>, AclError> {
    let malformed = || AclError::MalformedGrantee {
        header: header.to_string(),
        value: value.to_string(),
    };

    value
        .split(',')
        .map(|part| {
            let (kind, id) = part.trim().split_once('=').ok_or_else(malformed)?;
            if !kind.trim().eq_ignore_ascii_case("id") {
                return Err(malformed());
            }
            let id = id.trim().trim_matches('"');
            if id.is_empty() {
                return Err(malformed());
            }
            Ok(id.to_string())
        })
        .collect()
}

/// Collect the ACL changes in `headers`
///
/// Every problem is reported; the change set holds whatever parsed cleanly.
pub fn parse_acl_headers(headers: &HeaderMap) -> (AclChangeSet, Vec<AclError>) {
    let mut changes = AclChangeSet::default();
    let mut errors = Vec::new();

    for (name, value) in headers {
        let name = name.as_str();
        if !is_acl_header_name(name) {
            continue;
        }

        let Some(header) = AclHeader::from_name(name) else {
            errors.push(AclError::UnknownHeader(name.to_string()));
            continue;
        };
        let value = String::from_utf8_lossy(value.as_bytes());

        match header.permission() {
            None => match BucketAcl::from_canned(&value) {
                Some(acl) => changes.canned = Some(acl),
                None => errors.push(AclError::InvalidCannedAcl(value.into_owned())),
            },
            Some(permission) => match parse_grantees(name, &value) {
                Ok(ids) => changes.grants.extend(
                    ids.into_iter()
                        .map(|grantee_id| RequestedGrant { grantee_id, permission }),
                ),
                Err(e) => errors.push(e),
            },
        }
    }

    (changes, errors)
}

/// A change set whose grantees have been looked up
#[derive(Debug, Clone, Default)]
pub struct ResolvedAcl {
    pub canned: Option<BucketAcl>,
    pub grants: Vec<Grant>,
}

impl ResolvedAcl {
    /// Apply to a loaded document: canned ACL replaced, grants upserted in header order
    pub fn apply_to(&self, permissions: &mut BucketPermissions) {
        if let Some(acl) = self.canned {
            permissions.acl = acl;
        }
        for grant in &self.grants {
            permissions.upsert_grant(grant.clone());
        }
    }
}

/// Parse the request's ACL headers and resolve each grantee in the credential store
///
/// Unknown grantees are reported alongside parse errors and left out of the result.
pub async fn resolve_acl_headers(
    credentials: &CredentialStore,
    headers: &HeaderMap,
) -> Result<(ResolvedAcl, Vec<AclError>), CredentialError> {
    let (changes, mut errors) = parse_acl_headers(headers);
    let mut resolved = ResolvedAcl {
        canned: changes.canned,
        grants: Vec::with_capacity(changes.grants.len()),
    };

    let mut known: HashMap<String, Credential> = HashMap::new();
    for requested in changes.grants {
        if !known.contains_key(&requested.grantee_id) {
            match credentials.find(&requested.grantee_id).await? {
                Some(credential) => {
                    known.insert(requested.grantee_id.clone(), credential);
                }
                None => {
                    errors.push(AclError::UnknownGrantee(requested.grantee_id));
                    continue;
                }
            }
        }
        if let Some(credential) = known.get(&requested.grantee_id) {
            resolved
                .grants
                .push(Grant::for_credential(credential, requested.permission));
        }
    }

    Ok((resolved, errors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_permission_capabilities() {
        assert!(Permission::FullControl.is_write());
        assert!(Permission::Write.is_write());
        assert!(Permission::WriteAcp.is_write());
        assert!(!Permission::Read.is_write());
        assert!(!Permission::ReadAcp.is_write());

        assert!(Permission::Read.is_read());
        assert!(Permission::ReadAcp.is_read());
        assert!(Permission::FullControl.is_read());
        assert!(!Permission::Write.is_read());

        assert!(Permission::WriteAcp.is_acl_modification());
        assert!(Permission::FullControl.is_acl_modification());
        assert!(!Permission::Write.is_acl_modification());

        assert!(Permission::ReadAcp.is_acl_reading());
        assert!(Permission::FullControl.is_acl_reading());
        assert!(!Permission::Read.is_acl_reading());
    }

    #[test]
    fn test_permission_parsing() {
        assert_eq!("READ".parse::<Permission>().unwrap(), Permission::Read);
        assert_eq!("write-acp".parse::<Permission>().unwrap(), Permission::WriteAcp);
        assert_eq!(
            "full_control".parse::<Permission>().unwrap(),
            Permission::FullControl
        );
        assert!("admin".parse::<Permission>().is_err());
    }

    #[test]
    fn test_canned_acl() {
        assert_eq!(BucketAcl::from_canned("public-read"), Some(BucketAcl::PublicRead));
        assert_eq!(BucketAcl::from_canned("bogus"), None);
        assert!(BucketAcl::PublicReadWrite.allows_public_read());
        assert!(BucketAcl::PublicReadWrite.allows_public_write());
        assert!(!BucketAcl::PublicRead.allows_public_write());
        assert!(!BucketAcl::Private.allows_public_read());
    }

    #[test]
    fn test_document_serialization() {
        let owner = Credential::new("AK1", "SK1", "owner");
        let doc = BucketPermissions::new("demo", &owner);
        let json = serde_json::to_string(&doc).unwrap();

        assert!(json.contains("\"acl\":\"PRIVATE\""));
        assert!(json.contains("\"permission\":\"FULL_CONTROL\""));
        assert!(json.contains("\"granteeId\":\"AK1\""));

        let back: BucketPermissions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_upsert_grant_replaces_in_place() {
        let owner = Credential::new("AK1", "SK1", "owner");
        let mut doc = BucketPermissions::new("demo", &owner);

        doc.upsert_grant(Grant::new("AK2", "reader", Permission::Read));
        doc.upsert_grant(Grant::new("AK2", "reader", Permission::Write));

        assert_eq!(doc.grants.len(), 2);
        assert_eq!(doc.grant_for("AK2").unwrap().permission, Permission::Write);
        assert!(doc.is_visible_to("AK2"));
        assert!(!doc.is_visible_to("AK3"));
    }

    #[test]
    fn test_parse_acl_headers() {
        let (changes, errors) = parse_acl_headers(&headers(&[
            ("x-amz-grant-read", "id=\"AK2\", id=\"AK3\""),
            ("x-amz-grant-write-acp", "id=AK4"),
            ("x-amz-acl", "public-read"),
            ("content-type", "text/plain"),
        ]));

        assert!(errors.is_empty());
        assert_eq!(changes.canned, Some(BucketAcl::PublicRead));
        assert_eq!(
            changes.grants,
            vec![
                RequestedGrant {
                    grantee_id: "AK2".into(),
                    permission: Permission::Read
                },
                RequestedGrant {
                    grantee_id: "AK3".into(),
                    permission: Permission::Read
                },
                RequestedGrant {
                    grantee_id: "AK4".into(),
                    permission: Permission::WriteAcp
                },
            ]
        );
    }

    #[test]
    fn test_parse_acl_headers_reports_errors() {
        let (changes, errors) = parse_acl_headers(&headers(&[
            ("x-amz-grant-everything", "id=\"AK2\""),
            ("x-amz-grant-read", "emailAddress=\"a@b.c\""),
            ("x-amz-acl", "world-writable"),
            ("x-amz-grant-write", "id=\"AK5\""),
        ]));

        assert_eq!(errors.len(), 3);
        assert!(matches!(errors[0], AclError::UnknownHeader(_)));
        assert!(matches!(errors[1], AclError::MalformedGrantee { .. }));
        assert!(matches!(errors[2], AclError::InvalidCannedAcl(_)));
        assert_eq!(changes.grants.len(), 1);
        assert_eq!(changes.grants[0].grantee_id, "AK5");
    }

    #[test]
    fn test_has_acl_headers() {
        assert!(has_acl_headers(&headers(&[("x-amz-acl", "private")])));
        assert!(has_acl_headers(&headers(&[("x-amz-grant-read", "id=a")])));
        assert!(!has_acl_headers(&headers(&[("x-amz-date", "20240101T000000Z")])));
    }

    #[tokio::test]
    async fn test_resolve_acl_headers() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        store
            .add(Credential::new("AK2", "SK2", "reader"))
            .await
            .unwrap();

        let (resolved, errors) = resolve_acl_headers(
            &store,
            &headers(&[("x-amz-grant-read", "id=\"AK2\", id=\"GHOST\"")]),
        )
        .await
        .unwrap();

        assert_eq!(resolved.grants.len(), 1);
        assert_eq!(resolved.grants[0].grantee_display_name, "reader");
        assert!(matches!(errors.as_slice(), [AclError::UnknownGrantee(id)] if id == "GHOST"));
    }
}

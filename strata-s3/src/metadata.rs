//! Per-object sidecar metadata

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

/// Suffix of the sidecar file stored next to each object
pub const SIDECAR_SUFFIX: &str = ".strata-meta.json";

/// The only version an object ever has
pub const VERSION_ID: &str = "1";

/// True when a key names a sidecar rather than an object
pub fn is_sidecar_key(key: &str) -> bool {
    key.ends_with(SIDECAR_SUFFIX)
}

/// Quoted hex MD5 of the content
pub fn compute_etag(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}

/// Sidecar record, replaced wholesale on every upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub etag: String,
    pub key: String,
    /// Access key of the uploader; empty for anonymous uploads
    pub owner: String,
    pub public: bool,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
    pub version_id: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub user_metadata: BTreeMap<String, String>,
}

/// Caller-supplied attributes of an upload
#[derive(Debug, Clone, Default)]
pub struct ObjectAttributes {
    pub owner: String,
    pub public: bool,
    pub content_type: Option<String>,
    pub user_metadata: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn for_upload(key: &str, data: &[u8], attributes: ObjectAttributes) -> Self {
        let now = Utc::now();
        Self {
            etag: compute_etag(data),
            key: key.to_string(),
            owner: attributes.owner,
            public: attributes.public,
            size: data.len() as u64,
            last_modified: now,
            uploaded_at: now,
            version_id: VERSION_ID.to_string(),
            tags: BTreeMap::new(),
            content_type: attributes.content_type,
            user_metadata: attributes.user_metadata,
        }
    }
}

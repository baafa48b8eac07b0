//! ListObjectsV2 over a flat bucket walk
//!
//! The walk yields every file and directory; listing filters by prefix, folds
//! keys into common prefixes when the delimiter is `/`, and pages through the
//! merged key-ordered result.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::storage::{ObjectEntry, ObjectStorage, StorageError};

/// Default and upper bound for `max-keys`
pub const MAX_KEYS: usize = 1000;

const DIRECTORY_DELIMITER: &str = "/";

#[derive(Debug, Error)]
pub enum ListError {
    #[error("Invalid continuation token")]
    InvalidContinuationToken,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Listing parameters
#[derive(Debug, Clone, Default)]
pub struct ListRequest {
    pub prefix: String,
    pub delimiter: String,
    /// Capped at [`MAX_KEYS`]; `None` means the default
    pub max_keys: Option<usize>,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
}

impl ListRequest {
    pub fn effective_max_keys(&self) -> usize {
        self.max_keys.map_or(MAX_KEYS, |n| n.min(MAX_KEYS))
    }
}

/// A listed object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

impl From<ObjectEntry> for ListedObject {
    fn from(entry: ObjectEntry) -> Self {
        Self {
            key: entry.key,
            size: entry.size,
            etag: entry.etag,
            last_modified: entry.last_modified,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListResult {
    pub contents: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
    /// Contents plus common prefixes returned in this page
    pub key_count: usize,
}

enum Item {
    Object(ListedObject),
    Prefix,
}

pub fn encode_continuation_token(key: &str) -> String {
    STANDARD.encode(key.as_bytes())
}

pub fn decode_continuation_token(token: &str) -> Result<String, ListError> {
    STANDARD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or(ListError::InvalidContinuationToken)
}

/// Run a listing over walked entries
pub fn list(entries: Vec<ObjectEntry>, request: &ListRequest) -> Result<ListResult, ListError> {
    let group = request.delimiter == DIRECTORY_DELIMITER;

    // Keyed by object key or common prefix; a BTreeMap dedupes prefixes and orders both
    let mut items: BTreeMap<String, Item> = BTreeMap::new();
    for entry in entries {
        let Some(remainder) = entry.key.strip_prefix(request.prefix.as_str()) else {
            continue;
        };

        if !group {
            items.insert(entry.key.clone(), Item::Object(entry.into()));
            continue;
        }

        if remainder.is_empty() {
            continue;
        }
        match remainder.find('/') {
            Some(slash) => {
                let common = format!("{}{}", request.prefix, &remainder[..=slash]);
                items.entry(common).or_insert(Item::Prefix);
            }
            None => {
                items.insert(entry.key.clone(), Item::Object(entry.into()));
            }
        }
    }

    let marker = match &request.continuation_token {
        Some(token) => Some(decode_continuation_token(token)?),
        None => request.start_after.clone(),
    };

    let max_keys = request.effective_max_keys();
    let mut remaining = items
        .into_iter()
        .filter(|(key, _)| marker.as_ref().map_or(true, |m| key > m))
        .peekable();

    let mut result = ListResult::default();
    let mut last_key = None;
    while result.key_count < max_keys {
        let Some((key, item)) = remaining.next() else {
            break;
        };
        match item {
            Item::Object(object) => result.contents.push(object),
            Item::Prefix => result.common_prefixes.push(key.clone()),
        }
        result.key_count += 1;
        last_key = Some(key);
    }

    if max_keys > 0 && remaining.peek().is_some() {
        result.is_truncated = true;
        result.next_continuation_token = last_key.as_deref().map(encode_continuation_token);
    }

    Ok(result)
}

/// Walk a bucket and list it
pub async fn list_bucket(
    storage: &dyn ObjectStorage,
    bucket: &str,
    request: &ListRequest,
) -> Result<ListResult, ListError> {
    let entries = storage.walk(bucket).await?;
    list(entries, request)
}

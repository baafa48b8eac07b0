//! Durable access-key store
//!
//! All credentials for a deployment live in a single JSON document. Reads go
//! straight to disk; appends are serialized by a store-wide lock, plus an
//! advisory lock on `credentials.json.lock` shared with other processes, and land
//! via an atomic rename, so a reader never observes a half-written document.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use strata_core::fs::{lock_document, read_optional, write_atomic};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Default file name of the credential document inside the data directory
pub const CREDENTIALS_FILE: &str = "credentials.json";

const ACCESS_KEY_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;
const ACCESS_KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SECRET_KEY_CHARSET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Errors from the credential store
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Access key already exists: {0}")]
    DuplicateAccessKey(String),

    #[error("Credential field must not be empty: {0}")]
    EmptyField(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed credential document: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// An issued access key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub access_key_id: String,
    pub secret_key: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_key: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
            display_name: display_name.into(),
            created_at: Utc::now(),
        }
    }

    /// Create a credential with a random access key and secret
    pub fn generate(display_name: impl Into<String>) -> Self {
        let mut rng = rand::thread_rng();
        let access_key_id = random_string(&mut rng, ACCESS_KEY_CHARSET, ACCESS_KEY_LEN);
        let secret_key = random_string(&mut rng, SECRET_KEY_CHARSET, SECRET_KEY_LEN);
        Self::new(access_key_id, secret_key, display_name)
    }
}

fn random_string(rng: &mut impl Rng, charset: &[u8], len: usize) -> String {
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CredentialDocument {
    #[serde(default)]
    credentials: Vec<Credential>,
}

/// File-backed credential store
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store rooted in `data_dir` using the default file name
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(CREDENTIALS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All credentials, in issue order. A missing document is an empty store.
    pub async fn load_all(&self) -> Result<Vec<Credential>, CredentialError> {
        Ok(self.read_document().await?.credentials)
    }

    /// Look up a credential by access key
    pub async fn find(&self, access_key_id: &str) -> Result<Option<Credential>, CredentialError> {
        Ok(self
            .read_document()
            .await?
            .credentials
            .into_iter()
            .find(|c| c.access_key_id == access_key_id))
    }

    /// Append a credential, rejecting a duplicate access key
    pub async fn add(&self, credential: Credential) -> Result<(), CredentialError> {
        if credential.access_key_id.is_empty() {
            return Err(CredentialError::EmptyField("accessKeyId"));
        }
        if credential.secret_key.is_empty() {
            return Err(CredentialError::EmptyField("secretKey"));
        }

        let _guard = self.write_lock.lock().await;
        let _document_lock = lock_document(&self.path).await?;
        let mut document = self.read_document().await?;

        if document
            .credentials
            .iter()
            .any(|c| c.access_key_id == credential.access_key_id)
        {
            return Err(CredentialError::DuplicateAccessKey(
                credential.access_key_id,
            ));
        }

        info!(
            access_key = %credential.access_key_id,
            display_name = %credential.display_name,
            "Adding credential"
        );
        document.credentials.push(credential);
        self.write_document(&document).await
    }

    /// Generate and persist a new credential
    pub async fn generate(
        &self,
        display_name: impl Into<String>,
    ) -> Result<Credential, CredentialError> {
        let credential = Credential::generate(display_name);
        self.add(credential.clone()).await?;
        Ok(credential)
    }

    async fn read_document(&self) -> Result<CredentialDocument, CredentialError> {
        match read_optional(&self.path).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(CredentialDocument::default()),
        }
    }

    async fn write_document(&self, document: &CredentialDocument) -> Result<(), CredentialError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(&self.path, &bytes).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_shape() {
        let credential = Credential::generate("alice");

        assert_eq!(credential.access_key_id.len(), 20);
        assert!(credential
            .access_key_id
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        assert_eq!(credential.secret_key.len(), 40);
        assert_eq!(credential.display_name, "alice");
        assert_ne!(credential, Credential::generate("alice"));
    }

    #[tokio::test]
    async fn test_missing_document_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());

        assert!(store.load_all().await.unwrap().is_empty());
        assert!(store.find("AKIDEXAMPLE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());

        store
            .add(Credential::new("AK1", "SK1", "first"))
            .await
            .unwrap();
        let generated = store.generate("second").await.unwrap();

        let found = store.find("AK1").await.unwrap().unwrap();
        assert_eq!(found.secret_key, "SK1");
        assert_eq!(found.display_name, "first");

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[1].access_key_id, generated.access_key_id);

        // A fresh handle sees the persisted document
        let reopened = CredentialStore::in_dir(dir.path());
        assert!(reopened.find(&generated.access_key_id).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_handles_append_without_losing_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let first = std::sync::Arc::new(CredentialStore::in_dir(dir.path()));
        let second = std::sync::Arc::new(CredentialStore::in_dir(dir.path()));

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = if i % 2 == 0 { first.clone() } else { second.clone() };
            handles.push(tokio::spawn(async move {
                store.generate(format!("user-{i}")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(first.load_all().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_duplicate_access_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());

        store.add(Credential::new("AK1", "SK1", "a")).await.unwrap();
        let err = store
            .add(Credential::new("AK1", "other", "b"))
            .await
            .unwrap_err();

        assert!(matches!(err, CredentialError::DuplicateAccessKey(ref k) if k == "AK1"));
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_fields_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());

        let err = store.add(Credential::new("", "SK", "x")).await.unwrap_err();
        assert!(matches!(err, CredentialError::EmptyField("accessKeyId")));

        let err = store.add(Credential::new("AK", "", "x")).await.unwrap_err();
        assert!(matches!(err, CredentialError::EmptyField("secretKey")));
    }

    #[tokio::test]
    async fn test_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::in_dir(dir.path());
        tokio::fs::write(store.path(), b"not json").await.unwrap();

        assert!(matches!(
            store.load_all().await,
            Err(CredentialError::Malformed(_))
        ));
    }
}

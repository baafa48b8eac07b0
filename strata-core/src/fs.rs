//! Filesystem helpers for persisted documents

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use uuid::Uuid;

/// Replace `path` with `contents` so that readers see either the old or the new
/// document, never a partial one.
///
/// The data is written to a sibling temporary file and renamed over the target.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::fs::write(&tmp, contents).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

/// True for the sibling files [`write_atomic`] creates while a write is in flight
pub fn is_temp_file_name(name: &str) -> bool {
    let Some(inner) = name
        .strip_prefix('.')
        .and_then(|n| n.strip_suffix(".tmp"))
    else {
        return false;
    };
    inner
        .rsplit_once('.')
        .is_some_and(|(_, id)| id.len() == 32 && id.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Read a file, mapping "not found" to `None`
pub async fn read_optional(path: &Path) -> io::Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Exclusive advisory lock on a document, honoured by every process that
/// opens the same data directory. Released when dropped.
#[derive(Debug)]
pub struct DocumentLock {
    file: File,
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Path of the lock file guarding `path`
pub fn lock_path(path: &Path) -> io::Result<PathBuf> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    Ok(path.with_file_name(format!("{file_name}.lock")))
}

/// Wait for the exclusive lock on `path`. The lock file lives next to the
/// document and is never removed.
pub async fn lock_document(path: &Path) -> io::Result<DocumentLock> {
    let lock_path = lock_path(path)?;
    if let Some(parent) = lock_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    tokio::task::spawn_blocking(move || {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(DocumentLock { file })
    })
    .await
    .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"second");

        // No temporary files left behind
        let mut entries = tokio::fs::read_dir(path.parent().unwrap()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["doc.json".to_string()]);
    }

    #[test]
    fn test_temp_file_names() {
        assert!(is_temp_file_name(
            ".doc.json.0123456789abcdef0123456789abcdef.tmp"
        ));
        assert!(!is_temp_file_name(".gitignore"));
        assert!(!is_temp_file_name(".notes.tmp"));
        assert!(!is_temp_file_name("doc.json"));
    }

    #[tokio::test]
    async fn test_document_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        let held = lock_document(&path).await.unwrap();
        assert!(dir.path().join("doc.json.lock").exists());

        // A second handle on the same file waits until the first is dropped
        let waiter = tokio::spawn({
            let path = path.clone();
            async move { lock_document(&path).await.unwrap() }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let _second = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_lock_path() {
        assert_eq!(
            lock_path(Path::new("/data/acl/demo.acl.json")).unwrap(),
            PathBuf::from("/data/acl/demo.acl.json.lock")
        );
    }

    #[tokio::test]
    async fn test_read_optional_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_optional(&dir.path().join("absent")).await.unwrap();
        assert!(result.is_none());
    }
}

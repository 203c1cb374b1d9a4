//! Folder-backed key storage.
//!
//! Layout inside the folder:
//!
//! - `{prefix}{fingerprint}`: the armored (or base64) private key
//! - `metadata-{prefix}{fingerprint}`: optional JSON metadata
//!
//! Files are created with mode 0600 on unix.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{StorageBackend, StoredKey};
use crate::types::{KeywardenError, Result};

const METADATA_PREFIX: &str = "metadata-";

pub struct DiskBackend {
    folder: PathBuf,
    prefix: String,
}

impl DiskBackend {
    /// Create the backend, making sure the folder exists.
    pub async fn new(folder: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let folder = folder.into();
        fs::create_dir_all(&folder).await.map_err(|e| {
            KeywardenError::Storage(format!("cannot create {}: {}", folder.display(), e))
        })?;
        Ok(Self {
            folder,
            prefix: prefix.into(),
        })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.folder.join(format!("{}{}", self.prefix, key))
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.folder
            .join(format!("{}{}{}", METADATA_PREFIX, self.prefix, key))
    }
}

async fn write_private(path: &Path, contents: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options
        .open(path)
        .await
        .map_err(|e| KeywardenError::Storage(format!("cannot open {}: {}", path.display(), e)))?;
    file.write_all(contents.as_bytes())
        .await
        .map_err(|e| KeywardenError::Storage(format!("cannot write {}: {}", path.display(), e)))?;
    file.flush().await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(KeywardenError::Storage(format!(
            "cannot remove {}: {}",
            path.display(),
            e
        ))),
    }
}

#[async_trait::async_trait]
impl StorageBackend for DiskBackend {
    fn name(&self) -> &str {
        "disk"
    }

    fn path(&self) -> String {
        format!("{}/{}*", self.folder.display(), self.prefix)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.folder).await.map_err(|e| {
            KeywardenError::Storage(format!("cannot list {}: {}", self.folder.display(), e))
        })?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(METADATA_PREFIX) {
                continue;
            }
            if let Some(key) = name.strip_prefix(&self.prefix) {
                if !key.is_empty() {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn read(&self, key: &str) -> Result<StoredKey> {
        let path = self.key_path(key);
        let data = match fs::read_to_string(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeywardenError::NotFound(format!("stored key {}", key)));
            }
            Err(e) => {
                return Err(KeywardenError::Storage(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        let metadata = fs::read_to_string(self.metadata_path(key))
            .await
            .unwrap_or_default();

        debug!(key = %key, path = %path.display(), "Read key from disk");
        Ok(StoredKey { data, metadata })
    }

    async fn save(&self, key: &str, data: &str) -> Result<()> {
        write_private(&self.key_path(key), data).await
    }

    async fn save_with_metadata(&self, key: &str, data: &str, metadata: &str) -> Result<()> {
        write_private(&self.key_path(key), data).await?;
        write_private(&self.metadata_path(key), metadata).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_exists(&self.key_path(key)).await?;
        remove_if_exists(&self.metadata_path(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disk_backend_prefix_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), "kw-").await.unwrap();

        backend.save("AAAA", "key-a").await.unwrap();
        backend
            .save_with_metadata("BBBB", "key-b", r#"{"password":"pw"}"#)
            .await
            .unwrap();
        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();

        assert_eq!(backend.list().await.unwrap(), vec!["AAAA", "BBBB"]);

        let b = backend.read("BBBB").await.unwrap();
        assert_eq!(b.data, "key-b");
        assert_eq!(b.metadata, r#"{"password":"pw"}"#);
        assert!(dir.path().join("metadata-kw-BBBB").exists());

        backend.delete("BBBB").await.unwrap();
        backend.delete("BBBB").await.unwrap();
        assert!(!dir.path().join("metadata-kw-BBBB").exists());
        assert!(matches!(
            backend.read("BBBB").await,
            Err(KeywardenError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_disk_backend_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path(), "").await.unwrap();
        backend.save("CCCC", "key-c").await.unwrap();

        let mode = std::fs::metadata(dir.path().join("CCCC"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

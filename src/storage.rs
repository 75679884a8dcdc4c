use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("file already exists")]
    AlreadyExists,
    #[error("file not found")]
    NotFound,
    #[error("not a regular file")]
    NotAFile,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// Upload cap in bytes.
    #[serde(default)]
    pub max_size: i64,
    /// Eviction quota in bytes. Zero disables eviction.
    #[serde(default)]
    pub limit: u64,
}

/// Content-addressed blob store.
///
/// Blobs live at `<path>/<addr[0..2]>/<addr>`: a flat two-level fanout keyed
/// by the opaque address string. The filesystem is the only source of truth
/// for blob existence; no in-memory index is kept.
pub struct Storage {
    config: StorageConfig,
}

impl Storage {
    pub fn new(config: StorageConfig) -> Self {
        Storage { config }
    }

    pub fn root(&self) -> &Path {
        &self.config.path
    }

    pub fn max_file_size(&self) -> i64 {
        self.config.max_size
    }

    pub fn eviction_limit(&self) -> u64 {
        self.config.limit
    }

    fn fanout(address: &str) -> &str {
        address.get(..2).unwrap_or(address)
    }

    fn file_path(&self, address: &str) -> PathBuf {
        self.config.path.join(Self::fanout(address)).join(address)
    }

    /// Writes `data` under `address`, creating the fanout directory if
    /// needed. Refuses to overwrite: a second put of the same address fails
    /// with `AlreadyExists`. Returns the byte count once the file is synced
    /// to disk.
    pub async fn put(&self, address: &str, data: &[u8]) -> Result<u64, StorageError> {
        let folder = self.config.path.join(Self::fanout(address));

        let mut builder = fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(0o755);
        builder.create(&folder).await?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(folder.join(address))
            .await
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists
                } else {
                    StorageError::Io(e)
                }
            })?;

        file.write_all(data).await?;
        file.sync_all().await?;

        Ok(data.len() as u64)
    }

    /// Resolves `address` to its on-disk path, if the blob exists.
    pub async fn locate(&self, address: &str) -> Result<PathBuf, StorageError> {
        let file_name = self.file_path(address);

        match fs::metadata(&file_name).await {
            Ok(_) => Ok(file_name),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Byte length of the blob at `address`.
    pub async fn size(&self, address: &str) -> Result<u64, StorageError> {
        let file_name = self.file_path(address);

        match fs::metadata(&file_name).await {
            Ok(meta) if meta.is_dir() => Err(StorageError::NotAFile),
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Removes the blob at `address`. Returns `false` without error when the
    /// file was already absent, `true` when a file was deleted.
    pub async fn remove(&self, address: &str) -> Result<bool, StorageError> {
        let file_name = self.file_path(address);

        match fs::metadata(&file_name).await {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
            Ok(_) => {
                fs::remove_file(&file_name).await?;
                Ok(true)
            }
        }
    }
}

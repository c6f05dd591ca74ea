//! Catalogue-only storage: every byte-level operation is a no-op or an
//! error, and only `remote_url` tells where a product's bytes live.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

use super::{ProductKey, StorageBackend};

pub struct NoneStorage {
    tempdir: Option<PathBuf>,
}

impl NoneStorage {
    pub fn new(tempdir: Option<PathBuf>) -> NoneStorage {
        NoneStorage { tempdir }
    }

    fn no_bytes(key: &ProductKey) -> Error {
        Error::storage(format!(
            "storage backend 'none' holds no product data ({})",
            key.relative()
        ))
    }
}

#[async_trait]
impl StorageBackend for NoneStorage {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        Ok(())
    }

    async fn exists(&self, _key: &ProductKey) -> Result<bool> {
        Ok(false)
    }

    async fn put(
        &self,
        _sources: &[PathBuf],
        key: &ProductKey,
        _use_symlinks: bool,
    ) -> Result<u64> {
        Err(Self::no_bytes(key))
    }

    async fn put_stream(
        &self,
        _reader: Box<dyn AsyncRead + Send + Unpin>,
        key: &ProductKey,
    ) -> Result<u64> {
        Err(Self::no_bytes(key))
    }

    async fn move_within(&self, _from: &ProductKey, _to: &ProductKey) -> Result<()> {
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &ProductKey,
        _target_dir: &Path,
        _use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        Err(Self::no_bytes(key))
    }

    async fn remove(&self, _key: &ProductKey) -> Result<()> {
        Ok(())
    }

    async fn size(&self, key: &ProductKey) -> Result<u64> {
        Err(Self::no_bytes(key))
    }

    async fn hash(&self, key: &ProductKey, _algorithm: HashAlgorithm) -> Result<String> {
        Err(Self::no_bytes(key))
    }

    fn temp_workspace(&self) -> Result<tempfile::TempDir> {
        match &self.tempdir {
            Some(base) => {
                std::fs::create_dir_all(base)?;
                tempfile::Builder::new()
                    .prefix(".muninn-work-")
                    .tempdir_in(base)
                    .map_err(Error::from)
            }
            None => tempfile::tempdir().map_err(Error::from),
        }
    }

    fn is_catalogue_only(&self) -> bool {
        true
    }
}

//! S3-compatible object-store storage, built on `object_store`.
//!
//! Product bytes live under `[prefix/]archive_path/physical_name[/…]`.
//! The bucket itself is provisioned out of band; `prepare` only verifies
//! that it is reachable.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

use super::{collect_files, ProductKey, StorageBackend};

#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_access_key: Option<String>,
}

pub struct S3Storage {
    store: AmazonS3,
    prefix: String,
    tempdir: Option<PathBuf>,
}

impl S3Storage {
    pub fn new(config: &S3Config, tempdir: Option<PathBuf>) -> Result<S3Storage> {
        let mut builder = AmazonS3Builder::new().with_bucket_name(&config.bucket);
        if let Some(region) = &config.region {
            builder = builder.with_region(region);
        }
        if let Some(access_key) = &config.access_key {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(host) = &config.host {
            let endpoint = match config.port {
                Some(port) => format!("http://{}:{}", host, port),
                None => format!("http://{}", host),
            };
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }
        let store = builder
            .build()
            .map_err(|e| Error::storage_with("failed to configure the S3 object store", e))?;
        Ok(S3Storage {
            store,
            prefix: config.prefix.clone().unwrap_or_default(),
            tempdir,
        })
    }

    fn object_key(&self, parts: &[&str]) -> String {
        let mut segments: Vec<&str> = Vec::new();
        if !self.prefix.is_empty() {
            segments.push(self.prefix.trim_matches('/'));
        }
        for part in parts {
            if !part.is_empty() {
                segments.push(part.trim_matches('/'));
            }
        }
        segments.join("/")
    }

    fn base_key(&self, key: &ProductKey) -> String {
        self.object_key(&[&key.archive_path, &key.physical_name])
    }

    /// Objects of a product: `(name_relative_to_archive_path, path, size)`,
    /// sorted by name.
    async fn entries(&self, key: &ProductKey) -> Result<Vec<(String, ObjectPath, usize)>> {
        let base = self.base_key(key);
        let mut out = Vec::new();

        if let Ok(meta) = self.store.head(&ObjectPath::from(base.clone())).await {
            out.push((key.physical_name.clone(), meta.location, meta.size));
        }
        let prefix = ObjectPath::from(base.clone());
        let listing: Vec<object_store::ObjectMeta> = self
            .store
            .list(Some(&prefix))
            .await
            .map_err(wrap)?
            .try_collect()
            .await
            .map_err(wrap)?;
        for meta in listing {
            let location = meta.location.to_string();
            if location == base {
                continue;
            }
            let relative = format!(
                "{}/{}",
                key.physical_name,
                location.trim_start_matches(&format!("{}/", base))
            );
            out.push((relative, meta.location, meta.size));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn upload_file(&self, source: &Path, target: &ObjectPath) -> Result<u64> {
        let mut file = tokio::fs::File::open(source).await?;
        let (_, mut writer) = self.store.put_multipart(target).await.map_err(wrap)?;
        let written = tokio::io::copy(&mut file, &mut writer).await?;
        writer.shutdown().await?;
        Ok(written)
    }

    async fn download(&self, location: &ObjectPath, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let result = self.store.get(location).await.map_err(wrap)?;
        let mut stream = result.into_stream();
        let mut file = tokio::fs::File::create(target).await?;
        while let Some(chunk) = stream.try_next().await.map_err(wrap)? {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for S3Storage {
    async fn prepare(&self) -> Result<()> {
        // The bucket is managed externally; probe it so misconfiguration
        // surfaces early.
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.prefix.clone()))
        };
        self.store
            .list(prefix.as_ref())
            .await
            .map_err(wrap)?
            .try_next()
            .await
            .map_err(wrap)?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let prefix = if self.prefix.is_empty() {
            None
        } else {
            Some(ObjectPath::from(self.prefix.clone()))
        };
        let listing: Vec<object_store::ObjectMeta> = self
            .store
            .list(prefix.as_ref())
            .await
            .map_err(wrap)?
            .try_collect()
            .await
            .map_err(wrap)?;
        for meta in listing {
            self.store.delete(&meta.location).await.map_err(wrap)?;
        }
        Ok(())
    }

    async fn exists(&self, key: &ProductKey) -> Result<bool> {
        Ok(!self.entries(key).await?.is_empty())
    }

    async fn put(
        &self,
        sources: &[PathBuf],
        key: &ProductKey,
        _use_symlinks: bool,
    ) -> Result<u64> {
        if self.exists(key).await? {
            return Err(Error::storage(format!(
                "destination {:?} already exists",
                key.relative()
            )));
        }
        let mut total = 0;
        for source in sources {
            if !key.enclosing && !source.is_dir() && sources.len() == 1 {
                let target = ObjectPath::from(self.base_key(key));
                total += self.upload_file(source, &target).await?;
                continue;
            }
            for (relative, path) in collect_files(source)? {
                let object = if key.enclosing {
                    self.object_key(&[&key.archive_path, &key.physical_name, &relative])
                } else {
                    self.object_key(&[&key.archive_path, &relative])
                };
                total += self.upload_file(&path, &ObjectPath::from(object)).await?;
            }
        }
        tracing::debug!(key = %key.relative(), bytes = total, "stored product");
        Ok(total)
    }

    async fn put_stream(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        key: &ProductKey,
    ) -> Result<u64> {
        let object = if key.enclosing {
            self.object_key(&[&key.archive_path, &key.physical_name, &key.physical_name])
        } else {
            self.base_key(key)
        };
        let (_, mut writer) = self
            .store
            .put_multipart(&ObjectPath::from(object))
            .await
            .map_err(wrap)?;
        let written = tokio::io::copy(&mut reader, &mut writer).await?;
        writer.shutdown().await?;
        Ok(written)
    }

    async fn move_within(&self, from: &ProductKey, to: &ProductKey) -> Result<()> {
        for (name, location, _) in self.entries(from).await? {
            let rest = name.trim_start_matches(&from.physical_name);
            let target = ObjectPath::from(format!("{}{}", self.base_key(to), rest));
            self.store.copy(&location, &target).await.map_err(wrap)?;
            self.store.delete(&location).await.map_err(wrap)?;
        }
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &ProductKey,
        target_dir: &Path,
        _use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let entries = self.entries(key).await?;
        if entries.is_empty() {
            return Err(Error::storage(format!(
                "product {:?} is not present in storage",
                key.relative()
            )));
        }
        for (name, location, _) in &entries {
            self.download(location, &target_dir.join(name)).await?;
        }
        Ok(vec![target_dir.join(&key.physical_name)])
    }

    async fn remove(&self, key: &ProductKey) -> Result<()> {
        for (_, location, _) in self.entries(key).await? {
            self.store.delete(&location).await.map_err(wrap)?;
        }
        Ok(())
    }

    async fn size(&self, key: &ProductKey) -> Result<u64> {
        Ok(self
            .entries(key)
            .await?
            .into_iter()
            .map(|(_, _, size)| size as u64)
            .sum())
    }

    async fn hash(&self, key: &ProductKey, algorithm: HashAlgorithm) -> Result<String> {
        let entries = self.entries(key).await?;
        if entries.is_empty() {
            return Err(Error::storage(format!(
                "product {:?} is not present in storage",
                key.relative()
            )));
        }
        let single_file = entries.len() == 1 && entries[0].0 == key.physical_name;
        let mut hasher = algorithm.hasher();
        for (name, location, _) in entries {
            if !single_file {
                hasher.update(name.as_bytes());
                hasher.update(b"\0");
            }
            let result = self.store.get(&location).await.map_err(wrap)?;
            let mut stream = result.into_stream();
            while let Some(chunk) = stream.try_next().await.map_err(wrap)? {
                hasher.update(&chunk);
            }
        }
        Ok(hasher.finish())
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
}

fn wrap(err: object_store::Error) -> Error {
    Error::storage_with("object store operation failed", err)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn key_construction() {
        let config = S3Config {
            bucket: "archive".to_string(),
            prefix: Some("tenant/a".to_string()),
            region: Some("eu-west-1".to_string()),
            access_key: Some("k".to_string()),
            secret_access_key: Some("s".to_string()),
            ..Default::default()
        };
        let storage = S3Storage::new(&config, None).unwrap();
        assert_eq!(
            storage.base_key(&ProductKey::new("abc/2024", "alpha.dat", false)),
            "tenant/a/abc/2024/alpha.dat"
        );
        assert_eq!(
            storage.object_key(&["", "alpha.dat"]),
            "tenant/a/alpha.dat"
        );
    }
}

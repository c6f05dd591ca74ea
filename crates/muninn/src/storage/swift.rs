//! Swift-style object-store storage over plain HTTP.
//!
//! Uses v1 authentication: a GET against the auth URL with
//! `X-Auth-User`/`X-Auth-Key` headers yields a storage URL and a token.
//! The token is refreshed once on a 401 and object keys live inside a
//! single container.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::TryStreamExt;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

use super::{collect_files, ProductKey, StorageBackend};

#[derive(Clone, Debug, Default)]
pub struct SwiftConfig {
    pub container: String,
    pub user: String,
    pub key: String,
    pub authurl: String,
}

#[derive(Clone, Debug)]
struct Session {
    storage_url: String,
    token: String,
}

pub struct SwiftStorage {
    config: SwiftConfig,
    client: reqwest::Client,
    session: Mutex<Option<Session>>,
    tempdir: Option<PathBuf>,
}

#[derive(Debug, serde::Deserialize)]
struct ObjectEntry {
    name: String,
    bytes: u64,
}

impl SwiftStorage {
    pub fn new(config: SwiftConfig, tempdir: Option<PathBuf>) -> SwiftStorage {
        SwiftStorage {
            config,
            client: reqwest::Client::new(),
            session: Mutex::new(None),
            tempdir,
        }
    }

    async fn authenticate(&self) -> Result<Session> {
        let response = self
            .client
            .get(&self.config.authurl)
            .header("X-Auth-User", &self.config.user)
            .header("X-Auth-Key", &self.config.key)
            .send()
            .await
            .map_err(|e| Error::storage_with("swift authentication failed", e))?;
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "swift authentication failed with status {}",
                response.status()
            )));
        }
        let header = |name: &str| -> Result<String> {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::storage(format!("swift auth response lacks the {} header", name))
                })
        };
        Ok(Session {
            storage_url: header("X-Storage-Url")?,
            token: header("X-Auth-Token")?,
        })
    }

    async fn session(&self, force_refresh: bool) -> Result<Session> {
        let mut guard = self.session.lock().await;
        if force_refresh || guard.is_none() {
            *guard = Some(self.authenticate().await?);
        }
        match guard.as_ref() {
            Some(session) => Ok(session.clone()),
            None => Err(Error::storage("no swift session")),
        }
    }

    fn container_url(&self, session: &Session) -> String {
        format!(
            "{}/{}",
            session.storage_url.trim_end_matches('/'),
            self.config.container
        )
    }

    fn object_url(&self, session: &Session, key: &str) -> String {
        format!("{}/{}", self.container_url(session), key)
    }

    /// Issue `build(session)` and retry once with a fresh token on 401.
    async fn request<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&Session) -> reqwest::RequestBuilder,
    {
        let session = self.session(false).await?;
        let response = build(&session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| Error::storage_with("swift request failed", e))?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let session = self.session(true).await?;
        build(&session)
            .header("X-Auth-Token", &session.token)
            .send()
            .await
            .map_err(|e| Error::storage_with("swift request failed", e))
    }

    fn base_key(&self, key: &ProductKey) -> String {
        key.relative()
    }

    async fn list_container(&self, prefix: &str) -> Result<Vec<ObjectEntry>> {
        let response = self
            .request(|session| {
                self.client
                    .get(self.container_url(session))
                    .query(&[("prefix", prefix), ("format", "json")])
            })
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "swift listing failed with status {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::storage_with("swift listing is not valid JSON", e))
    }

    /// Objects of a product, `(name_relative_to_archive_path, key, size)`.
    async fn entries(&self, key: &ProductKey) -> Result<Vec<(String, String, u64)>> {
        let base = self.base_key(key);
        let listing = self.list_container(&base).await?;
        let mut out = Vec::new();
        for entry in listing {
            let relative = if entry.name == base {
                key.physical_name.clone()
            } else if let Some(rest) = entry.name.strip_prefix(&format!("{}/", base)) {
                format!("{}/{}", key.physical_name, rest)
            } else {
                continue;
            };
            out.push((relative, entry.name, entry.bytes));
        }
        out.sort();
        Ok(out)
    }

    async fn upload_file(&self, source: &Path, key: &str) -> Result<u64> {
        let size = tokio::fs::metadata(source).await?.len();
        let response = self
            .request(|session| {
                let url = self.object_url(session, key);
                // The body stream is rebuilt per attempt.
                let path = source.to_path_buf();
                let stream = futures::stream::once(async move {
                    tokio::fs::File::open(path).await.map(ReaderStream::new)
                })
                .try_flatten();
                self.client
                    .put(url)
                    .body(reqwest::Body::wrap_stream(stream))
            })
            .await?;
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "swift upload of {:?} failed with status {}",
                key,
                response.status()
            )));
        }
        Ok(size)
    }

    async fn download(&self, key: &str, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let response = self
            .request(|session| self.client.get(self.object_url(session, key)))
            .await?;
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "swift download of {:?} failed with status {}",
                key,
                response.status()
            )));
        }
        let mut file = tokio::fs::File::create(target).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream
            .try_next()
            .await
            .map_err(|e| Error::storage_with("swift download stream failed", e))?
        {
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let response = self
            .request(|session| self.client.delete(self.object_url(session, key)))
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            return Err(Error::storage(format!(
                "swift delete of {:?} failed with status {}",
                key,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for SwiftStorage {
    async fn prepare(&self) -> Result<()> {
        let response = self
            .request(|session| self.client.put(self.container_url(session)))
            .await?;
        if !response.status().is_success() {
            return Err(Error::storage(format!(
                "failed to create swift container {:?}: status {}",
                self.config.container,
                response.status()
            )));
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        for entry in self.list_container("").await? {
            self.delete_object(&entry.name).await?;
        }
        let response = self
            .request(|session| self.client.delete(self.container_url(session)))
            .await?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND
        {
            return Err(Error::storage(format!(
                "failed to delete swift container {:?}: status {}",
                self.config.container,
                response.status()
            )));
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
                total += self.upload_file(source, &self.base_key(key)).await?;
                continue;
            }
            for (relative, path) in collect_files(source)? {
                let object = if key.enclosing {
                    format!("{}/{}", self.base_key(key), relative)
                } else if key.archive_path.is_empty() {
                    relative.clone()
                } else {
                    format!("{}/{}", key.archive_path, relative)
                };
                total += self.upload_file(&path, &object).await?;
            }
        }
        Ok(total)
    }

    async fn put_stream(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        key: &ProductKey,
    ) -> Result<u64> {
        // Swift PUTs are not replayable from a one-shot stream; spool to a
        // temp file and upload that.
        let workspace = self.temp_workspace()?;
        let spool = workspace.path().join(&key.physical_name);
        let mut file = tokio::fs::File::create(&spool).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        drop(file);

        let object = if key.enclosing {
            format!("{}/{}", self.base_key(key), key.physical_name)
        } else {
            self.base_key(key)
        };
        self.upload_file(&spool, &object).await?;
        Ok(written)
    }

    async fn move_within(&self, from: &ProductKey, to: &ProductKey) -> Result<()> {
        for (name, key, _) in self.entries(from).await? {
            let rest = name.trim_start_matches(&from.physical_name);
            let target = format!("{}{}", self.base_key(to), rest);
            let response = self
                .request(|session| {
                    self.client
                        .put(self.object_url(session, &target))
                        .header(
                            "X-Copy-From",
                            format!("/{}/{}", self.config.container, key),
                        )
                        .header("Content-Length", "0")
                })
                .await?;
            if !response.status().is_success() {
                return Err(Error::storage(format!(
                    "swift copy of {:?} failed with status {}",
                    key,
                    response.status()
                )));
            }
            self.delete_object(&key).await?;
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
        for (name, object, _) in &entries {
            self.download(object, &target_dir.join(name)).await?;
        }
        Ok(vec![target_dir.join(&key.physical_name)])
    }

    async fn remove(&self, key: &ProductKey) -> Result<()> {
        for (_, object, _) in self.entries(key).await? {
            self.delete_object(&object).await?;
        }
        Ok(())
    }

    async fn size(&self, key: &ProductKey) -> Result<u64> {
        Ok(self
            .entries(key)
            .await?
            .into_iter()
            .map(|(_, _, size)| size)
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
        for (name, object, _) in entries {
            if !single_file {
                hasher.update(name.as_bytes());
                hasher.update(b"\0");
            }
            let response = self
                .request(|session| self.client.get(self.object_url(session, &object)))
                .await?;
            if !response.status().is_success() {
                return Err(Error::storage(format!(
                    "swift download of {:?} failed with status {}",
                    object,
                    response.status()
                )));
            }
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream
                .try_next()
                .await
                .map_err(|e| Error::storage_with("swift download stream failed", e))?
            {
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

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn object_listing_names() {
        // Pure key-mapping check; no server involved.
        let key = ProductKey::new("abc/2024", "prod", true);
        let base = key.relative();
        assert_eq!(base, "abc/2024/prod");
        assert_eq!(
            format!("{}/{}", key.physical_name, "a.dat"),
            "prod/a.dat"
        );
    }
}

//! Local filesystem storage.
//!
//! Products live under `<root>/<archive_path>/<physical_name>`. Symlinks
//! between two points inside the root are created relative, so the whole
//! archive stays valid when the root moves.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;

use super::{file_name, hash_paths, paths_size, ProductKey, StorageBackend};

pub struct FsStorage {
    root: PathBuf,
    tempdir: Option<PathBuf>,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, tempdir: Option<PathBuf>) -> FsStorage {
        FsStorage {
            root: root.into(),
            tempdir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn product_path(&self, key: &ProductKey) -> PathBuf {
        let mut path = self.root.clone();
        if !key.archive_path.is_empty() {
            path.push(&key.archive_path);
        }
        path.push(&key.physical_name);
        path
    }

    /// Remove now-empty directories between `path` and the root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            match std::fs::remove_dir(dir) {
                Ok(()) => current = dir.parent(),
                Err(_) => break,
            }
        }
    }

    async fn place(&self, source: &Path, dest: &Path, use_symlinks: bool) -> Result<u64> {
        let canonical_source = tokio::fs::canonicalize(source).await?;
        if let Ok(canonical_dest) = tokio::fs::canonicalize(dest).await {
            if canonical_source == canonical_dest {
                // Already in place.
                return paths_size(&[canonical_source]).await;
            }
        }
        if tokio::fs::symlink_metadata(dest).await.is_ok() {
            return Err(Error::storage(format!(
                "destination {:?} already exists",
                dest
            )));
        }
        if use_symlinks {
            let target = if canonical_source.starts_with(&self.root)
                || source.starts_with(&self.root)
            {
                let parent = dest
                    .parent()
                    .ok_or_else(|| Error::storage(format!("{:?} has no parent", dest)))?;
                relative_to(parent, &canonical_source)
            } else {
                canonical_source.clone()
            };
            tokio::fs::symlink(&target, dest).await?;
            return paths_size(&[canonical_source]).await;
        }
        copy_recursive(source, dest).await
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    async fn prepare(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if tokio::fs::metadata(&self.root).await.is_ok() {
            tokio::fs::remove_dir_all(&self.root).await?;
        }
        Ok(())
    }

    async fn exists(&self, key: &ProductKey) -> Result<bool> {
        Ok(tokio::fs::symlink_metadata(self.product_path(key))
            .await
            .is_ok())
    }

    async fn put(
        &self,
        sources: &[PathBuf],
        key: &ProductKey,
        use_symlinks: bool,
    ) -> Result<u64> {
        let product_path = self.product_path(key);
        let mut total = 0;
        if key.enclosing {
            tokio::fs::create_dir_all(&product_path).await?;
            for source in sources {
                let dest = product_path.join(file_name(source)?);
                total += self.place(source, &dest, use_symlinks).await?;
            }
        } else {
            let source = match sources {
                [source] => source,
                _ => {
                    return Err(Error::storage(
                        "a product without an enclosing directory has exactly one path",
                    ))
                }
            };
            if let Some(parent) = product_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            total += self.place(source, &product_path, use_symlinks).await?;
        }
        tracing::debug!(key = %key.relative(), bytes = total, "stored product");
        Ok(total)
    }

    async fn put_stream(
        &self,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
        key: &ProductKey,
    ) -> Result<u64> {
        let mut path = self.product_path(key);
        if key.enclosing {
            tokio::fs::create_dir_all(&path).await?;
            path = path.join(&key.physical_name);
        } else if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(written)
    }

    async fn move_within(&self, from: &ProductKey, to: &ProductKey) -> Result<()> {
        let source = self.product_path(from);
        let dest = self.product_path(to);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&source, &dest).await?;
        self.prune_empty_parents(&source);
        Ok(())
    }

    async fn retrieve(
        &self,
        key: &ProductKey,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let source = self.product_path(key);
        if tokio::fs::symlink_metadata(&source).await.is_err() {
            return Err(Error::storage(format!(
                "product {:?} is not present in storage",
                key.relative()
            )));
        }
        let target = target_dir.join(&key.physical_name);
        if use_symlinks {
            let canonical = tokio::fs::canonicalize(&source).await?;
            tokio::fs::symlink(&canonical, &target).await?;
        } else {
            copy_recursive(&source, &target).await?;
        }
        Ok(vec![target])
    }

    async fn remove(&self, key: &ProductKey) -> Result<()> {
        let path = self.product_path(key);
        match tokio::fs::symlink_metadata(&path).await {
            Err(_) => return Ok(()),
            Ok(metadata) if metadata.is_dir() => tokio::fs::remove_dir_all(&path).await?,
            Ok(_) => tokio::fs::remove_file(&path).await?,
        }
        self.prune_empty_parents(&path);
        Ok(())
    }

    async fn size(&self, key: &ProductKey) -> Result<u64> {
        paths_size(&[self.product_path(key)]).await
    }

    async fn hash(&self, key: &ProductKey, algorithm: HashAlgorithm) -> Result<String> {
        hash_paths(&[self.product_path(key)], algorithm).await
    }

    fn temp_workspace(&self) -> Result<tempfile::TempDir> {
        let base = self.tempdir.as_deref().unwrap_or(&self.root);
        std::fs::create_dir_all(base)?;
        tempfile::Builder::new()
            .prefix(".muninn-work-")
            .tempdir_in(base)
            .map_err(Error::from)
    }

    fn supports_symlinks(&self) -> bool {
        cfg!(unix)
    }

    fn local_path(&self, key: &ProductKey) -> Option<PathBuf> {
        Some(self.product_path(key))
    }

    fn relative_location(&self, path: &Path) -> Option<(String, String)> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let physical_name = relative.file_name()?.to_str()?.to_string();
        let archive_path = relative
            .parent()?
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/");
        Some((archive_path, physical_name))
    }
}

/// Relative path from directory `from` to `target`.
fn relative_to(from: &Path, target: &Path) -> PathBuf {
    let from: Vec<Component> = from.components().collect();
    let target_parts: Vec<Component> = target.components().collect();
    let common = from
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for part in &target_parts[common..] {
        out.push(part);
    }
    out
}

async fn copy_recursive(source: &Path, dest: &Path) -> Result<u64> {
    let metadata = tokio::fs::metadata(source).await?;
    if !metadata.is_dir() {
        return Ok(tokio::fs::copy(source, dest).await?);
    }
    let mut total = 0;
    let mut stack = vec![(source.to_path_buf(), dest.to_path_buf())];
    while let Some((src, dst)) = stack.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            let entry_dest = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry_path, entry_dest));
            } else {
                total += tokio::fs::copy(&entry_path, &entry_dest).await?;
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(archive_path: &str, physical_name: &str) -> ProductKey {
        ProductKey::new(archive_path, physical_name, false)
    }

    #[tokio::test]
    async fn put_retrieve_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let storage = FsStorage::new(&root, None);
        storage.prepare().await.unwrap();

        let source = dir.path().join("alpha.dat");
        std::fs::write(&source, b"hello").unwrap();

        let key = key("abc/2024", "alpha.dat");
        let written = storage.put(&[source], &key, false).await.unwrap();
        assert_eq!(written, 5);
        assert!(storage.exists(&key).await.unwrap());
        assert_eq!(storage.size(&key).await.unwrap(), 5);

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let paths = storage.retrieve(&key, &out, false).await.unwrap();
        assert_eq!(paths, vec![out.join("alpha.dat")]);
        assert_eq!(std::fs::read(&paths[0]).unwrap(), b"hello");

        storage.remove(&key).await.unwrap();
        assert!(!storage.exists(&key).await.unwrap());
        // Empty archive_path directories are pruned.
        assert!(!root.join("abc").exists());
        assert!(root.exists());
    }

    #[tokio::test]
    async fn enclosing_directory_products() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("archive"), None);
        storage.prepare().await.unwrap();

        let a = dir.path().join("a.dat");
        let b = dir.path().join("b.dat");
        std::fs::write(&a, b"one").unwrap();
        std::fs::write(&b, b"twoo").unwrap();

        let key = ProductKey::new("multi", "prod", true);
        let written = storage.put(&[a, b], &key, false).await.unwrap();
        assert_eq!(written, 7);

        let out = dir.path().join("out");
        std::fs::create_dir(&out).unwrap();
        let paths = storage.retrieve(&key, &out, false).await.unwrap();
        assert_eq!(paths, vec![out.join("prod")]);
        assert!(out.join("prod/a.dat").exists());
        assert!(out.join("prod/b.dat").exists());
    }

    #[tokio::test]
    async fn symlinks_inside_root_are_relative() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("archive");
        let storage = FsStorage::new(&root, None);
        storage.prepare().await.unwrap();

        // First ingest a product by copy, then symlink a second key to a
        // source inside the root.
        let source = dir.path().join("orig.dat");
        std::fs::write(&source, b"data").unwrap();
        let first = key("a", "orig.dat");
        storage.put(&[source], &first, false).await.unwrap();

        let inside = root.join("a/orig.dat");
        let second = key("b", "linked.dat");
        storage.put(&[inside], &second, true).await.unwrap();

        let link = root.join("b/linked.dat");
        let target = std::fs::read_link(&link).unwrap();
        assert!(target.is_relative(), "{target:?}");
        assert_eq!(std::fs::read(&link).unwrap(), b"data");
    }

    #[tokio::test]
    async fn put_refuses_occupied_destination() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("archive"), None);
        storage.prepare().await.unwrap();

        let source = dir.path().join("alpha.dat");
        std::fs::write(&source, b"hello").unwrap();
        let key = key("abc", "alpha.dat");
        storage.put(&[source.clone()], &key, false).await.unwrap();
        let err = storage.put(&[source], &key, false).await.unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }

    #[test]
    fn relative_location_resolution() {
        let storage = FsStorage::new("/data/archive", None);
        assert_eq!(
            storage.relative_location(Path::new("/data/archive/abc/2024/alpha.dat")),
            Some(("abc/2024".to_string(), "alpha.dat".to_string()))
        );
        assert_eq!(
            storage.relative_location(Path::new("/elsewhere/alpha.dat")),
            None
        );
    }

    #[test]
    fn relative_path_computation() {
        assert_eq!(
            relative_to(Path::new("/a/b/c"), Path::new("/a/x/y.dat")),
            PathBuf::from("../../x/y.dat")
        );
        assert_eq!(
            relative_to(Path::new("/a"), Path::new("/a/y.dat")),
            PathBuf::from("y.dat")
        );
    }
}

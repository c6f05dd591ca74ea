//! The storage backend abstraction: a uniform façade over the byte side
//! of the archive. Backends receive `(archive_path, physical_name)` as
//! their key and know nothing about catalogue state.

pub mod fs;
pub mod none;
pub mod s3;
pub mod swift;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::hash::{HashAlgorithm, Hasher};

/// The storage key of one product's bytes.
///
/// A multi-part product (`enclosing` set) lives as a directory named
/// `physical_name` containing its files; a single-part product lives as a
/// file (or directory) named `physical_name` directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProductKey {
    pub archive_path: String,
    pub physical_name: String,
    pub enclosing: bool,
}

impl ProductKey {
    pub fn new(archive_path: &str, physical_name: &str, enclosing: bool) -> ProductKey {
        ProductKey {
            archive_path: archive_path.to_string(),
            physical_name: physical_name.to_string(),
            enclosing,
        }
    }

    /// Slash-separated key relative to the storage root.
    pub fn relative(&self) -> String {
        if self.archive_path.is_empty() {
            self.physical_name.clone()
        } else {
            format!("{}/{}", self.archive_path, self.physical_name)
        }
    }
}

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Create the storage root (directory, bucket prefix, container).
    async fn prepare(&self) -> Result<()>;

    /// Remove all stored bytes and the root itself.
    async fn destroy(&self) -> Result<()>;

    async fn exists(&self, key: &ProductKey) -> Result<bool>;

    /// Place the source paths under the key; returns bytes written.
    async fn put(&self, sources: &[PathBuf], key: &ProductKey, use_symlinks: bool)
        -> Result<u64>;

    /// Place a single byte stream as the product's sole file.
    async fn put_stream(
        &self,
        reader: Box<dyn AsyncRead + Send + Unpin>,
        key: &ProductKey,
    ) -> Result<u64>;

    /// Re-key stored bytes (rename within the same storage).
    async fn move_within(&self, from: &ProductKey, to: &ProductKey) -> Result<()>;

    /// Copy (or symlink) the product out to `target_dir`; returns the
    /// produced paths, the enclosing directory included when multi-part.
    async fn retrieve(
        &self,
        key: &ProductKey,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>>;

    async fn remove(&self, key: &ProductKey) -> Result<()>;

    async fn size(&self, key: &ProductKey) -> Result<u64>;

    async fn hash(&self, key: &ProductKey, algorithm: HashAlgorithm) -> Result<String>;

    /// A scoped work directory, placed so that final moves into storage do
    /// not cross mount points where that matters (filesystem storage).
    fn temp_workspace(&self) -> Result<tempfile::TempDir>;

    /// Whether `put`/`retrieve` honor `use_symlinks`.
    fn supports_symlinks(&self) -> bool {
        false
    }

    /// True for the `none` backend: the catalogue alone knows the product.
    fn is_catalogue_only(&self) -> bool {
        false
    }

    /// For storages with an on-disk root: the `(archive_path,
    /// physical_name)` of `path` if it already lies inside the root.
    fn relative_location(&self, _path: &Path) -> Option<(String, String)> {
        None
    }

    /// For storages with an on-disk root: the absolute path of the
    /// product's bytes.
    fn local_path(&self, _key: &ProductKey) -> Option<PathBuf> {
        None
    }
}

/// Recursively collect the regular files under `path` (or `path` itself),
/// as `(relative_name, absolute_path)` pairs sorted by name.
pub(crate) fn collect_files(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let name = file_name(path)?;
    if path.is_dir() {
        let mut stack = vec![(name, path.to_path_buf())];
        while let Some((prefix, dir)) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let entry_path = entry.path();
                let relative = format!("{}/{}", prefix, file_name(&entry_path)?);
                if entry_path.is_dir() {
                    stack.push((relative, entry_path));
                } else {
                    out.push((relative, entry_path));
                }
            }
        }
    } else {
        out.push((name, path.to_path_buf()));
    }
    out.sort();
    Ok(out)
}

pub(crate) fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| Error::storage(format!("path {:?} has no usable file name", path)))
}

/// Total size of the given paths, directories walked recursively.
pub(crate) async fn paths_size(paths: &[PathBuf]) -> Result<u64> {
    let mut total = 0;
    for path in paths {
        for (_, file) in collect_files(path)? {
            total += tokio::fs::metadata(&file).await?.len();
        }
    }
    Ok(total)
}

/// Hash a set of source paths the way the archive records product hashes:
/// a single regular file hashes as its raw contents; anything else mixes
/// each file's relative name in front of its contents, in sorted order.
pub(crate) async fn hash_paths(paths: &[PathBuf], algorithm: HashAlgorithm) -> Result<String> {
    let mut files = Vec::new();
    for path in paths {
        files.extend(collect_files(path)?);
    }
    files.sort();
    let single_file = files.len() == 1 && paths.len() == 1 && paths[0].is_file();

    let mut hasher = algorithm.hasher();
    for (name, path) in files {
        if !single_file {
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
        }
        hash_file(&mut hasher, &path).await?;
    }
    Ok(hasher.finish())
}

pub(crate) async fn hash_file(hasher: &mut Hasher, path: &Path) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..n]);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hash::HashAlgorithm;

    #[tokio::test]
    async fn single_file_hash_is_plain_content_digest() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("alpha.dat");
        std::fs::write(&file, b"hello").unwrap();

        let hash = hash_paths(&[file], HashAlgorithm::Md5).await.unwrap();
        assert_eq!(hash, "md5:5d41402abc4b2a76b9719d911017c592");
    }

    #[tokio::test]
    async fn directory_hash_covers_names() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("product");
        std::fs::create_dir(&product).unwrap();
        std::fs::write(product.join("a.dat"), b"one").unwrap();
        std::fs::write(product.join("b.dat"), b"two").unwrap();

        let before = hash_paths(&[product.clone()], HashAlgorithm::Md5)
            .await
            .unwrap();
        std::fs::rename(product.join("b.dat"), product.join("c.dat")).unwrap();
        let after = hash_paths(&[product], HashAlgorithm::Md5).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn sizes_walk_directories() {
        let dir = tempfile::tempdir().unwrap();
        let product = dir.path().join("product");
        std::fs::create_dir(&product).unwrap();
        std::fs::write(product.join("a.dat"), b"12345").unwrap();
        std::fs::write(product.join("b.dat"), b"123").unwrap();

        assert_eq!(paths_size(&[product]).await.unwrap(), 8);
    }
}

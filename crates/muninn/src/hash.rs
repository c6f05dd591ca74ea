//! Product content hashing.
//!
//! Hashes are recorded as `"<algorithm>:<hex>"`. A legacy bare hex string
//! is interpreted as SHA-1.

use sha1::Digest;

use crate::error::{Error, Result};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Sha1 => "sha1",
            HashAlgorithm::Sha224 => "sha224",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    pub fn from_name(name: &str) -> Result<HashAlgorithm> {
        Ok(match name {
            "md5" => HashAlgorithm::Md5,
            "sha1" => HashAlgorithm::Sha1,
            "sha224" => HashAlgorithm::Sha224,
            "sha256" => HashAlgorithm::Sha256,
            "sha384" => HashAlgorithm::Sha384,
            "sha512" => HashAlgorithm::Sha512,
            _ => {
                return Err(Error::Config(format!(
                    "unsupported hash algorithm {:?}",
                    name
                )))
            }
        })
    }

    pub fn hasher(&self) -> Hasher {
        match self {
            HashAlgorithm::Md5 => Hasher::Md5(md5::Context::new()),
            HashAlgorithm::Sha1 => Hasher::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Sha224 => Hasher::Sha224(sha2::Sha224::new()),
            HashAlgorithm::Sha256 => Hasher::Sha256(sha2::Sha256::new()),
            HashAlgorithm::Sha384 => Hasher::Sha384(sha2::Sha384::new()),
            HashAlgorithm::Sha512 => Hasher::Sha512(sha2::Sha512::new()),
        }
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub enum Hasher {
    Md5(md5::Context),
    Sha1(sha1::Sha1),
    Sha224(sha2::Sha224),
    Sha256(sha2::Sha256),
    Sha384(sha2::Sha384),
    Sha512(sha2::Sha512),
}

impl Hasher {
    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Hasher::Md5(context) => context.consume(bytes),
            Hasher::Sha1(digest) => digest.update(bytes),
            Hasher::Sha224(digest) => digest.update(bytes),
            Hasher::Sha256(digest) => digest.update(bytes),
            Hasher::Sha384(digest) => digest.update(bytes),
            Hasher::Sha512(digest) => digest.update(bytes),
        }
    }

    /// `"<algorithm>:<hex>"`.
    pub fn finish(self) -> String {
        match self {
            Hasher::Md5(context) => format!("md5:{}", hex::encode(context.compute().0)),
            Hasher::Sha1(digest) => format!("sha1:{}", hex::encode(digest.finalize())),
            Hasher::Sha224(digest) => format!("sha224:{}", hex::encode(digest.finalize())),
            Hasher::Sha256(digest) => format!("sha256:{}", hex::encode(digest.finalize())),
            Hasher::Sha384(digest) => format!("sha384:{}", hex::encode(digest.finalize())),
            Hasher::Sha512(digest) => format!("sha512:{}", hex::encode(digest.finalize())),
        }
    }
}

/// Split a stored hash into its algorithm and digest. Bare hex is legacy
/// SHA-1.
pub fn parse_hash(text: &str) -> Result<(HashAlgorithm, &str)> {
    match text.split_once(':') {
        Some((algorithm, digest)) => Ok((HashAlgorithm::from_name(algorithm)?, digest)),
        None => Ok((HashAlgorithm::Sha1, text)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn md5_of_hello() {
        let mut hasher = HashAlgorithm::Md5.hasher();
        hasher.update(b"hello");
        assert_eq!(
            hasher.finish(),
            "md5:5d41402abc4b2a76b9719d911017c592"
        );
    }

    #[test]
    fn sha256_of_empty() {
        let hasher = HashAlgorithm::Sha256.hasher();
        assert_eq!(
            hasher.finish(),
            "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn legacy_bare_hex_is_sha1() {
        let (algorithm, digest) =
            parse_hash("da39a3ee5e6b4b0d3255bfef95601890afd80709").unwrap();
        assert_eq!(algorithm, HashAlgorithm::Sha1);
        assert_eq!(digest, "da39a3ee5e6b4b0d3255bfef95601890afd80709");

        let (algorithm, _) = parse_hash("md5:abc").unwrap();
        assert_eq!(algorithm, HashAlgorithm::Md5);
        assert!(parse_hash("whirlpool:abc").is_err());
    }
}

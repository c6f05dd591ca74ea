//! Archive configuration and credentials.
//!
//! An archive is opened by id: a search path (the `MUNINN_CONFIG_PATH`
//! environment variable, colon-separated files and directories) is
//! consulted to locate `<id>.cfg`, or the id may itself be a path to a
//! configuration file. The file is INI-style: `[section]` headers,
//! `key = value` lines, `#`/`;` comments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const CONFIG_PATH_VARIABLE: &str = "MUNINN_CONFIG_PATH";

/// Parsed INI document: section → key → value.
#[derive(Clone, Debug, Default)]
pub struct IniDocument {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Result<IniDocument> {
        let mut document = IniDocument::default();
        let mut current = String::new();
        for (number, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| {
                    Error::Config(format!("malformed section header on line {}", number + 1))
                })?;
                current = name.trim().to_string();
                document.sections.entry(current.clone()).or_default();
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                Error::Config(format!("expected key = value on line {}", number + 1))
            })?;
            if current.is_empty() {
                return Err(Error::Config(format!(
                    "key {:?} appears before any section header",
                    key.trim()
                )));
            }
            document
                .sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(document)
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(key).map(String::as_str)
    }
}

fn parse_list(value: Option<&str>) -> Vec<String> {
    value
        .map(|v| {
            v.split(|c: char| c.is_whitespace() || c == ',')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_bool(section: &str, key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(Error::Config(format!(
            "[{}] {} expects a boolean, got {:?}",
            section, key, value
        ))),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DatabaseKind {
    Postgresql,
    Sqlite,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageKind {
    Fs,
    S3,
    Swift,
    None,
}

#[derive(Clone, Debug, Default)]
pub struct PostgresqlConfig {
    pub connection_string: String,
    pub table_prefix: String,
}

#[derive(Clone, Debug, Default)]
pub struct SqliteConfig {
    pub connection_string: String,
    pub table_prefix: String,
    pub mod_spatialite_path: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct FsConfig {
    pub root: PathBuf,
    pub use_symlinks: bool,
}

#[derive(Clone, Debug, Default)]
pub struct SwiftSectionConfig {
    pub container: String,
    pub user: String,
    pub key: String,
    pub authurl: String,
}

#[derive(Clone, Debug)]
pub struct ArchiveConfig {
    pub database: DatabaseKind,
    pub storage: StorageKind,
    /// Minutes a freshly catalogued product is exempt from cascading.
    pub cascade_grace_period: i64,
    pub max_cascade_cycles: u32,
    pub namespace_extensions: Vec<String>,
    pub product_type_extensions: Vec<String>,
    pub hook_extensions: Vec<String>,
    pub remote_backend_extensions: Vec<String>,
    pub synchronizers: Vec<String>,
    pub auth_file: Option<PathBuf>,
    pub tempdir: Option<PathBuf>,
    pub postgresql: PostgresqlConfig,
    pub sqlite: SqliteConfig,
    pub fs: FsConfig,
    pub s3: crate::storage::s3::S3Config,
    pub swift: SwiftSectionConfig,
    /// Raw `[extension:…]` and `[synchronizer:…]` sections, preserved for
    /// plug-ins to read.
    document: IniDocument,
}

impl ArchiveConfig {
    /// Locate the configuration of archive `id` on the search path.
    ///
    /// `search_path` defaults to the `MUNINN_CONFIG_PATH` environment
    /// variable. The id may also be a direct path to a config file.
    pub fn locate(id: &str, search_path: Option<&str>) -> Result<PathBuf> {
        let direct = Path::new(id);
        if direct.is_file() {
            return Ok(direct.to_path_buf());
        }
        let environment;
        let search_path = match search_path {
            Some(path) => path,
            None => {
                environment = std::env::var(CONFIG_PATH_VARIABLE).unwrap_or_default();
                &environment
            }
        };
        for entry in search_path.split(':').filter(|e| !e.is_empty()) {
            let entry = Path::new(entry);
            if entry.is_dir() {
                let candidate = entry.join(format!("{}.cfg", id));
                if candidate.is_file() {
                    return Ok(candidate);
                }
            } else if entry.is_file() {
                let stem = entry.file_stem().and_then(|s| s.to_str());
                if stem == Some(id) {
                    return Ok(entry.to_path_buf());
                }
            }
        }
        Err(Error::Config(format!(
            "no configuration found for archive {:?} (search path {:?})",
            id, search_path
        )))
    }

    pub fn load(path: &Path) -> Result<ArchiveConfig> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read configuration {:?}: {}", path, e))
        })?;
        ArchiveConfig::parse(&text)
    }

    pub fn parse(text: &str) -> Result<ArchiveConfig> {
        let document = IniDocument::parse(text)?;
        let archive = document
            .section("archive")
            .ok_or_else(|| Error::Config("missing [archive] section".to_string()))?;

        let database = match archive.get("database").map(String::as_str) {
            Some("postgresql") => DatabaseKind::Postgresql,
            Some("sqlite") => DatabaseKind::Sqlite,
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown database backend {:?}",
                    other
                )))
            }
            None => return Err(Error::Config("[archive] database is required".to_string())),
        };
        let storage = match archive.get("storage").map(String::as_str) {
            Some("fs") => StorageKind::Fs,
            Some("s3") => StorageKind::S3,
            Some("swift") => StorageKind::Swift,
            Some("none") => StorageKind::None,
            Some(other) => {
                return Err(Error::Config(format!(
                    "unknown storage backend {:?}",
                    other
                )))
            }
            None => return Err(Error::Config("[archive] storage is required".to_string())),
        };

        let cascade_grace_period = match archive.get("cascade_grace_period") {
            Some(value) => value.parse().map_err(|_| {
                Error::Config(format!(
                    "cascade_grace_period expects minutes, got {:?}",
                    value
                ))
            })?,
            None => 0,
        };
        let max_cascade_cycles = match archive.get("max_cascade_cycles") {
            Some(value) => value.parse().map_err(|_| {
                Error::Config(format!("max_cascade_cycles expects a count, got {:?}", value))
            })?,
            None => 25,
        };

        let postgresql = PostgresqlConfig {
            connection_string: document
                .get("postgresql", "connection_string")
                .unwrap_or_default()
                .to_string(),
            table_prefix: document
                .get("postgresql", "table_prefix")
                .unwrap_or_default()
                .to_string(),
        };
        let sqlite = SqliteConfig {
            connection_string: document
                .get("sqlite", "connection_string")
                .unwrap_or_default()
                .to_string(),
            table_prefix: document
                .get("sqlite", "table_prefix")
                .unwrap_or_default()
                .to_string(),
            mod_spatialite_path: document
                .get("sqlite", "mod_spatialite_path")
                .map(str::to_string),
        };
        let fs = FsConfig {
            root: document
                .get("fs", "root")
                .map(PathBuf::from)
                .unwrap_or_default(),
            use_symlinks: match document.get("fs", "use_symlinks") {
                Some(value) => parse_bool("fs", "use_symlinks", value)?,
                None => false,
            },
        };
        let s3 = crate::storage::s3::S3Config {
            bucket: document.get("s3", "bucket").unwrap_or_default().to_string(),
            prefix: document.get("s3", "prefix").map(str::to_string),
            host: document.get("s3", "host").map(str::to_string),
            port: match document.get("s3", "port") {
                Some(value) => Some(value.parse().map_err(|_| {
                    Error::Config(format!("[s3] port expects a number, got {:?}", value))
                })?),
                None => None,
            },
            region: document.get("s3", "region").map(str::to_string),
            access_key: document.get("s3", "access_key").map(str::to_string),
            secret_access_key: document
                .get("s3", "secret_access_key")
                .map(str::to_string),
        };
        let swift = SwiftSectionConfig {
            container: document
                .get("swift", "container")
                .unwrap_or_default()
                .to_string(),
            user: document.get("swift", "user").unwrap_or_default().to_string(),
            key: document.get("swift", "key").unwrap_or_default().to_string(),
            authurl: document
                .get("swift", "authurl")
                .unwrap_or_default()
                .to_string(),
        };

        match database {
            DatabaseKind::Postgresql if postgresql.connection_string.is_empty() => {
                return Err(Error::Config(
                    "[postgresql] connection_string is required".to_string(),
                ))
            }
            DatabaseKind::Sqlite if sqlite.connection_string.is_empty() => {
                return Err(Error::Config(
                    "[sqlite] connection_string is required".to_string(),
                ))
            }
            _ => {}
        }
        if storage == StorageKind::Fs && fs.root.as_os_str().is_empty() {
            return Err(Error::Config("[fs] root is required".to_string()));
        }
        if storage == StorageKind::S3 && s3.bucket.is_empty() {
            return Err(Error::Config("[s3] bucket is required".to_string()));
        }
        if storage == StorageKind::Swift && swift.container.is_empty() {
            return Err(Error::Config("[swift] container is required".to_string()));
        }

        Ok(ArchiveConfig {
            database,
            storage,
            cascade_grace_period,
            max_cascade_cycles,
            namespace_extensions: parse_list(archive.get("namespace_extensions").map(String::as_str)),
            product_type_extensions: parse_list(
                archive.get("product_type_extensions").map(String::as_str),
            ),
            hook_extensions: parse_list(archive.get("hook_extensions").map(String::as_str)),
            remote_backend_extensions: parse_list(
                archive.get("remote_backend_extensions").map(String::as_str),
            ),
            synchronizers: parse_list(archive.get("synchronizers").map(String::as_str)),
            auth_file: archive.get("auth_file").map(PathBuf::from),
            tempdir: archive.get("tempdir").map(PathBuf::from),
            postgresql,
            sqlite,
            fs,
            s3,
            swift,
            document,
        })
    }

    /// The raw key/value pairs of an `[extension:<module>]` section.
    pub fn extension_section(&self, module: &str) -> Option<&BTreeMap<String, String>> {
        self.document.section(&format!("extension:{}", module))
    }

    /// The raw key/value pairs of a `[synchronizer:<name>]` section.
    pub fn synchronizer_section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.document.section(&format!("synchronizer:{}", name))
    }
}

// ---------------------------------------------------------------------
// Credentials.

/// One credentials record, keyed in the auth file by host, URL prefix, or
/// `s3://bucket`.
#[derive(Clone, Debug, PartialEq)]
pub enum Credential {
    Basic {
        username: String,
        password: String,
    },
    OAuth2 {
        grant_type: String,
        username: String,
        password: String,
        client_id: String,
        client_secret: String,
        token_url: String,
        auth_args: Option<serde_json::Value>,
    },
    S3 {
        bucket: String,
        access_key: String,
        secret_access_key: String,
        port: Option<u16>,
    },
    Swift {
        user: String,
        key: String,
    },
}

#[derive(Clone, Debug, Default)]
pub struct Credentials {
    entries: Vec<(String, Credential)>,
}

impl Credentials {
    pub fn load(path: &Path) -> Result<Credentials> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read credentials {:?}: {}", path, e))
        })?;
        Credentials::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Credentials> {
        let document: serde_json::Map<String, serde_json::Value> = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("credentials file is not valid JSON: {}", e)))?;
        let mut entries = Vec::new();
        for (key, value) in document {
            entries.push((key.clone(), parse_credential(&key, &value)?));
        }
        Ok(Credentials { entries })
    }

    /// Longest matching URL prefix, then exact host, then `s3://bucket`.
    pub fn resolve(&self, url: &url::Url) -> Option<&Credential> {
        let text = url.as_str();
        let mut best: Option<(usize, &Credential)> = None;
        for (key, credential) in &self.entries {
            if text.starts_with(key.as_str()) {
                let length = key.len();
                if best.map(|(l, _)| length > l).unwrap_or(true) {
                    best = Some((length, credential));
                }
            }
        }
        if let Some((_, credential)) = best {
            return Some(credential);
        }
        if let Some(host) = url.host_str() {
            for (key, credential) in &self.entries {
                if key == host {
                    return Some(credential);
                }
            }
        }
        None
    }

    /// The record for an `s3://bucket` key.
    pub fn for_bucket(&self, bucket: &str) -> Option<&Credential> {
        let key = format!("s3://{}", bucket);
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, c)| c)
    }
}

fn parse_credential(key: &str, value: &serde_json::Value) -> Result<Credential> {
    let object = value.as_object().ok_or_else(|| {
        Error::Config(format!("credentials entry {:?} is not an object", key))
    })?;
    let text = |field: &str| -> Result<String> {
        object
            .get(field)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Config(format!(
                    "credentials entry {:?} lacks the {:?} field",
                    key, field
                ))
            })
    };
    match object.get("auth_type").and_then(|v| v.as_str()) {
        None => Ok(Credential::Basic {
            username: text("username")?,
            password: text("password")?,
        }),
        Some("oauth2") => {
            // Tolerate the historical `grand_type` misspelling.
            let grant_type = match object.get("grant_type").and_then(|v| v.as_str()) {
                Some(value) => value.to_string(),
                None => match object.get("grand_type").and_then(|v| v.as_str()) {
                    Some(value) => {
                        tracing::warn!(
                            entry = key,
                            "credentials use the misspelled 'grand_type' field; read it as 'grant_type'"
                        );
                        value.to_string()
                    }
                    None => return Err(Error::Config(format!(
                        "credentials entry {:?} lacks the \"grant_type\" field",
                        key
                    ))),
                },
            };
            Ok(Credential::OAuth2 {
                grant_type,
                username: text("username")?,
                password: text("password")?,
                client_id: text("client_id")?,
                client_secret: text("client_secret")?,
                token_url: text("token_url")?,
                auth_args: object.get("auth_args").cloned(),
            })
        }
        Some("S3") => Ok(Credential::S3 {
            bucket: text("bucket")?,
            access_key: text("access_key")?,
            secret_access_key: text("secret_access_key")?,
            port: object
                .get("port")
                .and_then(|v| v.as_u64())
                .map(|p| p as u16),
        }),
        Some("Swift") => Ok(Credential::Swift {
            user: text("user")?,
            key: text("key")?,
        }),
        Some(other) => Err(Error::Config(format!(
            "credentials entry {:?} has unknown auth_type {:?}",
            key, other
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"
# An archive over SQLite and local files.
[archive]
database = sqlite
storage = fs
cascade_grace_period = 15
namespace_extensions = optical
product_type_extensions = optical, radar

[sqlite]
connection_string = /data/catalogue.db
table_prefix = muninn_

[fs]
root = /data/archive
use_symlinks = true

[extension:optical]
cloud_mask = strict
"#;

    #[test]
    fn parses_sections_and_defaults() {
        let config = ArchiveConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.database, DatabaseKind::Sqlite);
        assert_eq!(config.storage, StorageKind::Fs);
        assert_eq!(config.cascade_grace_period, 15);
        assert_eq!(config.max_cascade_cycles, 25);
        assert_eq!(config.sqlite.table_prefix, "muninn_");
        assert_eq!(config.fs.root, PathBuf::from("/data/archive"));
        assert!(config.fs.use_symlinks);
        assert_eq!(config.namespace_extensions, vec!["optical"]);
        assert_eq!(config.product_type_extensions, vec!["optical", "radar"]);
        assert_eq!(
            config
                .extension_section("optical")
                .and_then(|s| s.get("cloud_mask"))
                .map(String::as_str),
            Some("strict")
        );
    }

    #[test]
    fn missing_mandatory_keys() {
        assert!(ArchiveConfig::parse("[archive]\nstorage = fs\n").is_err());
        assert!(ArchiveConfig::parse("[archive]\ndatabase = sqlite\nstorage = fs\n").is_err());
        let err = ArchiveConfig::parse(
            "[archive]\ndatabase = sqlite\nstorage = fs\n[sqlite]\nconnection_string = x\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("[fs] root"));
    }

    #[test]
    fn locate_by_directory_and_direct_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("myarchive.cfg");
        std::fs::write(&file, SAMPLE).unwrap();

        let path = dir.path().to_str().unwrap();
        assert_eq!(
            ArchiveConfig::locate("myarchive", Some(path)).unwrap(),
            file
        );
        assert_eq!(
            ArchiveConfig::locate(file.to_str().unwrap(), Some("")).unwrap(),
            file
        );
        assert!(ArchiveConfig::locate("other", Some(path)).is_err());
    }

    #[test]
    fn credentials_records() {
        let text = r#"{
            "https://data.example.com/private": {"username": "u", "password": "p"},
            "data.example.com": {"username": "host", "password": "wide"},
            "s3://products": {"auth_type": "S3", "bucket": "products",
                              "access_key": "ak", "secret_access_key": "sk"},
            "https://sso.example.com": {"auth_type": "oauth2", "grand_type": "password",
                "username": "u", "password": "p", "client_id": "c",
                "client_secret": "s", "token_url": "https://sso.example.com/token"}
        }"#;
        let credentials = Credentials::parse(text).unwrap();

        let url: url::Url = "https://data.example.com/private/file.dat".parse().unwrap();
        assert_eq!(
            credentials.resolve(&url),
            Some(&Credential::Basic {
                username: "u".to_string(),
                password: "p".to_string()
            })
        );

        let url: url::Url = "https://data.example.com/public/file.dat".parse().unwrap();
        assert!(matches!(
            credentials.resolve(&url),
            Some(Credential::Basic { username, .. }) if username == "host"
        ));

        assert!(matches!(
            credentials.for_bucket("products"),
            Some(Credential::S3 { .. })
        ));

        // The misspelled grand_type is accepted.
        let url: url::Url = "https://sso.example.com/anything".parse().unwrap();
        assert!(matches!(
            credentials.resolve(&url),
            Some(Credential::OAuth2 { grant_type, .. }) if grant_type == "password"
        ));
    }
}

//! The archive orchestrator: catalogue operations composed from the
//! schema, property, expression, database, storage and plug-in layers.
//!
//! Every public operation is an implicit transaction boundary and releases
//! the database connection before returning. Two-phase writes (ingest,
//! attach, pull) reserve the catalogue row with `active = false` before
//! touching bytes; the flag is the durable handshake between catalogue and
//! storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::cascade;
use crate::config::{ArchiveConfig, Credentials, DatabaseKind, StorageKind};
use crate::database::postgres::PostgresBackend;
use crate::database::sqlite::SqliteBackend;
use crate::database::{DatabaseBackend, SearchOptions, Summary, SummaryOptions};
use crate::error::{Error, Result};
use crate::expr::{BinaryOp, Expr, ParameterMap};
use crate::hash::parse_hash;
use crate::plugin::{Analysis, ExtensionSet, HookExtension, ProductType, Registry};
use crate::properties::Properties;
use crate::remote::HttpRemoteBackend;
use crate::schema::{SchemaSet, CORE};
use crate::storage::fs::FsStorage;
use crate::storage::none::NoneStorage;
use crate::storage::s3::S3Storage;
use crate::storage::swift::{SwiftConfig, SwiftStorage};
use crate::storage::{paths_size, ProductKey, StorageBackend};
use crate::value::{DataType, Value};

const REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct IngestOptions {
    /// Product type; when absent the registry probes `identify`.
    pub product_type: Option<String>,
    /// Caller-supplied properties; when absent the plug-in analyzes.
    pub properties: Option<Properties>,
    /// Move bytes into storage; `false` catalogues only.
    pub ingest_product: bool,
    pub use_symlinks: Option<bool>,
    /// Keep the bytes where they are (must already lie inside the
    /// archive root).
    pub use_current_path: bool,
    /// Re-read the stored bytes and compare content hashes.
    pub verify_hash: bool,
    /// Reclaim a conflicting half-ingested (`active = false`) row.
    pub force: bool,
}

impl Default for IngestOptions {
    fn default() -> Self {
        IngestOptions {
            product_type: None,
            properties: None,
            ingest_product: true,
            use_symlinks: None,
            use_current_path: false,
            verify_hash: false,
            force: false,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct AttachOptions {
    pub product_type: Option<String>,
    pub use_symlinks: Option<bool>,
    pub verify_hash: bool,
    /// Skip the size-equality check against the catalogued size.
    pub force: bool,
}

/// An archive handle: catalogue, storage and plug-in registry.
pub struct Archive {
    pub(crate) registry: Arc<Registry>,
    pub(crate) database: Box<dyn DatabaseBackend>,
    pub(crate) storage: Arc<dyn StorageBackend>,
    pub(crate) credentials: Credentials,
    /// Minutes a freshly catalogued product is exempt from cascading.
    pub(crate) cascade_grace_period: i64,
    pub(crate) max_cascade_cycles: u32,
    default_use_symlinks: bool,
}

impl Archive {
    /// Open an archive by id, resolving its configuration on the search
    /// path and its extensions against `extensions`.
    pub fn open(id: &str, extensions: &ExtensionSet) -> Result<Archive> {
        let path = ArchiveConfig::locate(id, None)?;
        let config = ArchiveConfig::load(&path)?;
        Archive::open_with_config(&config, extensions)
    }

    pub fn open_with_config(config: &ArchiveConfig, extensions: &ExtensionSet) -> Result<Archive> {
        let registry = Registry::from_extension_set(
            extensions,
            &config.namespace_extensions,
            &config.product_type_extensions,
            &config.remote_backend_extensions,
            &config.hook_extensions,
        )?;
        let schema = registry.schema();
        let database: Box<dyn DatabaseBackend> = match config.database {
            DatabaseKind::Postgresql => Box::new(PostgresBackend::new(
                config.postgresql.connection_string.as_str(),
                config.postgresql.table_prefix.as_str(),
                schema.clone(),
            )),
            DatabaseKind::Sqlite => Box::new(SqliteBackend::new(
                config.sqlite.connection_string.as_str(),
                config.sqlite.table_prefix.as_str(),
                config.sqlite.mod_spatialite_path.clone(),
                schema,
            )),
        };
        let storage: Arc<dyn StorageBackend> = match config.storage {
            StorageKind::Fs => Arc::new(FsStorage::new(&config.fs.root, config.tempdir.clone())),
            StorageKind::S3 => Arc::new(S3Storage::new(&config.s3, config.tempdir.clone())?),
            StorageKind::Swift => Arc::new(SwiftStorage::new(
                SwiftConfig {
                    container: config.swift.container.clone(),
                    user: config.swift.user.clone(),
                    key: config.swift.key.clone(),
                    authurl: config.swift.authurl.clone(),
                },
                config.tempdir.clone(),
            )),
            StorageKind::None => Arc::new(NoneStorage::new(config.tempdir.clone())),
        };
        let credentials = match &config.auth_file {
            Some(path) => Credentials::load(path)?,
            None => Credentials::default(),
        };
        Archive::assemble(
            registry,
            database,
            storage,
            credentials,
            config.cascade_grace_period,
            config.max_cascade_cycles,
            config.fs.use_symlinks,
        )
    }

    /// Assemble a handle from already-built parts (also the test seam).
    pub fn assemble(
        mut registry: Registry,
        database: Box<dyn DatabaseBackend>,
        storage: Arc<dyn StorageBackend>,
        credentials: Credentials,
        cascade_grace_period: i64,
        max_cascade_cycles: u32,
        default_use_symlinks: bool,
    ) -> Result<Archive> {
        // The HTTP(S) transport is always available, probed after any
        // registered transports.
        registry.register_remote_backend(Arc::new(HttpRemoteBackend::new(REMOTE_TIMEOUT)?));
        Ok(Archive {
            registry: Arc::new(registry),
            database,
            storage,
            credentials,
            cascade_grace_period,
            max_cascade_cycles,
            default_use_symlinks,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn schema(&self) -> Arc<SchemaSet> {
        self.registry.schema()
    }

    // ------------------------------------------------------------------
    // Connection discipline.

    async fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            let _ = self.database.rollback().await;
        }
        let disconnect = self.database.disconnect().await;
        match (result, disconnect) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    // ------------------------------------------------------------------
    // Catalogue lifecycle.

    pub async fn prepare(&mut self) -> Result<()> {
        let result = async {
            self.database.prepare().await?;
            self.storage.prepare().await
        }
        .await;
        self.finish(result).await
    }

    /// Drop every catalogue row and all stored bytes.
    pub async fn destroy(&mut self) -> Result<()> {
        let result = async {
            self.database.destroy().await?;
            self.storage.destroy().await
        }
        .await;
        self.finish(result).await
    }

    pub async fn catalogue_exists(&mut self) -> Result<bool> {
        let result = self.database.exists().await;
        self.finish(result).await
    }

    // ------------------------------------------------------------------
    // Searching.

    pub async fn search(
        &mut self,
        expression: Option<&str>,
        parameters: &ParameterMap,
        options: &SearchOptions,
    ) -> Result<Vec<Properties>> {
        let expr = self.compile(expression, parameters)?;
        let result = self.database.search(expr.as_ref(), options).await;
        self.finish(result).await
    }

    pub async fn count(&mut self, expression: Option<&str>, parameters: &ParameterMap) -> Result<i64> {
        let expr = self.compile(expression, parameters)?;
        let result = self.database.count(expr.as_ref()).await;
        self.finish(result).await
    }

    pub async fn summary(
        &mut self,
        expression: Option<&str>,
        parameters: &ParameterMap,
        options: &SummaryOptions,
    ) -> Result<Summary> {
        let expr = self.compile(expression, parameters)?;
        let result = self.database.summary(expr.as_ref(), options).await;
        self.finish(result).await
    }

    fn compile(&self, expression: Option<&str>, parameters: &ParameterMap) -> Result<Option<Expr>> {
        expression
            .map(|text| crate::expr::compile(text, &self.registry.schema(), parameters))
            .transpose()
    }

    /// The product with the given UUID.
    pub async fn product(&mut self, uuid: Uuid) -> Result<Properties> {
        let result = self.fetch_product(uuid).await;
        self.finish(result).await
    }

    async fn fetch_product(&mut self, uuid: Uuid) -> Result<Properties> {
        let namespaces: Vec<String> = self
            .registry
            .schema()
            .extensions()
            .map(|ns| ns.name().to_string())
            .collect();
        let options = SearchOptions {
            namespaces,
            ..Default::default()
        };
        let expr = uuid_condition(uuid);
        let mut rows = self.database.search(Some(&expr), &options).await?;
        rows.pop()
            .ok_or_else(|| Error::NotFound(format!("product {} does not exist", uuid)))
    }

    async fn find_by_name(
        &mut self,
        product_type: &str,
        field: &str,
        name: &str,
    ) -> Result<Option<Properties>> {
        let expr = Expr::Binary {
            op: BinaryOp::And,
            lhs: Box::new(field_equals("product_type", Value::Text(product_type.into()))),
            rhs: Box::new(field_equals(field, Value::Text(name.into()))),
        };
        let mut rows = self
            .database
            .search(Some(&expr), &SearchOptions::default())
            .await?;
        Ok(rows.pop())
    }

    // ------------------------------------------------------------------
    // Ingest.

    /// Identify the product type of the given paths.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<String> {
        Ok(self.registry.identify(paths)?.name().to_string())
    }

    pub async fn ingest(&mut self, paths: &[PathBuf], options: IngestOptions) -> Result<Properties> {
        let result = self.ingest_inner(paths, &options).await;
        self.finish(result).await
    }

    async fn ingest_inner(
        &mut self,
        paths: &[PathBuf],
        options: &IngestOptions,
    ) -> Result<Properties> {
        if paths.is_empty() {
            return Err(Error::State("nothing to ingest".to_string()));
        }
        let plugin = match &options.product_type {
            Some(name) => self.registry.product_type(name)?,
            None => self.registry.identify(paths)?,
        };
        let Analysis {
            mut properties,
            tags,
        } = match &options.properties {
            Some(properties) => Analysis {
                properties: properties.clone(),
                tags: Vec::new(),
            },
            None => plugin.analyze(paths)?,
        };
        if properties.product_name().is_none() {
            return Err(Error::Plugin(format!(
                "product type {:?} produced no core.product_name",
                plugin.name()
            )));
        }

        let uuid = match properties.uuid() {
            Some(uuid) => uuid,
            None => {
                let uuid = Uuid::new_v4();
                properties.set_core("uuid", Value::Uuid(uuid));
                uuid
            }
        };
        let now = Utc::now().naive_utc();
        properties.set_core("product_type", Value::Text(plugin.name().to_string()));
        properties.set_core("metadata_date", Value::Timestamp(now));

        let size = paths_size(paths).await?;
        properties.set_core("size", Value::Long64(size as i64));
        if let Some(algorithm) = plugin.hash_type() {
            properties.set_core(
                "hash",
                Value::Text(crate::storage::hash_paths(paths, algorithm).await?),
            );
        }

        let physical_name = if plugin.use_enclosing_directory() {
            plugin.enclosing_directory(&properties)?
        } else {
            match paths {
                [path] => crate::storage::file_name(path)?,
                _ => {
                    return Err(Error::Plugin(format!(
                        "product type {:?} takes a single path",
                        plugin.name()
                    )))
                }
            }
        };
        properties.set_core("physical_name", Value::Text(physical_name.clone()));

        let ingest_bytes = options.ingest_product && !self.storage.is_catalogue_only();
        let archive_path = if !ingest_bytes {
            None
        } else if options.use_current_path {
            let (archive_path, located_name) = self
                .storage
                .relative_location(&paths[0])
                .ok_or_else(|| {
                    Error::State(format!(
                        "{:?} does not lie inside the archive root",
                        paths[0]
                    ))
                })?;
            if !plugin.use_enclosing_directory() && located_name != physical_name {
                return Err(Error::State(format!(
                    "current path {:?} does not match physical name {:?}",
                    located_name, physical_name
                )));
            }
            Some(archive_path)
        } else {
            Some(plugin.archive_path(&properties)?)
        };

        let use_symlinks = options.use_symlinks.unwrap_or(self.default_use_symlinks);
        if ingest_bytes && use_symlinks && !self.storage.supports_symlinks() {
            return Err(Error::storage(
                "this storage backend does not support symlinks",
            ));
        }

        properties.set_core("active", Value::Boolean(!ingest_bytes));
        properties.validate(&self.registry.schema(), true)?;

        // Phase one: reserve the catalogue slots before touching bytes.
        self.database.begin().await?;
        match self.database.insert_product(&properties).await {
            Ok(()) => {}
            Err(Error::Conflict(message)) => {
                self.database.rollback().await?;
                if !options.force {
                    return Err(Error::Conflict(message));
                }
                self.reclaim_reservation(&plugin, &properties).await?;
                self.database.begin().await?;
                self.database.insert_product(&properties).await?;
            }
            Err(err) => return Err(err),
        }
        self.database.commit().await?;

        if ingest_bytes {
            let archive_path = archive_path.unwrap_or_default();
            let key = ProductKey::new(
                &archive_path,
                &physical_name,
                plugin.use_enclosing_directory(),
            );
            if !options.use_current_path {
                self.storage.put(paths, &key, use_symlinks).await?;
            }
            if options.verify_hash {
                self.verify_stored_hash(&properties, &key).await?;
            }

            // Phase two: activate the product.
            let mut update = Properties::new();
            update.set_core("active", Value::Boolean(true));
            update.set_core("archive_date", Value::Timestamp(Utc::now().naive_utc()));
            update.set_core("archive_path", Value::Text(archive_path.clone()));
            self.database.begin().await?;
            self.database.update_product(uuid, &update, false).await?;
            if !tags.is_empty() {
                self.database.tag(uuid, &tags).await?;
            }
            self.database.commit().await?;
            properties.merge(&update);
        } else if !tags.is_empty() {
            self.database.begin().await?;
            self.database.tag(uuid, &tags).await?;
            self.database.commit().await?;
        }

        // Hooks run after commit and never roll the catalogue back.
        if ingest_bytes {
            self.run_ingest_hooks(&plugin, &mut properties).await?;
        } else {
            self.run_create_hooks(Some(&plugin), &mut properties).await?;
        }
        tracing::debug!(uuid = %uuid, product_type = plugin.name(), "ingested product");
        Ok(properties)
    }

    /// With `force`, a conflicting half-ingested row is removed so its
    /// `(type, name)` and `(archive_path, physical_name)` slots free up.
    async fn reclaim_reservation(
        &mut self,
        plugin: &Arc<dyn ProductType>,
        properties: &Properties,
    ) -> Result<()> {
        let name = properties
            .product_name()
            .ok_or_else(|| Error::Schema("product properties carry no product_name".into()))?
            .to_string();
        let existing = self
            .find_by_name(plugin.name(), "product_name", &name)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!(
                    "a conflicting product of type {:?} named {:?} exists but was not found",
                    plugin.name(),
                    name
                ))
            })?;
        if existing.active() {
            return Err(Error::Conflict(format!(
                "product {:?} of type {:?} already exists",
                name,
                plugin.name()
            )));
        }
        let stale = existing.require_uuid()?;
        tracing::warn!(uuid = %stale, "reclaiming half-ingested reservation");
        self.database.begin().await?;
        self.database.delete_product(stale).await?;
        self.database.commit().await?;
        Ok(())
    }

    async fn verify_stored_hash(&mut self, properties: &Properties, key: &ProductKey) -> Result<()> {
        let recorded = match properties.hash() {
            Some(hash) => hash.to_string(),
            None => return Ok(()),
        };
        let (algorithm, _) = parse_hash(&recorded)?;
        let actual = self.storage.hash(key, algorithm).await?;
        let normalized = if recorded.contains(':') {
            recorded.clone()
        } else {
            format!("sha1:{}", recorded)
        };
        if actual != normalized {
            return Err(Error::storage(format!(
                "hash mismatch for {}: recorded {}, stored {}",
                key.relative(),
                normalized,
                actual
            )));
        }
        Ok(())
    }

    /// Catalogue a product without bytes.
    pub async fn create_properties(&mut self, properties: Properties) -> Result<Properties> {
        let result = self.create_properties_inner(properties).await;
        self.finish(result).await
    }

    async fn create_properties_inner(&mut self, mut properties: Properties) -> Result<Properties> {
        if properties.uuid().is_none() {
            properties.set_core("uuid", Value::Uuid(Uuid::new_v4()));
        }
        properties.set_core("active", Value::Boolean(true));
        properties.set_core("metadata_date", Value::Timestamp(Utc::now().naive_utc()));
        if properties.product_type().is_none() || properties.product_name().is_none() {
            return Err(Error::Schema(
                "create_properties requires core.product_type and core.product_name".to_string(),
            ));
        }
        if properties.physical_name().is_none() {
            let name = properties.product_name().unwrap_or_default().to_string();
            properties.set_core("physical_name", Value::Text(name));
        }
        properties.validate(&self.registry.schema(), true)?;
        self.database.begin().await?;
        self.database.insert_product(&properties).await?;
        self.database.commit().await?;

        let plugin = properties
            .product_type()
            .and_then(|name| self.registry.product_type(name).ok());
        self.run_create_hooks(plugin.as_ref(), &mut properties).await?;
        Ok(properties)
    }

    // ------------------------------------------------------------------
    // Attach / pull.

    /// Re-attach bytes to a stripped catalogue record.
    pub async fn attach(&mut self, paths: &[PathBuf], options: AttachOptions) -> Result<Properties> {
        let result = self.attach_inner(paths, &options).await;
        self.finish(result).await
    }

    async fn attach_inner(
        &mut self,
        paths: &[PathBuf],
        options: &AttachOptions,
    ) -> Result<Properties> {
        if paths.is_empty() {
            return Err(Error::State("nothing to attach".to_string()));
        }
        let plugin = match &options.product_type {
            Some(name) => self.registry.product_type(name)?,
            None => self.registry.identify(paths)?,
        };
        let physical_name = if paths.len() == 1 {
            crate::storage::file_name(&paths[0])?
        } else {
            let analysis = plugin.analyze(paths)?;
            plugin.enclosing_directory(&analysis.properties)?
        };

        let mut properties = self
            .find_by_name(plugin.name(), "physical_name", &physical_name)
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no {} product with physical name {:?}",
                    plugin.name(),
                    physical_name
                ))
            })?;
        if !properties.active() {
            return Err(Error::State(format!(
                "product {:?} is not active",
                physical_name
            )));
        }
        if properties.archive_path().is_some() {
            return Err(Error::State(format!(
                "product {:?} already has bytes in storage",
                physical_name
            )));
        }
        let uuid = properties.require_uuid()?;

        if !options.force {
            if let Some(recorded) = properties.size() {
                let actual = paths_size(paths).await? as i64;
                if actual != recorded {
                    return Err(Error::State(format!(
                        "size mismatch for {:?}: catalogued {}, attaching {}",
                        physical_name, recorded, actual
                    )));
                }
            }
        }
        if options.verify_hash {
            if let Some(recorded) = properties.hash() {
                let (algorithm, _) = parse_hash(recorded)?;
                let actual = crate::storage::hash_paths(paths, algorithm).await?;
                let normalized = if recorded.contains(':') {
                    recorded.to_string()
                } else {
                    format!("sha1:{}", recorded)
                };
                if actual != normalized {
                    return Err(Error::storage(format!(
                        "hash mismatch for {:?}: recorded {}, attaching {}",
                        physical_name, normalized, actual
                    )));
                }
            }
        }

        let archive_path = plugin.archive_path(&properties)?;
        let key = ProductKey::new(
            &archive_path,
            &physical_name,
            plugin.use_enclosing_directory(),
        );
        if self.storage.exists(&key).await? {
            return Err(Error::State(format!(
                "bytes for {:?} are already present in storage",
                physical_name
            )));
        }

        // Reserve, move bytes, then activate again.
        let mut reserve = Properties::new();
        reserve.set_core("active", Value::Boolean(false));
        self.database.begin().await?;
        self.database.update_product(uuid, &reserve, false).await?;
        self.database.commit().await?;

        let restore = async {
            let use_symlinks = options.use_symlinks.unwrap_or(self.default_use_symlinks);
            let written = self.storage.put(paths, &key, use_symlinks).await?;

            let mut update = Properties::new();
            update.set_core("active", Value::Boolean(true));
            update.set_core("archive_date", Value::Timestamp(Utc::now().naive_utc()));
            update.set_core("archive_path", Value::Text(archive_path.clone()));
            if properties.size().is_none() {
                update.set_core("size", Value::Long64(written as i64));
            }
            self.database.begin().await?;
            self.database.update_product(uuid, &update, false).await?;
            self.database.commit().await?;
            Ok(update)
        }
        .await;
        match restore {
            Ok(update) => {
                properties.merge(&update);
                Ok(properties)
            }
            Err(err) => Err(err),
        }
    }

    /// Fetch a remote product's bytes into storage.
    pub async fn pull(&mut self, uuid: Uuid, verify_hash: bool) -> Result<Properties> {
        let result = self.pull_inner(uuid, verify_hash).await;
        self.finish(result).await
    }

    async fn pull_inner(&mut self, uuid: Uuid, verify_hash: bool) -> Result<Properties> {
        let mut properties = self.fetch_product(uuid).await?;
        if !properties.active() {
            return Err(Error::State(format!("product {} is not active", uuid)));
        }
        if properties.archive_path().is_some() {
            return Err(Error::State(format!(
                "product {} already has bytes in storage",
                uuid
            )));
        }
        let url_text = properties
            .remote_url()
            .ok_or_else(|| Error::State(format!("product {} has no remote_url", uuid)))?
            .to_string();
        let url: url::Url = url_text
            .parse()
            .map_err(|_| Error::storage(format!("malformed remote URL {:?}", url_text)))?;
        let remote = self.registry.remote_backend(&url)?;
        let plugin = self
            .registry
            .product_type(properties.product_type().unwrap_or_default())?;

        // Reserve while the transfer runs.
        let mut reserve = Properties::new();
        reserve.set_core("active", Value::Boolean(false));
        self.database.begin().await?;
        self.database.update_product(uuid, &reserve, false).await?;
        self.database.commit().await?;

        let outcome = self
            .pull_transfer(&plugin, &remote, &url, &mut properties, verify_hash)
            .await;
        match outcome {
            Ok(()) => {
                self.run_pull_hooks(&plugin, &mut properties).await?;
                Ok(properties)
            }
            Err(err) => {
                // The bytes never made it; the record is still a valid
                // catalogue-only product.
                let mut reset = Properties::new();
                reset.set_core("active", Value::Boolean(true));
                self.database.begin().await?;
                self.database.update_product(uuid, &reset, false).await?;
                self.database.commit().await?;
                Err(err)
            }
        }
    }

    async fn pull_transfer(
        &mut self,
        plugin: &Arc<dyn ProductType>,
        remote: &Arc<dyn crate::plugin::RemoteBackend>,
        url: &url::Url,
        properties: &mut Properties,
        verify_hash: bool,
    ) -> Result<()> {
        let uuid = properties.require_uuid()?;
        let workspace = self.storage.temp_workspace()?;
        let credential = self.credentials.resolve(url);
        let paths = remote.pull(properties, workspace.path(), credential).await?;
        if paths.is_empty() {
            return Err(Error::storage(format!(
                "remote backend returned no files for {}",
                url
            )));
        }

        let size = paths_size(&paths).await?;
        let hash = match plugin.hash_type() {
            Some(algorithm) => Some(crate::storage::hash_paths(&paths, algorithm).await?),
            None => None,
        };
        if verify_hash {
            if let (Some(actual), Some(recorded)) = (&hash, properties.hash()) {
                let normalized = if recorded.contains(':') {
                    recorded.to_string()
                } else {
                    format!("sha1:{}", recorded)
                };
                // Only comparable when the algorithms line up.
                if normalized
                    .split(':')
                    .next()
                    .map(|a| actual.starts_with(a))
                    .unwrap_or(false)
                    && *actual != normalized
                {
                    return Err(Error::storage(format!(
                        "hash mismatch for pulled product {}: recorded {}, pulled {}",
                        uuid, normalized, actual
                    )));
                }
            }
        }

        let physical_name = properties
            .physical_name()
            .ok_or_else(|| Error::Schema("product carries no physical_name".into()))?
            .to_string();
        let archive_path = plugin.archive_path(properties)?;
        let key = ProductKey::new(
            &archive_path,
            &physical_name,
            plugin.use_enclosing_directory(),
        );
        self.storage.put(&paths, &key, false).await?;
        drop(workspace);

        let mut update = Properties::new();
        update.set_core("active", Value::Boolean(true));
        update.set_core("archive_date", Value::Timestamp(Utc::now().naive_utc()));
        update.set_core("archive_path", Value::Text(archive_path));
        update.set_core("size", Value::Long64(size as i64));
        if let Some(hash) = hash {
            update.set_core("hash", Value::Text(hash));
        }
        self.database.begin().await?;
        self.database.update_product(uuid, &update, false).await?;
        self.database.commit().await?;
        properties.merge(&update);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Strip / remove / delete.

    /// Delete a product's bytes but keep its catalogue record.
    pub async fn strip(&mut self, uuid: Uuid, force: bool, cascade: bool) -> Result<()> {
        let result = async {
            self.strip_product(uuid, force).await?;
            if cascade {
                cascade::run(self).await?;
            }
            Ok(())
        }
        .await;
        self.finish(result).await
    }

    pub(crate) async fn strip_product(&mut self, uuid: Uuid, force: bool) -> Result<()> {
        let properties = self.fetch_product(uuid).await?;
        if !properties.active() && !force {
            return Err(Error::State(format!("product {} is not active", uuid)));
        }
        let archive_path = properties
            .archive_path()
            .ok_or_else(|| {
                Error::State(format!("product {} has no bytes in storage", uuid))
            })?
            .to_string();
        let key = self.product_key(&properties, &archive_path)?;
        self.storage.remove(&key).await?;

        let mut update = Properties::new();
        update.clear_field(CORE, "archive_date");
        update.clear_field(CORE, "archive_path");
        update.set_core("active", Value::Boolean(true));
        update.set_core("metadata_date", Value::Timestamp(Utc::now().naive_utc()));
        self.database.begin().await?;
        self.database.update_product(uuid, &update, false).await?;
        self.database.commit().await?;
        tracing::debug!(uuid = %uuid, "stripped product");
        Ok(())
    }

    /// Delete a product's bytes and its catalogue record.
    pub async fn remove(&mut self, uuid: Uuid, force: bool, cascade: bool) -> Result<()> {
        let result = async {
            self.remove_product(uuid, force).await?;
            if cascade {
                cascade::run(self).await?;
            }
            Ok(())
        }
        .await;
        self.finish(result).await
    }

    pub(crate) async fn remove_product(&mut self, uuid: Uuid, force: bool) -> Result<()> {
        let properties = self.fetch_product(uuid).await?;
        if !properties.active() && !force {
            return Err(Error::State(format!(
                "product {} is not active (use force to remove a partial ingest)",
                uuid
            )));
        }
        if let Some(archive_path) = properties.archive_path().map(str::to_string) {
            let key = self.product_key(&properties, &archive_path)?;
            self.storage.remove(&key).await?;
        }
        self.database.begin().await?;
        self.database.delete_product(uuid).await?;
        self.database.commit().await?;

        self.run_remove_hooks(&properties).await?;
        tracing::debug!(uuid = %uuid, "removed product");
        Ok(())
    }

    /// Remove catalogue rows only; bytes are left alone.
    pub async fn delete_properties(&mut self, uuid: Uuid) -> Result<()> {
        let result = async {
            self.database.begin().await?;
            self.database.delete_product(uuid).await?;
            self.database.commit().await
        }
        .await;
        self.finish(result).await
    }

    fn product_key(&self, properties: &Properties, archive_path: &str) -> Result<ProductKey> {
        let physical_name = properties
            .physical_name()
            .ok_or_else(|| Error::Schema("product carries no physical_name".into()))?;
        let enclosing = properties
            .product_type()
            .and_then(|name| self.registry.product_type(name).ok())
            .map(|plugin| plugin.use_enclosing_directory())
            .unwrap_or(false);
        Ok(ProductKey::new(archive_path, physical_name, enclosing))
    }

    // ------------------------------------------------------------------
    // Retrieve / export.

    /// Copy (or symlink) a product's bytes into `target_dir`.
    pub async fn retrieve(
        &mut self,
        uuid: Uuid,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let result = self.retrieve_inner(uuid, target_dir, use_symlinks).await;
        self.finish(result).await
    }

    async fn retrieve_inner(
        &mut self,
        uuid: Uuid,
        target_dir: &Path,
        use_symlinks: bool,
    ) -> Result<Vec<PathBuf>> {
        let properties = self.fetch_product(uuid).await?;
        match properties.archive_path() {
            Some(archive_path) => {
                let key = self.product_key(&properties, &archive_path.to_string())?;
                self.storage.retrieve(&key, target_dir, use_symlinks).await
            }
            None => {
                // Transparent remote fetch for catalogue-only products.
                let url_text = properties.remote_url().ok_or_else(|| {
                    Error::State(format!(
                        "product {} has neither stored bytes nor a remote_url",
                        uuid
                    ))
                })?;
                let url: url::Url = url_text.parse().map_err(|_| {
                    Error::storage(format!("malformed remote URL {:?}", url_text))
                })?;
                let remote = self.registry.remote_backend(&url)?;
                let credential = self.credentials.resolve(&url);
                remote.pull(&properties, target_dir, credential).await
            }
        }
    }

    /// The on-disk location of a product's bytes, for storages with a
    /// local root (`None` for object stores and catalogue-only storage).
    pub async fn product_path(&mut self, uuid: Uuid) -> Result<Option<PathBuf>> {
        let result = async {
            let properties = self.fetch_product(uuid).await?;
            match properties.archive_path() {
                Some(archive_path) => {
                    let key = self.product_key(&properties, archive_path)?;
                    Ok(self.storage.local_path(&key))
                }
                None => Ok(None),
            }
        }
        .await;
        self.finish(result).await
    }

    /// Export a product, deferring to the plug-in for named formats.
    pub async fn export(
        &mut self,
        uuid: Uuid,
        format: Option<&str>,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        let result = self.export_inner(uuid, format, target_dir).await;
        self.finish(result).await
    }

    async fn export_inner(
        &mut self,
        uuid: Uuid,
        format: Option<&str>,
        target_dir: &Path,
    ) -> Result<PathBuf> {
        let properties = self.fetch_product(uuid).await?;
        let format = match format {
            None => {
                let mut paths = self.retrieve_inner(uuid, target_dir, false).await?;
                return paths
                    .pop()
                    .ok_or_else(|| Error::storage("retrieve produced no paths"));
            }
            Some(format) => format,
        };
        let plugin = self
            .registry
            .product_type(properties.product_type().unwrap_or_default())?;
        if !plugin.export_formats().iter().any(|f| *f == format) {
            return Err(Error::Plugin(format!(
                "product type {:?} does not export format {:?}",
                plugin.name(),
                format
            )));
        }
        plugin.export(self, &properties, format, target_dir).await
    }

    // ------------------------------------------------------------------
    // Tags and links.

    pub async fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()> {
        let result = async {
            if tags.iter().any(|t| t.is_empty()) {
                return Err(Error::State("tags must be non-empty".to_string()));
            }
            self.assert_exists(uuid).await?;
            self.database.tag(uuid, tags).await
        }
        .await;
        self.finish(result).await
    }

    pub async fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        let result = self.database.untag(uuid, tags).await;
        self.finish(result).await
    }

    pub async fn list_tags(&mut self, uuid: Uuid) -> Result<Vec<String>> {
        let result = self.database.list_tags(uuid).await;
        self.finish(result).await
    }

    /// Record that `uuid` was derived from `source`.
    pub async fn link(&mut self, uuid: Uuid, source: Uuid) -> Result<()> {
        let result = async {
            if uuid == source {
                return Err(Error::State("a product cannot be its own source".to_string()));
            }
            self.assert_exists(uuid).await?;
            // The source may live in an external archive; tolerated, not
            // verified.
            self.database.link(uuid, source).await
        }
        .await;
        self.finish(result).await
    }

    pub async fn unlink(&mut self, uuid: Uuid, source: Option<Uuid>) -> Result<()> {
        let result = self.database.unlink(uuid, source).await;
        self.finish(result).await
    }

    pub async fn derived_products(&mut self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let result = self.database.derived_of(uuid).await;
        self.finish(result).await
    }

    pub async fn source_products(&mut self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let result = self.database.sources_of(uuid).await;
        self.finish(result).await
    }

    async fn assert_exists(&mut self, uuid: Uuid) -> Result<()> {
        let expr = uuid_condition(uuid);
        if self.database.count(Some(&expr)).await? == 0 {
            return Err(Error::NotFound(format!("product {} does not exist", uuid)));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Updates.

    /// Apply a partial property update. A namespace set to the null
    /// sentinel is removed; `create_namespaces` inserts missing namespace
    /// rows instead of failing.
    pub async fn update_properties(
        &mut self,
        uuid: Uuid,
        update: &Properties,
        create_namespaces: bool,
    ) -> Result<()> {
        let result = async {
            update.validate(&self.registry.schema(), true)?;
            let mut update = update.clone();
            if update.metadata_date().is_none() {
                update.set_core("metadata_date", Value::Timestamp(Utc::now().naive_utc()));
            }
            self.database.begin().await?;
            self.database
                .update_product(uuid, &update, create_namespaces)
                .await?;
            self.database.commit().await
        }
        .await;
        self.finish(result).await
    }

    /// Re-run `analyze` on the stored bytes and merge the result; fields
    /// the plug-in no longer returns are preserved.
    pub async fn rebuild_properties(&mut self, uuid: Uuid) -> Result<Properties> {
        let result = self.rebuild_inner(uuid).await;
        self.finish(result).await
    }

    async fn rebuild_inner(&mut self, uuid: Uuid) -> Result<Properties> {
        let mut properties = self.fetch_product(uuid).await?;
        let archive_path = properties
            .archive_path()
            .ok_or_else(|| {
                Error::State(format!("product {} has no bytes in storage", uuid))
            })?
            .to_string();
        let plugin = self
            .registry
            .product_type(properties.product_type().unwrap_or_default())?;

        let workspace = self.storage.temp_workspace()?;
        let key = self.product_key(&properties, &archive_path)?;
        let paths = self.storage.retrieve(&key, workspace.path(), false).await?;
        let analysis = plugin.analyze(&paths)?;
        drop(workspace);

        // Identity and placement stay authoritative in the catalogue.
        const PROTECTED: [&str; 6] = [
            "uuid",
            "active",
            "archive_date",
            "archive_path",
            "physical_name",
            "product_type",
        ];
        let mut update = Properties::new();
        for (namespace, fields) in analysis.properties.defined() {
            for (name, value) in fields {
                if namespace == CORE && PROTECTED.contains(&name.as_str()) {
                    continue;
                }
                if let Some(value) = value {
                    update.set(namespace, name, value.clone());
                }
            }
        }
        update.set_core("metadata_date", Value::Timestamp(Utc::now().naive_utc()));
        update.validate(&self.registry.schema(), true)?;

        self.database.begin().await?;
        self.database.update_product(uuid, &update, true).await?;
        if !analysis.tags.is_empty() {
            self.database.tag(uuid, &analysis.tags).await?;
        }
        self.database.commit().await?;
        properties.merge(&update);
        Ok(properties)
    }

    // ------------------------------------------------------------------
    // Hooks.

    async fn run_ingest_hooks(
        &mut self,
        plugin: &Arc<dyn ProductType>,
        properties: &mut Properties,
    ) -> Result<()> {
        let mut first_error: Option<Error> = None;
        if let Err(err) = plugin.post_ingest_hook(self, properties).await {
            record_hook_error(&mut first_error, "post_ingest_hook", err);
        }
        for hook in self.registry.hook_extensions() {
            if let Err(err) = hook.post_ingest_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_ingest_hook", err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_create_hooks(
        &mut self,
        plugin: Option<&Arc<dyn ProductType>>,
        properties: &mut Properties,
    ) -> Result<()> {
        let mut first_error: Option<Error> = None;
        if let Some(plugin) = plugin {
            if let Err(err) = plugin.post_create_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_create_hook", err);
            }
        }
        for hook in self.registry.hook_extensions() {
            if let Err(err) = hook.post_create_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_create_hook", err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_pull_hooks(
        &mut self,
        plugin: &Arc<dyn ProductType>,
        properties: &mut Properties,
    ) -> Result<()> {
        let mut first_error: Option<Error> = None;
        if let Err(err) = plugin.post_pull_hook(self, properties).await {
            record_hook_error(&mut first_error, "post_pull_hook", err);
        }
        for hook in self.registry.hook_extensions() {
            if let Err(err) = hook.post_pull_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_pull_hook", err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn run_remove_hooks(&mut self, properties: &Properties) -> Result<()> {
        let mut first_error: Option<Error> = None;
        if let Some(plugin) = properties
            .product_type()
            .and_then(|name| self.registry.product_type(name).ok())
        {
            if let Err(err) = plugin.post_remove_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_remove_hook", err);
            }
        }
        // Teardown mirrors setup: reverse registration order.
        let hooks: Vec<Arc<dyn HookExtension>> = self.registry.hook_extensions_reversed();
        for hook in hooks {
            if let Err(err) = hook.post_remove_hook(self, properties).await {
                record_hook_error(&mut first_error, "post_remove_hook", err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record_hook_error(first: &mut Option<Error>, hook: &str, err: Error) {
    tracing::error!(hook, error = %err, "hook failed after commit");
    if first.is_none() {
        *first = Some(match err {
            err @ Error::Plugin(_) => err,
            other => Error::Plugin(format!("{} failed: {}", hook, other)),
        });
    }
}

pub(crate) fn uuid_condition(uuid: Uuid) -> Expr {
    field_equals("uuid", Value::Uuid(uuid))
}

fn field_equals(field: &str, value: Value) -> Expr {
    Expr::Binary {
        op: BinaryOp::Eq,
        lhs: Box::new(Expr::Property {
            namespace: CORE.to_string(),
            field: field.to_string(),
            data_type: match &value {
                Value::Uuid(_) => DataType::Uuid,
                _ => DataType::Text,
            },
        }),
        rhs: Box::new(Expr::Literal(value)),
    }
}

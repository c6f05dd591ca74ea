//! The plug-in registry: product types, namespaces, remote backends and
//! hook extensions, bound to the core at archive-open time.
//!
//! Rust has no ambient module path to import extensions from, so
//! extension factories are registered on a [`Registry`] (or selected from
//! an [`ExtensionSet`]) before the archive opens; the configuration's
//! `*_extensions` lists pick registered factories by name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::properties::Properties;
use crate::schema::{Namespace, SchemaSet};

/// Per-type policy applied when a product's sources are all removed or
/// all stripped.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum CascadeRule {
    #[default]
    Ignore,
    CascadePurgeAsStrip,
    CascadePurge,
    Strip,
    Cascade,
    Purge,
}

impl CascadeRule {
    pub fn name(&self) -> &'static str {
        match self {
            CascadeRule::Ignore => "IGNORE",
            CascadeRule::CascadePurgeAsStrip => "CASCADE_PURGE_AS_STRIP",
            CascadeRule::CascadePurge => "CASCADE_PURGE",
            CascadeRule::Strip => "STRIP",
            CascadeRule::Cascade => "CASCADE",
            CascadeRule::Purge => "PURGE",
        }
    }

    pub fn from_name(name: &str) -> Result<CascadeRule> {
        Ok(match name {
            "IGNORE" => CascadeRule::Ignore,
            "CASCADE_PURGE_AS_STRIP" => CascadeRule::CascadePurgeAsStrip,
            "CASCADE_PURGE" => CascadeRule::CascadePurge,
            "STRIP" => CascadeRule::Strip,
            "CASCADE" => CascadeRule::Cascade,
            "PURGE" => CascadeRule::Purge,
            _ => return Err(Error::Config(format!("unknown cascade rule {:?}", name))),
        })
    }
}

/// What the cascade engine does to a derived product.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CascadeAction {
    None,
    Strip,
    Remove,
}

impl CascadeRule {
    /// The action when all sources of the derived product were removed.
    pub fn on_sources_removed(&self) -> CascadeAction {
        match self {
            CascadeRule::Ignore => CascadeAction::None,
            CascadeRule::CascadePurgeAsStrip | CascadeRule::Strip => CascadeAction::Strip,
            CascadeRule::CascadePurge | CascadeRule::Cascade | CascadeRule::Purge => {
                CascadeAction::Remove
            }
        }
    }

    /// The action when all sources still exist but were stripped.
    pub fn on_sources_stripped(&self) -> CascadeAction {
        match self {
            CascadeRule::Ignore
            | CascadeRule::CascadePurgeAsStrip
            | CascadeRule::CascadePurge => CascadeAction::None,
            CascadeRule::Strip | CascadeRule::Cascade => CascadeAction::Strip,
            CascadeRule::Purge => CascadeAction::Remove,
        }
    }
}

/// Result of a product type's `analyze`.
#[derive(Clone, Debug, Default)]
pub struct Analysis {
    pub properties: Properties,
    pub tags: Vec<String>,
}

/// Type-specific behavior of one product type.
#[async_trait]
pub trait ProductType: Send + Sync {
    fn name(&self) -> &str;

    /// Whether multi-part products are wrapped in a directory named after
    /// the product.
    fn use_enclosing_directory(&self) -> bool {
        false
    }

    /// Content hash algorithm; `None` disables hashing for this type.
    fn hash_type(&self) -> Option<HashAlgorithm> {
        Some(HashAlgorithm::Md5)
    }

    fn cascade_rule(&self) -> CascadeRule {
        CascadeRule::Ignore
    }

    /// Extension namespaces this type may populate.
    fn namespaces(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether the given paths look like a product of this type.
    fn identify(&self, paths: &[PathBuf]) -> bool;

    /// Extract properties (and optionally tags) from the product files.
    fn analyze(&self, paths: &[PathBuf]) -> Result<Analysis>;

    /// Name of the enclosing directory for multi-part products.
    fn enclosing_directory(&self, properties: &Properties) -> Result<String> {
        properties
            .product_name()
            .map(str::to_string)
            .ok_or_else(|| Error::Plugin("product has no product_name".to_string()))
    }

    /// Relative directory inside the archive where the product lives.
    fn archive_path(&self, properties: &Properties) -> Result<String>;

    /// Export formats supported beyond the default copy-retrieve.
    fn export_formats(&self) -> Vec<&'static str> {
        Vec::new()
    }

    /// Export the product in one of the advertised formats.
    async fn export(
        &self,
        _archive: &mut Archive,
        _product: &Properties,
        format: &str,
        _target_dir: &Path,
    ) -> Result<PathBuf> {
        Err(Error::Plugin(format!(
            "export format {:?} is not implemented",
            format
        )))
    }

    async fn post_ingest_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_create_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_pull_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_remove_hook(
        &self,
        _archive: &mut Archive,
        _properties: &Properties,
    ) -> Result<()> {
        Ok(())
    }
}

/// A remote transport able to fetch product bytes by URL.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Whether this transport handles the given URL.
    fn identify(&self, url: &Url) -> bool;

    /// Download the product into `target_dir`; returns the local paths.
    async fn pull(
        &self,
        product: &Properties,
        target_dir: &Path,
        credentials: Option<&crate::config::Credential>,
    ) -> Result<Vec<PathBuf>>;
}

/// A bag of optional post-phase hooks, invoked across the registry in
/// configuration order (reverse order for `post_remove_hook`).
#[async_trait]
pub trait HookExtension: Send + Sync {
    async fn post_ingest_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_create_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_pull_hook(
        &self,
        _archive: &mut Archive,
        _properties: &mut Properties,
    ) -> Result<()> {
        Ok(())
    }

    async fn post_remove_hook(
        &self,
        _archive: &mut Archive,
        _properties: &Properties,
    ) -> Result<()> {
        Ok(())
    }
}

/// A named set of extension factories, consulted by the configuration's
/// `*_extensions` keys.
#[derive(Default)]
pub struct ExtensionSet {
    product_types: BTreeMap<String, Vec<Arc<dyn ProductType>>>,
    namespaces: BTreeMap<String, Vec<Namespace>>,
    remote_backends: BTreeMap<String, Vec<Arc<dyn RemoteBackend>>>,
    hooks: BTreeMap<String, Arc<dyn HookExtension>>,
}

impl ExtensionSet {
    pub fn new() -> ExtensionSet {
        ExtensionSet::default()
    }

    pub fn add_product_types(&mut self, name: &str, types: Vec<Arc<dyn ProductType>>) {
        self.product_types.insert(name.to_string(), types);
    }

    pub fn add_namespaces(&mut self, name: &str, namespaces: Vec<Namespace>) {
        self.namespaces.insert(name.to_string(), namespaces);
    }

    pub fn add_remote_backends(&mut self, name: &str, backends: Vec<Arc<dyn RemoteBackend>>) {
        self.remote_backends.insert(name.to_string(), backends);
    }

    pub fn add_hook_extension(&mut self, name: &str, hook: Arc<dyn HookExtension>) {
        self.hooks.insert(name.to_string(), hook);
    }
}

/// The live registry of one archive handle.
pub struct Registry {
    schema: Arc<SchemaSet>,
    product_types: Vec<Arc<dyn ProductType>>,
    remote_backends: Vec<Arc<dyn RemoteBackend>>,
    hook_extensions: Vec<Arc<dyn HookExtension>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            schema: Arc::new(SchemaSet::new()),
            product_types: Vec::new(),
            remote_backends: Vec::new(),
            hook_extensions: Vec::new(),
        }
    }

    /// Populate a registry from an extension set, honoring the
    /// configuration's selection and ordering.
    pub fn from_extension_set(
        extensions: &ExtensionSet,
        namespace_extensions: &[String],
        product_type_extensions: &[String],
        remote_backend_extensions: &[String],
        hook_extensions: &[String],
    ) -> Result<Registry> {
        let mut registry = Registry::new();
        for name in namespace_extensions {
            let namespaces = extensions.namespaces.get(name).ok_or_else(|| {
                Error::Config(format!("namespace extension {:?} is not registered", name))
            })?;
            for namespace in namespaces {
                registry.register_namespace(namespace.clone())?;
            }
        }
        for name in product_type_extensions {
            let types = extensions.product_types.get(name).ok_or_else(|| {
                Error::Config(format!(
                    "product type extension {:?} is not registered",
                    name
                ))
            })?;
            for product_type in types {
                registry.register_product_type(product_type.clone())?;
            }
        }
        for name in remote_backend_extensions {
            let backends = extensions.remote_backends.get(name).ok_or_else(|| {
                Error::Config(format!(
                    "remote backend extension {:?} is not registered",
                    name
                ))
            })?;
            for backend in backends {
                registry.register_remote_backend(backend.clone());
            }
        }
        for name in hook_extensions {
            let hook = extensions.hooks.get(name).ok_or_else(|| {
                Error::Config(format!("hook extension {:?} is not registered", name))
            })?;
            registry.register_hook_extension(hook.clone());
        }
        Ok(registry)
    }

    pub fn schema(&self) -> Arc<SchemaSet> {
        self.schema.clone()
    }

    pub fn register_namespace(&mut self, namespace: Namespace) -> Result<()> {
        let schema = Arc::make_mut(&mut self.schema);
        schema.register(namespace)
    }

    pub fn register_product_type(&mut self, product_type: Arc<dyn ProductType>) -> Result<()> {
        let name = product_type.name().to_string();
        if name.is_empty() {
            return Err(Error::Plugin(
                "a product type plug-in carries no product_type name".to_string(),
            ));
        }
        if self.product_type(&name).is_ok() {
            return Err(Error::Config(format!(
                "product type {:?} is already registered",
                name
            )));
        }
        for namespace in product_type.namespaces() {
            if self.schema.namespace(&namespace).is_none() {
                return Err(Error::Plugin(format!(
                    "product type {:?} uses unregistered namespace {:?}",
                    name, namespace
                )));
            }
        }
        self.product_types.push(product_type);
        Ok(())
    }

    pub fn register_remote_backend(&mut self, backend: Arc<dyn RemoteBackend>) {
        self.remote_backends.push(backend);
    }

    pub fn register_hook_extension(&mut self, hook: Arc<dyn HookExtension>) {
        self.hook_extensions.push(hook);
    }

    pub fn product_type(&self, name: &str) -> Result<Arc<dyn ProductType>> {
        self.product_types
            .iter()
            .find(|t| t.name() == name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("product type {:?} is not registered", name)))
    }

    pub fn product_types(&self) -> &[Arc<dyn ProductType>] {
        &self.product_types
    }

    /// The first product type whose `identify` accepts the paths.
    pub fn identify(&self, paths: &[PathBuf]) -> Result<Arc<dyn ProductType>> {
        self.product_types
            .iter()
            .find(|t| t.identify(paths))
            .cloned()
            .ok_or_else(|| {
                Error::Plugin(format!(
                    "no registered product type identifies {:?}",
                    paths
                ))
            })
    }

    /// The first remote backend whose `identify` accepts the URL.
    pub fn remote_backend(&self, url: &Url) -> Result<Arc<dyn RemoteBackend>> {
        self.remote_backends
            .iter()
            .find(|b| b.identify(url))
            .cloned()
            .ok_or_else(|| {
                Error::Config(format!("no remote backend handles the URL {}", url))
            })
    }

    /// Hook extensions in registration order.
    pub fn hook_extensions(&self) -> Vec<Arc<dyn HookExtension>> {
        self.hook_extensions.clone()
    }

    /// Hook extensions in reverse order, for `post_remove_hook`.
    pub fn hook_extensions_reversed(&self) -> Vec<Arc<dyn HookExtension>> {
        let mut hooks = self.hook_extensions.clone();
        hooks.reverse();
        hooks
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cascade_rule_table() {
        use CascadeAction::*;
        let table = [
            (CascadeRule::Ignore, None, None),
            (CascadeRule::CascadePurgeAsStrip, Strip, None),
            (CascadeRule::CascadePurge, Remove, None),
            (CascadeRule::Strip, Strip, Strip),
            (CascadeRule::Cascade, Remove, Strip),
            (CascadeRule::Purge, Remove, Remove),
        ];
        for (rule, removed, stripped) in table {
            assert_eq!(rule.on_sources_removed(), removed, "{:?}", rule);
            assert_eq!(rule.on_sources_stripped(), stripped, "{:?}", rule);
        }
    }

    #[test]
    fn cascade_rule_names_round_trip() {
        for rule in [
            CascadeRule::Ignore,
            CascadeRule::CascadePurgeAsStrip,
            CascadeRule::CascadePurge,
            CascadeRule::Strip,
            CascadeRule::Cascade,
            CascadeRule::Purge,
        ] {
            assert_eq!(CascadeRule::from_name(rule.name()).unwrap(), rule);
        }
        assert!(CascadeRule::from_name("DELETE").is_err());
    }
}

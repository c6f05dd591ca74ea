//! Muninn is a product-catalogue-and-archive core: a typed, namespaced,
//! queryable catalogue of data-product metadata, optionally paired with
//! the product bytes on an attached storage.
//!
//! The crate provides:
//!
//! - a typed, extensible schema model (namespaces, data types, indices);
//! - a purpose-built expression language, compiled per database backend;
//! - the catalogue operations and their transactional semantics, including
//!   the cascade engine that propagates strip/remove through link graphs;
//! - a backend abstraction spanning two database backends (PostgreSQL with
//!   PostGIS, SQLite with SpatiaLite) and four storage backends (local
//!   filesystem, S3-compatible object store, Swift-style object store, and
//!   a catalogue-only `none` storage);
//! - a plug-in registry binding product types, namespaces, remote
//!   transports and hooks to the core at run time.
//!
//! The usual entry point is [`Archive::open`], which resolves an archive
//! id against the `MUNINN_CONFIG_PATH` search path and assembles the
//! configured backends and extensions into one handle.

pub mod archive;
mod cascade;
pub mod config;
pub mod database;
pub mod error;
pub mod expr;
pub mod geometry;
pub mod hash;
pub mod plugin;
pub mod properties;
pub mod remote;
pub mod schema;
pub mod storage;
pub mod value;

pub use archive::{Archive, AttachOptions, IngestOptions};
pub use config::{ArchiveConfig, Credential, Credentials};
pub use database::{
    Aggregate, AggregateFunc, DatabaseBackend, GroupBy, SearchOptions, Summary, SummaryOptions,
    TimeBin,
};
pub use error::{Error, Result};
pub use expr::ParameterMap;
pub use geometry::{Geometry, Position};
pub use hash::HashAlgorithm;
pub use plugin::{
    Analysis, CascadeRule, ExtensionSet, HookExtension, ProductType, Registry, RemoteBackend,
};
pub use properties::Properties;
pub use schema::{Field, Namespace, SchemaSet};
pub use storage::{ProductKey, StorageBackend};
pub use value::{DataType, Value};

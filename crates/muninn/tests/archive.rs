//! End-to-end archive tests over the embedded SQLite backend and local
//! filesystem storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use pretty_assertions::assert_eq;

use muninn::database::sqlite::SqliteBackend;
use muninn::storage::fs::FsStorage;
use muninn::value::parse_timestamp;
use muninn::{
    Aggregate, Analysis, Archive, AttachOptions, CascadeRule, Credentials, DataType, Error, Field,
    GroupBy, IngestOptions, Namespace, ParameterMap, ProductType, Properties, Registry,
    SearchOptions, SummaryOptions, Value,
};
use uuid::Uuid;

/// Single-file `.dat` products archived under `abc/<year>`.
struct AbcProduct;

#[async_trait::async_trait]
impl ProductType for AbcProduct {
    fn name(&self) -> &str {
        "ABC"
    }

    fn identify(&self, paths: &[PathBuf]) -> bool {
        paths.len() == 1
            && paths[0]
                .extension()
                .map(|e| e == "dat")
                .unwrap_or(false)
    }

    fn analyze(&self, paths: &[PathBuf]) -> muninn::Result<Analysis> {
        let name = paths[0]
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Plugin("unusable file name".to_string()))?;
        let mut properties = Properties::new();
        properties.set_core("product_name", Value::Text(name.to_string()));
        Ok(Analysis {
            properties,
            tags: vec!["ingested".to_string()],
        })
    }

    fn archive_path(&self, _properties: &Properties) -> muninn::Result<String> {
        Ok("abc/2024".to_string())
    }
}

/// A minimal type with an explicit name and cascade rule, never
/// identified automatically.
struct SimpleType {
    name: &'static str,
    rule: CascadeRule,
}

#[async_trait::async_trait]
impl ProductType for SimpleType {
    fn name(&self) -> &str {
        self.name
    }

    fn cascade_rule(&self) -> CascadeRule {
        self.rule
    }

    fn identify(&self, _paths: &[PathBuf]) -> bool {
        false
    }

    fn analyze(&self, paths: &[PathBuf]) -> muninn::Result<Analysis> {
        let name = paths[0]
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Plugin("unusable file name".to_string()))?;
        let mut properties = Properties::new();
        properties.set_core("product_name", Value::Text(name.to_string()));
        Ok(Analysis {
            properties,
            tags: Vec::new(),
        })
    }

    fn archive_path(&self, _properties: &Properties) -> muninn::Result<String> {
        Ok(self.name.to_lowercase())
    }
}

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_namespace(
            Namespace::new("optical")
                .unwrap()
                .with_field(Field::new("cloud_cover", DataType::Real).optional().indexed())
                .unwrap(),
        )
        .unwrap();
    registry.register_product_type(Arc::new(AbcProduct)).unwrap();
    registry
        .register_product_type(Arc::new(SimpleType {
            name: "RAW",
            rule: CascadeRule::Ignore,
        }))
        .unwrap();
    registry
        .register_product_type(Arc::new(SimpleType {
            name: "DRV",
            rule: CascadeRule::Purge,
        }))
        .unwrap();
    registry
        .register_product_type(Arc::new(SimpleType {
            name: "STR",
            rule: CascadeRule::Cascade,
        }))
        .unwrap();
    registry
}

async fn archive_in(dir: &Path) -> Archive {
    let registry = registry();
    let schema = registry.schema();
    let database = Box::new(SqliteBackend::new(
        dir.join("catalogue.db").to_string_lossy().to_string(),
        "",
        None,
        schema,
    ));
    let storage = Arc::new(FsStorage::new(dir.join("archive"), None));
    let mut archive = Archive::assemble(
        registry,
        database,
        storage,
        Credentials::default(),
        0,
        25,
        false,
    )
    .unwrap();
    archive.prepare().await.unwrap();
    archive
}

fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

async fn search(archive: &mut Archive, expression: &str) -> Vec<Properties> {
    archive
        .search(
            Some(expression),
            &ParameterMap::new(),
            &SearchOptions::default(),
        )
        .await
        .unwrap()
}

async fn ingest_file(
    archive: &mut Archive,
    dir: &Path,
    name: &str,
    contents: &[u8],
    product_type: &str,
) -> Uuid {
    let path = write_file(dir, name, contents);
    let properties = archive
        .ingest(
            &[path],
            IngestOptions {
                product_type: Some(product_type.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    properties.uuid().unwrap()
}

#[tokio::test]
async fn ingest_and_search_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    let ingested = archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    assert_eq!(ingested.product_type(), Some("ABC"));

    let rows = search(&mut archive, r#"product_name == "alpha.dat""#).await;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.size(), Some(5));
    assert_eq!(row.archive_path(), Some("abc/2024"));
    assert_eq!(row.hash(), Some("md5:5d41402abc4b2a76b9719d911017c592"));
    assert!(row.active());

    // Tags returned by analyze are recorded.
    let tags = archive.list_tags(row.uuid().unwrap()).await.unwrap();
    assert_eq!(tags, vec!["ingested".to_string()]);

    // Retrieval yields byte-identical content.
    let out = dir.path().join("out");
    std::fs::create_dir(&out).unwrap();
    let paths = archive
        .retrieve(row.uuid().unwrap(), &out, false)
        .await
        .unwrap();
    assert_eq!(std::fs::read(&paths[0]).unwrap(), b"hello");
}

#[tokio::test]
async fn duplicate_ingest_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    let err = archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)), "{err}");

    let count = archive.count(None, &ParameterMap::new()).await.unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn forced_ingest_reclaims_inactive_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    // Fake a crashed ingest: a catalogue-only product flipped inactive
    // holds the (type, name) slot the way a half-finished ingest would.
    let source = write_file(dir.path(), "alpha.dat", b"hello");
    let planted = archive
        .ingest(
            &[source.clone()],
            IngestOptions {
                ingest_product: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let mut to_inactive = Properties::new();
    to_inactive.set_core("active", Value::Boolean(false));
    archive
        .update_properties(planted.uuid().unwrap(), &to_inactive, false)
        .await
        .unwrap();

    // Without force the slot is taken; with force it is reclaimed.
    let err = archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    let properties = archive
        .ingest(
            &[source],
            IngestOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(properties.active());
    assert_eq!(archive.count(None, &ParameterMap::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn cascade_purge_removes_derived_products() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = ingest_file(&mut archive, dir.path(), "s.raw", b"source", "RAW").await;
    let derived = ingest_file(&mut archive, dir.path(), "d.drv", b"derived", "DRV").await;
    archive.link(derived, source).await.unwrap();

    archive.remove(source, false, true).await.unwrap();

    let count = archive.count(None, &ParameterMap::new()).await.unwrap();
    assert_eq!(count, 0);
}

#[tokio::test]
async fn cascade_strip_of_stripped_sources() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = ingest_file(&mut archive, dir.path(), "s.raw", b"source", "RAW").await;
    let derived = ingest_file(&mut archive, dir.path(), "d.str", b"derived", "STR").await;
    archive.link(derived, source).await.unwrap();

    // CASCADE rule: stripping all sources strips the derived product.
    archive.strip(source, false, true).await.unwrap();

    let rows = search(&mut archive, r#"product_type == "STR""#).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].archive_path(), None);
    // Both rows survive.
    assert_eq!(archive.count(None, &ParameterMap::new()).await.unwrap(), 2);
}

#[tokio::test]
async fn null_is_surfaced_by_not_equal() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let mut properties = Properties::new();
    properties.set_core("product_type", Value::Text("RAW".to_string()));
    properties.set_core("product_name", Value::Text("norurl".to_string()));
    archive.create_properties(properties).await.unwrap();

    let rows = search(&mut archive, r#"remote_url != "x""#).await;
    assert_eq!(rows.len(), 1);
    let rows = search(&mut archive, "is_defined(remote_url)").await;
    assert_eq!(rows.len(), 0);
}

#[tokio::test]
async fn timestamp_difference_in_seconds() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let mut properties = Properties::new();
    properties.set_core("product_type", Value::Text("RAW".to_string()));
    properties.set_core("product_name", Value::Text("window".to_string()));
    properties.set_core(
        "validity_start",
        Value::Timestamp(parse_timestamp("2024-01-01T00:00:00").unwrap()),
    );
    properties.set_core(
        "validity_stop",
        Value::Timestamp(parse_timestamp("2024-01-01T00:05:00").unwrap()),
    );
    archive.create_properties(properties).await.unwrap();

    let rows = search(&mut archive, "validity_stop - validity_start > 299").await;
    assert_eq!(rows.len(), 1);
    let rows = search(&mut archive, "validity_stop - validity_start > 301").await;
    assert_eq!(rows.len(), 0);
}

#[tokio::test]
async fn strip_then_attach_restores_the_product() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    let ingested = archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    let uuid = ingested.uuid().unwrap();
    let stored = dir.path().join("archive/abc/2024/alpha.dat");
    assert!(stored.exists());

    archive.strip(uuid, false, false).await.unwrap();
    assert!(!stored.exists());
    let rows = search(&mut archive, r#"product_name == "alpha.dat""#).await;
    assert_eq!(rows[0].archive_path(), None);
    assert!(rows[0].active());
    assert_eq!(rows[0].size(), Some(5));

    let restored = archive
        .attach(
            &[source],
            AttachOptions {
                product_type: Some("ABC".to_string()),
                verify_hash: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(restored.archive_path(), Some("abc/2024"));
    assert!(stored.exists());

    let rows = search(&mut archive, "is_defined(archive_path)").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].size(), Some(5));
    assert_eq!(
        rows[0].hash(),
        Some("md5:5d41402abc4b2a76b9719d911017c592")
    );
}

#[tokio::test]
async fn attach_refuses_size_mismatch_unless_forced() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    let ingested = archive
        .ingest(&[source.clone()], IngestOptions::default())
        .await
        .unwrap();
    archive
        .strip(ingested.uuid().unwrap(), false, false)
        .await
        .unwrap();

    std::fs::write(&source, b"hello world").unwrap();
    let err = archive
        .attach(
            &[source.clone()],
            AttachOptions {
                product_type: Some("ABC".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::State(_)), "{err}");

    archive
        .attach(
            &[source],
            AttachOptions {
                product_type: Some("ABC".to_string()),
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn destroy_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap();

    archive.destroy().await.unwrap();
    assert!(!archive.catalogue_exists().await.unwrap());
    assert!(!dir.path().join("archive").exists());
}

#[tokio::test]
async fn tags_and_links_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let a = ingest_file(&mut archive, dir.path(), "a.raw", b"a", "RAW").await;
    let b = ingest_file(&mut archive, dir.path(), "b.raw", b"b", "RAW").await;

    archive
        .tag(a, &["level1".to_string(), "raw".to_string()])
        .await
        .unwrap();
    archive.tag(a, &["raw".to_string()]).await.unwrap();
    assert_eq!(
        archive.list_tags(a).await.unwrap(),
        vec!["level1".to_string(), "raw".to_string()]
    );

    archive.link(b, a).await.unwrap();
    archive.link(b, a).await.unwrap();
    assert_eq!(archive.source_products(b).await.unwrap(), vec![a]);
    assert_eq!(archive.derived_products(a).await.unwrap(), vec![b]);

    let err = archive.link(a, a).await.unwrap_err();
    assert!(matches!(err, Error::State(_)));

    let rows = search(&mut archive, r#"has_tag("raw")"#).await;
    assert_eq!(rows.len(), 1);
    let rows = search(&mut archive, &format!("is_source_of({})", b)).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uuid(), Some(a));
    let rows = search(&mut archive, &format!("is_derived_from({})", a)).await;
    assert_eq!(rows[0].uuid(), Some(b));
    let rows = search(&mut archive, r#"is_derived_from(product_type == "RAW")"#).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].uuid(), Some(b));
}

#[tokio::test]
async fn namespace_updates_and_projection() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let uuid = ingest_file(&mut archive, dir.path(), "a.raw", b"a", "RAW").await;

    let mut update = Properties::new();
    update.set("optical", "cloud_cover", Value::Real(0.25));
    archive.update_properties(uuid, &update, true).await.unwrap();

    let rows = search(&mut archive, "optical.cloud_cover < 0.5").await;
    assert_eq!(rows.len(), 1);

    let options = SearchOptions {
        namespaces: vec!["optical".to_string()],
        ..Default::default()
    };
    let rows = archive
        .search(Some("is_defined(optical)"), &ParameterMap::new(), &options)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(
        rows[0].get("optical", "cloud_cover"),
        Some(&Value::Real(0.25))
    );

    // The namespace sentinel removes the record.
    let mut removal = Properties::new();
    removal.clear_namespace("optical");
    archive.update_properties(uuid, &removal, false).await.unwrap();
    let rows = search(&mut archive, "is_defined(optical)").await;
    assert_eq!(rows.len(), 0);
}

#[tokio::test]
async fn summary_groups_and_aggregates() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    ingest_file(&mut archive, dir.path(), "alpha.dat", b"hello", "ABC").await;
    ingest_file(&mut archive, dir.path(), "beta.dat", b"abc", "ABC").await;
    ingest_file(&mut archive, dir.path(), "c.raw", b"1", "RAW").await;

    let schema = archive.schema();
    let options = SummaryOptions {
        aggregates: vec![Aggregate::parse("size.sum").unwrap()],
        group_by: vec![GroupBy::parse("product_type", &schema).unwrap()],
        group_by_tag: false,
        having: None,
        order_by: vec![],
    };
    let summary = archive
        .summary(None, &ParameterMap::new(), &options)
        .await
        .unwrap();
    assert_eq!(
        summary
            .columns
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>(),
        vec!["product_type", "count", "size.sum"]
    );
    assert_eq!(summary.rows.len(), 2);
    // Ordered by the group key: ABC before RAW.
    assert_eq!(
        summary.rows[0],
        vec![
            Some(Value::Text("ABC".to_string())),
            Some(Value::Long64(2)),
            Some(Value::Long64(8)),
        ]
    );
    assert_eq!(
        summary.rows[1],
        vec![
            Some(Value::Text("RAW".to_string())),
            Some(Value::Long64(1)),
            Some(Value::Long64(1)),
        ]
    );
}

#[tokio::test]
async fn summary_having_filters_groups() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    ingest_file(&mut archive, dir.path(), "alpha.dat", b"hello", "ABC").await;
    ingest_file(&mut archive, dir.path(), "c.raw", b"1", "RAW").await;

    let schema = archive.schema();
    let options = SummaryOptions {
        aggregates: vec![Aggregate::parse("size.sum").unwrap()],
        group_by: vec![GroupBy::parse("product_type", &schema).unwrap()],
        group_by_tag: false,
        having: Some("size.sum > 2".to_string()),
        order_by: vec![],
    };
    let summary = archive
        .summary(None, &ParameterMap::new(), &options)
        .await
        .unwrap();
    assert_eq!(summary.rows.len(), 1);
    assert_eq!(summary.rows[0][0], Some(Value::Text("ABC".to_string())));
}

#[tokio::test]
async fn pull_without_remote_url_is_a_state_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let mut properties = Properties::new();
    properties.set_core("product_type", Value::Text("RAW".to_string()));
    properties.set_core("product_name", Value::Text("local".to_string()));
    let created = archive.create_properties(properties).await.unwrap();

    let err = archive
        .pull(created.uuid().unwrap(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::State(_)), "{err}");
}

#[tokio::test]
async fn delete_properties_keeps_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;

    let source = write_file(dir.path(), "alpha.dat", b"hello");
    let ingested = archive
        .ingest(&[source], IngestOptions::default())
        .await
        .unwrap();
    let stored = dir.path().join("archive/abc/2024/alpha.dat");
    assert!(stored.exists());

    archive
        .delete_properties(ingested.uuid().unwrap())
        .await
        .unwrap();
    assert_eq!(archive.count(None, &ParameterMap::new()).await.unwrap(), 0);
    assert!(stored.exists());
}

#[tokio::test]
async fn parameterized_search() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;
    ingest_file(&mut archive, dir.path(), "alpha.dat", b"hello", "ABC").await;

    let mut parameters = ParameterMap::new();
    parameters.insert("name".to_string(), Value::Text("alpha.dat".to_string()));
    let rows = archive
        .search(
            Some("product_name == @name"),
            &parameters,
            &SearchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    let err = archive
        .search(
            Some("product_name == @name"),
            &ParameterMap::new(),
            &SearchOptions::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Expression(_)));
}

#[tokio::test]
async fn pattern_matching_with_wildcards() {
    let dir = tempfile::tempdir().unwrap();
    let mut archive = archive_in(dir.path()).await;
    ingest_file(&mut archive, dir.path(), "alpha.dat", b"hello", "ABC").await;
    ingest_file(&mut archive, dir.path(), "beta.dat", b"abc", "ABC").await;

    let rows = search(&mut archive, r#"product_name ~= "alpha%""#).await;
    assert_eq!(rows.len(), 1);
    let rows = search(&mut archive, r#"product_name ~= "%.dat""#).await;
    assert_eq!(rows.len(), 2);
    let rows = search(&mut archive, r#"product_name ~= "_lpha.dat""#).await;
    assert_eq!(rows.len(), 1);
}

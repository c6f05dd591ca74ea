//! Embedded database backend over SQLite.
//!
//! Timestamps are stored as INTEGER microseconds since the Unix epoch;
//! timestamp arithmetic truncates to milliseconds, a documented property
//! of this backend. Geometry columns hold WKT text and spatial predicates
//! are evaluated through the SpatiaLite extension, which is loaded lazily
//! from a configurable library path on the first spatial query; no
//! spatial index is created.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::Connection;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::{Expr, LinkArg};
use crate::geometry::Geometry;
use crate::properties::Properties;
use crate::schema::{Namespace, SchemaSet, CORE};
use crate::value::{DataType, Value};

use super::sqlgen::{Dialect, SqlBuilder};
use super::{
    row_to_properties, DatabaseBackend, LinkOwner, SearchOptions, SourceState, Summary,
    SummaryOptions, TimeBin,
};

pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("?{}", index)
    }

    fn coerce_boolean(&self, inner: &str) -> String {
        format!("ifnull(({}), 0)", inner)
    }

    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String {
        // Microsecond integers; truncate symmetrically to milliseconds.
        format!("(CAST(({} - {}) / 1000 AS INTEGER) / 1000.0)", lhs, rhs)
    }

    fn geometry_value(&self, placeholder: &str) -> String {
        format!("GeomFromText({}, 4326)", placeholder)
    }

    fn geometry_column(&self, column: &str) -> String {
        format!("GeomFromText({}, 4326)", column)
    }

    fn select_geometry(&self, column: &str) -> String {
        column.to_string()
    }

    fn geometry_covers(&self, a: &str, b: &str) -> String {
        format!("Covers({}, {})", a, b)
    }

    fn geometry_intersects(&self, a: &str, b: &str) -> String {
        format!("Intersects({}, {})", a, b)
    }

    fn geometry_distance(&self, a: &str, b: &str) -> String {
        format!("Distance({}, {})", a, b)
    }

    fn time_bin(&self, column: &str, bin: TimeBin) -> (String, DataType) {
        let epoch = format!("{} / 1000000", column);
        match bin {
            TimeBin::Year => (
                format!("CAST(strftime('%Y', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::Month => (
                format!("CAST(strftime('%m', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::YearMonth => (
                format!("strftime('%Y-%m', {}, 'unixepoch')", epoch),
                DataType::Text,
            ),
            TimeBin::Date => (
                format!("strftime('%Y-%m-%d', {}, 'unixepoch')", epoch),
                DataType::Text,
            ),
            TimeBin::Day => (
                format!("CAST(strftime('%d', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::Hour => (
                format!("CAST(strftime('%H', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::Minute => (
                format!("CAST(strftime('%M', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::Second => (
                format!("CAST(strftime('%S', {}, 'unixepoch') AS INTEGER)", epoch),
                DataType::Long64,
            ),
            TimeBin::Time => (
                format!("strftime('%H:%M:%S', {}, 'unixepoch')", epoch),
                DataType::Text,
            ),
        }
    }

    fn cast_aggregate(&self, inner: &str, result: DataType) -> String {
        match result {
            DataType::Long64 | DataType::Integer32 => format!("CAST({} AS INTEGER)", inner),
            DataType::Real => format!("CAST({} AS REAL)", inner),
            _ => inner.to_string(),
        }
    }
}

pub struct SqliteBackend {
    path: String,
    table_prefix: String,
    mod_spatialite_path: String,
    schema: Arc<SchemaSet>,
    connection: Option<Connection>,
    spatialite_loaded: bool,
    in_transaction: bool,
}

impl SqliteBackend {
    pub fn new(
        path: impl Into<String>,
        table_prefix: impl Into<String>,
        mod_spatialite_path: Option<String>,
        schema: Arc<SchemaSet>,
    ) -> SqliteBackend {
        SqliteBackend {
            path: path.into(),
            table_prefix: table_prefix.into(),
            mod_spatialite_path: mod_spatialite_path
                .unwrap_or_else(|| "mod_spatialite".to_string()),
            schema,
            connection: None,
            spatialite_loaded: false,
            in_transaction: false,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    fn connection(&mut self) -> Result<&Connection> {
        if self.connection.is_none() {
            let connection = Connection::open(&self.path).map_err(wrap)?;
            connection
                .execute_batch(
                    "PRAGMA foreign_keys = ON;\n\
                     PRAGMA case_sensitive_like = ON;",
                )
                .map_err(wrap)?;
            tracing::debug!(path = %self.path, "opened SQLite catalogue");
            self.connection = Some(connection);
        }
        match &self.connection {
            Some(connection) => Ok(connection),
            None => Err(Error::backend("no catalogue connection")),
        }
    }

    fn ensure_spatialite(&mut self) -> Result<()> {
        if self.spatialite_loaded {
            return Ok(());
        }
        let path = self.mod_spatialite_path.clone();
        let connection = self.connection()?;
        unsafe { connection.load_extension_enable() }.map_err(wrap)?;
        let loaded = unsafe { connection.load_extension(&path, None) };
        connection.load_extension_disable().map_err(wrap)?;
        loaded.map_err(|e| {
            Error::backend_with(
                format!("failed to load the SpatiaLite extension from {:?}", path),
                e,
            )
        })?;
        self.spatialite_loaded = true;
        Ok(())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize> {
        let connection = self.connection()?;
        tracing::debug!(%sql, "executing");
        let mut statement = connection.prepare(sql).map_err(wrap)?;
        let affected = statement
            .execute(rusqlite::params_from_iter(params.iter().map(encode)))
            .map_err(wrap)?;
        Ok(affected)
    }

    fn query_rows(
        &mut self,
        sql: &str,
        params: &[Value],
        types: &[DataType],
    ) -> Result<Vec<Vec<Option<Value>>>> {
        let connection = self.connection()?;
        tracing::debug!(%sql, "querying");
        let mut statement = connection.prepare(sql).map_err(wrap)?;
        let mut rows = statement
            .query(rusqlite::params_from_iter(params.iter().map(encode)))
            .map_err(wrap)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(wrap)? {
            let mut values = Vec::with_capacity(types.len());
            for (index, data_type) in types.iter().enumerate() {
                values.push(decode(row, index, *data_type)?);
            }
            out.push(values);
        }
        Ok(out)
    }

    fn namespace_ddl(&self, namespace: &Namespace) -> Vec<String> {
        let table = self.table(namespace.name());
        let mut columns = Vec::new();
        if namespace.name() == CORE {
            for field in namespace.fields() {
                let mut column = format!("{} {}", field.name, column_type(field.data_type));
                if field.name == "uuid" {
                    column.push_str(" PRIMARY KEY");
                } else if !field.optional {
                    column.push_str(" NOT NULL");
                }
                columns.push(column);
            }
            columns.push("UNIQUE (product_type, product_name)".to_string());
            columns.push("UNIQUE (archive_path, physical_name)".to_string());
        } else {
            columns.push(format!(
                "uuid TEXT PRIMARY KEY REFERENCES {}(uuid) ON DELETE CASCADE",
                self.table(CORE)
            ));
            for field in namespace.fields() {
                let mut column = format!("{} {}", field.name, column_type(field.data_type));
                if !field.optional {
                    column.push_str(" NOT NULL");
                }
                columns.push(column);
            }
        }
        let mut statements = vec![format!(
            "CREATE TABLE {} ({})",
            table,
            columns.join(", ")
        )];
        for field in namespace.fields() {
            if field.indexed && field.data_type != DataType::Geometry {
                statements.push(format!(
                    "CREATE INDEX idx_{table}_{field} ON {table} ({field})",
                    table = table,
                    field = field.name,
                ));
            }
        }
        statements
    }

    fn insert_namespace_row(
        &mut self,
        uuid: Uuid,
        namespace: &str,
        fields: &std::collections::BTreeMap<String, Option<Value>>,
    ) -> Result<()> {
        let mut names = vec!["uuid".to_string()];
        let mut params = vec![Value::Uuid(uuid)];
        for (field, value) in fields {
            if namespace == CORE && field == "uuid" {
                continue;
            }
            if let Some(value) = value {
                names.push(field.clone());
                params.push(value.clone());
            }
        }
        let placeholders: Vec<String> =
            (1..=params.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(namespace),
            names.join(", "),
            placeholders.join(", ")
        );
        self.execute(&sql, &params)?;
        Ok(())
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn prepare(&mut self) -> Result<()> {
        if self.exists().await? {
            return Err(Error::State(
                "the catalogue is already prepared".to_string(),
            ));
        }
        let schema = self.schema.clone();
        for namespace in schema.iter() {
            for statement in self.namespace_ddl(namespace) {
                self.execute(&statement, &[])?;
            }
        }
        let core = self.table(CORE);
        let tag = self.table("tag");
        let link = self.table("link");
        for statement in [
            format!(
                "CREATE TABLE {tag} (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 uuid TEXT NOT NULL REFERENCES {core}(uuid) ON DELETE CASCADE, \
                 tag TEXT NOT NULL, UNIQUE (uuid, tag))"
            ),
            format!("CREATE INDEX idx_{tag}_tag ON {tag} (tag)"),
            format!(
                "CREATE TABLE {link} (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 uuid TEXT NOT NULL REFERENCES {core}(uuid) ON DELETE CASCADE, \
                 source_uuid TEXT NOT NULL, UNIQUE (uuid, source_uuid))"
            ),
            format!("CREATE INDEX idx_{link}_source ON {link} (source_uuid)"),
        ] {
            self.execute(&statement, &[])?;
        }
        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let schema = self.schema.clone();
        let mut tables: Vec<String> = schema
            .extensions()
            .map(|ns| self.table(ns.name()))
            .collect();
        tables.push(self.table("tag"));
        tables.push(self.table("link"));
        tables.push(self.table(CORE));
        for table in tables {
            self.execute(&format!("DROP TABLE IF EXISTS {}", table), &[])?;
        }
        Ok(())
    }

    async fn exists(&mut self) -> Result<bool> {
        let core = self.table(CORE);
        let connection = self.connection()?;
        let count: i64 = connection
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [&core],
                |row| row.get(0),
            )
            .map_err(wrap)?;
        Ok(count > 0)
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN IMMEDIATE", &[])?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.execute("ROLLBACK", &[])?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            self.in_transaction = false;
            self.spatialite_loaded = false;
            if let Err((connection, err)) = connection.close() {
                drop(connection);
                return Err(Error::backend_with("failed to close the catalogue", err));
            }
        }
        Ok(())
    }

    async fn insert_product(&mut self, properties: &Properties) -> Result<()> {
        let uuid = properties.require_uuid()?;
        let core_fields = properties
            .fields(CORE)
            .ok_or_else(|| Error::Schema("product properties carry no core namespace".into()))?
            .clone();
        let mut names = Vec::new();
        let mut params = Vec::new();
        for (field, value) in &core_fields {
            if let Some(value) = value {
                names.push(field.clone());
                params.push(value.clone());
            }
        }
        let placeholders: Vec<String> =
            (1..=params.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(CORE),
            names.join(", "),
            placeholders.join(", ")
        );
        self.execute(&sql, &params)?;

        let extensions: Vec<(String, _)> = properties
            .defined()
            .filter(|(name, _)| *name != CORE)
            .map(|(name, fields)| (name.to_string(), fields.clone()))
            .collect();
        for (namespace, fields) in extensions {
            self.insert_namespace_row(uuid, &namespace, &fields)?;
        }
        Ok(())
    }

    async fn update_product(
        &mut self,
        uuid: Uuid,
        diff: &Properties,
        create_namespaces: bool,
    ) -> Result<()> {
        // Core first; an empty core diff is fine.
        if let Some(fields) = diff.fields(CORE) {
            let mut assignments = Vec::new();
            let mut params = Vec::new();
            for (field, value) in fields {
                if field == "uuid" {
                    continue;
                }
                match value {
                    Some(value) => {
                        params.push(value.clone());
                        assignments.push(format!("{} = ?{}", field, params.len()));
                    }
                    None => assignments.push(format!("{} = NULL", field)),
                }
            }
            if !assignments.is_empty() {
                params.push(Value::Uuid(uuid));
                let sql = format!(
                    "UPDATE {} SET {} WHERE uuid = ?{}",
                    self.table(CORE),
                    assignments.join(", "),
                    params.len()
                );
                if self.execute(&sql, &params)? == 0 {
                    return Err(Error::NotFound(format!("product {} does not exist", uuid)));
                }
            }
        }

        let names: Vec<String> = diff
            .namespace_names()
            .filter(|name| *name != CORE)
            .map(str::to_string)
            .collect();
        for namespace in names {
            if diff.is_cleared(&namespace) {
                let sql = format!("DELETE FROM {} WHERE uuid = ?1", self.table(&namespace));
                self.execute(&sql, &[Value::Uuid(uuid)])?;
                continue;
            }
            let fields = match diff.fields(&namespace) {
                Some(fields) => fields.clone(),
                None => continue,
            };
            let mut assignments = Vec::new();
            let mut params = Vec::new();
            for (field, value) in &fields {
                match value {
                    Some(value) => {
                        params.push(value.clone());
                        assignments.push(format!("{} = ?{}", field, params.len()));
                    }
                    None => assignments.push(format!("{} = NULL", field)),
                }
            }
            if assignments.is_empty() {
                continue;
            }
            params.push(Value::Uuid(uuid));
            let sql = format!(
                "UPDATE {} SET {} WHERE uuid = ?{}",
                self.table(&namespace),
                assignments.join(", "),
                params.len()
            );
            if self.execute(&sql, &params)? == 0 {
                if !create_namespaces {
                    return Err(Error::NotFound(format!(
                        "product {} has no {} namespace record",
                        uuid, namespace
                    )));
                }
                self.insert_namespace_row(uuid, &namespace, &fields)?;
            }
        }
        Ok(())
    }

    async fn delete_product(&mut self, uuid: Uuid) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE uuid = ?1", self.table(CORE));
        if self.execute(&sql, &[Value::Uuid(uuid)])? == 0 {
            return Err(Error::NotFound(format!("product {} does not exist", uuid)));
        }
        Ok(())
    }

    async fn search(
        &mut self,
        expr: Option<&Expr>,
        options: &SearchOptions,
    ) -> Result<Vec<Properties>> {
        if expr.map(uses_spatial).unwrap_or(false) {
            self.ensure_spatialite()?;
        }
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let plan = builder.search(expr, options)?;
        let types: Vec<DataType> = plan.columns.iter().map(|c| c.data_type).collect();
        let rows = self.query_rows(&plan.sql, &plan.params, &types)?;
        let mut out = Vec::with_capacity(rows.len());
        for values in rows {
            let mut properties = row_to_properties(&plan.columns, values);
            if let Some(names) = &options.property_names {
                properties = properties.project_fields(names);
            }
            out.push(properties);
        }
        Ok(out)
    }

    async fn count(&mut self, expr: Option<&Expr>) -> Result<i64> {
        if expr.map(uses_spatial).unwrap_or(false) {
            self.ensure_spatialite()?;
        }
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let statement = builder.count(expr)?;
        let rows = self.query_rows(&statement.sql, &statement.params, &[DataType::Long64])?;
        match rows.first().and_then(|row| row.first()) {
            Some(Some(Value::Long64(count))) => Ok(*count),
            _ => Err(Error::backend("count query returned no rows")),
        }
    }

    async fn summary(&mut self, expr: Option<&Expr>, options: &SummaryOptions) -> Result<Summary> {
        if expr.map(uses_spatial).unwrap_or(false) {
            self.ensure_spatialite()?;
        }
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let plan = builder.summary(expr, options)?;
        let types: Vec<DataType> = plan.columns.iter().map(|(_, dt)| *dt).collect();
        let rows = self.query_rows(&plan.sql, &plan.params, &types)?;
        Ok(Summary {
            columns: plan.columns,
            rows,
        })
    }

    async fn link(&mut self, uuid: Uuid, source: Uuid) -> Result<()> {
        let sql = format!(
            "INSERT OR IGNORE INTO {} (uuid, source_uuid) VALUES (?1, ?2)",
            self.table("link")
        );
        self.execute(&sql, &[Value::Uuid(uuid), Value::Uuid(source)])?;
        Ok(())
    }

    async fn unlink(&mut self, uuid: Uuid, source: Option<Uuid>) -> Result<()> {
        let affected = match source {
            Some(source) => {
                let sql = format!(
                    "DELETE FROM {} WHERE uuid = ?1 AND source_uuid = ?2",
                    self.table("link")
                );
                self.execute(&sql, &[Value::Uuid(uuid), Value::Uuid(source)])?
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE uuid = ?1", self.table("link"));
                self.execute(&sql, &[Value::Uuid(uuid)])?
            }
        };
        if affected == 0 && source.is_some() {
            return Err(Error::NotFound(format!(
                "product {} has no such link",
                uuid
            )));
        }
        Ok(())
    }

    async fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()> {
        for tag in tags {
            let sql = format!(
                "INSERT OR IGNORE INTO {} (uuid, tag) VALUES (?1, ?2)",
                self.table("tag")
            );
            self.execute(&sql, &[Value::Uuid(uuid), Value::Text(tag.clone())])?;
        }
        Ok(())
    }

    async fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        match tags {
            Some(tags) => {
                for tag in tags {
                    let sql = format!(
                        "DELETE FROM {} WHERE uuid = ?1 AND tag = ?2",
                        self.table("tag")
                    );
                    self.execute(&sql, &[Value::Uuid(uuid), Value::Text(tag.clone())])?;
                }
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE uuid = ?1", self.table("tag"));
                self.execute(&sql, &[Value::Uuid(uuid)])?;
            }
        }
        Ok(())
    }

    async fn list_tags(&mut self, uuid: Uuid) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT tag FROM {} WHERE uuid = ?1 ORDER BY tag",
            self.table("tag")
        );
        let rows = self.query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Text])?;
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.into_iter().next() {
                Some(Some(Value::Text(tag))) => Some(tag),
                _ => None,
            })
            .collect())
    }

    async fn derived_of(&mut self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT uuid FROM {} WHERE source_uuid = ?1",
            self.table("link")
        );
        let rows = self.query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Uuid])?;
        Ok(collect_uuids(rows))
    }

    async fn sources_of(&mut self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT source_uuid FROM {} WHERE uuid = ?1",
            self.table("link")
        );
        let rows = self.query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Uuid])?;
        Ok(collect_uuids(rows))
    }

    async fn link_owners(&mut self) -> Result<Vec<LinkOwner>> {
        let sql = format!(
            "SELECT DISTINCT c.uuid, c.metadata_date, c.archive_path IS NOT NULL \
             FROM {link} l JOIN {core} c ON (c.uuid = l.uuid)",
            link = self.table("link"),
            core = self.table(CORE),
        );
        let rows = self.query_rows(
            &sql,
            &[],
            &[DataType::Uuid, DataType::Timestamp, DataType::Boolean],
        )?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.into_iter();
            let uuid = match row.next() {
                Some(Some(Value::Uuid(uuid))) => uuid,
                _ => continue,
            };
            let metadata_date = match row.next() {
                Some(Some(Value::Timestamp(t))) => t,
                _ => continue,
            };
            let archived = matches!(row.next(), Some(Some(Value::Boolean(true))));
            out.push(LinkOwner {
                uuid,
                metadata_date,
                archived,
            });
        }
        Ok(out)
    }

    async fn source_state(&mut self, uuids: &[Uuid]) -> Result<Vec<SourceState>> {
        if uuids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> =
            (1..=uuids.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT uuid, archive_path IS NOT NULL FROM {} WHERE uuid IN ({})",
            self.table(CORE),
            placeholders.join(", ")
        );
        let params: Vec<Value> = uuids.iter().map(|u| Value::Uuid(*u)).collect();
        let rows = self.query_rows(&sql, &params, &[DataType::Uuid, DataType::Boolean])?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = row.into_iter();
            let uuid = match row.next() {
                Some(Some(Value::Uuid(uuid))) => uuid,
                _ => continue,
            };
            let archived = matches!(row.next(), Some(Some(Value::Boolean(true))));
            out.push(SourceState { uuid, archived });
        }
        Ok(out)
    }
}

fn collect_uuids(rows: Vec<Vec<Option<Value>>>) -> Vec<Uuid> {
    rows.into_iter()
        .filter_map(|row| match row.into_iter().next() {
            Some(Some(Value::Uuid(uuid))) => Some(uuid),
            _ => None,
        })
        .collect()
}

/// Whether an expression needs SpatiaLite functions.
fn uses_spatial(expr: &Expr) -> bool {
    match expr {
        Expr::CoversGeometry(..) | Expr::IntersectsGeometry(..) | Expr::Distance(..) => true,
        Expr::Not(inner) | Expr::Neg(inner) | Expr::HasTag(inner) => uses_spatial(inner),
        Expr::Binary { lhs, rhs, .. } => uses_spatial(lhs) || uses_spatial(rhs),
        Expr::In { lhs, .. } => uses_spatial(lhs),
        Expr::CoversTime(args) | Expr::IntersectsTime(args) => args.iter().any(uses_spatial),
        Expr::IsSourceOf(arg) | Expr::IsDerivedFrom(arg) => match arg {
            LinkArg::Uuid(inner) | LinkArg::SubQuery(inner) => uses_spatial(inner),
        },
        _ => false,
    }
}

fn wrap(err: rusqlite::Error) -> Error {
    // SQLITE_CONSTRAINT_PRIMARYKEY and SQLITE_CONSTRAINT_UNIQUE.
    const CONFLICT_CODES: [i32; 2] = [1555, 2067];
    if let rusqlite::Error::SqliteFailure(code, ref message) = err {
        if code.code == rusqlite::ErrorCode::ConstraintViolation
            && CONFLICT_CODES.contains(&code.extended_code)
        {
            return Error::Conflict(
                message
                    .clone()
                    .unwrap_or_else(|| "unique constraint violation".to_string()),
            );
        }
    }
    Error::backend_with("SQLite operation failed", err)
}

fn column_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Boolean
        | DataType::Integer32
        | DataType::Long64
        | DataType::Timestamp => "INTEGER",
        DataType::Real => "REAL",
        DataType::Text | DataType::Uuid | DataType::Geometry | DataType::Json => "TEXT",
    }
}

fn encode(value: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match value {
        Value::Boolean(b) => Sql::Integer(*b as i64),
        Value::Integer32(v) => Sql::Integer(*v as i64),
        Value::Long64(v) => Sql::Integer(*v),
        Value::Real(v) => Sql::Real(*v),
        Value::Text(s) => Sql::Text(s.clone()),
        Value::Timestamp(t) => Sql::Integer(t.and_utc().timestamp_micros()),
        Value::Uuid(u) => Sql::Text(u.to_string()),
        Value::Geometry(g) => Sql::Text(g.to_string()),
        Value::Json(v) => Sql::Text(v.to_string()),
    }
}

fn decode(row: &rusqlite::Row<'_>, index: usize, data_type: DataType) -> Result<Option<Value>> {
    let value = match data_type {
        DataType::Boolean => row
            .get::<_, Option<i64>>(index)
            .map_err(wrap)?
            .map(|v| Value::Boolean(v != 0)),
        DataType::Integer32 => row
            .get::<_, Option<i64>>(index)
            .map_err(wrap)?
            .map(|v| Value::Integer32(v as i32)),
        DataType::Long64 => row
            .get::<_, Option<i64>>(index)
            .map_err(wrap)?
            .map(Value::Long64),
        DataType::Real => row
            .get::<_, Option<f64>>(index)
            .map_err(wrap)?
            .map(Value::Real),
        DataType::Text => row
            .get::<_, Option<String>>(index)
            .map_err(wrap)?
            .map(Value::Text),
        DataType::Timestamp => match row.get::<_, Option<i64>>(index).map_err(wrap)? {
            Some(micros) => Some(Value::Timestamp(decode_timestamp(micros)?)),
            None => None,
        },
        DataType::Uuid => match row.get::<_, Option<String>>(index).map_err(wrap)? {
            Some(text) => Some(Value::Uuid(text.parse().map_err(|_| {
                Error::backend(format!("malformed UUID {:?} in catalogue", text))
            })?)),
            None => None,
        },
        DataType::Geometry => match row.get::<_, Option<String>>(index).map_err(wrap)? {
            Some(wkt) => Some(Value::Geometry(Geometry::from_wkt(&wkt).map_err(|e| {
                Error::backend(format!("malformed geometry in catalogue: {}", e))
            })?)),
            None => None,
        },
        DataType::Json => match row.get::<_, Option<String>>(index).map_err(wrap)? {
            Some(text) => Some(Value::Json(serde_json::from_str(&text).map_err(|e| {
                Error::backend(format!("malformed JSON in catalogue: {}", e))
            })?)),
            None => None,
        },
    };
    Ok(value)
}

fn decode_timestamp(micros: i64) -> Result<NaiveDateTime> {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| Error::backend(format!("timestamp {} out of range", micros)))
}

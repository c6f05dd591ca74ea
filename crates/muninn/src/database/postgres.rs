//! Relational database backend over PostgreSQL with PostGIS.
//!
//! TEXT columns carry `COLLATE "C"` so ordering is stable across locales.
//! Geometry columns are `geometry(GEOMETRY, 4326)` with a GiST index.
//! SQL is built at run time (the schema is registered at run time), so the
//! non-macro sqlx query interface is used throughout.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Connection, PgConnection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::geometry::Geometry;
use crate::properties::Properties;
use crate::schema::{Namespace, SchemaSet, CORE};
use crate::value::{DataType, Value};

use super::sqlgen::{Dialect, SqlBuilder};
use super::{
    row_to_properties, DatabaseBackend, LinkOwner, SearchOptions, SourceState, Summary,
    SummaryOptions, TimeBin,
};

pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn coerce_boolean(&self, inner: &str) -> String {
        format!("coalesce(({}), false)", inner)
    }

    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String {
        format!(
            "CAST(EXTRACT(EPOCH FROM ({} - {})) AS DOUBLE PRECISION)",
            lhs, rhs
        )
    }

    fn geometry_value(&self, placeholder: &str) -> String {
        format!("ST_GeomFromText({}, 4326)", placeholder)
    }

    fn geometry_column(&self, column: &str) -> String {
        column.to_string()
    }

    fn select_geometry(&self, column: &str) -> String {
        format!("ST_AsText({})", column)
    }

    fn geometry_covers(&self, a: &str, b: &str) -> String {
        format!("ST_Covers({}, {})", a, b)
    }

    fn geometry_intersects(&self, a: &str, b: &str) -> String {
        format!("ST_Intersects({}, {})", a, b)
    }

    fn geometry_distance(&self, a: &str, b: &str) -> String {
        format!("ST_Distance({}, {})", a, b)
    }

    fn time_bin(&self, column: &str, bin: TimeBin) -> (String, DataType) {
        match bin {
            TimeBin::Year => (
                format!("CAST(EXTRACT(YEAR FROM {}) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::Month => (
                format!("CAST(EXTRACT(MONTH FROM {}) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::YearMonth => (
                format!("to_char({}, 'YYYY-MM')", column),
                DataType::Text,
            ),
            TimeBin::Date => (
                format!("to_char({}, 'YYYY-MM-DD')", column),
                DataType::Text,
            ),
            TimeBin::Day => (
                format!("CAST(EXTRACT(DAY FROM {}) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::Hour => (
                format!("CAST(EXTRACT(HOUR FROM {}) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::Minute => (
                format!("CAST(EXTRACT(MINUTE FROM {}) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::Second => (
                format!("CAST(FLOOR(EXTRACT(SECOND FROM {})) AS BIGINT)", column),
                DataType::Long64,
            ),
            TimeBin::Time => (
                format!("to_char({}, 'HH24:MI:SS')", column),
                DataType::Text,
            ),
        }
    }

    fn cast_aggregate(&self, inner: &str, result: DataType) -> String {
        match result {
            DataType::Long64 | DataType::Integer32 => format!("CAST({} AS BIGINT)", inner),
            DataType::Real => format!("CAST({} AS DOUBLE PRECISION)", inner),
            _ => inner.to_string(),
        }
    }
}

pub struct PostgresBackend {
    connection_string: String,
    table_prefix: String,
    schema: Arc<SchemaSet>,
    connection: Option<PgConnection>,
    in_transaction: bool,
}

impl PostgresBackend {
    pub fn new(
        connection_string: impl Into<String>,
        table_prefix: impl Into<String>,
        schema: Arc<SchemaSet>,
    ) -> PostgresBackend {
        PostgresBackend {
            connection_string: connection_string.into(),
            table_prefix: table_prefix.into(),
            schema,
            connection: None,
            in_transaction: false,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.table_prefix, name)
    }

    async fn connection(&mut self) -> Result<&mut PgConnection> {
        if self.connection.is_none() {
            let connection = PgConnection::connect(&self.connection_string)
                .await
                .map_err(wrap)?;
            tracing::debug!("opened PostgreSQL catalogue connection");
            self.connection = Some(connection);
        }
        match &mut self.connection {
            Some(connection) => Ok(connection),
            None => Err(Error::backend("no catalogue connection")),
        }
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let connection = self.connection().await?;
        tracing::debug!(%sql, "executing");
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }
        let result = query.execute(&mut *connection).await.map_err(wrap)?;
        Ok(result.rows_affected())
    }

    async fn query_rows(
        &mut self,
        sql: &str,
        params: &[Value],
        types: &[DataType],
    ) -> Result<Vec<Vec<Option<Value>>>> {
        let connection = self.connection().await?;
        tracing::debug!(%sql, "querying");
        let mut query = sqlx::query(sql);
        for value in params {
            query = bind_value(query, value);
        }
        let rows = query.fetch_all(&mut *connection).await.map_err(wrap)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = Vec::with_capacity(types.len());
            for (index, data_type) in types.iter().enumerate() {
                values.push(decode(&row, index, *data_type)?);
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
                "uuid UUID PRIMARY KEY REFERENCES {}(uuid) ON DELETE CASCADE",
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
            if field.data_type == DataType::Geometry {
                statements.push(format!(
                    "CREATE INDEX idx_{table}_{field} ON {table} USING GIST ({field})",
                    table = table,
                    field = field.name,
                ));
            } else if field.indexed {
                statements.push(format!(
                    "CREATE INDEX idx_{table}_{field} ON {table} ({field})",
                    table = table,
                    field = field.name,
                ));
            }
        }
        statements
    }

    async fn insert_namespace_row(
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
        let schema = self.schema.clone();
        let placeholders: Vec<String> = names
            .iter()
            .enumerate()
            .map(|(i, name)| placeholder_for(&schema, namespace, name, i + 1))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(namespace),
            names.join(", "),
            placeholders.join(", ")
        );
        self.execute(&sql, &params).await?;
        Ok(())
    }
}

/// Geometry parameters travel as WKT and are wrapped on the SQL side.
fn placeholder_for(schema: &SchemaSet, namespace: &str, field: &str, index: usize) -> String {
    let is_geometry = schema
        .resolve(namespace, field)
        .map(|f| f.data_type == DataType::Geometry)
        .unwrap_or(false);
    if is_geometry {
        format!("ST_GeomFromText(${}, 4326)", index)
    } else {
        format!("${}", index)
    }
}

#[async_trait]
impl DatabaseBackend for PostgresBackend {
    async fn prepare(&mut self) -> Result<()> {
        if self.exists().await? {
            return Err(Error::State(
                "the catalogue is already prepared".to_string(),
            ));
        }
        if let Err(err) = self
            .execute("CREATE EXTENSION IF NOT EXISTS postgis", &[])
            .await
        {
            tracing::warn!(error = %err, "could not ensure the postgis extension; assuming it is installed");
        }
        let schema = self.schema.clone();
        for namespace in schema.iter() {
            for statement in self.namespace_ddl(namespace) {
                self.execute(&statement, &[]).await?;
            }
        }
        let core = self.table(CORE);
        let tag = self.table("tag");
        let link = self.table("link");
        for statement in [
            format!(
                "CREATE TABLE {tag} (id BIGSERIAL UNIQUE, \
                 uuid UUID NOT NULL REFERENCES {core}(uuid) ON DELETE CASCADE, \
                 tag TEXT COLLATE \"C\" NOT NULL, PRIMARY KEY (uuid, tag))"
            ),
            format!("CREATE INDEX idx_{tag}_tag ON {tag} (tag)"),
            format!(
                "CREATE TABLE {link} (id BIGSERIAL UNIQUE, \
                 uuid UUID NOT NULL REFERENCES {core}(uuid) ON DELETE CASCADE, \
                 source_uuid UUID NOT NULL, PRIMARY KEY (uuid, source_uuid))"
            ),
            format!("CREATE INDEX idx_{link}_source ON {link} (source_uuid)"),
        ] {
            self.execute(&statement, &[]).await?;
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
            self.execute(&format!("DROP TABLE IF EXISTS {} CASCADE", table), &[])
                .await?;
        }
        Ok(())
    }

    async fn exists(&mut self) -> Result<bool> {
        let core = self.table(CORE);
        let connection = self.connection().await?;
        let row = sqlx::query(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_name = $1",
        )
        .bind(core)
        .fetch_one(&mut *connection)
        .await
        .map_err(wrap)?;
        let count: i64 = row.try_get(0).map_err(wrap)?;
        Ok(count > 0)
    }

    async fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if self.in_transaction {
            self.execute("ROLLBACK", &[]).await?;
            self.in_transaction = false;
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(connection) = self.connection.take() {
            self.in_transaction = false;
            connection.close().await.map_err(wrap)?;
        }
        Ok(())
    }

    async fn insert_product(&mut self, properties: &Properties) -> Result<()> {
        let uuid = properties.require_uuid()?;
        let core_fields = properties
            .fields(CORE)
            .ok_or_else(|| Error::Schema("product properties carry no core namespace".into()))?
            .clone();
        self.insert_namespace_row(uuid, CORE, &core_fields).await?;

        let extensions: Vec<(String, _)> = properties
            .defined()
            .filter(|(name, _)| *name != CORE)
            .map(|(name, fields)| (name.to_string(), fields.clone()))
            .collect();
        for (namespace, fields) in extensions {
            self.insert_namespace_row(uuid, &namespace, &fields).await?;
        }
        Ok(())
    }

    async fn update_product(
        &mut self,
        uuid: Uuid,
        diff: &Properties,
        create_namespaces: bool,
    ) -> Result<()> {
        let schema = self.schema.clone();
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
                        assignments.push(format!(
                            "{} = {}",
                            field,
                            placeholder_for(&schema, CORE, field, params.len())
                        ));
                    }
                    None => assignments.push(format!("{} = NULL", field)),
                }
            }
            if !assignments.is_empty() {
                params.push(Value::Uuid(uuid));
                let sql = format!(
                    "UPDATE {} SET {} WHERE uuid = ${}",
                    self.table(CORE),
                    assignments.join(", "),
                    params.len()
                );
                if self.execute(&sql, &params).await? == 0 {
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
                let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table(&namespace));
                self.execute(&sql, &[Value::Uuid(uuid)]).await?;
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
                        assignments.push(format!(
                            "{} = {}",
                            field,
                            placeholder_for(&schema, &namespace, field, params.len())
                        ));
                    }
                    None => assignments.push(format!("{} = NULL", field)),
                }
            }
            if assignments.is_empty() {
                continue;
            }
            params.push(Value::Uuid(uuid));
            let sql = format!(
                "UPDATE {} SET {} WHERE uuid = ${}",
                self.table(&namespace),
                assignments.join(", "),
                params.len()
            );
            if self.execute(&sql, &params).await? == 0 {
                if !create_namespaces {
                    return Err(Error::NotFound(format!(
                        "product {} has no {} namespace record",
                        uuid, namespace
                    )));
                }
                self.insert_namespace_row(uuid, &namespace, &fields).await?;
            }
        }
        Ok(())
    }

    async fn delete_product(&mut self, uuid: Uuid) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table(CORE));
        if self.execute(&sql, &[Value::Uuid(uuid)]).await? == 0 {
            return Err(Error::NotFound(format!("product {} does not exist", uuid)));
        }
        Ok(())
    }

    async fn search(
        &mut self,
        expr: Option<&Expr>,
        options: &SearchOptions,
    ) -> Result<Vec<Properties>> {
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = PostgresDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let plan = builder.search(expr, options)?;
        let types: Vec<DataType> = plan.columns.iter().map(|c| c.data_type).collect();
        let rows = self.query_rows(&plan.sql, &plan.params, &types).await?;
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
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = PostgresDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let statement = builder.count(expr)?;
        let rows = self
            .query_rows(&statement.sql, &statement.params, &[DataType::Long64])
            .await?;
        match rows.first().and_then(|row| row.first()) {
            Some(Some(Value::Long64(count))) => Ok(*count),
            _ => Err(Error::backend("count query returned no rows")),
        }
    }

    async fn summary(&mut self, expr: Option<&Expr>, options: &SummaryOptions) -> Result<Summary> {
        let schema = self.schema.clone();
        let prefix = self.table_prefix.clone();
        let dialect = PostgresDialect;
        let builder = SqlBuilder::new(&dialect, &prefix, &schema);
        let plan = builder.summary(expr, options)?;
        let types: Vec<DataType> = plan.columns.iter().map(|(_, dt)| *dt).collect();
        let rows = self.query_rows(&plan.sql, &plan.params, &types).await?;
        Ok(Summary {
            columns: plan.columns,
            rows,
        })
    }

    async fn link(&mut self, uuid: Uuid, source: Uuid) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (uuid, source_uuid) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            self.table("link")
        );
        self.execute(&sql, &[Value::Uuid(uuid), Value::Uuid(source)])
            .await?;
        Ok(())
    }

    async fn unlink(&mut self, uuid: Uuid, source: Option<Uuid>) -> Result<()> {
        let affected = match source {
            Some(source) => {
                let sql = format!(
                    "DELETE FROM {} WHERE uuid = $1 AND source_uuid = $2",
                    self.table("link")
                );
                self.execute(&sql, &[Value::Uuid(uuid), Value::Uuid(source)])
                    .await?
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table("link"));
                self.execute(&sql, &[Value::Uuid(uuid)]).await?
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
                "INSERT INTO {} (uuid, tag) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                self.table("tag")
            );
            self.execute(&sql, &[Value::Uuid(uuid), Value::Text(tag.clone())])
                .await?;
        }
        Ok(())
    }

    async fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()> {
        match tags {
            Some(tags) => {
                for tag in tags {
                    let sql = format!(
                        "DELETE FROM {} WHERE uuid = $1 AND tag = $2",
                        self.table("tag")
                    );
                    self.execute(&sql, &[Value::Uuid(uuid), Value::Text(tag.clone())])
                        .await?;
                }
            }
            None => {
                let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table("tag"));
                self.execute(&sql, &[Value::Uuid(uuid)]).await?;
            }
        }
        Ok(())
    }

    async fn list_tags(&mut self, uuid: Uuid) -> Result<Vec<String>> {
        let sql = format!(
            "SELECT tag FROM {} WHERE uuid = $1 ORDER BY tag",
            self.table("tag")
        );
        let rows = self
            .query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Text])
            .await?;
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
            "SELECT uuid FROM {} WHERE source_uuid = $1",
            self.table("link")
        );
        let rows = self
            .query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Uuid])
            .await?;
        Ok(collect_uuids(rows))
    }

    async fn sources_of(&mut self, uuid: Uuid) -> Result<Vec<Uuid>> {
        let sql = format!(
            "SELECT source_uuid FROM {} WHERE uuid = $1",
            self.table("link")
        );
        let rows = self
            .query_rows(&sql, &[Value::Uuid(uuid)], &[DataType::Uuid])
            .await?;
        Ok(collect_uuids(rows))
    }

    async fn link_owners(&mut self) -> Result<Vec<LinkOwner>> {
        let sql = format!(
            "SELECT DISTINCT c.uuid, c.metadata_date, c.archive_path IS NOT NULL \
             FROM {link} l JOIN {core} c ON (c.uuid = l.uuid)",
            link = self.table("link"),
            core = self.table(CORE),
        );
        let rows = self
            .query_rows(
                &sql,
                &[],
                &[DataType::Uuid, DataType::Timestamp, DataType::Boolean],
            )
            .await?;
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
            (1..=uuids.len()).map(|i| format!("${}", i)).collect();
        let sql = format!(
            "SELECT uuid, archive_path IS NOT NULL FROM {} WHERE uuid IN ({})",
            self.table(CORE),
            placeholders.join(", ")
        );
        let params: Vec<Value> = uuids.iter().map(|u| Value::Uuid(*u)).collect();
        let rows = self
            .query_rows(&sql, &params, &[DataType::Uuid, DataType::Boolean])
            .await?;
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

fn wrap(err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = err {
        if db.code().as_deref() == Some("23505") {
            return Error::Conflict(db.message().to_string());
        }
    }
    Error::backend_with("PostgreSQL operation failed", err)
}

fn column_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Boolean => "BOOLEAN",
        DataType::Integer32 => "INTEGER",
        DataType::Long64 => "BIGINT",
        DataType::Real => "DOUBLE PRECISION",
        DataType::Text => "TEXT COLLATE \"C\"",
        DataType::Timestamp => "TIMESTAMP",
        DataType::Uuid => "UUID",
        DataType::Geometry => "geometry(GEOMETRY, 4326)",
        DataType::Json => "JSONB",
    }
}

type PgQuery<'q> = sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>;

fn bind_value<'q>(query: PgQuery<'q>, value: &Value) -> PgQuery<'q> {
    match value {
        Value::Boolean(b) => query.bind(*b),
        Value::Integer32(v) => query.bind(*v),
        Value::Long64(v) => query.bind(*v),
        Value::Real(v) => query.bind(*v),
        Value::Text(s) => query.bind(s.clone()),
        Value::Timestamp(t) => query.bind(*t),
        Value::Uuid(u) => query.bind(*u),
        Value::Geometry(g) => query.bind(g.to_string()),
        Value::Json(v) => query.bind(v.clone()),
    }
}

fn decode(row: &PgRow, index: usize, data_type: DataType) -> Result<Option<Value>> {
    let value = match data_type {
        DataType::Boolean => row
            .try_get::<Option<bool>, _>(index)
            .map_err(wrap)?
            .map(Value::Boolean),
        DataType::Integer32 => row
            .try_get::<Option<i32>, _>(index)
            .map_err(wrap)?
            .map(Value::Integer32),
        DataType::Long64 => row
            .try_get::<Option<i64>, _>(index)
            .map_err(wrap)?
            .map(Value::Long64),
        DataType::Real => row
            .try_get::<Option<f64>, _>(index)
            .map_err(wrap)?
            .map(Value::Real),
        DataType::Text => row
            .try_get::<Option<String>, _>(index)
            .map_err(wrap)?
            .map(Value::Text),
        DataType::Timestamp => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)
            .map_err(wrap)?
            .map(Value::Timestamp),
        DataType::Uuid => row
            .try_get::<Option<Uuid>, _>(index)
            .map_err(wrap)?
            .map(Value::Uuid),
        DataType::Geometry => match row.try_get::<Option<String>, _>(index).map_err(wrap)? {
            Some(wkt) => Some(Value::Geometry(Geometry::from_wkt(&wkt).map_err(|e| {
                Error::backend(format!("malformed geometry in catalogue: {}", e))
            })?)),
            None => None,
        },
        DataType::Json => row
            .try_get::<Option<serde_json::Value>, _>(index)
            .map_err(wrap)?
            .map(Value::Json),
    };
    Ok(value)
}

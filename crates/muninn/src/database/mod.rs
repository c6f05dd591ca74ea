//! The database backend abstraction: schema creation, typed CRUD, query
//! lowering, aggregation, links and tags, and the transactional envelope.
//!
//! Two implementations share the semantics defined here: a relational
//! backend over PostgreSQL with PostGIS, and an embedded backend over
//! SQLite with SpatiaLite. Connections are created lazily and released at
//! the end of each archive-level operation.

pub mod postgres;
pub mod sqlgen;
pub mod sqlite;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expr::Expr;
use crate::properties::Properties;
use crate::schema::CORE;
use crate::value::{DataType, Value};

pub use sqlgen::{Dialect, PlanColumn, SearchPlan, SqlBuilder, Statement, SummaryPlan};

#[derive(Clone, Debug, Default)]
pub struct SearchOptions {
    /// Extension namespaces to return alongside `core`.
    pub namespaces: Vec<String>,
    /// `±field` ordering terms; ascending by default.
    pub order_by: Vec<String>,
    pub limit: Option<u64>,
    /// Dotted property projection applied to the result rows.
    pub property_names: Option<Vec<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AggregateFunc {
    Min,
    Max,
    Sum,
    Avg,
}

impl AggregateFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunc::Min => "min",
            AggregateFunc::Max => "max",
            AggregateFunc::Sum => "sum",
            AggregateFunc::Avg => "avg",
        }
    }

    pub fn sql_name(&self) -> &'static str {
        match self {
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
        }
    }

    pub fn from_name(name: &str) -> Option<AggregateFunc> {
        Some(match name {
            "min" => AggregateFunc::Min,
            "max" => AggregateFunc::Max,
            "sum" => AggregateFunc::Sum,
            "avg" => AggregateFunc::Avg,
            _ => return None,
        })
    }

    /// The type an aggregate over a `field_type` operand produces.
    pub fn result_type(&self, field_type: DataType) -> Result<DataType> {
        match self {
            AggregateFunc::Min | AggregateFunc::Max => match field_type {
                DataType::Integer32
                | DataType::Long64
                | DataType::Real
                | DataType::Text
                | DataType::Timestamp => Ok(field_type),
                other => Err(Error::Expression(format!(
                    "cannot aggregate {} fields",
                    other
                ))),
            },
            AggregateFunc::Sum => match field_type {
                DataType::Integer32 | DataType::Long64 => Ok(DataType::Long64),
                DataType::Real => Ok(DataType::Real),
                other => Err(Error::Expression(format!(
                    "sum is not defined for {} fields",
                    other
                ))),
            },
            AggregateFunc::Avg => match field_type {
                DataType::Integer32 | DataType::Long64 | DataType::Real => Ok(DataType::Real),
                other => Err(Error::Expression(format!(
                    "avg is not defined for {} fields",
                    other
                ))),
            },
        }
    }
}

/// One requested aggregate: a dotted property (or the synthesized
/// `validity_duration`) and a function.
#[derive(Clone, Debug)]
pub struct Aggregate {
    pub field: String,
    pub func: AggregateFunc,
}

impl Aggregate {
    /// Parse `field.func` (e.g. `size.sum`, `validity_duration.max`,
    /// `mynamespace.myfield.min`).
    pub fn parse(text: &str) -> Result<Aggregate> {
        let (field, func) = text.rsplit_once('.').ok_or_else(|| {
            Error::Expression(format!(
                "invalid aggregate {:?}: expected <property>.<min|max|sum|avg>",
                text
            ))
        })?;
        let func = AggregateFunc::from_name(func).ok_or_else(|| {
            Error::Expression(format!("unknown aggregate function {:?}", func))
        })?;
        Ok(Aggregate {
            field: field.to_string(),
            func,
        })
    }

    pub fn namespace(&self) -> Option<&str> {
        if self.field == "validity_duration" {
            return None;
        }
        Some(crate::properties::split_reference(&self.field).0)
    }
}

/// Timestamp binning subscript for summary group-bys.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TimeBin {
    Year,
    Month,
    YearMonth,
    Date,
    Day,
    Hour,
    Minute,
    Second,
    Time,
}

impl TimeBin {
    pub fn name(&self) -> &'static str {
        match self {
            TimeBin::Year => "year",
            TimeBin::Month => "month",
            TimeBin::YearMonth => "yearmonth",
            TimeBin::Date => "date",
            TimeBin::Day => "day",
            TimeBin::Hour => "hour",
            TimeBin::Minute => "minute",
            TimeBin::Second => "second",
            TimeBin::Time => "time",
        }
    }

    pub fn from_name(name: &str) -> Option<TimeBin> {
        Some(match name {
            "year" => TimeBin::Year,
            "month" => TimeBin::Month,
            "yearmonth" => TimeBin::YearMonth,
            "date" => TimeBin::Date,
            "day" => TimeBin::Day,
            "hour" => TimeBin::Hour,
            "minute" => TimeBin::Minute,
            "second" => TimeBin::Second,
            "time" => TimeBin::Time,
            _ => return None,
        })
    }
}

/// One summary grouping key: a dotted property with an optional timestamp
/// binning subscript.
#[derive(Clone, Debug)]
pub struct GroupBy {
    pub field: String,
    pub bin: Option<TimeBin>,
}

impl GroupBy {
    /// Parse `field[.bin]`, resolving the ambiguity between namespace
    /// separators and binning subscripts against the schema.
    pub fn parse(text: &str, schema: &crate::schema::SchemaSet) -> Result<GroupBy> {
        // Try the longest property reference first.
        let (namespace, rest) = crate::properties::split_reference(text);
        if schema.resolve(namespace, rest).is_ok() && namespace == CORE {
            return Ok(GroupBy {
                field: text.to_string(),
                bin: None,
            });
        }
        if let Some((field, bin)) = text.rsplit_once('.') {
            if let Some(bin) = TimeBin::from_name(bin) {
                let (namespace, name) = crate::properties::split_reference(field);
                if schema.resolve(namespace, name).is_ok() {
                    return Ok(GroupBy {
                        field: field.to_string(),
                        bin: Some(bin),
                    });
                }
            }
        }
        let (namespace, field) = crate::properties::split_reference(text);
        schema.resolve(namespace, field)?;
        Ok(GroupBy {
            field: text.to_string(),
            bin: None,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct SummaryOptions {
    pub aggregates: Vec<Aggregate>,
    pub group_by: Vec<GroupBy>,
    /// Group by tag as well; a product with N tags contributes N rows.
    pub group_by_tag: bool,
    /// Condition over the summary output columns.
    pub having: Option<String>,
    /// `±column` terms over output column names; defaults to the
    /// group-by order.
    pub order_by: Vec<String>,
}

/// Result of a summary: named, typed columns and their rows.
#[derive(Clone, Debug)]
pub struct Summary {
    pub columns: Vec<(String, DataType)>,
    pub rows: Vec<Vec<Option<Value>>>,
}

/// State of a link source as seen by the cascade engine.
#[derive(Copy, Clone, Debug)]
pub struct SourceState {
    pub uuid: Uuid,
    /// Whether the catalogue row still has `archive_path` set.
    pub archived: bool,
}

/// A cascade candidate: a product owning link rows.
#[derive(Copy, Clone, Debug)]
pub struct LinkOwner {
    pub uuid: Uuid,
    pub metadata_date: NaiveDateTime,
    pub archived: bool,
}

/// Contract between the orchestrator and a database backend.
///
/// A backend owns at most one connection; it is created on first need and
/// dropped by [`DatabaseBackend::disconnect`] at the end of each archive
/// operation.
#[async_trait]
pub trait DatabaseBackend: Send {
    /// Create the catalogue tables and indices for the registered schema.
    async fn prepare(&mut self) -> Result<()>;

    /// Drop all catalogue tables.
    async fn destroy(&mut self) -> Result<()>;

    /// Whether the catalogue tables exist.
    async fn exists(&mut self) -> Result<bool>;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;

    /// Insert the core row and any namespace rows of a new product.
    async fn insert_product(&mut self, properties: &Properties) -> Result<()>;

    /// Apply an update diff: concrete fields are written, field sentinels
    /// become NULL, namespace sentinels delete the namespace row.
    async fn update_product(
        &mut self,
        uuid: Uuid,
        diff: &Properties,
        create_namespaces: bool,
    ) -> Result<()>;

    /// Delete the core row; namespace rows, links and tags cascade.
    async fn delete_product(&mut self, uuid: Uuid) -> Result<()>;

    async fn search(&mut self, expr: Option<&Expr>, options: &SearchOptions)
        -> Result<Vec<Properties>>;

    async fn count(&mut self, expr: Option<&Expr>) -> Result<i64>;

    async fn summary(&mut self, expr: Option<&Expr>, options: &SummaryOptions) -> Result<Summary>;

    /// Record a derived→source link; duplicates are ignored.
    async fn link(&mut self, uuid: Uuid, source: Uuid) -> Result<()>;

    /// Remove one link, or all links of `uuid` when `source` is `None`.
    async fn unlink(&mut self, uuid: Uuid, source: Option<Uuid>) -> Result<()>;

    /// Attach tags; duplicates are ignored.
    async fn tag(&mut self, uuid: Uuid, tags: &[String]) -> Result<()>;

    /// Remove the given tags, or all tags when `tags` is `None`.
    async fn untag(&mut self, uuid: Uuid, tags: Option<&[String]>) -> Result<()>;

    async fn list_tags(&mut self, uuid: Uuid) -> Result<Vec<String>>;

    /// UUIDs of products derived from `uuid`.
    async fn derived_of(&mut self, uuid: Uuid) -> Result<Vec<Uuid>>;

    /// Source UUIDs recorded for `uuid`, dangling ones included.
    async fn sources_of(&mut self, uuid: Uuid) -> Result<Vec<Uuid>>;

    /// Products that own at least one link row.
    async fn link_owners(&mut self) -> Result<Vec<LinkOwner>>;

    /// Which of `uuids` still exist, and whether each is archived.
    async fn source_state(&mut self, uuids: &[Uuid]) -> Result<Vec<SourceState>>;
}

/// Decode helper shared by both backends: build [`Properties`] from a
/// search row already decoded into per-column optional values.
pub(crate) fn row_to_properties(columns: &[PlanColumn], values: Vec<Option<Value>>) -> Properties {
    let mut properties = Properties::new();
    let mut present: Option<String> = None;
    for (column, value) in columns.iter().zip(values) {
        if column.marker {
            present = value.as_ref().and(Some(column.namespace.clone()));
            continue;
        }
        if column.namespace != CORE && present.as_deref() != Some(column.namespace.as_str()) {
            continue;
        }
        if let Some(value) = value {
            properties.set(&column.namespace, &column.field, value);
        }
    }
    properties
}

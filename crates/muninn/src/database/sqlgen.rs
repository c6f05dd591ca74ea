//! Lowering of typed expressions and catalogue operations to SQL.
//!
//! Both database backends share this generator; a [`Dialect`] supplies the
//! pieces that differ (placeholder style, boolean coercion, timestamp
//! arithmetic, spatial functions, time binning).
//!
//! NULL handling is folded into two-valued logic here: every comparison is
//! wrapped so a NULL operand yields false, and `!=` / `not in` are lowered
//! through negation so a NULL property satisfies them. `is_defined` remains
//! the explicit NULL probe.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::expr::{Ast, BinaryOp, Expr, LinkArg, UnaryOp};
use crate::schema::{SchemaSet, CORE};
use crate::value::{DataType, Value};

use super::{Aggregate, AggregateFunc, GroupBy, SearchOptions, SummaryOptions, TimeBin};

/// Backend-specific SQL fragments.
pub trait Dialect: Send + Sync {
    /// Numbered placeholder, 1-based.
    fn placeholder(&self, index: usize) -> String;
    /// Coerce a possibly-NULL boolean expression to two-valued logic.
    fn coerce_boolean(&self, inner: &str) -> String;
    /// `lhs - rhs` between two timestamps, in (possibly truncated) seconds.
    fn timestamp_diff(&self, lhs: &str, rhs: &str) -> String;
    /// Wrap a bound WKT parameter into a geometry value.
    fn geometry_value(&self, placeholder: &str) -> String;
    /// A geometry column in function-argument position.
    fn geometry_column(&self, column: &str) -> String;
    /// A geometry column in select-list position (text WKT out).
    fn select_geometry(&self, column: &str) -> String;
    fn geometry_covers(&self, a: &str, b: &str) -> String;
    fn geometry_intersects(&self, a: &str, b: &str) -> String;
    fn geometry_distance(&self, a: &str, b: &str) -> String;
    /// Bin a timestamp column; returns the SQL and the bin's result type.
    fn time_bin(&self, column: &str, bin: TimeBin) -> (String, DataType);
    /// Cast an aggregate so it decodes predictably.
    fn cast_aggregate(&self, inner: &str, result: DataType) -> String;
}

/// A generated statement with its positional parameters.
#[derive(Debug)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// One column of a search select-list.
#[derive(Clone, Debug)]
pub struct PlanColumn {
    pub namespace: String,
    pub field: String,
    pub data_type: DataType,
    /// Marker columns carry the namespace-row `uuid` used to detect
    /// whether the (left-joined) namespace row exists.
    pub marker: bool,
}

#[derive(Debug)]
pub struct SearchPlan {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<PlanColumn>,
}

#[derive(Debug)]
pub struct SummaryPlan {
    pub sql: String,
    pub params: Vec<Value>,
    pub columns: Vec<(String, DataType)>,
}

pub struct SqlBuilder<'a> {
    dialect: &'a dyn Dialect,
    prefix: &'a str,
    schema: &'a SchemaSet,
    params: Vec<Value>,
    aliases: u32,
    suffix: String,
    summary_columns: Option<BTreeMap<String, (String, DataType)>>,
}

impl<'a> SqlBuilder<'a> {
    pub fn new(dialect: &'a dyn Dialect, prefix: &'a str, schema: &'a SchemaSet) -> Self {
        SqlBuilder {
            dialect,
            prefix,
            schema,
            params: Vec::new(),
            aliases: 0,
            suffix: String::new(),
            summary_columns: None,
        }
    }

    fn table(&self, namespace: &str) -> String {
        format!("{}{}", self.prefix, namespace)
    }

    /// The table reference valid in the current scope (aliased inside
    /// sub-queries).
    fn scoped(&self, namespace: &str) -> String {
        format!("{}{}{}", self.prefix, namespace, self.suffix)
    }

    fn column(&self, namespace: &str, field: &str) -> String {
        format!("{}.{}", self.scoped(namespace), field)
    }

    fn push(&mut self, value: Value) -> String {
        self.params.push(value);
        self.dialect.placeholder(self.params.len())
    }

    fn next_alias(&mut self, kind: &str) -> String {
        self.aliases += 1;
        format!("{}_{}", kind, self.aliases)
    }

    /// FROM clause for `core` plus left-joined extension namespaces.
    fn from_clause(&self, namespaces: &BTreeSet<String>) -> String {
        let mut sql = if self.suffix.is_empty() {
            format!("FROM {}", self.table(CORE))
        } else {
            format!("FROM {} AS {}", self.table(CORE), self.scoped(CORE))
        };
        for namespace in namespaces {
            if namespace == CORE {
                continue;
            }
            if self.suffix.is_empty() {
                sql.push_str(&format!(
                    " LEFT JOIN {ns} ON ({ns}.uuid = {core}.uuid)",
                    ns = self.table(namespace),
                    core = self.scoped(CORE),
                ));
            } else {
                sql.push_str(&format!(
                    " LEFT JOIN {table} AS {alias} ON ({alias}.uuid = {core}.uuid)",
                    table = self.table(namespace),
                    alias = self.scoped(namespace),
                    core = self.scoped(CORE),
                ));
            }
        }
        sql
    }

    // ------------------------------------------------------------------
    // Conditions.

    /// Lower a boolean expression to a two-valued SQL condition.
    pub fn condition(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Literal(Value::Boolean(true)) => Ok("(1 = 1)".to_string()),
            Expr::Literal(Value::Boolean(false)) => Ok("(0 = 1)".to_string()),
            Expr::Property { .. } => {
                // A bare boolean property; NULL counts as false.
                let column = self.value_expr(expr)?;
                Ok(self.dialect.coerce_boolean(&column))
            }
            Expr::Not(inner) => Ok(format!("(NOT {})", self.condition(inner)?)),
            Expr::Binary { op, lhs, rhs } => self.binary_condition(*op, lhs, rhs),
            Expr::In {
                lhs,
                negated,
                items,
            } => {
                let operand = self.value_expr(lhs)?;
                let mut placeholders = Vec::with_capacity(items.len());
                for item in items {
                    placeholders.push(self.push(item.clone()));
                }
                let test = self.dialect.coerce_boolean(&format!(
                    "{} IN ({})",
                    operand,
                    placeholders.join(", ")
                ));
                if *negated {
                    Ok(format!("(NOT {})", test))
                } else {
                    Ok(test)
                }
            }
            Expr::IsDefinedField { namespace, field } => {
                Ok(format!("{} IS NOT NULL", self.column(namespace, field)))
            }
            Expr::IsDefinedNamespace(namespace) => {
                Ok(format!("{} IS NOT NULL", self.column(namespace, "uuid")))
            }
            Expr::CoversTime(args) => {
                let a = self.value_expr(&args[0])?;
                let b = self.value_expr(&args[1])?;
                let c = self.value_expr(&args[2])?;
                let d = self.value_expr(&args[3])?;
                Ok(self
                    .dialect
                    .coerce_boolean(&format!("({a} <= {c} AND {b} >= {d})")))
            }
            Expr::IntersectsTime(args) => {
                let a = self.value_expr(&args[0])?;
                let b = self.value_expr(&args[1])?;
                let c = self.value_expr(&args[2])?;
                let d = self.value_expr(&args[3])?;
                Ok(self
                    .dialect
                    .coerce_boolean(&format!("({a} <= {d} AND {b} >= {c})")))
            }
            Expr::CoversGeometry(a, b) => {
                let a = self.geometry_operand(a)?;
                let b = self.geometry_operand(b)?;
                let test = self.dialect.geometry_covers(&a, &b);
                Ok(self.dialect.coerce_boolean(&test))
            }
            Expr::IntersectsGeometry(a, b) => {
                let a = self.geometry_operand(a)?;
                let b = self.geometry_operand(b)?;
                let test = self.dialect.geometry_intersects(&a, &b);
                Ok(self.dialect.coerce_boolean(&test))
            }
            Expr::IsSourceOf(arg) => self.link_condition(arg, "source_uuid", "uuid"),
            Expr::IsDerivedFrom(arg) => self.link_condition(arg, "uuid", "source_uuid"),
            Expr::HasTag(tag) => {
                let alias = self.next_alias("tg");
                let value = self.value_expr(tag)?;
                Ok(format!(
                    "EXISTS (SELECT 1 FROM {table} {alias} WHERE {alias}.uuid = {core}.uuid AND {alias}.tag = {value})",
                    table = self.table("tag"),
                    alias = alias,
                    core = self.scoped(CORE),
                    value = value,
                ))
            }
            other => Err(Error::Expression(format!(
                "expected a boolean expression, got {}",
                other.data_type()
            ))),
        }
    }

    fn binary_condition(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> Result<String> {
        match op {
            BinaryOp::Or => Ok(format!(
                "({} OR {})",
                self.condition(lhs)?,
                self.condition(rhs)?
            )),
            BinaryOp::And => Ok(format!(
                "({} AND {})",
                self.condition(lhs)?,
                self.condition(rhs)?
            )),
            BinaryOp::Eq => {
                let (l, r) = (self.value_expr(lhs)?, self.value_expr(rhs)?);
                Ok(self.dialect.coerce_boolean(&format!("{} = {}", l, r)))
            }
            BinaryOp::Ne => {
                // True when either operand is NULL or the values differ.
                let (l, r) = (self.value_expr(lhs)?, self.value_expr(rhs)?);
                let eq = self.dialect.coerce_boolean(&format!("{} = {}", l, r));
                Ok(format!("(NOT {})", eq))
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                let symbol = match op {
                    BinaryOp::Lt => "<",
                    BinaryOp::Le => "<=",
                    BinaryOp::Gt => ">",
                    _ => ">=",
                };
                let (l, r) = (self.value_expr(lhs)?, self.value_expr(rhs)?);
                Ok(self
                    .dialect
                    .coerce_boolean(&format!("{} {} {}", l, symbol, r)))
            }
            BinaryOp::Matches => {
                let (l, r) = (self.value_expr(lhs)?, self.value_expr(rhs)?);
                Ok(self
                    .dialect
                    .coerce_boolean(&format!("{} LIKE {} ESCAPE '\\'", l, r)))
            }
            _ => Err(Error::Expression(format!(
                "operator {} is not a condition",
                op.symbol()
            ))),
        }
    }

    fn link_condition(&mut self, arg: &LinkArg, near: &str, far: &str) -> Result<String> {
        let alias = self.next_alias("ln");
        let far_match = match arg {
            LinkArg::Uuid(expr) => {
                let value = self.value_expr(expr)?;
                format!("{}.{} = {}", alias, far, value)
            }
            LinkArg::SubQuery(condition) => {
                let select = self.subquery(condition)?;
                format!("{}.{} IN ({})", alias, far, select)
            }
        };
        Ok(format!(
            "EXISTS (SELECT 1 FROM {table} {alias} WHERE {alias}.{near} = {core}.uuid AND {far_match})",
            table = self.table("link"),
            alias = alias,
            near = near,
            core = self.scoped(CORE),
            far_match = far_match,
        ))
    }

    /// A `SELECT uuid` sub-query over an aliased scope.
    fn subquery(&mut self, condition: &Expr) -> Result<String> {
        let saved = std::mem::take(&mut self.suffix);
        self.aliases += 1;
        self.suffix = format!("_q{}", self.aliases);

        let mut namespaces = BTreeSet::new();
        condition.referenced_namespaces(&mut namespaces);
        let from = self.from_clause(&namespaces);
        let inner = self.condition(condition);
        let core = self.scoped(CORE);
        self.suffix = saved;

        Ok(format!("SELECT {}.uuid {} WHERE {}", core, from, inner?))
    }

    // ------------------------------------------------------------------
    // Scalar values.

    fn value_expr(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Literal(Value::Geometry(geometry)) => {
                let placeholder = self.push(Value::Text(geometry.to_string()));
                Ok(self.dialect.geometry_value(&placeholder))
            }
            Expr::Literal(value) => Ok(self.push(value.clone())),
            Expr::Property {
                namespace, field, ..
            } => {
                if namespace.is_empty() {
                    // Synthetic summary column (HAVING resolution).
                    let sql = self
                        .summary_columns
                        .as_ref()
                        .and_then(|columns| columns.get(field))
                        .map(|(sql, _)| sql.clone())
                        .ok_or_else(|| {
                            Error::Expression(format!("unknown summary column {:?}", field))
                        })?;
                    return Ok(sql);
                }
                Ok(self.column(namespace, field))
            }
            Expr::Neg(operand) => Ok(format!("(- {})", self.value_expr(operand)?)),
            Expr::Binary { op, lhs, rhs } => {
                let timestamps = lhs.data_type() == DataType::Timestamp
                    && rhs.data_type() == DataType::Timestamp;
                let (l, r) = (self.value_expr(lhs)?, self.value_expr(rhs)?);
                match op {
                    BinaryOp::Sub if timestamps => Ok(self.dialect.timestamp_diff(&l, &r)),
                    BinaryOp::Add => Ok(format!("({} + {})", l, r)),
                    BinaryOp::Sub => Ok(format!("({} - {})", l, r)),
                    BinaryOp::Mul => Ok(format!("({} * {})", l, r)),
                    BinaryOp::Div => Ok(format!("({} / {})", l, r)),
                    _ => Err(Error::Expression(format!(
                        "operator {} does not produce a value",
                        op.symbol()
                    ))),
                }
            }
            Expr::Distance(a, b) => {
                let a = self.geometry_operand(a)?;
                let b = self.geometry_operand(b)?;
                Ok(self.dialect.geometry_distance(&a, &b))
            }
            other => Err(Error::Expression(format!(
                "a {} expression cannot be used as a value here",
                other.data_type()
            ))),
        }
    }

    fn geometry_operand(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Literal(Value::Geometry(geometry)) => {
                let placeholder = self.push(Value::Text(geometry.to_string()));
                Ok(self.dialect.geometry_value(&placeholder))
            }
            Expr::Property {
                namespace, field, ..
            } => {
                let column = self.column(namespace, field);
                Ok(self.dialect.geometry_column(&column))
            }
            other => Err(Error::Expression(format!(
                "expected a geometry operand, got {}",
                other.data_type()
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Statements.

    pub fn search(mut self, expr: Option<&Expr>, options: &SearchOptions) -> Result<SearchPlan> {
        let mut namespaces = BTreeSet::new();
        if let Some(expr) = expr {
            expr.referenced_namespaces(&mut namespaces);
        }

        // Select-list: all core fields, then each projected namespace with
        // a leading row-presence marker.
        let mut selects = Vec::new();
        let mut columns = Vec::new();
        let core = self
            .schema
            .namespace(CORE)
            .ok_or_else(|| Error::Schema("schema set carries no core namespace".into()))?
            .clone();
        for field in core.fields() {
            let column = self.column(CORE, &field.name);
            selects.push(if field.data_type == DataType::Geometry {
                self.dialect.select_geometry(&column)
            } else {
                column
            });
            columns.push(PlanColumn {
                namespace: CORE.to_string(),
                field: field.name.clone(),
                data_type: field.data_type,
                marker: false,
            });
        }
        for name in &options.namespaces {
            if name == CORE {
                continue;
            }
            let namespace = self
                .schema
                .namespace(name)
                .ok_or_else(|| Error::Schema(format!("undefined namespace {:?}", name)))?
                .clone();
            namespaces.insert(name.clone());
            selects.push(self.column(name, "uuid"));
            columns.push(PlanColumn {
                namespace: name.clone(),
                field: "uuid".to_string(),
                data_type: DataType::Uuid,
                marker: true,
            });
            for field in namespace.fields() {
                let column = self.column(name, &field.name);
                selects.push(if field.data_type == DataType::Geometry {
                    self.dialect.select_geometry(&column)
                } else {
                    column
                });
                columns.push(PlanColumn {
                    namespace: name.clone(),
                    field: field.name.clone(),
                    data_type: field.data_type,
                    marker: false,
                });
            }
        }

        let mut order_terms = Vec::new();
        for term in &options.order_by {
            let (descending, reference) = parse_order(term);
            let (namespace, field) = crate::properties::split_reference(reference);
            let definition = self.schema.resolve(namespace, field)?;
            if !definition.data_type.has_order() {
                return Err(Error::Expression(format!(
                    "cannot order by {} field {}",
                    definition.data_type, reference
                )));
            }
            if namespace != CORE {
                namespaces.insert(namespace.to_string());
            }
            order_terms.push(format!(
                "{} {}",
                self.column(namespace, field),
                if descending { "DESC" } else { "ASC" }
            ));
        }

        let condition = match expr {
            Some(expr) => Some(self.condition(expr)?),
            None => None,
        };
        let mut sql = format!(
            "SELECT {} {}",
            selects.join(", "),
            self.from_clause(&namespaces)
        );
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        if !order_terms.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_terms.join(", "));
        }
        if let Some(limit) = options.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        Ok(SearchPlan {
            sql,
            params: self.params,
            columns,
        })
    }

    pub fn count(mut self, expr: Option<&Expr>) -> Result<Statement> {
        let mut namespaces = BTreeSet::new();
        if let Some(expr) = expr {
            expr.referenced_namespaces(&mut namespaces);
        }
        let condition = match expr {
            Some(expr) => Some(self.condition(expr)?),
            None => None,
        };
        let mut sql = format!("SELECT COUNT(*) {}", self.from_clause(&namespaces));
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        Ok(Statement {
            sql,
            params: self.params,
        })
    }

    pub fn summary(
        mut self,
        expr: Option<&Expr>,
        options: &SummaryOptions,
    ) -> Result<SummaryPlan> {
        let mut namespaces = BTreeSet::new();
        if let Some(expr) = expr {
            expr.referenced_namespaces(&mut namespaces);
        }

        // Column name -> (sql, type), used by HAVING and ORDER BY.
        let mut named = BTreeMap::new();
        let mut selects = Vec::new();
        let mut columns = Vec::new();
        let mut group_exprs = Vec::new();

        for group in &options.group_by {
            let (namespace, field) = crate::properties::split_reference(&group.field);
            let definition = self.schema.resolve(namespace, field)?;
            if namespace != CORE {
                namespaces.insert(namespace.to_string());
            }
            let column = self.column(namespace, field);
            let (sql, data_type, name) = match definition.data_type {
                DataType::Timestamp => {
                    let bin = group.bin.ok_or_else(|| {
                        Error::Expression(format!(
                            "group_by on timestamp {} requires a binning subscript",
                            group.field
                        ))
                    })?;
                    let (sql, data_type) = self.dialect.time_bin(&column, bin);
                    (sql, data_type, format!("{}.{}", group.field, bin.name()))
                }
                DataType::Boolean | DataType::Integer32 | DataType::Long64 | DataType::Text => {
                    if group.bin.is_some() {
                        return Err(Error::Expression(format!(
                            "binning subscript is only valid on timestamps ({})",
                            group.field
                        )));
                    }
                    (column, definition.data_type, group.field.clone())
                }
                other => {
                    return Err(Error::Expression(format!(
                        "cannot group by {} field {}",
                        other, group.field
                    )))
                }
            };
            selects.push(format!("{} AS {}", sql, quote_ident(&name)));
            group_exprs.push(sql.clone());
            named.insert(name.clone(), (sql, data_type));
            columns.push((name, data_type));
        }

        if options.group_by_tag {
            namespaces.insert("tag".to_string());
            let sql = format!("{}.tag", self.table("tag"));
            selects.push(format!("{} AS {}", sql, quote_ident("tag")));
            group_exprs.push(sql.clone());
            named.insert("tag".to_string(), (sql, DataType::Text));
            columns.push(("tag".to_string(), DataType::Text));
        }

        // The implicit product count.
        let count_sql = "COUNT(*)".to_string();
        selects.push(format!("{} AS {}", count_sql, quote_ident("count")));
        named.insert("count".to_string(), (count_sql, DataType::Long64));
        columns.push(("count".to_string(), DataType::Long64));

        for aggregate in &options.aggregates {
            let (inner, field_type, name) = self.aggregate_operand(aggregate)?;
            if let Some(namespace) = aggregate.namespace() {
                if namespace != CORE {
                    namespaces.insert(namespace.to_string());
                }
            }
            let result = aggregate.func.result_type(field_type)?;
            let sql = self.dialect.cast_aggregate(
                &format!("{}({})", aggregate.func.sql_name(), inner),
                result,
            );
            selects.push(format!("{} AS {}", sql, quote_ident(&name)));
            named.insert(name.clone(), (sql, result));
            columns.push((name, result));
        }

        let condition = match expr {
            Some(expr) => Some(self.condition(expr)?),
            None => None,
        };

        // `tag` is not a property namespace; join it by hand.
        namespaces.remove("tag");
        let mut sql = format!(
            "SELECT {} {}",
            selects.join(", "),
            self.from_clause(&namespaces)
        );
        if options.group_by_tag {
            sql.push_str(&format!(
                " JOIN {tag} ON ({tag}.uuid = {core}.uuid)",
                tag = self.table("tag"),
                core = self.scoped(CORE),
            ));
        }
        if let Some(condition) = condition {
            sql.push_str(" WHERE ");
            sql.push_str(&condition);
        }
        if !group_exprs.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&group_exprs.join(", "));
        }

        if let Some(having) = &options.having {
            let ast = crate::expr::parse(having)?;
            let resolved = resolve_summary_condition(&ast, &named)?;
            self.summary_columns = Some(named.clone());
            let lowered = self.condition(&resolved)?;
            self.summary_columns = None;
            sql.push_str(" HAVING ");
            sql.push_str(&lowered);
        }

        let order_by: Vec<&str> = if options.order_by.is_empty() {
            columns
                .iter()
                .take(group_exprs.len())
                .map(|(name, _)| name.as_str())
                .collect()
        } else {
            Vec::new()
        };
        let mut order_terms = Vec::new();
        if options.order_by.is_empty() {
            for name in order_by {
                order_terms.push(format!("{} ASC", quote_ident(name)));
            }
        } else {
            for term in &options.order_by {
                let (descending, name) = parse_order(term);
                if !named.contains_key(name) {
                    return Err(Error::Expression(format!(
                        "cannot order summary by unknown column {:?}",
                        name
                    )));
                }
                order_terms.push(format!(
                    "{} {}",
                    quote_ident(name),
                    if descending { "DESC" } else { "ASC" }
                ));
            }
        }
        if !order_terms.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&order_terms.join(", "));
        }

        Ok(SummaryPlan {
            sql,
            params: self.params,
            columns,
        })
    }

    fn aggregate_operand(&mut self, aggregate: &Aggregate) -> Result<(String, DataType, String)> {
        if aggregate.field == "validity_duration" {
            let start = self.column(CORE, "validity_start");
            let stop = self.column(CORE, "validity_stop");
            let sql = self.dialect.timestamp_diff(&stop, &start);
            return Ok((
                sql,
                DataType::Real,
                format!("validity_duration.{}", aggregate.func.name()),
            ));
        }
        let (namespace, field) = crate::properties::split_reference(&aggregate.field);
        let definition = self.schema.resolve(namespace, field)?;
        Ok((
            self.column(namespace, field),
            definition.data_type,
            format!("{}.{}", aggregate.field, aggregate.func.name()),
        ))
    }
}

fn parse_order(term: &str) -> (bool, &str) {
    match term.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, term.strip_prefix('+').unwrap_or(term)),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Resolve a HAVING expression against the summary output columns.
fn resolve_summary_condition(
    ast: &Ast,
    columns: &BTreeMap<String, (String, DataType)>,
) -> Result<Expr> {
    let expr = resolve_summary_expr(ast, columns)?;
    if expr.data_type() != DataType::Boolean {
        return Err(Error::Expression(format!(
            "having expects a boolean condition, got {}",
            expr.data_type()
        )));
    }
    Ok(expr)
}

fn resolve_summary_expr(
    ast: &Ast,
    columns: &BTreeMap<String, (String, DataType)>,
) -> Result<Expr> {
    match ast {
        Ast::Literal(value) => Ok(Expr::Literal(value.clone())),
        Ast::Name(name) => {
            let (_, data_type) = columns.get(name).ok_or_else(|| {
                Error::Expression(format!("unknown summary column {:?}", name))
            })?;
            Ok(Expr::Property {
                namespace: String::new(),
                field: name.clone(),
                data_type: *data_type,
            })
        }
        Ast::Unary(UnaryOp::Not, operand) => Ok(Expr::Not(Box::new(resolve_summary_condition(
            operand, columns,
        )?))),
        Ast::Unary(UnaryOp::Plus, operand) => resolve_summary_expr(operand, columns),
        Ast::Unary(UnaryOp::Minus, operand) => Ok(Expr::Neg(Box::new(resolve_summary_expr(
            operand, columns,
        )?))),
        Ast::Binary(op, lhs, rhs) => {
            let lhs = resolve_summary_expr(lhs, columns)?;
            let rhs = resolve_summary_expr(rhs, columns)?;
            Ok(Expr::Binary {
                op: *op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            })
        }
        Ast::In {
            lhs,
            negated,
            items,
        } => Ok(Expr::In {
            lhs: Box::new(resolve_summary_expr(lhs, columns)?),
            negated: *negated,
            items: items.clone(),
        }),
        _ => Err(Error::Expression(
            "parameters and functions are not supported in having".into(),
        )),
    }
}

#[cfg(test)]
mod test {
    use super::super::sqlite::SqliteDialect;
    use super::*;
    use crate::expr::{compile, ParameterMap};
    use crate::schema::{Field, Namespace};

    fn schema() -> SchemaSet {
        let mut set = SchemaSet::new();
        set.register(
            Namespace::new("mynamespace")
                .unwrap()
                .with_field(Field::new("myfield", DataType::Integer32))
                .unwrap(),
        )
        .unwrap();
        set
    }

    fn lower(text: &str) -> (String, Vec<Value>) {
        let schema = schema();
        let expr = compile(text, &schema, &ParameterMap::new()).unwrap();
        let dialect = SqliteDialect;
        let mut builder = SqlBuilder::new(&dialect, "", &schema);
        let sql = builder.condition(&expr).unwrap();
        (sql, builder.params)
    }

    #[test]
    fn null_surfacing_not_equal() {
        let (sql, params) = lower(r#"remote_url != "x""#);
        assert_eq!(sql, "(NOT ifnull((core.remote_url = ?1), 0))");
        assert_eq!(params, vec![Value::Text("x".into())]);
    }

    #[test]
    fn equality_is_two_valued() {
        let (sql, _) = lower(r#"product_name == "alpha.dat""#);
        assert_eq!(sql, "ifnull((core.product_name = ?1), 0)");
    }

    #[test]
    fn is_defined_lowering() {
        let (sql, _) = lower("is_defined(remote_url)");
        assert_eq!(sql, "core.remote_url IS NOT NULL");

        let (sql, _) = lower("is_defined(mynamespace)");
        assert_eq!(sql, "mynamespace.uuid IS NOT NULL");
    }

    #[test]
    fn timestamp_difference_millisecond_truncation() {
        let (sql, _) = lower("validity_stop - validity_start > 299");
        assert!(
            sql.contains("CAST((core.validity_stop - core.validity_start) / 1000 AS INTEGER) / 1000.0"),
            "{sql}"
        );
    }

    #[test]
    fn membership() {
        let (sql, params) = lower("size not in [1, 2]");
        assert_eq!(sql, "(NOT ifnull((core.size IN (?1, ?2)), 0))");
        assert_eq!(params, vec![Value::Long64(1), Value::Long64(2)]);
    }

    #[test]
    fn pattern_match_with_escape() {
        let (sql, _) = lower(r#"product_name ~= "alpha%""#);
        assert_eq!(sql, "ifnull((core.product_name LIKE ?1 ESCAPE '\\'), 0)");
    }

    #[test]
    fn has_tag_exists() {
        let (sql, params) = lower(r#"has_tag("raw")"#);
        assert_eq!(
            sql,
            "EXISTS (SELECT 1 FROM tag tg_1 WHERE tg_1.uuid = core.uuid AND tg_1.tag = ?1)"
        );
        assert_eq!(params, vec![Value::Text("raw".into())]);
    }

    #[test]
    fn link_subquery_uses_aliases() {
        let (sql, _) = lower(r#"is_derived_from(product_type == "RAW")"#);
        assert!(sql.contains("FROM link ln_1"), "{sql}");
        assert!(sql.contains("core AS core_q2"), "{sql}");
        assert!(sql.contains("core_q2.product_type"), "{sql}");
    }

    #[test]
    fn search_plan_includes_namespace_marker() {
        let schema = schema();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, "", &schema);
        let options = SearchOptions {
            namespaces: vec!["mynamespace".to_string()],
            order_by: vec!["-size".to_string()],
            limit: Some(10),
            property_names: None,
        };
        let plan = builder.search(None, &options).unwrap();
        assert!(plan.sql.contains("LEFT JOIN mynamespace"), "{}", plan.sql);
        assert!(plan.sql.contains("ORDER BY core.size DESC"), "{}", plan.sql);
        assert!(plan.sql.ends_with("LIMIT 10"), "{}", plan.sql);
        let marker = plan
            .columns
            .iter()
            .find(|c| c.marker)
            .expect("marker column");
        assert_eq!(marker.namespace, "mynamespace");
    }

    #[test]
    fn summary_plan() {
        let schema = schema();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, "", &schema);
        let options = SummaryOptions {
            aggregates: vec![Aggregate {
                field: "size".to_string(),
                func: AggregateFunc::Sum,
            }],
            group_by: vec![GroupBy {
                field: "product_type".to_string(),
                bin: None,
            }],
            group_by_tag: false,
            having: Some("size.sum > 100".to_string()),
            order_by: vec!["-count".to_string()],
        };
        let plan = builder.summary(None, &options).unwrap();
        assert!(plan.sql.contains("GROUP BY core.product_type"), "{}", plan.sql);
        assert!(plan.sql.contains("HAVING"), "{}", plan.sql);
        assert!(plan.sql.contains("ORDER BY \"count\" DESC"), "{}", plan.sql);
        assert_eq!(
            plan.columns
                .iter()
                .map(|(name, _)| name.as_str())
                .collect::<Vec<_>>(),
            vec!["product_type", "count", "size.sum"]
        );
    }

    #[test]
    fn timestamp_group_requires_bin() {
        let schema = schema();
        let dialect = SqliteDialect;
        let builder = SqlBuilder::new(&dialect, "", &schema);
        let options = SummaryOptions {
            aggregates: vec![],
            group_by: vec![GroupBy {
                field: "creation_date".to_string(),
                bin: None,
            }],
            group_by_tag: false,
            having: None,
            order_by: vec![],
        };
        assert!(builder.summary(None, &options).is_err());
    }
}

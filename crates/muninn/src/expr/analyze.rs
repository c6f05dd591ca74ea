//! Semantic analysis: resolve names against the schema, substitute
//! parameters, type-check, and produce the typed AST that backends lower.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDateTime;

use crate::error::{Error, Result};
use crate::schema::{SchemaSet, CORE};
use crate::value::{DataType, Value};

use super::parser::{Ast, BinaryOp, UnaryOp};

/// The typed expression tree. Every node has a known [`DataType`].
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Property {
        namespace: String,
        field: String,
        data_type: DataType,
    },
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    In {
        lhs: Box<Expr>,
        negated: bool,
        items: Vec<Value>,
    },
    IsDefinedField {
        namespace: String,
        field: String,
    },
    IsDefinedNamespace(String),
    /// `covers(a_start, a_stop, b_start, b_stop)` on closed intervals.
    CoversTime(Box<[Expr; 4]>),
    IntersectsTime(Box<[Expr; 4]>),
    CoversGeometry(Box<Expr>, Box<Expr>),
    IntersectsGeometry(Box<Expr>, Box<Expr>),
    Distance(Box<Expr>, Box<Expr>),
    IsSourceOf(LinkArg),
    IsDerivedFrom(LinkArg),
    HasTag(Box<Expr>),
}

/// Argument of `is_source_of` / `is_derived_from`: a UUID-valued
/// expression or a boolean sub-query whose result set is a set of UUIDs.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkArg {
    Uuid(Box<Expr>),
    SubQuery(Box<Expr>),
}

impl Expr {
    pub fn data_type(&self) -> DataType {
        match self {
            Expr::Literal(value) => value.data_type(),
            Expr::Property { data_type, .. } => *data_type,
            Expr::Not(_)
            | Expr::In { .. }
            | Expr::IsDefinedField { .. }
            | Expr::IsDefinedNamespace(_)
            | Expr::CoversTime(_)
            | Expr::IntersectsTime(_)
            | Expr::CoversGeometry(..)
            | Expr::IntersectsGeometry(..)
            | Expr::IsSourceOf(_)
            | Expr::IsDerivedFrom(_)
            | Expr::HasTag(_) => DataType::Boolean,
            Expr::Neg(operand) => operand.data_type(),
            Expr::Distance(..) => DataType::Real,
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::Or | BinaryOp::And => DataType::Boolean,
                op if op.is_comparison() => DataType::Boolean,
                BinaryOp::Sub
                    if lhs.data_type() == DataType::Timestamp
                        && rhs.data_type() == DataType::Timestamp =>
                {
                    DataType::Real
                }
                _ => lhs
                    .data_type()
                    .widen(rhs.data_type())
                    .unwrap_or(DataType::Real),
            },
        }
    }

    /// Extension namespaces this expression touches; the backend joins
    /// their tables into the query.
    pub fn referenced_namespaces(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Property { namespace, .. } | Expr::IsDefinedField { namespace, .. } => {
                if namespace != CORE {
                    out.insert(namespace.clone());
                }
            }
            Expr::IsDefinedNamespace(namespace) => {
                out.insert(namespace.clone());
            }
            Expr::Literal(_) => {}
            Expr::Not(e) | Expr::Neg(e) | Expr::HasTag(e) => e.referenced_namespaces(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.referenced_namespaces(out);
                rhs.referenced_namespaces(out);
            }
            Expr::In { lhs, .. } => lhs.referenced_namespaces(out),
            Expr::CoversTime(args) | Expr::IntersectsTime(args) => {
                for arg in args.iter() {
                    arg.referenced_namespaces(out);
                }
            }
            Expr::CoversGeometry(a, b)
            | Expr::IntersectsGeometry(a, b)
            | Expr::Distance(a, b) => {
                a.referenced_namespaces(out);
                b.referenced_namespaces(out);
            }
            // Sub-query namespaces are joined inside the sub-select.
            Expr::IsSourceOf(arg) | Expr::IsDerivedFrom(arg) => {
                if let LinkArg::Uuid(e) = arg {
                    e.referenced_namespaces(out);
                }
            }
        }
    }
}

/// The free `@parameter` names of an untyped expression.
pub fn free_parameters(ast: &Ast) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_parameters(ast, &mut out);
    out
}

fn collect_parameters(ast: &Ast, out: &mut BTreeSet<String>) {
    match ast {
        Ast::Parameter(name) => {
            out.insert(name.clone());
        }
        Ast::Literal(_) | Ast::Name(_) => {}
        Ast::Unary(_, operand) => collect_parameters(operand, out),
        Ast::Binary(_, lhs, rhs) => {
            collect_parameters(lhs, out);
            collect_parameters(rhs, out);
        }
        Ast::In { lhs, .. } => collect_parameters(lhs, out),
        Ast::Call { args, .. } => {
            for arg in args {
                collect_parameters(arg, out);
            }
        }
    }
}

/// Analyze `ast` as a boolean condition against `schema`, substituting
/// `parameters`.
pub fn analyze(
    ast: &Ast,
    schema: &SchemaSet,
    parameters: &BTreeMap<String, Value>,
) -> Result<Expr> {
    let free: Vec<String> = free_parameters(ast)
        .into_iter()
        .filter(|name| !parameters.contains_key(name))
        .collect();
    if !free.is_empty() {
        return Err(Error::Expression(format!(
            "unbound parameters: {}",
            free.join(", ")
        )));
    }
    let analyzer = Analyzer {
        schema,
        parameters,
        now: chrono::Utc::now().naive_utc(),
    };
    analyzer.condition(ast)
}

struct Analyzer<'a> {
    schema: &'a SchemaSet,
    parameters: &'a BTreeMap<String, Value>,
    /// `now()` resolves to a single instant per analysis.
    now: NaiveDateTime,
}

impl<'a> Analyzer<'a> {
    /// Analyze as a boolean condition; UUID-typed expressions coerce to
    /// "is defined".
    fn condition(&self, ast: &Ast) -> Result<Expr> {
        let expr = self.expr(ast)?;
        self.coerce_condition(expr)
    }

    fn coerce_condition(&self, expr: Expr) -> Result<Expr> {
        match expr.data_type() {
            DataType::Boolean => Ok(expr),
            DataType::Uuid => Ok(match expr {
                Expr::Property {
                    namespace, field, ..
                } => Expr::IsDefinedField { namespace, field },
                // A UUID value is by definition defined.
                _ => Expr::Literal(Value::Boolean(true)),
            }),
            other => Err(Error::Expression(format!(
                "expected a boolean condition, got {}",
                other
            ))),
        }
    }

    fn expr(&self, ast: &Ast) -> Result<Expr> {
        match ast {
            Ast::Literal(value) => Ok(Expr::Literal(value.clone())),
            Ast::Parameter(name) => {
                let value = self.parameters.get(name).ok_or_else(|| {
                    Error::Expression(format!("unbound parameter @{}", name))
                })?;
                Ok(Expr::Literal(value.clone()))
            }
            Ast::Name(name) => self.property(name),
            Ast::Unary(op, operand) => self.unary(*op, operand),
            Ast::Binary(op, lhs, rhs) => self.binary(*op, lhs, rhs),
            Ast::In {
                lhs,
                negated,
                items,
            } => self.membership(lhs, *negated, items),
            Ast::Call { name, args } => self.call(name, args),
        }
    }

    fn property(&self, name: &str) -> Result<Expr> {
        let (namespace, field) = match name.split_once('.') {
            Some((namespace, field)) => {
                if field.contains('.') {
                    return Err(Error::Expression(format!(
                        "invalid property reference {:?}",
                        name
                    )));
                }
                (namespace, field)
            }
            None => {
                if self.schema.namespace(name).is_some()
                    && name != CORE
                    && self.schema.resolve(CORE, name).is_err()
                {
                    return Err(Error::Expression(format!(
                        "namespace {:?} can only be used as an is_defined argument",
                        name
                    )));
                }
                (CORE, name)
            }
        };
        let definition = self
            .schema
            .resolve(namespace, field)
            .map_err(|e| Error::Expression(e.to_string()))?;
        Ok(Expr::Property {
            namespace: namespace.to_string(),
            field: field.to_string(),
            data_type: definition.data_type,
        })
    }

    fn unary(&self, op: UnaryOp, operand: &Ast) -> Result<Expr> {
        match op {
            UnaryOp::Not => {
                let operand = self.condition(operand)?;
                Ok(Expr::Not(Box::new(operand)))
            }
            UnaryOp::Plus | UnaryOp::Minus => {
                let operand = self.expr(operand)?;
                if !operand.data_type().is_numeric() {
                    return Err(Error::Expression(format!(
                        "unary sign requires a numeric operand, got {}",
                        operand.data_type()
                    )));
                }
                if op == UnaryOp::Plus {
                    Ok(operand)
                } else {
                    Ok(Expr::Neg(Box::new(operand)))
                }
            }
        }
    }

    fn binary(&self, op: BinaryOp, lhs: &Ast, rhs: &Ast) -> Result<Expr> {
        if matches!(op, BinaryOp::Or | BinaryOp::And) {
            let lhs = self.condition(lhs)?;
            let rhs = self.condition(rhs)?;
            return Ok(Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            });
        }

        let lhs = self.expr(lhs)?;
        let rhs = self.expr(rhs)?;
        let (lt, rt) = (lhs.data_type(), rhs.data_type());
        let compatible = lt == rt || lt.widen(rt).is_some();

        match op {
            BinaryOp::Eq | BinaryOp::Ne => {
                if lt == DataType::Geometry || rt == DataType::Geometry {
                    return Err(Error::Expression(
                        "geometry values do not support == / != (use covers or intersects)"
                            .into(),
                    ));
                }
                if !compatible {
                    return Err(type_mismatch(op, lt, rt));
                }
            }
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
                if !lt.has_order() || !rt.has_order() {
                    return Err(Error::Expression(format!(
                        "{} values have no comparison order",
                        if lt.has_order() { rt } else { lt }
                    )));
                }
                if matches!(lt, DataType::Boolean | DataType::Uuid)
                    || matches!(rt, DataType::Boolean | DataType::Uuid)
                {
                    return Err(Error::Expression(format!(
                        "order comparison is not defined for {} values",
                        if matches!(lt, DataType::Boolean | DataType::Uuid) {
                            lt
                        } else {
                            rt
                        }
                    )));
                }
                if !compatible {
                    return Err(type_mismatch(op, lt, rt));
                }
            }
            BinaryOp::Matches => {
                if lt != DataType::Text || rt != DataType::Text {
                    return Err(Error::Expression(format!(
                        "~= requires text operands, got {} and {}",
                        lt, rt
                    )));
                }
            }
            BinaryOp::Add | BinaryOp::Mul | BinaryOp::Div => {
                if !lt.is_numeric() || !rt.is_numeric() {
                    return Err(type_mismatch(op, lt, rt));
                }
            }
            BinaryOp::Sub => {
                let timestamps = lt == DataType::Timestamp && rt == DataType::Timestamp;
                if !timestamps && (!lt.is_numeric() || !rt.is_numeric()) {
                    return Err(type_mismatch(op, lt, rt));
                }
            }
            BinaryOp::Or | BinaryOp::And => unreachable!(),
        }
        Ok(Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        })
    }

    fn membership(&self, lhs: &Ast, negated: bool, items: &[Value]) -> Result<Expr> {
        let lhs = self.expr(lhs)?;
        let lt = lhs.data_type();
        if !matches!(
            lt,
            DataType::Text | DataType::Integer32 | DataType::Long64 | DataType::Real
        ) {
            return Err(Error::Expression(format!(
                "in-lists are not supported for {} values",
                lt
            )));
        }
        for item in items {
            let it = item.data_type();
            if it != lt && it.widen(lt).is_none() {
                return Err(Error::Expression(format!(
                    "in-list item of type {} does not match {} operand",
                    it, lt
                )));
            }
        }
        Ok(Expr::In {
            lhs: Box::new(lhs),
            negated,
            items: items.to_vec(),
        })
    }

    fn call(&self, name: &str, args: &[Ast]) -> Result<Expr> {
        match (name, args.len()) {
            ("now", 0) => Ok(Expr::Literal(Value::Timestamp(self.now))),
            ("is_defined", 1) => self.is_defined(&args[0]),
            ("covers", 4) => Ok(Expr::CoversTime(self.interval_args(name, args)?)),
            ("intersects", 4) => Ok(Expr::IntersectsTime(self.interval_args(name, args)?)),
            ("covers", 2) => {
                let (a, b) = self.geometry_args(name, args)?;
                Ok(Expr::CoversGeometry(a, b))
            }
            ("intersects", 2) => {
                let (a, b) = self.geometry_args(name, args)?;
                Ok(Expr::IntersectsGeometry(a, b))
            }
            ("distance", 2) => {
                let (a, b) = self.geometry_args(name, args)?;
                Ok(Expr::Distance(a, b))
            }
            ("is_source_of", 1) => Ok(Expr::IsSourceOf(self.link_arg(&args[0])?)),
            ("is_derived_from", 1) => Ok(Expr::IsDerivedFrom(self.link_arg(&args[0])?)),
            ("has_tag", 1) => {
                let arg = self.expr(&args[0])?;
                if arg.data_type() != DataType::Text {
                    return Err(Error::Expression(format!(
                        "has_tag requires a text argument, got {}",
                        arg.data_type()
                    )));
                }
                Ok(Expr::HasTag(Box::new(arg)))
            }
            _ => Err(Error::Expression(format!(
                "unknown function {}/{}",
                name,
                args.len()
            ))),
        }
    }

    fn is_defined(&self, arg: &Ast) -> Result<Expr> {
        let name = match arg {
            Ast::Name(name) => name,
            _ => {
                return Err(Error::Expression(
                    "is_defined requires a property or namespace reference".into(),
                ))
            }
        };
        if let Some((namespace, field)) = name.split_once('.') {
            self.schema
                .resolve(namespace, field)
                .map_err(|e| Error::Expression(e.to_string()))?;
            return Ok(Expr::IsDefinedField {
                namespace: namespace.to_string(),
                field: field.to_string(),
            });
        }
        // Bare name: an extension namespace, else a core field.
        if name != CORE && self.schema.namespace(name).is_some() {
            return Ok(Expr::IsDefinedNamespace(name.to_string()));
        }
        self.schema
            .resolve(CORE, name)
            .map_err(|e| Error::Expression(e.to_string()))?;
        Ok(Expr::IsDefinedField {
            namespace: CORE.to_string(),
            field: name.to_string(),
        })
    }

    fn interval_args(&self, name: &str, args: &[Ast]) -> Result<Box<[Expr; 4]>> {
        let mut out = Vec::with_capacity(4);
        for arg in args {
            let expr = self.expr(arg)?;
            if expr.data_type() != DataType::Timestamp {
                return Err(Error::Expression(format!(
                    "{} on intervals requires timestamp arguments, got {}",
                    name,
                    expr.data_type()
                )));
            }
            out.push(expr);
        }
        let array: [Expr; 4] = out
            .try_into()
            .map_err(|_| Error::Expression(format!("{} requires 4 arguments", name)))?;
        Ok(Box::new(array))
    }

    fn geometry_args(&self, name: &str, args: &[Ast]) -> Result<(Box<Expr>, Box<Expr>)> {
        let a = self.expr(&args[0])?;
        let b = self.expr(&args[1])?;
        for expr in [&a, &b] {
            if expr.data_type() != DataType::Geometry {
                return Err(Error::Expression(format!(
                    "{} requires geometry arguments, got {}",
                    name,
                    expr.data_type()
                )));
            }
        }
        Ok((Box::new(a), Box::new(b)))
    }

    fn link_arg(&self, arg: &Ast) -> Result<LinkArg> {
        let expr = self.expr(arg)?;
        match expr.data_type() {
            DataType::Uuid => Ok(LinkArg::Uuid(Box::new(expr))),
            DataType::Boolean => Ok(LinkArg::SubQuery(Box::new(expr))),
            other => Err(Error::Expression(format!(
                "expected a UUID or sub-query argument, got {}",
                other
            ))),
        }
    }
}

fn type_mismatch(op: BinaryOp, lt: DataType, rt: DataType) -> Error {
    Error::Expression(format!(
        "operator {} is not defined for {} and {}",
        op.symbol(),
        lt,
        rt
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::expr::parser::parse;
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

    fn check(text: &str) -> Result<Expr> {
        analyze(&parse(text).unwrap(), &schema(), &BTreeMap::new())
    }

    #[test]
    fn resolves_core_and_extension_properties() {
        let expr = check(r#"product_name == "alpha.dat""#).unwrap();
        assert!(matches!(
            &expr,
            Expr::Binary { op: BinaryOp::Eq, lhs, .. }
                if matches!(&**lhs, Expr::Property { namespace, field, .. }
                    if namespace == "core" && field == "product_name")
        ));

        check("mynamespace.myfield > 3").unwrap();
        assert!(check("mynamespace.other == 1").is_err());
        assert!(check("nowhere.field == 1").is_err());
    }

    #[test]
    fn type_errors() {
        assert!(check(r#"size == "text""#).is_err());
        assert!(check("active < true").is_err());
        assert!(check("uuid <= uuid").is_err());
        assert!(check(r#"size ~= "5%""#).is_err());
        assert!(check("footprint == footprint").is_err());
        assert!(check(r#"size + "x" > 0"#).is_err());
    }

    #[test]
    fn numeric_widening_allowed() {
        check("mynamespace.myfield == 3").unwrap();
        check("size + 1.5 > 2").unwrap();
    }

    #[test]
    fn timestamp_subtraction_is_real() {
        let expr = check("validity_stop - validity_start > 299").unwrap();
        if let Expr::Binary { lhs, .. } = &expr {
            assert_eq!(lhs.data_type(), DataType::Real);
        } else {
            panic!("expected binary expression");
        }
        assert!(check("validity_stop - size > 0").is_err());
    }

    #[test]
    fn uuid_coerces_to_defined() {
        let expr = check("remote_url != \"x\" and uuid").unwrap();
        if let Expr::Binary { rhs, .. } = &expr {
            assert_eq!(
                **rhs,
                Expr::IsDefinedField {
                    namespace: "core".into(),
                    field: "uuid".into()
                }
            );
        } else {
            panic!("expected binary expression");
        }
    }

    #[test]
    fn is_defined_forms() {
        assert_eq!(
            check("is_defined(mynamespace)").unwrap(),
            Expr::IsDefinedNamespace("mynamespace".into())
        );
        assert_eq!(
            check("is_defined(remote_url)").unwrap(),
            Expr::IsDefinedField {
                namespace: "core".into(),
                field: "remote_url".into()
            }
        );
        assert_eq!(
            check("is_defined(mynamespace.myfield)").unwrap(),
            Expr::IsDefinedField {
                namespace: "mynamespace".into(),
                field: "myfield".into()
            }
        );
        assert!(check("is_defined(now())").is_err());
    }

    #[test]
    fn bare_namespace_outside_is_defined_rejected() {
        assert!(check("mynamespace").is_err());
    }

    #[test]
    fn functions() {
        check("covers(validity_start, validity_stop, 2024-01-01, 2024-02-01)").unwrap();
        check("intersects(validity_start, validity_stop, 2024-01-01, 2024-02-01)").unwrap();
        check("covers(footprint, POINT (4 52))").unwrap();
        check("distance(footprint, POINT (4 52)) < 1.0").unwrap();
        check(r#"has_tag("raw")"#).unwrap();
        check("creation_date < now()").unwrap();
        assert!(check("covers(validity_start, validity_stop, footprint, footprint)").is_err());
        assert!(check("has_tag(5)").is_err());
        assert!(check("unknown_func(1)").is_err());
    }

    #[test]
    fn link_functions() {
        let expr = check("is_source_of(32a61528-a712-427a-b28f-8ebd28c9778e)").unwrap();
        assert!(matches!(expr, Expr::IsSourceOf(LinkArg::Uuid(_))));

        let expr = check(r#"is_derived_from(product_type == "RAW")"#).unwrap();
        assert!(matches!(expr, Expr::IsDerivedFrom(LinkArg::SubQuery(_))));
    }

    #[test]
    fn parameters_substituted() {
        let params = BTreeMap::from([("name".to_string(), Value::Text("alpha".into()))]);
        let expr = analyze(&parse("product_name == @name").unwrap(), &schema(), &params).unwrap();
        assert!(matches!(
            &expr,
            Expr::Binary { rhs, .. }
                if matches!(&**rhs, Expr::Literal(Value::Text(t)) if t == "alpha")
        ));

        let err =
            analyze(&parse("product_name == @name").unwrap(), &schema(), &BTreeMap::new())
                .unwrap_err();
        assert!(err.to_string().contains("unbound parameters: name"));
    }

    #[test]
    fn free_parameter_report() {
        let ast = parse("a == @x and b == @y or is_defined(@x)").unwrap();
        let free = free_parameters(&ast);
        assert_eq!(
            free.into_iter().collect::<Vec<_>>(),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn referenced_namespaces() {
        let expr = check("mynamespace.myfield == 1 and is_defined(mynamespace)").unwrap();
        let mut out = BTreeSet::new();
        expr.referenced_namespaces(&mut out);
        assert_eq!(out.into_iter().collect::<Vec<_>>(), vec!["mynamespace"]);
    }
}

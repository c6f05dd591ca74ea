//! The catalogue expression language: lexer, parser, and semantic
//! analysis. The typed [`Expr`] tree stays target-agnostic until a
//! database backend lowers it to its native query form.

mod analyze;
mod lexer;
mod parser;

use std::collections::BTreeMap;

use crate::error::Result;
use crate::schema::SchemaSet;
use crate::value::Value;

pub use analyze::{analyze, free_parameters, Expr, LinkArg};
pub use lexer::{tokenize, Spanned, Token};
pub use parser::{parse, Ast, BinaryOp, UnaryOp};

/// Caller-supplied `@name` parameter bindings.
pub type ParameterMap = BTreeMap<String, Value>;

/// Parse and analyze in one step.
pub fn compile(text: &str, schema: &SchemaSet, parameters: &ParameterMap) -> Result<Expr> {
    let ast = parse(text)?;
    analyze(&ast, schema, parameters)
}

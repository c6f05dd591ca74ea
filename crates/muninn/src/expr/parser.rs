//! Recursive-descent parser for the expression language.
//!
//! Precedence, low to high: `or`, `and`, `not`, comparison, additive,
//! multiplicative, unary sign, call/primary.

use crate::error::{Error, Result};
use crate::value::Value;

use super::lexer::{tokenize, Spanned, Token};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Plus,
    Minus,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Or => "or",
            BinaryOp::And => "and",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::Matches => "~=",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Ne
                | BinaryOp::Lt
                | BinaryOp::Le
                | BinaryOp::Gt
                | BinaryOp::Ge
                | BinaryOp::Matches
        )
    }
}

/// The untyped syntax tree produced by [`parse`].
#[derive(Clone, Debug, PartialEq)]
pub enum Ast {
    Literal(Value),
    Parameter(String),
    /// Possibly dotted name: property reference or, as an `is_defined`
    /// argument, a namespace reference.
    Name(String),
    Unary(UnaryOp, Box<Ast>),
    Binary(BinaryOp, Box<Ast>, Box<Ast>),
    In {
        lhs: Box<Ast>,
        negated: bool,
        items: Vec<Value>,
    },
    Call {
        name: String,
        args: Vec<Ast>,
    },
}

pub fn parse(text: &str) -> Result<Ast> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.expression()?;
    if let Some(spanned) = parser.peek_spanned() {
        return Err(Error::Expression(format!(
            "unexpected {:?} at offset {}",
            spanned.token, spanned.offset
        )));
    }
    Ok(ast)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek_spanned(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn peek(&self) -> Option<&Token> {
        self.peek_spanned().map(|s| &s.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&Token> {
        self.tokens.get(self.pos + ahead).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<()> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected {:?}", token)))
        }
    }

    fn unexpected(&self, context: &str) -> Error {
        match self.peek_spanned() {
            Some(spanned) => Error::Expression(format!(
                "{}, found {:?} at offset {}",
                context, spanned.token, spanned.offset
            )),
            None => Error::Expression(format!("{}, found end of input", context)),
        }
    }

    fn expression(&mut self) -> Result<Ast> {
        self.or_expression()
    }

    fn or_expression(&mut self) -> Result<Ast> {
        let mut lhs = self.and_expression()?;
        while self.eat(&Token::Or) {
            let rhs = self.and_expression()?;
            lhs = Ast::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and_expression(&mut self) -> Result<Ast> {
        let mut lhs = self.not_expression()?;
        while self.eat(&Token::And) {
            let rhs = self.not_expression()?;
            lhs = Ast::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not_expression(&mut self) -> Result<Ast> {
        // `not` directly before `in` belongs to the comparison below.
        if self.peek() == Some(&Token::Not) && self.peek_at(1) != Some(&Token::In) {
            self.pos += 1;
            let operand = self.not_expression()?;
            return Ok(Ast::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Ast> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(BinaryOp::Eq),
            Some(Token::Ne) => Some(BinaryOp::Ne),
            Some(Token::Lt) => Some(BinaryOp::Lt),
            Some(Token::Le) => Some(BinaryOp::Le),
            Some(Token::Gt) => Some(BinaryOp::Gt),
            Some(Token::Ge) => Some(BinaryOp::Ge),
            Some(Token::Matches) => Some(BinaryOp::Matches),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let rhs = self.additive()?;
            return Ok(Ast::Binary(op, Box::new(lhs), Box::new(rhs)));
        }
        let negated = self.peek() == Some(&Token::Not) && self.peek_at(1) == Some(&Token::In);
        if negated {
            self.pos += 1;
        }
        if self.eat(&Token::In) {
            let items = self.literal_list()?;
            return Ok(Ast::In {
                lhs: Box::new(lhs),
                negated,
                items,
            });
        }
        Ok(lhs)
    }

    fn literal_list(&mut self) -> Result<Vec<Value>> {
        self.expect(Token::LBracket)?;
        let mut items = Vec::new();
        if self.eat(&Token::RBracket) {
            return Ok(items);
        }
        loop {
            items.push(self.signed_literal()?);
            if self.eat(&Token::RBracket) {
                return Ok(items);
            }
            self.expect(Token::Comma)?;
        }
    }

    fn signed_literal(&mut self) -> Result<Value> {
        let negative = if self.eat(&Token::Minus) {
            true
        } else {
            self.eat(&Token::Plus);
            false
        };
        match self.advance() {
            Some(Token::Literal(value)) => {
                if !negative {
                    return Ok(value);
                }
                match value {
                    Value::Long64(v) => Ok(Value::Long64(-v)),
                    Value::Real(v) => Ok(Value::Real(-v)),
                    other => Err(Error::Expression(format!(
                        "cannot negate {} literal in list",
                        other.data_type()
                    ))),
                }
            }
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.unexpected("expected literal in list"))
            }
        }
    }

    fn additive(&mut self) -> Result<Ast> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Ast> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Ast::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Ast> {
        if self.eat(&Token::Plus) {
            let operand = self.unary()?;
            return Ok(Ast::Unary(UnaryOp::Plus, Box::new(operand)));
        }
        if self.eat(&Token::Minus) {
            let operand = self.unary()?;
            return Ok(Ast::Unary(UnaryOp::Minus, Box::new(operand)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Ast> {
        match self.peek().cloned() {
            Some(Token::Literal(value)) => {
                self.pos += 1;
                Ok(Ast::Literal(value))
            }
            Some(Token::Parameter(name)) => {
                self.pos += 1;
                Ok(Ast::Parameter(name))
            }
            Some(Token::Name(name)) => {
                self.pos += 1;
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expression()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Ast::Call { name, args })
                } else {
                    Ok(Ast::Name(name))
                }
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expression()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            _ => Err(self.unexpected("expected expression")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn precedence() {
        // `a or b and not c == 1` parses as `a or (b and (not (c == 1)))`.
        let ast = parse("a or b and not c == 1").unwrap();
        assert_eq!(
            ast,
            Ast::Binary(
                BinaryOp::Or,
                Box::new(Ast::Name("a".into())),
                Box::new(Ast::Binary(
                    BinaryOp::And,
                    Box::new(Ast::Name("b".into())),
                    Box::new(Ast::Unary(
                        UnaryOp::Not,
                        Box::new(Ast::Binary(
                            BinaryOp::Eq,
                            Box::new(Ast::Name("c".into())),
                            Box::new(Ast::Literal(Value::Long64(1))),
                        )),
                    )),
                )),
            )
        );
    }

    #[test]
    fn arithmetic_precedence() {
        let ast = parse("a + b * 2 > 10").unwrap();
        assert_eq!(
            ast,
            Ast::Binary(
                BinaryOp::Gt,
                Box::new(Ast::Binary(
                    BinaryOp::Add,
                    Box::new(Ast::Name("a".into())),
                    Box::new(Ast::Binary(
                        BinaryOp::Mul,
                        Box::new(Ast::Name("b".into())),
                        Box::new(Ast::Literal(Value::Long64(2))),
                    )),
                )),
                Box::new(Ast::Literal(Value::Long64(10))),
            )
        );
    }

    #[test]
    fn in_lists() {
        let ast = parse("size in [1, 2, -3]").unwrap();
        assert_eq!(
            ast,
            Ast::In {
                lhs: Box::new(Ast::Name("size".into())),
                negated: false,
                items: vec![
                    Value::Long64(1),
                    Value::Long64(2),
                    Value::Long64(-3),
                ],
            }
        );

        let ast = parse(r#"product_type not in ["a", "b"]"#).unwrap();
        assert_eq!(
            ast,
            Ast::In {
                lhs: Box::new(Ast::Name("product_type".into())),
                negated: true,
                items: vec![Value::Text("a".into()), Value::Text("b".into())],
            }
        );
    }

    #[test]
    fn not_in_vs_not() {
        // `not a in [1]` negates the membership test, it is not `(not a) in [1]`.
        let ast = parse("not a in [1]").unwrap();
        assert_eq!(
            ast,
            Ast::Unary(
                UnaryOp::Not,
                Box::new(Ast::In {
                    lhs: Box::new(Ast::Name("a".into())),
                    negated: false,
                    items: vec![Value::Long64(1)],
                })
            )
        );
    }

    #[test]
    fn calls() {
        let ast = parse("is_defined(mynamespace)").unwrap();
        assert_eq!(
            ast,
            Ast::Call {
                name: "is_defined".into(),
                args: vec![Ast::Name("mynamespace".into())],
            }
        );

        let ast = parse("now()").unwrap();
        assert_eq!(
            ast,
            Ast::Call {
                name: "now".into(),
                args: vec![],
            }
        );
    }

    #[test]
    fn parenthesized() {
        let ast = parse("(a or b) and c").unwrap();
        assert_eq!(
            ast,
            Ast::Binary(
                BinaryOp::And,
                Box::new(Ast::Binary(
                    BinaryOp::Or,
                    Box::new(Ast::Name("a".into())),
                    Box::new(Ast::Name("b".into())),
                )),
                Box::new(Ast::Name("c".into())),
            )
        );
    }

    #[test]
    fn unary_sign() {
        let ast = parse("-size < -10").unwrap();
        assert_eq!(
            ast,
            Ast::Binary(
                BinaryOp::Lt,
                Box::new(Ast::Unary(UnaryOp::Minus, Box::new(Ast::Name("size".into())))),
                Box::new(Ast::Unary(
                    UnaryOp::Minus,
                    Box::new(Ast::Literal(Value::Long64(10))),
                )),
            )
        );
    }

    #[test]
    fn errors() {
        assert!(parse("a ==").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("size in [a]").is_err());
        assert!(parse("").is_err());
    }
}

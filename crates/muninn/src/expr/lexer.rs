//! Tokenizer for the catalogue expression language.

use crate::error::{Error, Result};
use crate::geometry::{is_wkt_prefix, Geometry};
use crate::value::{parse_timestamp, Value};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Not,
    And,
    Or,
    In,
    /// Identifier, possibly dotted (`ns.field`).
    Name(String),
    /// `@name` parameter reference.
    Parameter(String),
    /// Boolean, integer, real, text, timestamp, UUID or geometry literal.
    Literal(Value),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(text: &str) -> Result<Vec<Spanned>> {
    let mut lexer = Lexer { text, pos: 0 };
    let mut tokens = Vec::new();
    while let Some(spanned) = lexer.next_token()? {
        tokens.push(spanned);
    }
    Ok(tokens)
}

struct Lexer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::Expression(format!("{} at offset {}", message.into(), self.pos))
    }

    fn next_token(&mut self) -> Result<Option<Spanned>> {
        let trimmed = self.rest().trim_start();
        self.pos = self.text.len() - trimmed.len();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let offset = self.pos;
        let token = self.scan()?;
        Ok(Some(Spanned { token, offset }))
    }

    fn scan(&mut self) -> Result<Token> {
        let rest = self.rest();
        let first = rest.chars().next().unwrap_or_default();

        // Multi-character operators before their single-character prefixes.
        for (symbol, token) in [
            ("==", Token::Eq),
            ("!=", Token::Ne),
            ("<=", Token::Le),
            (">=", Token::Ge),
            ("~=", Token::Matches),
        ] {
            if rest.starts_with(symbol) {
                self.pos += symbol.len();
                return Ok(token);
            }
        }
        match first {
            '<' | '>' | '+' | '-' | '*' | '/' | '(' | ')' | '[' | ']' | ',' => {
                self.pos += 1;
                return Ok(match first {
                    '<' => Token::Lt,
                    '>' => Token::Gt,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    _ => Token::Comma,
                });
            }
            '"' => return self.text_literal(),
            '@' => {
                self.pos += 1;
                let name = self.identifier()?;
                return Ok(Token::Parameter(name));
            }
            _ => {}
        }

        if let Some(token) = self.uuid_literal() {
            return Ok(token);
        }
        if first.is_ascii_digit() {
            return self.number_or_timestamp();
        }
        if first.is_ascii_uppercase() {
            return self.geometry_literal();
        }
        if first.is_ascii_lowercase() {
            return self.word();
        }
        Err(self.error(format!("unexpected character {:?}", first)))
    }

    fn identifier(&mut self) -> Result<String> {
        let rest = self.rest();
        match rest.chars().next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return Err(self.error("expected identifier")),
        }
        let len = rest
            .chars()
            .take_while(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_')
            .count();
        let name = &rest[..len];
        self.pos += len;
        Ok(name.to_string())
    }

    /// Keyword, boolean literal, or (dotted) name.
    fn word(&mut self) -> Result<Token> {
        let mut name = self.identifier()?;
        match name.as_str() {
            "not" => return Ok(Token::Not),
            "and" => return Ok(Token::And),
            "or" => return Ok(Token::Or),
            "in" => return Ok(Token::In),
            "true" => return Ok(Token::Literal(Value::Boolean(true))),
            "false" => return Ok(Token::Literal(Value::Boolean(false))),
            _ => {}
        }
        while self.rest().starts_with('.') {
            self.pos += 1;
            name.push('.');
            name.push_str(&self.identifier()?);
        }
        Ok(Token::Name(name))
    }

    fn text_literal(&mut self) -> Result<Token> {
        let mut out = String::new();
        let mut chars = self.rest().char_indices().skip(1).peekable();
        while let Some((index, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += index + 1;
                    return Ok(Token::Literal(Value::Text(out)));
                }
                '\\' => match chars.next() {
                    Some((_, '"')) => out.push('"'),
                    Some((_, '\\')) => out.push('\\'),
                    Some((_, 'n')) => out.push('\n'),
                    Some((_, 't')) => out.push('\t'),
                    Some((_, 'r')) => out.push('\r'),
                    other => {
                        return Err(self.error(format!(
                            "invalid escape sequence {:?}",
                            other.map(|(_, c)| c)
                        )))
                    }
                },
                c => out.push(c),
            }
        }
        Err(self.error("unterminated text literal"))
    }

    /// A UUID literal: 8-4-4-4-12 lowercase hex groups.
    fn uuid_literal(&mut self) -> Option<Token> {
        const GROUPS: [usize; 5] = [8, 4, 4, 4, 12];
        let rest = self.rest();
        let bytes = rest.as_bytes();
        if bytes.len() < 36 {
            return None;
        }
        let mut index = 0;
        for (i, len) in GROUPS.iter().enumerate() {
            if i > 0 {
                if bytes[index] != b'-' {
                    return None;
                }
                index += 1;
            }
            for _ in 0..*len {
                if !bytes[index].is_ascii_hexdigit() {
                    return None;
                }
                index += 1;
            }
        }
        // A following identifier character makes it something else.
        if bytes
            .get(index)
            .map(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .unwrap_or(false)
        {
            return None;
        }
        let uuid: uuid::Uuid = rest[..36].parse().ok()?;
        self.pos += 36;
        Some(Token::Literal(Value::Uuid(uuid)))
    }

    fn number_or_timestamp(&mut self) -> Result<Token> {
        let rest = self.rest();
        let bytes = rest.as_bytes();

        // Four digits followed by '-' start a timestamp literal.
        if bytes.len() >= 5
            && bytes[..4].iter().all(u8::is_ascii_digit)
            && bytes[4] == b'-'
        {
            let len = rest
                .chars()
                .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | ':' | '.' | 'T'))
                .count();
            let literal = &rest[..len];
            let value = parse_timestamp(literal).map_err(|e| self.error(e.to_string()))?;
            self.pos += len;
            return Ok(Token::Literal(Value::Timestamp(value)));
        }

        // Radix-prefixed integers.
        for (prefix, radix) in [("0x", 16), ("0o", 8), ("0b", 2)] {
            if rest.len() > 2 && rest[..2].eq_ignore_ascii_case(prefix) {
                let digits: String = rest[2..]
                    .chars()
                    .take_while(|c| c.is_digit(radix))
                    .collect();
                if digits.is_empty() {
                    return Err(self.error(format!("invalid {} integer literal", prefix)));
                }
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|e| self.error(e.to_string()))?;
                self.pos += 2 + digits.len();
                return Ok(Token::Literal(Value::Long64(value)));
            }
        }

        let integer_len = rest.chars().take_while(char::is_ascii_digit).count();
        let mut len = integer_len;
        let mut is_real = false;

        if rest[len..].starts_with('.')
            && rest[len + 1..]
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(false)
        {
            is_real = true;
            len += 1 + rest[len + 1..]
                .chars()
                .take_while(char::is_ascii_digit)
                .count();
        }
        let tail = &rest[len..];
        if tail.starts_with('e') || tail.starts_with('E') {
            let mut exp_len = 1;
            let exp = &tail[1..];
            let signed = exp.starts_with('+') || exp.starts_with('-');
            if signed {
                exp_len += 1;
            }
            let digits = tail[exp_len..].chars().take_while(char::is_ascii_digit).count();
            if digits > 0 {
                is_real = true;
                len += exp_len + digits;
            }
        }

        let literal = &rest[..len];
        self.pos += len;
        if is_real {
            let value: f64 = literal.parse().map_err(|_| {
                Error::Expression(format!("invalid real literal {:?}", literal))
            })?;
            Ok(Token::Literal(Value::Real(value)))
        } else {
            let value: i64 = literal.parse().map_err(|_| {
                Error::Expression(format!("invalid integer literal {:?}", literal))
            })?;
            Ok(Token::Literal(Value::Long64(value)))
        }
    }

    fn geometry_literal(&mut self) -> Result<Token> {
        let rest = self.rest();
        if !is_wkt_prefix(rest) {
            return Err(self.error("unexpected uppercase word"));
        }
        let tag_len = rest
            .chars()
            .take_while(|c| c.is_ascii_uppercase())
            .count();
        let after_tag = rest[tag_len..].trim_start();
        let consumed_ws = rest.len() - tag_len - after_tag.len();

        let len = if after_tag.to_ascii_uppercase().starts_with("EMPTY") {
            tag_len + consumed_ws + "EMPTY".len()
        } else if after_tag.starts_with('(') {
            let mut depth = 0usize;
            let mut end = None;
            for (index, c) in after_tag.char_indices() {
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(index + 1);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let end = end.ok_or_else(|| self.error("unbalanced parentheses in geometry"))?;
            tag_len + consumed_ws + end
        } else {
            return Err(self.error("expected geometry coordinates or EMPTY"));
        };

        let literal = &rest[..len];
        let geometry = Geometry::from_wkt(literal).map_err(|e| self.error(e.to_string()))?;
        self.pos += len;
        Ok(Token::Literal(Value::Geometry(geometry)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::value::parse_timestamp;

    fn tokens(text: &str) -> Vec<Token> {
        tokenize(text).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn keywords_and_names() {
        assert_eq!(
            tokens("not active and product_type"),
            vec![
                Token::Not,
                Token::Name("active".into()),
                Token::And,
                Token::Name("product_type".into()),
            ]
        );
        assert_eq!(
            tokens("mynamespace.myfield"),
            vec![Token::Name("mynamespace.myfield".into())]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            tokens("== != < <= > >= ~= + - * / ( ) [ ] ,"),
            vec![
                Token::Eq,
                Token::Ne,
                Token::Lt,
                Token::Le,
                Token::Gt,
                Token::Ge,
                Token::Matches,
                Token::Plus,
                Token::Minus,
                Token::Star,
                Token::Slash,
                Token::LParen,
                Token::RParen,
                Token::LBracket,
                Token::RBracket,
                Token::Comma,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(tokens("42"), vec![Token::Literal(Value::Long64(42))]);
        assert_eq!(tokens("0x1f"), vec![Token::Literal(Value::Long64(31))]);
        assert_eq!(tokens("0o17"), vec![Token::Literal(Value::Long64(15))]);
        assert_eq!(tokens("0b101"), vec![Token::Literal(Value::Long64(5))]);
        assert_eq!(tokens("3.25"), vec![Token::Literal(Value::Real(3.25))]);
        assert_eq!(tokens("1e3"), vec![Token::Literal(Value::Real(1000.0))]);
        assert_eq!(tokens("2.5e-1"), vec![Token::Literal(Value::Real(0.25))]);
    }

    #[test]
    fn text_escapes() {
        assert_eq!(
            tokens(r#""a\"b\\c\nd""#),
            vec![Token::Literal(Value::Text("a\"b\\c\nd".into()))]
        );
        assert!(tokenize("\"open").is_err());
    }

    #[test]
    fn timestamps() {
        assert_eq!(
            tokens("2024-01-01T00:05:00"),
            vec![Token::Literal(Value::Timestamp(
                parse_timestamp("2024-01-01T00:05:00").unwrap()
            ))]
        );
        assert_eq!(
            tokens("9999-99-99"),
            vec![Token::Literal(Value::Timestamp(
                parse_timestamp("9999-99-99").unwrap()
            ))]
        );
    }

    #[test]
    fn uuids() {
        let id = "32a61528-a712-427a-b28f-8ebd28c9778e";
        assert_eq!(
            tokens(id),
            vec![Token::Literal(Value::Uuid(id.parse().unwrap()))]
        );
        // Hex-looking names still lex as arithmetic on identifiers.
        assert_eq!(
            tokens("abc-5"),
            vec![
                Token::Name("abc".into()),
                Token::Minus,
                Token::Literal(Value::Long64(5)),
            ]
        );
    }

    #[test]
    fn geometry() {
        assert_eq!(
            tokens("covers(footprint, POINT (4 52))"),
            vec![
                Token::Name("covers".into()),
                Token::LParen,
                Token::Name("footprint".into()),
                Token::Comma,
                Token::Literal(Value::Geometry(
                    Geometry::from_wkt("POINT (4 52)").unwrap()
                )),
                Token::RParen,
            ]
        );
        assert_eq!(
            tokens("POLYGON EMPTY"),
            vec![Token::Literal(Value::Geometry(
                Geometry::from_wkt("POLYGON EMPTY").unwrap()
            ))]
        );
    }

    #[test]
    fn parameters() {
        assert_eq!(
            tokens("product_name == @name"),
            vec![
                Token::Name("product_name".into()),
                Token::Eq,
                Token::Parameter("name".into()),
            ]
        );
    }

    #[test]
    fn trailing_whitespace_skipped() {
        assert_eq!(tokens("true   "), vec![Token::Literal(Value::Boolean(true))]);
        assert_eq!(tokens("  "), vec![]);
    }

    #[test]
    fn offsets() {
        let spanned = tokenize("a  == b").unwrap();
        assert_eq!(spanned[1].offset, 3);
        assert_eq!(spanned[2].offset, 6);
    }
}

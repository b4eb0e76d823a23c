//! Hand-written grammar for the search query language (spec §4.2):
//!
//! ```text
//! expr   := or
//! or     := xor (OR xor)*
//! xor    := and (XOR and)*
//! and    := unary (AND? unary)*      -- adjacent terms are implicitly ANDed
//! unary  := NOT unary | atom
//! atom   := '(' expr ')' | term
//! term   := ['+' | '-'] (field ':')? (phrase | prefix | bare)
//! phrase := '"' .*? '"'
//! prefix := word '*'
//! ```
//!
//! No ecosystem crate implements this grammar; it compiles directly to a
//! [`tantivy`] query tree.

use tantivy::query::{AllQuery, BooleanQuery, Occur, PhraseQuery, Query, RegexQuery, TermQuery};
use tantivy::schema::{Field, IndexRecordOption};
use tantivy::tokenizer::TokenizerManager;
use tantivy::Term as TTerm;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Or(Vec<Expr>),
    Xor(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Must(Box<Expr>),
    MustNot(Box<Expr>),
    Phrase { field: Option<String>, text: String },
    Prefix { field: Option<String>, text: String },
    Term { field: Option<String>, text: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token(String);

fn tokenize(input: &str) -> Vec<Token> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' | ')' => {
                out.push(Token(chars.next().unwrap().to_string()));
            }
            '"' => {
                let mut s = String::from("\"");
                chars.next();
                for c in chars.by_ref() {
                    s.push(c);
                    if c == '"' {
                        break;
                    }
                }
                out.push(Token(s));
            }
            _ => {
                let mut s = String::new();
                let mut in_quotes = false;
                while let Some(&c) = chars.peek() {
                    if !in_quotes && (c.is_whitespace() || c == '(' || c == ')') {
                        break;
                    }
                    s.push(c);
                    chars.next();
                    if c == '"' {
                        if in_quotes {
                            break;
                        }
                        in_quotes = true;
                    }
                }
                out.push(Token(s));
            }
        }
    }
    out
}

pub fn parse(input: &str) -> Result<Expr, String> {
    let tokens = tokenize(input);
    let mut pos = 0;
    let expr = parse_or(&tokens, &mut pos)?;
    if pos != tokens.len() {
        return Err(format!("unexpected trailing input near {:?}", tokens.get(pos)));
    }
    Ok(expr)
}

fn peek<'a>(tokens: &'a [Token], pos: usize) -> Option<&'a str> {
    tokens.get(pos).map(|t| t.0.as_str())
}

fn parse_or(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    let mut parts = vec![parse_xor(tokens, pos)?];
    while peek(tokens, *pos).map(|s| s.eq_ignore_ascii_case("OR")).unwrap_or(false) {
        *pos += 1;
        parts.push(parse_xor(tokens, pos)?);
    }
    Ok(if parts.len() == 1 { parts.pop().unwrap() } else { Expr::Or(parts) })
}

fn parse_xor(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    let mut parts = vec![parse_and(tokens, pos)?];
    while peek(tokens, *pos).map(|s| s.eq_ignore_ascii_case("XOR")).unwrap_or(false) {
        *pos += 1;
        parts.push(parse_and(tokens, pos)?);
    }
    Ok(if parts.len() == 1 { parts.pop().unwrap() } else { Expr::Xor(parts) })
}

fn is_boundary_keyword(s: &str) -> bool {
    matches!(s.to_ascii_uppercase().as_str(), "AND" | "OR" | "XOR") || s == ")"
}

fn parse_and(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    let mut parts = vec![parse_unary(tokens, pos)?];
    loop {
        match peek(tokens, *pos) {
            Some(s) if s.eq_ignore_ascii_case("AND") => {
                *pos += 1;
                parts.push(parse_unary(tokens, pos)?);
            }
            Some(s) if !is_boundary_keyword(s) => {
                parts.push(parse_unary(tokens, pos)?);
            }
            _ => break,
        }
    }
    Ok(if parts.len() == 1 { parts.pop().unwrap() } else { Expr::And(parts) })
}

fn parse_unary(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    if peek(tokens, *pos).map(|s| s.eq_ignore_ascii_case("NOT")).unwrap_or(false) {
        *pos += 1;
        return Ok(Expr::Not(Box::new(parse_unary(tokens, pos)?)));
    }
    parse_atom(tokens, pos)
}

fn parse_atom(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    match peek(tokens, *pos) {
        Some("(") => {
            *pos += 1;
            let inner = parse_or(tokens, pos)?;
            if peek(tokens, *pos) != Some(")") {
                return Err("expected closing parenthesis".into());
            }
            *pos += 1;
            Ok(inner)
        }
        Some(_) => parse_term(tokens, pos),
        None => Err("unexpected end of query".into()),
    }
}

fn parse_term(tokens: &[Token], pos: &mut usize) -> Result<Expr, String> {
    let raw = peek(tokens, *pos).ok_or("expected a term")?.to_string();
    *pos += 1;

    let (modifier, rest) = match raw.chars().next() {
        Some('+') => (Some('+'), &raw[1..]),
        Some('-') => (Some('-'), &raw[1..]),
        _ => (None, raw.as_str()),
    };

    let (field, body) = match rest.split_once(':') {
        Some((f, b)) if !f.is_empty() && !b.is_empty() => (Some(f.to_string()), b),
        _ => (None, rest),
    };

    let atom = if let Some(phrase) = body.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Expr::Phrase { field, text: phrase.to_string() }
    } else if let Some(prefix) = body.strip_suffix('*') {
        Expr::Prefix { field, text: prefix.to_string() }
    } else {
        Expr::Term { field, text: body.to_string() }
    };

    Ok(match modifier {
        Some('+') => Expr::Must(Box::new(atom)),
        Some('-') => Expr::MustNot(Box::new(atom)),
        _ => atom,
    })
}

/// Fields searched when a term names none explicitly.
pub const DEFAULT_FIELDS: &[&str] = &["subject", "from", "to", "body"];

pub struct Compiler<'a> {
    pub fields: &'a std::collections::HashMap<String, Field>,
    pub tokenizers: &'a TokenizerManager,
}

impl<'a> Compiler<'a> {
    fn field(&self, name: &str) -> Result<Field, String> {
        self.fields.get(name).copied().ok_or_else(|| format!("unknown field {name}"))
    }

    fn term_query(&self, field: Field, text: &str) -> Box<dyn Query> {
        let term = TTerm::from_field_text(field, text);
        Box::new(TermQuery::new(term, IndexRecordOption::WithFreqsAndPositions))
    }

    fn tokens_of(&self, text: &str) -> Vec<String> {
        let mut tokenizer = self
            .tokenizers
            .get("default")
            .expect("default tokenizer is always registered");
        let mut stream = tokenizer.token_stream(text);
        let mut out = Vec::new();
        while let Some(tok) = stream.next() {
            out.push(tok.text.clone());
        }
        out
    }

    fn any_field_query(&self, make: impl Fn(Field) -> Box<dyn Query>) -> Result<Box<dyn Query>, String> {
        let mut clauses = Vec::new();
        for name in DEFAULT_FIELDS {
            let f = self.field(name)?;
            clauses.push((Occur::Should, make(f)));
        }
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    pub fn compile(&self, expr: &Expr) -> Result<Box<dyn Query>, String> {
        match expr {
            Expr::Or(parts) => {
                let clauses = parts
                    .iter()
                    .map(|p| self.compile(p).map(|q| (Occur::Should, q)))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Expr::And(parts) => {
                let clauses = parts
                    .iter()
                    .map(|p| self.compile_as_clause(p))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Expr::Xor(parts) => {
                // a XOR b XOR c ... : match docs where an odd number of
                // parts hit. Implemented as a left fold of pairwise XOR,
                // each pairwise XOR being (a OR b) AND NOT (a AND b). Each
                // operand expression is recompiled from the AST as needed
                // rather than cloning a boxed query.
                let mut acc = parts[0].clone();
                for part in &parts[1..] {
                    acc = Expr::And(vec![
                        Expr::Or(vec![acc.clone(), part.clone()]),
                        Expr::Not(Box::new(Expr::And(vec![acc.clone(), part.clone()]))),
                    ]);
                }
                self.compile(&acc)
            }
            Expr::Not(inner) => {
                let q = self.compile(inner)?;
                Ok(Box::new(BooleanQuery::new(vec![
                    (Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
                    (Occur::MustNot, q),
                ])))
            }
            Expr::Must(inner) | Expr::MustNot(inner) => self.compile(inner),
            Expr::Phrase { field, text } => {
                let fields: Vec<&str> = match field {
                    Some(f) => vec![f.as_str()],
                    None => DEFAULT_FIELDS.to_vec(),
                };
                let mut clauses = Vec::new();
                for name in fields {
                    let f = self.field(name)?;
                    let words = self.tokens_of(text);
                    if words.len() < 2 {
                        clauses.push((Occur::Should, self.term_query(f, text)));
                        continue;
                    }
                    let terms: Vec<TTerm> =
                        words.iter().map(|w| TTerm::from_field_text(f, w)).collect();
                    clauses.push((Occur::Should, Box::new(PhraseQuery::new(terms)) as Box<dyn Query>));
                }
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Expr::Prefix { field, text } => {
                let fields: Vec<&str> = match field {
                    Some(f) => vec![f.as_str()],
                    None => DEFAULT_FIELDS.to_vec(),
                };
                let mut clauses = Vec::new();
                for name in fields {
                    let f = self.field(name)?;
                    let pattern = format!("{}.*", regex::escape(text));
                    let q = RegexQuery::from_pattern(&pattern, f)
                        .map_err(|e| format!("bad prefix pattern: {e}"))?;
                    clauses.push((Occur::Should, Box::new(q) as Box<dyn Query>));
                }
                Ok(Box::new(BooleanQuery::new(clauses)))
            }
            Expr::Term { field, text } => match field {
                Some(name) => {
                    let f = self.field(name)?;
                    Ok(self.term_query(f, text))
                }
                None => self.any_field_query(|f| self.term_query(f, text)),
            },
        }
    }

    /// Wraps a compiled sub-expression as a clause for an enclosing `And`,
    /// honoring `+`/`-` modifiers at the top of that sub-expression.
    fn compile_as_clause(&self, expr: &Expr) -> Result<(Occur, Box<dyn Query>), String> {
        match expr {
            Expr::Must(inner) => Ok((Occur::Must, self.compile(inner)?)),
            Expr::MustNot(inner) => Ok((Occur::MustNot, self.compile(inner)?)),
            other => Ok((Occur::Must, self.compile(other)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_terms_as_implicit_and() {
        let e = parse("invoice march").unwrap();
        assert_eq!(
            e,
            Expr::And(vec![
                Expr::Term { field: None, text: "invoice".into() },
                Expr::Term { field: None, text: "march".into() },
            ])
        );
    }

    #[test]
    fn parses_or_lower_precedence_than_and() {
        let e = parse("a b OR c").unwrap();
        assert_eq!(
            e,
            Expr::Or(vec![
                Expr::And(vec![
                    Expr::Term { field: None, text: "a".into() },
                    Expr::Term { field: None, text: "b".into() },
                ]),
                Expr::Term { field: None, text: "c".into() },
            ])
        );
    }

    #[test]
    fn parses_must_and_must_not() {
        let e = parse("+urgent -spam").unwrap();
        assert_eq!(
            e,
            Expr::And(vec![
                Expr::Must(Box::new(Expr::Term { field: None, text: "urgent".into() })),
                Expr::MustNot(Box::new(Expr::Term { field: None, text: "spam".into() })),
            ])
        );
    }

    #[test]
    fn parses_field_scoped_phrase() {
        let e = parse(r#"subject:"year end report""#).unwrap();
        assert_eq!(
            e,
            Expr::Phrase { field: Some("subject".into()), text: "year end report".into() }
        );
    }

    #[test]
    fn parses_prefix_wildcard() {
        let e = parse("invoic*").unwrap();
        assert_eq!(e, Expr::Prefix { field: None, text: "invoic".into() });
    }

    #[test]
    fn parses_not_binds_tighter_than_and() {
        let e = parse("NOT a b").unwrap();
        assert_eq!(
            e,
            Expr::And(vec![
                Expr::Not(Box::new(Expr::Term { field: None, text: "a".into() })),
                Expr::Term { field: None, text: "b".into() },
            ])
        );
    }

    #[test]
    fn parses_parenthesized_grouping() {
        let e = parse("(a OR b) c").unwrap();
        assert_eq!(
            e,
            Expr::And(vec![
                Expr::Or(vec![
                    Expr::Term { field: None, text: "a".into() },
                    Expr::Term { field: None, text: "b".into() },
                ]),
                Expr::Term { field: None, text: "c".into() },
            ])
        );
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("a )").is_err());
    }
}

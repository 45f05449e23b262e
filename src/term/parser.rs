//! # Goal-String Parser
//!
//! Parses the textual goal grammar: a literal is `symbol(arg, ...)`; args
//! are identifiers (variables start upper case or `_`), quoted strings,
//! integers, booleans, lists `[a, b, c]` and nested compounds. Whitespace
//! is insignificant. Rule files additionally allow `head :- body.` clauses
//! and `%` line comments.
//!
//! `fileref("path", "hex")` parses into a structured file reference rather
//! than a compound, so references survive a round trip through display.

use super::{FileRef, Literal, Term};
use crate::rules::Rule;
use thiserror::Error;

/// Parse failure, reported synchronously; nothing is admitted on error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("expected {expected} at offset {at}")]
    Expected { expected: &'static str, at: usize },
    #[error("trailing input at offset {0}")]
    TrailingInput(usize),
    #[error("invalid integer at offset {0}")]
    InvalidInt(usize),
    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),
}

struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer {
            src: src.as_bytes(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_whitespace() {
                self.pos += 1;
            } else if c == b'%' {
                // Line comment.
                while self.pos < self.src.len() && self.src[self.pos] != b'\n' {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_ws();
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.src.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn expect(&mut self, c: u8, what: &'static str) -> Result<(), ParseError> {
        match self.peek() {
            Some(found) if found == c => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(ParseError::Expected {
                expected: what,
                at: self.pos,
            }),
        }
    }

    fn eat(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume `lit` if it appears next (used for `:-`).
    fn eat_str(&mut self, lit: &str) -> bool {
        self.skip_ws();
        if self.src[self.pos..].starts_with(lit.as_bytes()) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        self.skip_ws();
        let start = self.pos;
        while self.pos < self.src.len() {
            let c = self.src[self.pos];
            if c.is_ascii_alphanumeric() || c == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return match self.src.get(self.pos) {
                Some(&c) => Err(ParseError::UnexpectedChar(c as char, self.pos)),
                None => Err(ParseError::UnexpectedEof),
            };
        }
        Ok(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn string(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        self.expect(b'"', "string")?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some(b'"') => return Ok(out),
                Some(b'\\') => match self.bump() {
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(c) => out.push(c as char),
                    None => return Err(ParseError::UnterminatedString(start)),
                },
                Some(c) => out.push(c as char),
                None => return Err(ParseError::UnterminatedString(start)),
            }
        }
    }

    fn integer(&mut self) -> Result<i64, ParseError> {
        self.skip_ws();
        let start = self.pos;
        if self.src.get(self.pos) == Some(&b'-') {
            self.pos += 1;
        }
        while self
            .src
            .get(self.pos)
            .is_some_and(u8::is_ascii_digit)
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.src[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(ParseError::InvalidInt(start))
    }

    fn term(&mut self) -> Result<Term, ParseError> {
        match self.peek() {
            Some(b'"') => Ok(Term::Str(self.string()?)),
            Some(b'[') => {
                self.pos += 1;
                let mut items = Vec::new();
                if !self.eat(b']') {
                    loop {
                        items.push(self.term()?);
                        if self.eat(b']') {
                            break;
                        }
                        self.expect(b',', "',' or ']'")?;
                    }
                }
                Ok(Term::List(items))
            }
            Some(c) if c == b'-' || c.is_ascii_digit() => Ok(Term::Int(self.integer()?)),
            Some(c) if c.is_ascii_alphabetic() || c == b'_' => {
                let name = self.ident()?;
                let first = name.as_bytes()[0];
                if first.is_ascii_uppercase() || first == b'_' {
                    return Ok(Term::Var(name));
                }
                match name.as_str() {
                    "true" => return Ok(Term::Bool(true)),
                    "false" => return Ok(Term::Bool(false)),
                    _ => {}
                }
                if self.eat(b'(') {
                    let args = self.arg_list()?;
                    if name == "fileref" {
                        if let [Term::Str(file), Term::Str(sha1)] = args.as_slice() {
                            return Ok(Term::FileRef(FileRef {
                                file: file.clone(),
                                sha1: sha1.clone(),
                            }));
                        }
                    }
                    Ok(Term::Compound(name, args))
                } else {
                    Ok(Term::Sym(name))
                }
            }
            Some(c) => Err(ParseError::UnexpectedChar(c as char, self.pos)),
            None => Err(ParseError::UnexpectedEof),
        }
    }

    /// Comma-separated terms up to and including the closing `)`.
    fn arg_list(&mut self) -> Result<Vec<Term>, ParseError> {
        let mut args = Vec::new();
        if self.eat(b')') {
            return Ok(args);
        }
        loop {
            args.push(self.term()?);
            if self.eat(b')') {
                return Ok(args);
            }
            self.expect(b',', "',' or ')'")?;
        }
    }

    fn literal(&mut self) -> Result<Literal, ParseError> {
        self.skip_ws();
        let at = self.pos;
        let name = self.ident()?;
        let first = name.as_bytes()[0];
        if first.is_ascii_uppercase() {
            return Err(ParseError::Expected {
                expected: "predicate symbol",
                at,
            });
        }
        let args = if self.eat(b'(') {
            self.arg_list()?
        } else {
            Vec::new()
        };
        Ok(Literal::new(name, args))
    }

    fn rule(&mut self) -> Result<Rule, ParseError> {
        let head = self.literal()?;
        let mut body = Vec::new();
        if self.eat_str(":-") {
            loop {
                body.push(self.literal()?);
                if !self.eat(b',') {
                    break;
                }
            }
        }
        Ok(Rule::new(head, body))
    }

    fn at_eof(&mut self) -> bool {
        self.peek().is_none()
    }
}

/// Parse a single term.
pub fn parse_term(src: &str) -> Result<Term, ParseError> {
    let mut lx = Lexer::new(src);
    let term = lx.term()?;
    if lx.at_eof() {
        Ok(term)
    } else {
        Err(ParseError::TrailingInput(lx.pos))
    }
}

/// Parse a single literal, e.g. a query goal. A trailing `.` is accepted.
pub fn parse_literal(src: &str) -> Result<Literal, ParseError> {
    let mut lx = Lexer::new(src);
    let lit = lx.literal()?;
    lx.eat(b'.');
    if lx.at_eof() {
        Ok(lit)
    } else {
        Err(ParseError::TrailingInput(lx.pos))
    }
}

/// Parse a single rule or fact, e.g. `ancestor(X, Y) :- parent(X, Y).`
pub fn parse_rule(src: &str) -> Result<Rule, ParseError> {
    let mut lx = Lexer::new(src);
    let rule = lx.rule()?;
    lx.eat(b'.');
    if lx.at_eof() {
        Ok(rule)
    } else {
        Err(ParseError::TrailingInput(lx.pos))
    }
}

/// Parse a rule file: `.`-terminated clauses with `%` comments. Clauses
/// may span lines.
pub fn parse_rule_file(src: &str) -> Result<Vec<Rule>, ParseError> {
    let mut lx = Lexer::new(src);
    let mut rules = Vec::new();
    while !lx.at_eof() {
        let rule = lx.rule()?;
        lx.expect(b'.', "'.' terminating clause")?;
        rules.push(rule);
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literal_basic() {
        let lit = parse_literal("ancestor(bill, Y)").unwrap();
        assert_eq!(lit.pred, "ancestor");
        assert_eq!(lit.args[0], Term::Sym("bill".into()));
        assert_eq!(lit.args[1], Term::Var("Y".into()));
    }

    #[test]
    fn test_parse_zero_arity() {
        let lit = parse_literal("stop").unwrap();
        assert_eq!(lit.arity(), 0);
    }

    #[test]
    fn test_parse_all_arg_kinds() {
        let lit = parse_literal(r#"p(X, foo, "a string", -12, true, [1, [a], []], g(h(Y)))"#)
            .unwrap();
        assert_eq!(lit.arity(), 7);
        assert_eq!(lit.args[3], Term::Int(-12));
        assert_eq!(lit.args[4], Term::Bool(true));
        assert!(matches!(&lit.args[5], Term::List(items) if items.len() == 3));
    }

    #[test]
    fn test_parse_fileref() {
        let lit = parse_literal(
            r#"asciidoc("", fileref("doc.adoc", "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"), Out)"#,
        )
        .unwrap();
        let fr = lit.args[1].as_file_ref().unwrap();
        assert_eq!(fr.file, "doc.adoc");
    }

    #[test]
    fn test_whitespace_insignificant() {
        let a = parse_literal("p( a ,  b )").unwrap();
        let b = parse_literal("p(a,b)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_parse_rule() {
        let rule = parse_rule("ancestor(X, Y) :- parent(X, Z), ancestor(Z, Y).").unwrap();
        assert_eq!(rule.head.pred, "ancestor");
        assert_eq!(rule.body.len(), 2);
    }

    #[test]
    fn test_parse_fact() {
        let rule = parse_rule("parent(bill, mary).").unwrap();
        assert!(rule.is_fact());
    }

    #[test]
    fn test_parse_rule_file_with_comments() {
        let src = "
            % the classic ancestor program
            parent(bill, mary).
            parent(mary, john).
            ancestor(X, Y) :- parent(X, Y).
            ancestor(X, Y) :-
                parent(X, Z), % multi-line clause
                ancestor(Z, Y).
        ";
        let rules = parse_rule_file(src).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules.iter().filter(|r| r.is_fact()).count(), 2);
    }

    #[test]
    fn test_malformed_input_is_rejected() {
        assert!(parse_literal("Upper(a)").is_err());
        assert!(parse_literal("p(a").is_err());
        assert!(parse_literal("p(a) extra").is_err());
        assert!(parse_literal(r#"p("unterminated)"#).is_err());
        assert!(parse_rule_file("p(a) :- q(b)").is_err());
    }
}

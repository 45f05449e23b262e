//! # Term Model
//!
//! The first-order term representation underlying all evaluation: variables,
//! constants, compounds, lists and content-addressed file references.
//! Terms are immutable values. A canonical textual rendering gives every
//! term (and therefore every literal, rule and claim) a stable SHA-1 digest
//! used for tabling and cross-node identity.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

pub mod parser;
pub mod subst;
pub mod unify;

pub use parser::{parse_literal, parse_rule, parse_rule_file, parse_term, ParseError};
pub use subst::Subst;
pub use unify::{rename_apart, unify, unify_literals};

/// A content-addressed file reference. Equality is by hash: two references
/// with the same digest name the same blob wherever it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRef {
    /// Relative path the file was registered under.
    pub file: String,
    /// Lowercase hex SHA-1 of the file body.
    pub sha1: String,
}

impl PartialEq for FileRef {
    fn eq(&self, other: &Self) -> bool {
        self.sha1 == other.sha1
    }
}

impl Eq for FileRef {}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fileref(\"{}\", \"{}\")", self.file, self.sha1)
    }
}

/// A first-order term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    /// Variable; names start with an uppercase letter or underscore.
    Var(String),
    /// Symbolic atom (lowercase identifier).
    Sym(String),
    /// Quoted string constant.
    Str(String),
    /// Integer constant.
    Int(i64),
    /// Boolean constant.
    Bool(bool),
    /// Compound term: a symbol applied to an ordered argument list.
    Compound(String, Vec<Term>),
    /// Explicit list.
    List(Vec<Term>),
    /// Content-addressed file reference.
    FileRef(FileRef),
}

impl Term {
    pub fn is_var(&self) -> bool {
        matches!(self, Term::Var(_))
    }

    pub fn as_var(&self) -> Option<&str> {
        match self {
            Term::Var(name) => Some(name),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_file_ref(&self) -> Option<&FileRef> {
        match self {
            Term::FileRef(fr) => Some(fr),
            _ => None,
        }
    }

    /// A term is ground when it contains no variables.
    pub fn is_ground(&self) -> bool {
        match self {
            Term::Var(_) => false,
            Term::Compound(_, args) | Term::List(args) => args.iter().all(Term::is_ground),
            _ => true,
        }
    }

    /// Collect the names of all variables in this term.
    pub fn variables(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        self.collect_variables(&mut vars);
        vars
    }

    fn collect_variables(&self, vars: &mut HashSet<String>) {
        match self {
            Term::Var(name) => {
                vars.insert(name.clone());
            }
            Term::Compound(_, args) | Term::List(args) => {
                for a in args {
                    a.collect_variables(vars);
                }
            }
            _ => {}
        }
    }

    fn canonical_into(&self, names: &mut BTreeMap<String, String>, out: &mut String) {
        match self {
            Term::Var(name) => {
                let next = names.len();
                let canon = names
                    .entry(name.clone())
                    .or_insert_with(|| format!("_G{next}"));
                out.push_str(canon);
            }
            Term::Sym(s) => out.push_str(s),
            Term::Str(s) => {
                out.push('"');
                out.push_str(&escape_str(s));
                out.push('"');
            }
            Term::Int(v) => out.push_str(&v.to_string()),
            Term::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Term::Compound(functor, args) => {
                out.push_str(functor);
                out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    a.canonical_into(names, out);
                }
                out.push(')');
            }
            Term::List(items) => {
                out.push('[');
                for (i, a) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    a.canonical_into(names, out);
                }
                out.push(']');
            }
            Term::FileRef(fr) => {
                out.push_str(&fr.to_string());
            }
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => write!(f, "{name}"),
            Term::Sym(s) => write!(f, "{s}"),
            Term::Str(s) => write!(f, "\"{}\"", escape_str(s)),
            Term::Int(v) => write!(f, "{v}"),
            Term::Bool(b) => write!(f, "{b}"),
            Term::Compound(functor, args) => {
                write!(f, "{functor}(")?;
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Term::List(items) => {
                write!(f, "[")?;
                for (i, a) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, "]")
            }
            Term::FileRef(fr) => write!(f, "{fr}"),
        }
    }
}

fn escape_str(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// A literal: a predicate symbol applied to argument terms. The unit of
/// evaluation - goals, rule heads, body atoms and claims are all literals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literal {
    pub pred: String,
    pub args: Vec<Term>,
}

impl Literal {
    pub fn new(pred: impl Into<String>, args: Vec<Term>) -> Self {
        Literal {
            pred: pred.into(),
            args,
        }
    }

    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// The `pred/arity` indicator used for rule indexing and advertisement.
    pub fn indicator(&self) -> String {
        format!("{}/{}", self.pred, self.arity())
    }

    pub fn is_ground(&self) -> bool {
        self.args.iter().all(Term::is_ground)
    }

    pub fn variables(&self) -> HashSet<String> {
        let mut vars = HashSet::new();
        for a in &self.args {
            a.collect_variables(&mut vars);
        }
        vars
    }

    /// Canonical rendering with variables renamed to `_G0, _G1, ...` in
    /// order of first occurrence. Two literals equal modulo renaming have
    /// the same canonical form.
    pub fn canonical(&self) -> String {
        let mut names = BTreeMap::new();
        let mut out = String::new();
        out.push_str(&self.pred);
        out.push('(');
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            a.canonical_into(&mut names, &mut out);
        }
        out.push(')');
        out
    }

    /// SHA-1 of the canonical form. Equivalent goals have equal
    /// fingerprints; the goal table keys on this.
    pub fn fingerprint(&self) -> String {
        sha1_hex(self.canonical().as_bytes())
    }

    pub fn all_file_refs(&self) -> Vec<&FileRef> {
        fn walk<'a>(t: &'a Term, out: &mut Vec<&'a FileRef>) {
            match t {
                Term::FileRef(fr) => out.push(fr),
                Term::Compound(_, args) | Term::List(args) => {
                    for a in args {
                        walk(a, out);
                    }
                }
                _ => {}
            }
        }
        let mut out = Vec::new();
        for a in &self.args {
            walk(a, &mut out);
        }
        out
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            return write!(f, "{}", self.pred);
        }
        write!(f, "{}(", self.pred)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{a}")?;
        }
        write!(f, ")")
    }
}

/// Lowercase hex SHA-1 digest.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(s: &str) -> Literal {
        parse_literal(s).unwrap()
    }

    #[test]
    fn test_canonical_renames_variables() {
        let a = lit("ancestor(X, Y)");
        let b = lit("ancestor(A, B)");
        assert_eq!(a.canonical(), b.canonical());
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_canonical_distinguishes_shared_variables() {
        let a = lit("p(X, X)");
        let b = lit("p(X, Y)");
        assert_ne!(a.canonical(), b.canonical());
    }

    #[test]
    fn test_groundness() {
        assert!(lit("parent(bill, mary)").is_ground());
        assert!(!lit("parent(bill, Y)").is_ground());
        assert!(!lit("p([1, 2, X])").is_ground());
    }

    #[test]
    fn test_file_ref_equality_is_by_hash() {
        let a = FileRef {
            file: "a.txt".into(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
        };
        let b = FileRef {
            file: "elsewhere/b.txt".into(),
            sha1: "da39a3ee5e6b4b0d3255bfef95601890afd80709".into(),
        };
        assert_eq!(a, b);
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let l = lit("p(foo, \"a b\", 42, true, [1, g(X)], Y)");
        let back = parse_literal(&l.to_string()).unwrap();
        assert_eq!(l, back);
    }

    #[test]
    fn test_indicator() {
        assert_eq!(lit("ancestor(X, Y)").indicator(), "ancestor/2");
    }
}

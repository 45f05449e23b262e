//! # Wrapper Registry
//!
//! Tool-backed predicates. Each wrapper carries a mode/kind signature; the
//! engine checks modes before invocation (a violation produces an `errors`
//! outcome, never a crash) and uses kinds to trigger file synchronisation.
//! Resolution outcomes form a tagged sum rather than an inheritance
//! hierarchy: success, failure, substitutions, queries, lemmata, errors.

use crate::term::{Literal, Subst, Term};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod builtins;
pub mod exec;

/// Argument mode: `+` must be bound, `-` must be a variable, `?` either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    In,
    Out,
    Any,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::In => "+",
            Mode::Out => "-",
            Mode::Any => "?",
        }
    }
}

/// Argument kind. `File`/`Files` arguments are content-addressed references
/// whose blobs are synchronised before invocation; `Handle` arguments are
/// opaque tokens a wrapper hands back to itself across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    Value,
    File,
    Files,
    Handle,
}

/// Per-argument signature entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    pub mode: Mode,
    pub kind: Kind,
}

/// A wrapper predicate's signature: name plus per-argument mode and kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub args: Vec<ArgSpec>,
}

impl Signature {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    pub fn indicator(&self) -> String {
        format!("{}/{}", self.name, self.args.len())
    }

    /// Check a goal literal against the mode constraints. Returns every
    /// violation found, empty when the goal is applicable.
    pub fn mode_violations(&self, goal: &Literal) -> Vec<String> {
        let mut violations = Vec::new();
        if goal.args.len() != self.args.len() {
            violations.push(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.args.len(),
                goal.args.len()
            ));
            return violations;
        }
        for (spec, arg) in self.args.iter().zip(&goal.args) {
            match spec.mode {
                Mode::In => {
                    if !arg.is_ground() {
                        violations.push(format!(
                            "argument {} of {} must be bound, got {arg}",
                            spec.name, self.name
                        ));
                    } else if !kind_accepts(spec.kind, arg) {
                        violations.push(format!(
                            "argument {} of {} must be a {} value, got {arg}",
                            spec.name,
                            self.name,
                            kind_name(spec.kind)
                        ));
                    }
                }
                Mode::Out => {
                    if !arg.is_var() {
                        violations.push(format!(
                            "argument {} of {} must be a variable, got {arg}",
                            spec.name, self.name
                        ));
                    }
                }
                Mode::Any => {
                    if arg.is_ground() && !kind_accepts(spec.kind, arg) {
                        violations.push(format!(
                            "argument {} of {} must be a {} value, got {arg}",
                            spec.name,
                            self.name,
                            kind_name(spec.kind)
                        ));
                    }
                }
            }
        }
        violations
    }

    /// File references among the bound `file`/`files` arguments; their
    /// blobs must be locally resolvable before the wrapper runs.
    pub fn input_file_refs<'a>(&self, goal: &'a Literal) -> Vec<&'a crate::term::FileRef> {
        let mut refs = Vec::new();
        for (spec, arg) in self.args.iter().zip(&goal.args) {
            match spec.kind {
                Kind::File => {
                    if let Term::FileRef(fr) = arg {
                        refs.push(fr);
                    }
                }
                Kind::Files => {
                    if let Term::List(items) = arg {
                        for item in items {
                            if let Term::FileRef(fr) = item {
                                refs.push(fr);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        refs
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}{}: {}", a.mode.as_str(), a.name, kind_name(a.kind))?;
        }
        write!(f, ")")
    }
}

fn kind_accepts(kind: Kind, term: &Term) -> bool {
    match kind {
        Kind::Value | Kind::Handle => true,
        Kind::File => matches!(term, Term::FileRef(_)),
        Kind::Files => {
            matches!(term, Term::List(items) if items.iter().all(|t| matches!(t, Term::FileRef(_))))
        }
    }
}

fn kind_name(kind: Kind) -> &'static str {
    match kind {
        Kind::Value => "value",
        Kind::File => "file",
        Kind::Files => "files",
        Kind::Handle => "handle",
    }
}

/// Parse a signature from its display form, e.g.
/// `in_range(+low: value, +up: value, -x: value)`.
pub fn parse_signature(src: &str) -> Result<Signature, String> {
    let src = src.trim();
    let open = src.find('(').ok_or("missing '('")?;
    let name = src[..open].trim().to_string();
    if name.is_empty() {
        return Err("empty wrapper name".into());
    }
    let inner = src[open + 1..]
        .strip_suffix(')')
        .ok_or("missing closing ')'")?;
    let mut args = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (mode, rest) = match part.as_bytes()[0] {
            b'+' => (Mode::In, &part[1..]),
            b'-' => (Mode::Out, &part[1..]),
            b'?' => (Mode::Any, &part[1..]),
            _ => (Mode::Any, part),
        };
        let (arg_name, kind) = match rest.split_once(':') {
            Some((n, k)) => (n.trim().to_string(), k.trim()),
            None => (rest.trim().to_string(), "value"),
        };
        let kind = match kind {
            "value" => Kind::Value,
            "file" => Kind::File,
            "files" => Kind::Files,
            "handle" => Kind::Handle,
            other => return Err(format!("unknown kind {other:?}")),
        };
        args.push(ArgSpec {
            name: arg_name,
            mode,
            kind,
        });
    }
    Ok(Signature { name, args })
}

/// The result of resolving a wrapper against an applicable literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The literal holds as given (must be ground); one claim.
    Success,
    /// The literal does not hold; no claim.
    Failure,
    /// For each substitution the instantiated literal holds; one claim
    /// each. Substitutions may only bind output variables.
    Substitutions(Vec<Subst>),
    /// Dynamic subgoals: for each substitution and each subgoal, the
    /// ephemeral rule `s(head) :- s(q)` is added.
    Queries(Vec<Subst>, Vec<Literal>),
    /// Dynamic lemmata: paired substitutions and body lists, one ephemeral
    /// rule `s_i(head) :- s_i(body_i)` per pair.
    Lemmata(Vec<Subst>, Vec<Vec<Literal>>),
    /// The invocation failed; each message becomes part of an error claim.
    Errors(Vec<String>),
}

/// A tool-backed predicate. Long invocations run outside any engine lock;
/// the engine awaits the future from a spawned task.
#[async_trait]
pub trait Wrapper: Send + Sync {
    fn signature(&self) -> &Signature;

    async fn resolve(&self, goal: &Literal) -> Outcome;
}

/// The per-node set of registered wrappers, keyed by predicate name.
#[derive(Default)]
pub struct WrapperRegistry {
    map: DashMap<String, Arc<dyn Wrapper>>,
}

impl WrapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a wrapper; replaces any previous wrapper with that name.
    pub fn register(&self, wrapper: Arc<dyn Wrapper>) {
        let name = wrapper.signature().name.clone();
        tracing::debug!(wrapper = %wrapper.signature(), "registering wrapper");
        self.map.insert(name, wrapper);
    }

    pub fn get(&self, pred: &str) -> Option<Arc<dyn Wrapper>> {
        self.map.get(pred).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, pred: &str) -> bool {
        self.map.contains_key(pred)
    }

    /// `name/arity` indicators of all registered wrappers, for
    /// advertisement on the fabric.
    pub fn indicators(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .map
            .iter()
            .map(|e| e.value().signature().indicator())
            .collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_literal;

    fn sig() -> Signature {
        parse_signature("in_range(+low: value, +up: value, -x: value)").unwrap()
    }

    #[test]
    fn test_parse_signature_round_trip() {
        let s = sig();
        assert_eq!(s.name, "in_range");
        assert_eq!(s.args.len(), 3);
        assert_eq!(s.args[0].mode, Mode::In);
        assert_eq!(s.args[2].mode, Mode::Out);
        assert_eq!(parse_signature(&s.to_string()).unwrap(), s);
    }

    #[test]
    fn test_mode_check_accepts_applicable_goal() {
        let goal = parse_literal("in_range(1, 4, X)").unwrap();
        assert!(sig().mode_violations(&goal).is_empty());
    }

    #[test]
    fn test_mode_check_rejects_unbound_input() {
        let goal = parse_literal("in_range(Low, 4, X)").unwrap();
        let violations = sig().mode_violations(&goal);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("must be bound"));
    }

    #[test]
    fn test_mode_check_rejects_bound_output() {
        let goal = parse_literal("in_range(1, 4, 2)").unwrap();
        let violations = sig().mode_violations(&goal);
        assert!(violations[0].contains("must be a variable"));
    }

    #[test]
    fn test_file_kind_requires_file_ref() {
        let s = parse_signature("render(+src: file, -out: file)").unwrap();
        let bad = parse_literal("render(\"not a ref\", Out)").unwrap();
        assert!(!s.mode_violations(&bad).is_empty());
        let good = parse_literal(
            "render(fileref(\"a.adoc\", \"aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d\"), Out)",
        )
        .unwrap();
        assert!(s.mode_violations(&good).is_empty());
        assert_eq!(s.input_file_refs(&good).len(), 1);
    }

    #[test]
    fn test_arity_mismatch() {
        let goal = parse_literal("in_range(1, 4)").unwrap();
        assert!(!sig().mode_violations(&goal).is_empty());
    }
}

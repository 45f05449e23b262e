//! Substitutions: finite mappings from variable names to terms.
//!
//! Application is recursive - a bound variable whose value mentions other
//! bound variables resolves until a fixpoint. Composition is left-to-right.

use super::{Literal, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// A finite mapping from variable names to terms. Backed by an ordered map
/// so iteration (and therefore wire encoding) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subst(pub std::collections::BTreeMap<String, Term>);

impl Subst {
    pub fn new() -> Self {
        Subst::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, var: &str) -> Option<&Term> {
        self.0.get(var)
    }

    /// Bind a variable. The caller is responsible for not introducing
    /// cycles; `unify` guards against them.
    pub fn bind(&mut self, var: impl Into<String>, term: Term) {
        self.0.insert(var.into(), term);
    }

    /// Apply this substitution to a term, resolving variable chains to a
    /// fixpoint.
    pub fn apply(&self, term: &Term) -> Term {
        match term {
            Term::Var(name) => match self.0.get(name) {
                // A variable may be bound to another bound variable; chase
                // the chain. Unify's occurs guard keeps chains acyclic.
                Some(bound) => self.apply(bound),
                None => term.clone(),
            },
            Term::Compound(functor, args) => Term::Compound(
                functor.clone(),
                args.iter().map(|a| self.apply(a)).collect(),
            ),
            Term::List(items) => Term::List(items.iter().map(|a| self.apply(a)).collect()),
            _ => term.clone(),
        }
    }

    pub fn apply_literal(&self, lit: &Literal) -> Literal {
        Literal {
            pred: lit.pred.clone(),
            args: lit.args.iter().map(|a| self.apply(a)).collect(),
        }
    }

    /// Left-to-right composition: the result behaves as "apply `self`,
    /// then `other`".
    pub fn compose(&self, other: &Subst) -> Subst {
        let mut out = std::collections::BTreeMap::new();
        for (var, term) in &self.0 {
            out.insert(var.clone(), other.apply(term));
        }
        for (var, term) in &other.0 {
            out.entry(var.clone()).or_insert_with(|| term.clone());
        }
        Subst(out)
    }

    /// Project onto a set of variables, dropping all other bindings.
    pub fn restrict(&self, vars: &HashSet<String>) -> Subst {
        Subst(
            self.0
                .iter()
                .filter(|(var, _)| vars.contains(var.as_str()))
                .map(|(var, term)| (var.clone(), self.apply(term)))
                .collect(),
        )
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Term)> {
        self.0.iter()
    }
}

impl fmt::Display for Subst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (var, term)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{var} = {term}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<(String, Term)> for Subst {
    fn from_iter<I: IntoIterator<Item = (String, Term)>>(iter: I) -> Self {
        Subst(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_term;

    #[test]
    fn test_apply_resolves_chains() {
        let mut s = Subst::new();
        s.bind("X", Term::Var("Y".into()));
        s.bind("Y", Term::Int(3));
        assert_eq!(s.apply(&Term::Var("X".into())), Term::Int(3));
    }

    #[test]
    fn test_apply_descends_into_compounds() {
        let mut s = Subst::new();
        s.bind("X", Term::Sym("a".into()));
        let t = parse_term("f(X, [X, 1])").unwrap();
        assert_eq!(s.apply(&t), parse_term("f(a, [a, 1])").unwrap());
    }

    #[test]
    fn test_compose_is_left_to_right() {
        let mut first = Subst::new();
        first.bind("X", Term::Var("Y".into()));
        let mut second = Subst::new();
        second.bind("Y", Term::Int(7));
        let composed = first.compose(&second);
        assert_eq!(composed.apply(&Term::Var("X".into())), Term::Int(7));
        assert_eq!(composed.apply(&Term::Var("Y".into())), Term::Int(7));
    }

    #[test]
    fn test_restrict_projects() {
        let mut s = Subst::new();
        s.bind("X", Term::Int(1));
        s.bind("Y", Term::Int(2));
        let keep: std::collections::HashSet<String> = ["X".to_string()].into_iter().collect();
        let r = s.restrict(&keep);
        assert_eq!(r.get("X"), Some(&Term::Int(1)));
        assert_eq!(r.get("Y"), None);
    }
}

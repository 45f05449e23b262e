//! First-order unification and renaming-apart.
//!
//! The engine never constructs cyclic terms: binding a variable to a term
//! that contains it fails unification instead of building a cycle. There is
//! no general occurs-check pass beyond that guard.

use super::{Literal, Subst, Term};
use std::sync::atomic::{AtomicU64, Ordering};

/// Unify two terms under an existing substitution, returning the extended
/// substitution on success.
pub fn unify(a: &Term, b: &Term, subst: &Subst) -> Option<Subst> {
    let mut out = subst.clone();
    if unify_into(a, b, &mut out) {
        Some(out)
    } else {
        None
    }
}

/// Unify two literals argument-wise.
pub fn unify_literals(a: &Literal, b: &Literal, subst: &Subst) -> Option<Subst> {
    if a.pred != b.pred || a.args.len() != b.args.len() {
        return None;
    }
    let mut out = subst.clone();
    for (x, y) in a.args.iter().zip(&b.args) {
        if !unify_into(x, y, &mut out) {
            return None;
        }
    }
    Some(out)
}

fn unify_into(a: &Term, b: &Term, subst: &mut Subst) -> bool {
    let a = walk(a, subst);
    let b = walk(b, subst);
    match (&a, &b) {
        (Term::Var(x), Term::Var(y)) if x == y => true,
        (Term::Var(x), other) | (other, Term::Var(x)) => {
            if occurs(x, other, subst) {
                return false;
            }
            subst.bind(x.clone(), other.clone());
            true
        }
        (Term::Sym(x), Term::Sym(y)) => x == y,
        (Term::Str(x), Term::Str(y)) => x == y,
        (Term::Int(x), Term::Int(y)) => x == y,
        (Term::Bool(x), Term::Bool(y)) => x == y,
        (Term::FileRef(x), Term::FileRef(y)) => x == y,
        (Term::Compound(f, xs), Term::Compound(g, ys)) => {
            f == g
                && xs.len() == ys.len()
                && xs.iter().zip(ys).all(|(x, y)| unify_into(x, y, subst))
        }
        (Term::List(xs), Term::List(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| unify_into(x, y, subst))
        }
        _ => false,
    }
}

/// Resolve a term one level through the substitution (no deep apply).
fn walk(term: &Term, subst: &Subst) -> Term {
    let mut current = term.clone();
    while let Term::Var(name) = &current {
        match subst.get(name) {
            Some(bound) => current = bound.clone(),
            None => break,
        }
    }
    current
}

/// Would binding `var` to `term` construct a cycle?
fn occurs(var: &str, term: &Term, subst: &Subst) -> bool {
    match term {
        Term::Var(name) => {
            if name == var {
                return true;
            }
            match subst.get(name) {
                Some(bound) => occurs(var, &bound.clone(), subst),
                None => false,
            }
        }
        Term::Compound(_, args) | Term::List(args) => {
            args.iter().any(|a| occurs(var, a, subst))
        }
        _ => false,
    }
}

static RENAME_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Rename every variable in `head` and `body` to a fresh name, so a rule
/// can be resolved against a goal without variable capture. Called once per
/// resolution step.
pub fn rename_apart(head: &Literal, body: &[Literal]) -> (Literal, Vec<Literal>) {
    let stamp = RENAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut renaming = Subst::new();
    let mut vars = head.variables();
    for lit in body {
        vars.extend(lit.variables());
    }
    for var in vars {
        let fresh = format!("{var}__r{stamp}");
        renaming.bind(var, Term::Var(fresh));
    }
    let head = renaming.apply_literal(head);
    let body = body.iter().map(|l| renaming.apply_literal(l)).collect();
    (head, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::{parse_literal, parse_term};

    fn t(s: &str) -> Term {
        parse_term(s).unwrap()
    }

    #[test]
    fn test_unify_binds_variable() {
        let s = unify(&t("X"), &t("foo"), &Subst::new()).unwrap();
        assert_eq!(s.apply(&t("X")), t("foo"));
    }

    #[test]
    fn test_unify_compound() {
        let s = unify(&t("f(X, b)"), &t("f(a, Y)"), &Subst::new()).unwrap();
        assert_eq!(s.apply(&t("g(X, Y)")), t("g(a, b)"));
    }

    #[test]
    fn test_unify_mismatch_fails() {
        assert!(unify(&t("f(a)"), &t("g(a)"), &Subst::new()).is_none());
        assert!(unify(&t("f(a)"), &t("f(a, b)"), &Subst::new()).is_none());
        assert!(unify(&t("1"), &t("2"), &Subst::new()).is_none());
    }

    #[test]
    fn test_occurs_guard_fails_instead_of_looping() {
        assert!(unify(&t("X"), &t("f(X)"), &Subst::new()).is_none());
    }

    #[test]
    fn test_unify_respects_existing_bindings() {
        let s = unify(&t("X"), &t("a"), &Subst::new()).unwrap();
        assert!(unify(&t("X"), &t("b"), &s).is_none());
        assert!(unify(&t("X"), &t("a"), &s).is_some());
    }

    #[test]
    fn test_unify_literals_shares_variables() {
        let a = parse_literal("parent(bill, Z)").unwrap();
        let b = parse_literal("parent(X, Y)").unwrap();
        let s = unify_literals(&a, &b, &Subst::new()).unwrap();
        assert_eq!(s.apply(&t("X")), t("bill"));
    }

    #[test]
    fn test_rename_apart_is_fresh() {
        let head = parse_literal("p(X, Y)").unwrap();
        let body = vec![parse_literal("q(X)").unwrap()];
        let (h1, b1) = rename_apart(&head, &body);
        let (h2, _) = rename_apart(&head, &body);
        assert!(h1.variables().is_disjoint(&head.variables()));
        assert!(h1.variables().is_disjoint(&h2.variables()));
        // Shared variables stay shared after renaming.
        let hv = h1.variables();
        assert!(b1[0].variables().iter().all(|v| hv.contains(v)));
    }
}

//! Built-in wrappers registered on every node.

use super::{parse_signature, Outcome, Signature, Wrapper};
use crate::term::{Literal, Subst, Term};
use async_trait::async_trait;

/// `in_range(+low, +up, -x)`: enumerates the integers of the closed
/// interval as one substitution per value.
pub struct InRange {
    signature: Signature,
}

impl Default for InRange {
    fn default() -> Self {
        Self::new()
    }
}

impl InRange {
    pub fn new() -> Self {
        let signature = match parse_signature("in_range(+low: value, +up: value, -x: value)") {
            Ok(signature) => signature,
            Err(_) => unreachable!("builtin signature is well-formed"),
        };
        InRange { signature }
    }
}

#[async_trait]
impl Wrapper for InRange {
    fn signature(&self) -> &Signature {
        &self.signature
    }

    async fn resolve(&self, goal: &Literal) -> Outcome {
        let (low, up) = match (goal.args[0].as_int(), goal.args[1].as_int()) {
            (Some(low), Some(up)) => (low, up),
            _ => return Outcome::Errors(vec!["in_range bounds must be integers".into()]),
        };
        let out = match goal.args[2].as_var() {
            Some(name) => name.to_string(),
            None => return Outcome::Failure,
        };
        if low > up {
            return Outcome::Failure;
        }
        let substs = (low..=up)
            .map(|v| {
                let mut s = Subst::new();
                s.bind(out.clone(), Term::Int(v));
                s
            })
            .collect();
        Outcome::Substitutions(substs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_literal;

    #[tokio::test]
    async fn test_in_range_enumerates() {
        let w = InRange::new();
        let goal = parse_literal("in_range(1, 4, X)").unwrap();
        match w.resolve(&goal).await {
            Outcome::Substitutions(substs) => {
                let values: Vec<i64> = substs
                    .iter()
                    .map(|s| s.get("X").and_then(Term::as_int).unwrap())
                    .collect();
                assert_eq!(values, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_in_range_empty_interval_fails() {
        let w = InRange::new();
        let goal = parse_literal("in_range(4, 1, X)").unwrap();
        assert_eq!(w.resolve(&goal).await, Outcome::Failure);
    }
}

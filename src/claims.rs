//! # Claims Table
//!
//! Append-only store of ground claims with their derivation edges, indexed
//! by ground literal. A literal derived along several paths keeps every
//! edge; any one edge is a valid witness. The same (literal, edge) pair is
//! never stored twice.

use crate::rules::RuleId;
use crate::term::{sha1_hex, Literal, Subst};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Identity of a claim: SHA-1 of the canonical ground literal. Stable
/// across nodes, which is what lets remote derivation edges refer to the
/// provider's claims.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimId(pub String);

impl fmt::Display for ClaimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

impl ClaimId {
    pub fn of(literal: &Literal) -> Self {
        ClaimId(sha1_hex(literal.canonical().as_bytes()))
    }
}

/// How a claim was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// Directly from a fact in the rule base.
    Fact { rule: RuleId },
    /// Produced by a wrapper invocation.
    Wrapper {
        name: String,
        args_digest: String,
        binding: Subst,
    },
    /// A rule instance whose body literals are discharged by `support`.
    RuleInstance { rule: RuleId, support: Vec<ClaimId> },
    /// Delivered by a peer; `claim` names the claim in the peer's table.
    Remote { peer: String, claim: ClaimId },
    /// An error row: the goal failed but the failure stays introspectable.
    Error { source: String },
}

/// A ground literal together with every derivation edge recorded for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub literal: Literal,
    pub evidence: Vec<Evidence>,
}

impl Claim {
    pub fn is_error(&self) -> bool {
        self.literal.pred == "error"
    }
}

struct Record {
    literal: Literal,
    edges: Vec<Evidence>,
    edge_keys: HashSet<String>,
}

/// The per-node claim store.
#[derive(Default)]
pub struct ClaimsTable {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    records: HashMap<ClaimId, Record>,
    order: Vec<ClaimId>,
}

impl ClaimsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a derivation edge for a ground literal. Returns the claim id
    /// and whether the edge was new. Non-ground literals are a caller bug.
    pub fn record(&self, literal: Literal, evidence: Evidence) -> (ClaimId, bool) {
        debug_assert!(literal.is_ground(), "claims must be ground: {literal}");
        let id = ClaimId::of(&literal);
        // The edge key is the serialised evidence; identical rule
        // instances therefore collapse to one edge.
        let key = serde_json::to_string(&evidence).unwrap_or_else(|_| format!("{evidence:?}"));
        let mut guard = self.inner.write();
        let Inner { records, order } = &mut *guard;
        let record = match records.entry(id.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(v) => {
                order.push(id.clone());
                v.insert(Record {
                    literal,
                    edges: Vec::new(),
                    edge_keys: HashSet::new(),
                })
            }
        };
        if !record.edge_keys.insert(key) {
            return (id, false);
        }
        record.edges.push(evidence);
        (id, true)
    }

    pub fn get(&self, id: &ClaimId) -> Option<Claim> {
        let inner = self.inner.read();
        inner.records.get(id).map(|r| Claim {
            id: id.clone(),
            literal: r.literal.clone(),
            evidence: r.edges.clone(),
        })
    }

    pub fn contains(&self, id: &ClaimId) -> bool {
        self.inner.read().records.contains_key(id)
    }

    /// All claims across the node, in insertion order.
    pub fn all(&self) -> Vec<Claim> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| {
                inner.records.get(id).map(|r| Claim {
                    id: id.clone(),
                    literal: r.literal.clone(),
                    evidence: r.edges.clone(),
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The ground `error/2` literal recorded when a goal fails: the offending
/// goal rendered as a string plus the message list.
pub fn error_literal(goal: &Literal, messages: &[String]) -> Literal {
    Literal::new(
        "error",
        vec![
            crate::term::Term::Str(goal.to_string()),
            crate::term::Term::List(
                messages
                    .iter()
                    .map(|m| crate::term::Term::Str(m.clone()))
                    .collect(),
            ),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_literal;

    fn lit(s: &str) -> Literal {
        parse_literal(s).unwrap()
    }

    fn fact_edge(tag: &str) -> Evidence {
        Evidence::Fact {
            rule: RuleId(tag.to_string()),
        }
    }

    #[test]
    fn test_record_and_get() {
        let table = ClaimsTable::new();
        let (id, new) = table.record(lit("parent(bill, mary)"), fact_edge("r1"));
        assert!(new);
        let claim = table.get(&id).unwrap();
        assert_eq!(claim.literal, lit("parent(bill, mary)"));
        assert_eq!(claim.evidence.len(), 1);
    }

    #[test]
    fn test_duplicate_edge_suppressed() {
        let table = ClaimsTable::new();
        let (id, _) = table.record(lit("p(a)"), fact_edge("r1"));
        let (same, new) = table.record(lit("p(a)"), fact_edge("r1"));
        assert_eq!(id, same);
        assert!(!new);
        assert_eq!(table.get(&id).unwrap().evidence.len(), 1);
    }

    #[test]
    fn test_multiple_paths_keep_all_edges() {
        let table = ClaimsTable::new();
        let (id, _) = table.record(lit("p(a)"), fact_edge("r1"));
        let (_, new) = table.record(lit("p(a)"), fact_edge("r2"));
        assert!(new);
        assert_eq!(table.get(&id).unwrap().evidence.len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_claim_id_is_stable_across_tables() {
        let a = ClaimId::of(&lit("p(a, [1, 2])"));
        let b = ClaimId::of(&lit("p(a, [1, 2])"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_error_literal_is_ground() {
        let goal = lit("in_range(Low, 4, X)");
        let err = error_literal(&goal, &["bound missing".to_string()]);
        assert!(err.is_ground());
        assert_eq!(err.pred, "error");
    }
}

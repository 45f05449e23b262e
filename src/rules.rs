//! # Rule Base
//!
//! Horn clauses indexed by head predicate symbol and arity. Rules carry an
//! epoch; enumeration filters by epoch visibility so a resolution step
//! either sees all of a retracted rule set or none of it. Rules added
//! dynamically by a wrapper are tagged with the goal that produced them and
//! are retracted when that goal's query closes, unless marked permanent.

use crate::engine::GoalId;
use crate::term::{sha1_hex, Literal};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Content-hash identity of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub String);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..12.min(self.0.len())])
    }
}

/// A Horn clause. Facts are rules with an empty body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub head: Literal,
    pub body: Vec<Literal>,
}

impl Rule {
    pub fn new(head: Literal, body: Vec<Literal>) -> Self {
        Rule { head, body }
    }

    pub fn fact(head: Literal) -> Self {
        Rule {
            head,
            body: Vec::new(),
        }
    }

    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }

    /// Canonical clause text; the rule id is its SHA-1.
    pub fn canonical(&self) -> String {
        let mut out = self.head.canonical();
        if !self.body.is_empty() {
            out.push_str(":-");
            for (i, lit) in self.body.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&lit.canonical());
            }
        }
        out
    }

    pub fn id(&self) -> RuleId {
        RuleId(sha1_hex(self.canonical().as_bytes()))
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_fact() {
            return write!(f, "{}.", self.head);
        }
        write!(f, "{} :- ", self.head)?;
        for (i, lit) in self.body.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{lit}")?;
        }
        write!(f, ".")
    }
}

struct Entry {
    rule: Arc<Rule>,
    id: RuleId,
    /// Epoch at which the rule became visible.
    added: u64,
    /// Epoch at which the rule stopped matching, if retracted.
    retracted: Option<u64>,
    /// Goal that introduced the rule; `None` for permanent rules.
    origin: Option<GoalId>,
}

struct Index {
    epoch: u64,
    by_head: HashMap<(String, usize), Vec<Entry>>,
}

/// The per-node rule store. Writes are single-writer behind the lock;
/// readers enumerate a consistent epoch.
pub struct RuleBase {
    index: RwLock<Index>,
}

impl Default for RuleBase {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleBase {
    pub fn new() -> Self {
        RuleBase {
            index: RwLock::new(Index {
                epoch: 0,
                by_head: HashMap::new(),
            }),
        }
    }

    /// Current visibility epoch. A resolution step captures this once and
    /// passes it to `candidates` for every match in the step.
    pub fn epoch(&self) -> u64 {
        self.index.read().epoch
    }

    /// Insert a permanent rule. Returns the rule id; re-inserting an
    /// identical clause is a no-op.
    pub fn insert(&self, rule: Rule) -> RuleId {
        self.insert_tagged(rule, None)
    }

    /// Insert an ephemeral rule produced while evaluating `origin`.
    pub fn insert_ephemeral(&self, rule: Rule, origin: GoalId) -> RuleId {
        self.insert_tagged(rule, Some(origin))
    }

    fn insert_tagged(&self, rule: Rule, origin: Option<GoalId>) -> RuleId {
        let id = rule.id();
        let key = (rule.head.pred.clone(), rule.head.arity());
        let mut index = self.index.write();
        index.epoch += 1;
        let epoch = index.epoch;
        let entries = index.by_head.entry(key).or_default();
        if let Some(existing) = entries.iter_mut().find(|e| e.id == id) {
            if existing.retracted.is_some() {
                // Re-asserted after retraction: becomes visible again.
                existing.retracted = None;
                existing.added = epoch;
                existing.origin = origin;
            }
            return id;
        }
        entries.push(Entry {
            rule: Arc::new(rule),
            id: id.clone(),
            added: epoch,
            retracted: None,
            origin,
        });
        id
    }

    /// Enumerate rules matching `lit`'s head symbol and arity, visible at
    /// `epoch`.
    pub fn candidates(&self, lit: &Literal, epoch: u64) -> Vec<(RuleId, Arc<Rule>)> {
        let index = self.index.read();
        match index.by_head.get(&(lit.pred.clone(), lit.arity())) {
            Some(entries) => entries
                .iter()
                .filter(|e| e.added <= epoch && e.retracted.is_none_or(|r| r > epoch))
                .map(|e| (e.id.clone(), Arc::clone(&e.rule)))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Does any currently visible rule define `pred/arity`?
    pub fn defines(&self, pred: &str, arity: usize) -> bool {
        let index = self.index.read();
        let epoch = index.epoch;
        index
            .by_head
            .get(&(pred.to_string(), arity))
            .is_some_and(|entries| {
                entries
                    .iter()
                    .any(|e| e.added <= epoch && e.retracted.is_none_or(|r| r > epoch))
            })
    }

    /// All currently defined `pred/arity` indicators, for advertisement.
    pub fn head_indicators(&self) -> Vec<String> {
        let index = self.index.read();
        let epoch = index.epoch;
        let mut out: Vec<String> = index
            .by_head
            .iter()
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|e| e.added <= epoch && e.retracted.is_none_or(|r| r > epoch))
            })
            .map(|((pred, arity), _)| format!("{pred}/{arity}"))
            .collect();
        out.sort();
        out
    }

    /// Retract every ephemeral rule whose origin goal is in `closed`.
    /// A single epoch bump makes the whole set invisible at once.
    pub fn retract_by_origin(&self, closed: &std::collections::HashSet<GoalId>) -> usize {
        let mut index = self.index.write();
        index.epoch += 1;
        let epoch = index.epoch;
        let mut count = 0;
        for entries in index.by_head.values_mut() {
            for e in entries.iter_mut() {
                if e.retracted.is_none()
                    && e.origin.as_ref().is_some_and(|g| closed.contains(g))
                {
                    e.retracted = Some(epoch);
                    count += 1;
                }
            }
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_rule;

    fn rule(s: &str) -> Rule {
        parse_rule(s).unwrap()
    }

    #[test]
    fn test_candidates_by_head_and_arity() {
        let base = RuleBase::new();
        base.insert(rule("parent(bill, mary)."));
        base.insert(rule("parent(mary, john)."));
        base.insert(rule("parent(a, b, c)."));
        let goal = crate::term::parse_literal("parent(X, Y)").unwrap();
        assert_eq!(base.candidates(&goal, base.epoch()).len(), 2);
    }

    #[test]
    fn test_duplicate_clause_is_single_entry() {
        let base = RuleBase::new();
        let a = base.insert(rule("p(x)."));
        let b = base.insert(rule("p(x)."));
        assert_eq!(a, b);
        let goal = crate::term::parse_literal("p(X)").unwrap();
        assert_eq!(base.candidates(&goal, base.epoch()).len(), 1);
    }

    #[test]
    fn test_rule_id_ignores_variable_names() {
        assert_eq!(
            rule("p(X) :- q(X).").id(),
            rule("p(Other) :- q(Other).").id()
        );
        assert_ne!(rule("p(X) :- q(X).").id(), rule("p(X) :- q(Y).").id());
    }

    #[test]
    fn test_epoch_visibility() {
        let base = RuleBase::new();
        base.insert(rule("p(a)."));
        let before = base.epoch();
        base.insert(rule("p(b)."));
        let goal = crate::term::parse_literal("p(X)").unwrap();
        assert_eq!(base.candidates(&goal, before).len(), 1);
        assert_eq!(base.candidates(&goal, base.epoch()).len(), 2);
    }

    #[test]
    fn test_retract_by_origin() {
        let base = RuleBase::new();
        base.insert(rule("p(a)."));
        base.insert_ephemeral(rule("p(b)."), GoalId(7));
        base.insert_ephemeral(rule("p(c)."), GoalId(8));
        let closed = [GoalId(7)].into_iter().collect();
        assert_eq!(base.retract_by_origin(&closed), 1);
        let goal = crate::term::parse_literal("p(X)").unwrap();
        let visible = base.candidates(&goal, base.epoch());
        assert_eq!(visible.len(), 2);
        // Retraction is invisible to a step pinned to an older epoch.
        assert_eq!(base.candidates(&goal, base.epoch() - 1).len(), 3);
    }

    #[test]
    fn test_head_indicators() {
        let base = RuleBase::new();
        base.insert(rule("p(a)."));
        base.insert(rule("q(a, b) :- p(a)."));
        assert_eq!(base.head_indicators(), vec!["p/1", "q/2"]);
    }
}

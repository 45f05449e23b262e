//! Goal records and resolution frames.
//!
//! Goals are identified by id and connected by id-keyed adjacency sets;
//! tabled evaluation of mutually recursive predicates makes the consumer
//! graph cyclic, so nothing here owns anything else.

use crate::claims::ClaimId;
use crate::rules::RuleId;
use crate::term::{Literal, Subst};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Node-local goal identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalId(pub u64);

impl fmt::Display for GoalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Observable goal lifecycle, as reported by `etb.query_info`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoalState {
    Open,
    Pending,
    Resolved,
    Closed,
}

impl GoalState {
    pub fn as_str(self) -> &'static str {
        match self {
            GoalState::Open => "open",
            GoalState::Pending => "pending",
            GoalState::Resolved => "resolved",
            GoalState::Closed => "closed",
        }
    }
}

impl fmt::Display for GoalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recorded answer: the ground instance plus the claim witnessing it.
#[derive(Debug, Clone)]
pub struct AnswerRec {
    pub literal: Literal,
    pub claim: ClaimId,
}

/// A partially evaluated rule body. `head` and `remaining` come from a
/// renamed-apart rule; `subst` accumulates the bindings of discharged
/// body literals and `support` their witnessing claims.
#[derive(Debug, Clone)]
pub struct Frame {
    pub goal: GoalId,
    pub rule: RuleId,
    pub head: Literal,
    pub remaining: Vec<Literal>,
    pub subst: Subst,
    pub support: Vec<ClaimId>,
}

/// A frame suspended on a subgoal's answer stream. `instance` is the
/// instantiated body literal being awaited; each incoming answer is
/// unified against it under the frame's substitution.
#[derive(Debug, Clone)]
pub struct Waiter {
    pub frame: Frame,
    pub instance: Literal,
}

impl Waiter {
    /// Resume with one answer. `None` when the answer does not unify with
    /// this consumer's instance.
    pub fn resume(&self, answer: &Literal, claim: &ClaimId) -> Option<Frame> {
        let subst = crate::term::unify_literals(&self.instance, answer, &self.frame.subst)?;
        let mut support = self.frame.support.clone();
        support.push(claim.clone());
        Some(Frame {
            goal: self.frame.goal,
            rule: self.frame.rule.clone(),
            head: self.frame.head.clone(),
            remaining: self.frame.remaining.clone(),
            subst,
            support,
        })
    }
}

/// The evaluation record for one goal fingerprint. At most one of these
/// exists per fingerprint per node.
pub struct Goal {
    pub id: GoalId,
    /// Representative literal: the first literal admitted under this
    /// fingerprint. Consumers with differently named variables integrate
    /// answers by unification, so the choice of representative is
    /// immaterial.
    pub literal: Literal,
    pub answers: Vec<AnswerRec>,
    pub answer_keys: HashSet<String>,
    pub waiters: Vec<Waiter>,
    pub children: HashSet<GoalId>,
    pub parents: HashSet<GoalId>,
    /// Rules already resolved against this goal; re-expansion after a
    /// dynamic insertion only applies the difference (the table is
    /// additive).
    pub applied_rules: HashSet<RuleId>,
    /// Claims recorded on behalf of this goal, including error rows.
    pub claims: Vec<ClaimId>,
    /// Outstanding dispatched actions (wrapper invocation or remote
    /// delegation).
    pub inflight: usize,
    pub expanded: bool,
    pub closed: bool,
    pub resolved: bool,
}

impl Goal {
    pub fn new(id: GoalId, literal: Literal) -> Self {
        Goal {
            id,
            literal,
            answers: Vec::new(),
            answer_keys: HashSet::new(),
            waiters: Vec::new(),
            children: HashSet::new(),
            parents: HashSet::new(),
            applied_rules: HashSet::new(),
            claims: Vec::new(),
            inflight: 0,
            expanded: false,
            closed: false,
            resolved: false,
        }
    }

    /// Every dispatched action has returned and no further local step is
    /// possible. The completion check tests this over the whole consumer
    /// graph.
    pub fn is_quiescent(&self) -> bool {
        self.closed || (self.expanded && self.inflight == 0)
    }

    pub fn state(&self) -> GoalState {
        if self.closed {
            GoalState::Closed
        } else if self.inflight > 0 || !self.expanded {
            GoalState::Pending
        } else if self.resolved {
            GoalState::Resolved
        } else {
            GoalState::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::term::parse_literal;

    fn goal() -> Goal {
        Goal::new(GoalId(1), parse_literal("p(X)").unwrap())
    }

    #[test]
    fn test_state_follows_lifecycle() {
        let mut g = goal();
        // Admitted, expansion still queued.
        assert_eq!(g.state(), GoalState::Pending);
        assert!(!g.is_quiescent());

        g.expanded = true;
        assert_eq!(g.state(), GoalState::Open);
        assert!(g.is_quiescent());

        g.inflight = 1;
        assert_eq!(g.state(), GoalState::Pending);
        assert!(!g.is_quiescent());

        g.inflight = 0;
        g.resolved = true;
        assert_eq!(g.state(), GoalState::Resolved);

        g.closed = true;
        assert_eq!(g.state(), GoalState::Closed);
        assert!(g.is_quiescent());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(GoalState::Resolved.as_str(), "resolved");
        assert_eq!(GoalState::Pending.to_string(), "pending");
    }
}

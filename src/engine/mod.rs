//! # Goal Engine & Scheduler
//!
//! Goal-directed SLD resolution with tabling, run as a single actor that
//! owns the goal table. Workers are logically concurrent: wrapper
//! invocations, file fetches and remote delegations run as spawned tasks
//! outside the actor and re-enter through its queue, so operations on one
//! goal's state are serialised while distinct goals progress in parallel.
//!
//! Tabling: goals are keyed by fingerprint (canonical form of the literal
//! under a consistent variable renaming); a subgoal with an equivalent
//! fingerprint attaches to the existing record as a consumer of its
//! answer stream - at most one evaluation per fingerprint per node.
//! Answers are pushed to consumers incrementally, so mutually recursive
//! predicates make progress before every branch completes.
//!
//! A query completes when its root goal and every goal transitively
//! reachable from it are quiescent: all dispatched actions have returned
//! and the task queue holds nothing that could feed them.

mod goal;

pub use goal::{AnswerRec, Frame, Goal, GoalId, GoalState, Waiter};

use crate::claims::{error_literal, Claim, ClaimId, ClaimsTable, Evidence};
use crate::error::EtbError;
use crate::fabric::Fabric;
use crate::filestore::FileStore;
use crate::rules::{Rule, RuleBase, RuleId};
use crate::term::{unify_literals, FileRef, Literal, Subst};
use crate::wrappers::{Outcome, Wrapper, WrapperRegistry};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Client-visible query identity.
pub type QueryId = String;

/// Where a query came from. Remote queries stream their answers back to
/// the requesting peer as they arrive.
#[derive(Debug, Clone)]
pub enum QueryOrigin {
    Local,
    Remote {
        correlation: String,
        reply_host: String,
        reply_port: u16,
    },
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Overall deadline for one remote delegation.
    pub remote_deadline: Duration,
    /// Transport retries per provider before falling back or failing.
    pub remote_retries: u32,
    /// Engine-level wrapper deadline; `None` leaves deadlines to the
    /// wrappers themselves.
    pub wrapper_deadline: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            remote_deadline: Duration::from_secs(60),
            remote_retries: 3,
            wrapper_deadline: None,
        }
    }
}

/// Everything the engine evaluates against.
pub struct EngineDeps {
    pub rules: Arc<RuleBase>,
    pub wrappers: Arc<WrapperRegistry>,
    pub claims: Arc<ClaimsTable>,
    pub files: Arc<FileStore>,
    pub fabric: Arc<Fabric>,
    pub config: EngineConfig,
}

enum Task {
    Admit {
        literal: Literal,
        origin: QueryOrigin,
        reply: oneshot::Sender<QueryId>,
    },
    WrapperDone {
        goal: GoalId,
        outcome: Outcome,
    },
    DelegationDispatched {
        correlation: String,
        peer: String,
    },
    Delivered {
        correlation: String,
        subst: Subst,
        claim: ClaimId,
    },
    Closed {
        correlation: String,
    },
    DelegationFailed {
        correlation: String,
        error: String,
    },
    DelegationTimeout {
        correlation: String,
    },
    CloseQuery {
        id: QueryId,
    },
    Wait {
        id: QueryId,
        reply: oneshot::Sender<Option<watch::Receiver<bool>>>,
    },
    Status {
        id: QueryId,
        reply: oneshot::Sender<Option<bool>>,
    },
    Info {
        id: QueryId,
        reply: oneshot::Sender<Option<QueryInfo>>,
    },
    Answers {
        id: QueryId,
        reply: oneshot::Sender<Option<Vec<Subst>>>,
    },
    Claims {
        id: QueryId,
        errors_only: bool,
        reply: oneshot::Sender<Option<Vec<Claim>>>,
    },
    List {
        reply: oneshot::Sender<(Vec<QueryId>, Vec<QueryId>)>,
    },
    Shutdown,
}

/// Client-visible query metadata, served by `etb.query_info`.
#[derive(Debug, Clone)]
pub struct QueryInfo {
    pub id: QueryId,
    pub goal: GoalId,
    pub goal_state: GoalState,
    pub created: DateTime<Utc>,
    pub done: bool,
    /// Originating node id for local queries; the requester's reply
    /// address for delegated ones.
    pub origin: String,
}

struct QueryRec {
    literal: Literal,
    root: GoalId,
    created: DateTime<Utc>,
    origin: QueryOrigin,
    done: bool,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
    /// Ordered answer stream back to the requesting peer. Pushes go
    /// through one task per correlation so `closed` can never overtake a
    /// `deliver_answer`.
    sink: Option<mpsc::UnboundedSender<SinkMsg>>,
}

enum SinkMsg {
    Answer(Subst, ClaimId),
    Closed,
}

/// Sequential pusher for one remote-origin query.
fn spawn_sink(correlation: String, reply_host: &str, reply_port: u16) -> mpsc::UnboundedSender<SinkMsg> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = crate::rpc::PeerClient::new(reply_host, reply_port);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                SinkMsg::Answer(subst, claim) => {
                    if let Err(e) = client.deliver_answer(&correlation, &subst, &claim.0).await {
                        warn!(correlation = %correlation, error = %e, "deliver_answer failed");
                    }
                }
                SinkMsg::Closed => {
                    if let Err(e) = client.closed(&correlation).await {
                        warn!(correlation = %correlation, error = %e, "closed push failed");
                    }
                    break;
                }
            }
        }
    });
    tx
}

struct Delegation {
    goal: GoalId,
    peer: String,
}

#[derive(Default)]
struct EngineState {
    goals: HashMap<GoalId, Goal>,
    by_fingerprint: HashMap<String, GoalId>,
    queries: HashMap<QueryId, QueryRec>,
    query_order: Vec<QueryId>,
    /// Root goal -> queries rooted there (remote sinks hang off these).
    roots: HashMap<GoalId, Vec<QueryId>>,
    delegations: HashMap<String, Delegation>,
    next_goal: u64,
}

/// Handle to the engine actor. Cheap to clone; all operations enqueue
/// onto the actor's task queue.
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::UnboundedSender<Task>,
    pending: Arc<AtomicUsize>,
}

impl Engine {
    /// Spawn the scheduler loop.
    pub fn start(deps: EngineDeps) -> Engine {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Engine {
            tx,
            pending: Arc::new(AtomicUsize::new(0)),
        };
        let actor = Actor {
            state: EngineState::default(),
            deps,
            handle: engine.clone(),
            work: VecDeque::new(),
        };
        tokio::spawn(actor.run(rx));
        engine
    }

    fn send(&self, task: Task) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Task,
    ) -> Result<T, EtbError> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx));
        rx.await.map_err(|_| EtbError::EngineStopped)
    }

    /// Admit a parsed goal as a new query.
    pub async fn admit(&self, literal: Literal) -> Result<QueryId, EtbError> {
        self.request(|reply| Task::Admit {
            literal,
            origin: QueryOrigin::Local,
            reply,
        })
        .await
    }

    /// Admit a goal delegated by a peer; answers stream back to the
    /// given reply address tagged with the correlation id.
    pub async fn admit_remote(
        &self,
        literal: Literal,
        correlation: String,
        reply_host: String,
        reply_port: u16,
    ) -> Result<QueryId, EtbError> {
        self.request(|reply| Task::Admit {
            literal,
            origin: QueryOrigin::Remote {
                correlation,
                reply_host,
                reply_port,
            },
            reply,
        })
        .await
    }

    /// Block until the query completes.
    pub async fn wait(&self, id: &str) -> Result<(), EtbError> {
        let rx = self
            .request(|reply| Task::Wait {
                id: id.to_string(),
                reply,
            })
            .await?;
        let Some(mut rx) = rx else {
            return Err(EtbError::UnknownQuery(id.to_string()));
        };
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    pub async fn done(&self, id: &str) -> Result<bool, EtbError> {
        self.request(|reply| Task::Status {
            id: id.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| EtbError::UnknownQuery(id.to_string()))
    }

    /// Metadata for one query: creation time, root goal and its state,
    /// origin.
    pub async fn info(&self, id: &str) -> Result<QueryInfo, EtbError> {
        self.request(|reply| Task::Info {
            id: id.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| EtbError::UnknownQuery(id.to_string()))
    }

    pub async fn answers(&self, id: &str) -> Result<Vec<Subst>, EtbError> {
        self.request(|reply| Task::Answers {
            id: id.to_string(),
            reply,
        })
        .await?
        .ok_or_else(|| EtbError::UnknownQuery(id.to_string()))
    }

    pub async fn claims(&self, id: &str) -> Result<Vec<Claim>, EtbError> {
        self.query_claims(id, false).await
    }

    pub async fn errors(&self, id: &str) -> Result<Vec<Claim>, EtbError> {
        self.query_claims(id, true).await
    }

    async fn query_claims(&self, id: &str, errors_only: bool) -> Result<Vec<Claim>, EtbError> {
        self.request(|reply| Task::Claims {
            id: id.to_string(),
            errors_only,
            reply,
        })
        .await?
        .ok_or_else(|| EtbError::UnknownQuery(id.to_string()))
    }

    pub async fn list_queries(&self) -> Result<(Vec<QueryId>, Vec<QueryId>), EtbError> {
        self.request(|reply| Task::List { reply }).await
    }

    pub fn close_query(&self, id: &str) {
        self.send(Task::CloseQuery { id: id.to_string() });
    }

    /// Inbound `deliver_answer` from a provider peer.
    pub fn deliver_answer(&self, correlation: String, subst: Subst, claim: ClaimId) {
        self.send(Task::Delivered {
            correlation,
            subst,
            claim,
        });
    }

    /// Inbound `closed`: either a provider reporting quiescence to us, or
    /// a requester cancelling a query it delegated to us.
    pub fn closed(&self, correlation: String) {
        self.send(Task::Closed { correlation });
    }

    pub fn shutdown(&self) {
        self.send(Task::Shutdown);
    }
}

enum Work {
    Frame(Frame),
    Expand(GoalId),
}

struct Actor {
    state: EngineState,
    deps: EngineDeps,
    handle: Engine,
    work: VecDeque<Work>,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Task>) {
        info!("engine started");
        while let Some(task) = rx.recv().await {
            let stop = matches!(task, Task::Shutdown);
            self.handle_task(task);
            self.drive();
            self.handle.pending.fetch_sub(1, Ordering::SeqCst);
            if self.handle.pending.load(Ordering::SeqCst) == 0 {
                self.check_completion();
            }
            if stop {
                break;
            }
        }
        info!("engine stopped");
    }

    fn handle_task(&mut self, task: Task) {
        match task {
            Task::Admit {
                literal,
                origin,
                reply,
            } => {
                let id = self.admit(literal, origin);
                let _ = reply.send(id);
            }
            Task::WrapperDone { goal, outcome } => self.wrapper_done(goal, outcome),
            Task::DelegationDispatched { correlation, peer } => {
                if let Some(d) = self.state.delegations.get_mut(&correlation) {
                    d.peer = peer;
                }
            }
            Task::Delivered {
                correlation,
                subst,
                claim,
            } => self.remote_answer(&correlation, &subst, claim),
            Task::Closed { correlation } => self.closed(&correlation),
            Task::DelegationFailed { correlation, error } => {
                self.delegation_failed(&correlation, &error);
            }
            Task::DelegationTimeout { correlation } => {
                let deadline = self.deps.config.remote_deadline;
                self.delegation_failed(
                    &correlation,
                    &format!("remote deadline of {deadline:?} expired"),
                );
            }
            Task::CloseQuery { id } => self.close_query(&id),
            Task::Wait { id, reply } => {
                let rx = self.state.queries.get(&id).map(|q| q.done_rx.clone());
                let _ = reply.send(rx);
            }
            Task::Status { id, reply } => {
                let _ = reply.send(self.state.queries.get(&id).map(|q| q.done));
            }
            Task::Info { id, reply } => {
                let _ = reply.send(self.info_for(&id));
            }
            Task::Answers { id, reply } => {
                let _ = reply.send(self.answers_for(&id));
            }
            Task::Claims {
                id,
                errors_only,
                reply,
            } => {
                let _ = reply.send(self.claims_for(&id, errors_only));
            }
            Task::List { reply } => {
                let mut active = Vec::new();
                let mut done = Vec::new();
                for id in &self.state.query_order {
                    if let Some(q) = self.state.queries.get(id) {
                        if q.done {
                            done.push(id.clone());
                        } else {
                            active.push(id.clone());
                        }
                    }
                }
                let _ = reply.send((active, done));
            }
            Task::Shutdown => {}
        }
    }

    /// Drain the in-actor work queue: frame resolution and goal
    /// expansion, until no local step remains.
    fn drive(&mut self) {
        while let Some(item) = self.work.pop_front() {
            match item {
                Work::Frame(frame) => self.process_frame(frame),
                Work::Expand(goal) => self.expand(goal),
            }
        }
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn admit(&mut self, literal: Literal, origin: QueryOrigin) -> QueryId {
        let id = uuid::Uuid::new_v4().to_string();
        let (root, fresh) = self.intern_goal(literal.clone());
        let (done_tx, done_rx) = watch::channel(false);
        debug!(query = %id, goal = %root, %literal, fresh, "query admitted");
        let sink = match &origin {
            QueryOrigin::Remote {
                correlation,
                reply_host,
                reply_port,
            } => Some(spawn_sink(correlation.clone(), reply_host, *reply_port)),
            QueryOrigin::Local => None,
        };
        self.state.queries.insert(
            id.clone(),
            QueryRec {
                literal,
                root,
                created: Utc::now(),
                origin: origin.clone(),
                done: false,
                done_tx,
                done_rx,
                sink,
            },
        );
        self.state.query_order.push(id.clone());
        self.state.roots.entry(root).or_default().push(id.clone());
        if fresh {
            self.work.push_back(Work::Expand(root));
        } else if let QueryOrigin::Remote { .. } = origin {
            // An aliased root may already hold answers; replay them to
            // the requesting peer.
            let answers: Vec<AnswerRec> = self
                .state
                .goals
                .get(&root)
                .map(|g| g.answers.clone())
                .unwrap_or_default();
            for answer in answers {
                self.push_to_sink(&id, &answer);
            }
        }
        id
    }

    fn intern_goal(&mut self, literal: Literal) -> (GoalId, bool) {
        let fingerprint = literal.fingerprint();
        if let Some(&id) = self.state.by_fingerprint.get(&fingerprint) {
            return (id, false);
        }
        let id = GoalId(self.state.next_goal);
        self.state.next_goal += 1;
        self.state.by_fingerprint.insert(fingerprint, id);
        self.state.goals.insert(id, Goal::new(id, literal));
        (id, true)
    }

    // ------------------------------------------------------------------
    // Resolution
    // ------------------------------------------------------------------

    fn expand(&mut self, gid: GoalId) {
        let literal = match self.state.goals.get_mut(&gid) {
            Some(goal) if !goal.closed && !goal.expanded => {
                goal.expanded = true;
                goal.literal.clone()
            }
            _ => return,
        };
        debug!(goal = %gid, %literal, "expanding goal");

        let epoch = self.deps.rules.epoch();
        for (rule_id, rule) in self.deps.rules.candidates(&literal, epoch) {
            self.apply_rule(gid, rule_id, &rule);
        }

        if let Some(wrapper) = self.deps.wrappers.get(&literal.pred) {
            self.dispatch_wrapper(gid, literal, wrapper);
        } else if !self.deps.rules.defines(&literal.pred, literal.arity()) {
            self.dispatch_delegation(gid, literal);
        }
    }

    fn apply_rule(&mut self, gid: GoalId, rule_id: RuleId, rule: &Rule) {
        let literal = match self.state.goals.get_mut(&gid) {
            Some(goal) if !goal.closed => {
                if !goal.applied_rules.insert(rule_id.clone()) {
                    return;
                }
                goal.literal.clone()
            }
            _ => return,
        };
        let (head, body) = crate::term::rename_apart(&rule.head, &rule.body);
        let Some(subst) = unify_literals(&literal, &head, &Subst::new()) else {
            return;
        };
        self.work.push_back(Work::Frame(Frame {
            goal: gid,
            rule: rule_id,
            head,
            remaining: body,
            subst,
            support: Vec::new(),
        }));
    }

    fn process_frame(&mut self, mut frame: Frame) {
        if self
            .state
            .goals
            .get(&frame.goal)
            .is_none_or(|g| g.closed)
        {
            return;
        }
        if frame.remaining.is_empty() {
            let answer = frame.subst.apply_literal(&frame.head);
            if !answer.is_ground() {
                warn!(goal = %frame.goal, %answer, "dropping non-ground answer");
                return;
            }
            let evidence = if frame.support.is_empty() {
                Evidence::Fact { rule: frame.rule }
            } else {
                Evidence::RuleInstance {
                    rule: frame.rule,
                    support: frame.support,
                }
            };
            let (claim, _) = self.deps.claims.record(answer.clone(), evidence);
            self.attach_claim(frame.goal, &claim);
            self.add_answer(frame.goal, answer, claim);
            return;
        }

        let next = frame.remaining.remove(0);
        let instance = frame.subst.apply_literal(&next);
        let (child, fresh) = self.intern_goal(instance.clone());
        if let Some(goal) = self.state.goals.get_mut(&frame.goal) {
            goal.children.insert(child);
        }
        let parent = frame.goal;
        let waiter = Waiter { frame, instance };
        let existing = match self.state.goals.get_mut(&child) {
            Some(goal) => {
                goal.parents.insert(parent);
                goal.waiters.push(waiter.clone());
                goal.answers.clone()
            }
            None => return,
        };
        if fresh {
            self.work.push_back(Work::Expand(child));
        }
        for answer in existing {
            if let Some(resumed) = waiter.resume(&answer.literal, &answer.claim) {
                self.work.push_back(Work::Frame(resumed));
            }
        }
    }

    fn add_answer(&mut self, gid: GoalId, literal: Literal, claim: ClaimId) {
        let waiters = match self.state.goals.get_mut(&gid) {
            Some(goal) => {
                if goal.closed || !goal.answer_keys.insert(literal.canonical()) {
                    return;
                }
                goal.answers.push(AnswerRec {
                    literal: literal.clone(),
                    claim: claim.clone(),
                });
                goal.waiters.clone()
            }
            None => return,
        };
        debug!(goal = %gid, answer = %literal, "new answer");
        for waiter in waiters {
            if let Some(frame) = waiter.resume(&literal, &claim) {
                self.work.push_back(Work::Frame(frame));
            }
        }
        let answer = AnswerRec { literal, claim };
        if let Some(query_ids) = self.state.roots.get(&gid).cloned() {
            for query_id in query_ids {
                self.push_to_sink(&query_id, &answer);
            }
        }
    }

    fn attach_claim(&mut self, gid: GoalId, claim: &ClaimId) {
        if let Some(goal) = self.state.goals.get_mut(&gid) {
            if !goal.claims.contains(claim) {
                goal.claims.push(claim.clone());
            }
        }
    }

    fn record_error(&mut self, gid: GoalId, source: &str, messages: Vec<String>) {
        let Some(goal) = self.state.goals.get(&gid) else {
            return;
        };
        let literal = error_literal(&goal.literal, &messages);
        warn!(goal = %gid, source, ?messages, "goal error");
        let (claim, _) = self.deps.claims.record(
            literal,
            Evidence::Error {
                source: source.to_string(),
            },
        );
        self.attach_claim(gid, &claim);
    }

    // ------------------------------------------------------------------
    // Wrappers
    // ------------------------------------------------------------------

    fn dispatch_wrapper(&mut self, gid: GoalId, literal: Literal, wrapper: Arc<dyn Wrapper>) {
        let violations = wrapper.signature().mode_violations(&literal);
        if !violations.is_empty() {
            self.record_error(gid, &literal.pred, violations);
            return;
        }
        let needed: Vec<FileRef> = wrapper
            .signature()
            .input_file_refs(&literal)
            .into_iter()
            .cloned()
            .collect();
        if let Some(goal) = self.state.goals.get_mut(&gid) {
            goal.inflight += 1;
        }
        let handle = self.handle.clone();
        let files = Arc::clone(&self.deps.files);
        let fabric = Arc::clone(&self.deps.fabric);
        let deadline = self.deps.config.wrapper_deadline;
        tokio::spawn(async move {
            for fr in &needed {
                if let Err(message) = sync_blob(&fabric, &files, fr).await {
                    handle.send(Task::WrapperDone {
                        goal: gid,
                        outcome: Outcome::Errors(vec![message]),
                    });
                    return;
                }
            }
            let outcome = match deadline {
                Some(limit) => match tokio::time::timeout(limit, wrapper.resolve(&literal)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::Errors(vec![format!(
                        "wrapper {} exceeded its deadline of {limit:?}",
                        literal.pred
                    )]),
                },
                None => wrapper.resolve(&literal).await,
            };
            handle.send(Task::WrapperDone { goal: gid, outcome });
        });
    }

    fn wrapper_done(&mut self, gid: GoalId, outcome: Outcome) {
        let literal = match self.state.goals.get_mut(&gid) {
            Some(goal) => {
                goal.inflight = goal.inflight.saturating_sub(1);
                if goal.closed {
                    return;
                }
                goal.literal.clone()
            }
            None => return,
        };
        match outcome {
            Outcome::Success => {
                if literal.is_ground() {
                    self.wrapper_answer(gid, &literal, literal.clone(), Subst::new());
                } else {
                    self.record_error(
                        gid,
                        &literal.pred,
                        vec!["success outcome on a non-ground goal".to_string()],
                    );
                }
            }
            Outcome::Failure => {}
            Outcome::Substitutions(substs) => {
                for subst in substs {
                    let restricted = subst.restrict(&literal.variables());
                    let answer = restricted.apply_literal(&literal);
                    if answer.is_ground() {
                        self.wrapper_answer(gid, &literal, answer, restricted);
                    } else {
                        self.record_error(
                            gid,
                            &literal.pred,
                            vec![format!("substitution left goal non-ground: {answer}")],
                        );
                    }
                }
            }
            Outcome::Queries(substs, subgoals) => {
                for subst in &substs {
                    for subgoal in &subgoals {
                        let rule = Rule::new(
                            subst.apply_literal(&literal),
                            vec![subst.apply_literal(subgoal)],
                        );
                        self.deps.rules.insert_ephemeral(rule, gid);
                    }
                }
                self.reapply_rules(&literal);
            }
            Outcome::Lemmata(substs, bodies) => {
                if substs.len() != bodies.len() {
                    self.record_error(
                        gid,
                        &literal.pred,
                        vec![format!(
                            "lemmata outcome with {} substitutions but {} bodies",
                            substs.len(),
                            bodies.len()
                        )],
                    );
                    return;
                }
                for (subst, body) in substs.iter().zip(&bodies) {
                    let rule = Rule::new(
                        subst.apply_literal(&literal),
                        body.iter().map(|l| subst.apply_literal(l)).collect(),
                    );
                    self.deps.rules.insert_ephemeral(rule, gid);
                }
                self.reapply_rules(&literal);
            }
            Outcome::Errors(messages) => {
                self.record_error(gid, &literal.pred, messages);
            }
        }
    }

    fn wrapper_answer(&mut self, gid: GoalId, goal_lit: &Literal, answer: Literal, binding: Subst) {
        let (claim, _) = self.deps.claims.record(
            answer.clone(),
            Evidence::Wrapper {
                name: goal_lit.pred.clone(),
                args_digest: goal_lit.fingerprint(),
                binding,
            },
        );
        self.attach_claim(gid, &claim);
        self.add_answer(gid, answer, claim);
    }

    /// After a dynamic rule insertion, resolve the not-yet-applied rules
    /// against every open goal with a matching head. Previously computed
    /// answers are untouched; the table is additive.
    fn reapply_rules(&mut self, literal: &Literal) {
        let epoch = self.deps.rules.epoch();
        let targets: Vec<GoalId> = self
            .state
            .goals
            .values()
            .filter(|g| {
                !g.closed
                    && g.expanded
                    && g.literal.pred == literal.pred
                    && g.literal.arity() == literal.arity()
            })
            .map(|g| g.id)
            .collect();
        for gid in targets {
            let goal_lit = match self.state.goals.get(&gid) {
                Some(g) => g.literal.clone(),
                None => continue,
            };
            for (rule_id, rule) in self.deps.rules.candidates(&goal_lit, epoch) {
                self.apply_rule(gid, rule_id, &rule);
            }
        }
    }

    // ------------------------------------------------------------------
    // Remote delegation
    // ------------------------------------------------------------------

    fn dispatch_delegation(&mut self, gid: GoalId, literal: Literal) {
        let indicator = literal.indicator();
        let providers = self.deps.fabric.providers(&indicator);
        if providers.is_empty() {
            self.record_error(
                gid,
                "engine",
                vec![format!("unknown predicate {indicator}")],
            );
            return;
        }
        let correlation = uuid::Uuid::new_v4().to_string();
        if let Some(goal) = self.state.goals.get_mut(&gid) {
            goal.inflight += 1;
        }
        self.state.delegations.insert(
            correlation.clone(),
            Delegation {
                goal: gid,
                peer: providers[0].descriptor.id.clone(),
            },
        );
        debug!(goal = %gid, %literal, %correlation, "delegating to fabric");

        let handle = self.handle.clone();
        let fabric = Arc::clone(&self.deps.fabric);
        let retries = self.deps.config.remote_retries;
        let deadline = self.deps.config.remote_deadline;
        let goal_text = literal.to_string();
        tokio::spawn(async move {
            let mut last_error = String::from("no providers reachable");
            for provider in providers {
                let client = provider.client();
                let peer_id = provider.descriptor.id.clone();
                let (reply_host, reply_port) = fabric.callback_addr(&peer_id);
                for _ in 0..retries.max(1) {
                    let call =
                        client.remote_query(&goal_text, &correlation, &reply_host, reply_port);
                    match tokio::time::timeout(deadline, call).await {
                        Ok(Ok(())) => {
                            fabric.touch(&peer_id);
                            handle.send(Task::DelegationDispatched {
                                correlation: correlation.clone(),
                                peer: peer_id,
                            });
                            // Watchdog: if the provider never reports
                            // closure the delegation fails at the deadline.
                            tokio::time::sleep(deadline).await;
                            handle.send(Task::DelegationTimeout { correlation });
                            return;
                        }
                        Ok(Err(e)) => last_error = e.to_string(),
                        Err(_) => last_error = format!("no response within {deadline:?}"),
                    }
                }
                warn!(peer = %peer_id, error = %last_error, "provider failed; trying next");
                fabric.mark_unreachable(&peer_id);
            }
            handle.send(Task::DelegationFailed {
                correlation,
                error: last_error,
            });
        });
    }

    fn remote_answer(&mut self, correlation: &str, subst: &Subst, claim: ClaimId) {
        let (gid, peer) = match self.state.delegations.get(correlation) {
            Some(d) => (d.goal, d.peer.clone()),
            None => {
                debug!(correlation, "answer for unknown delegation dropped");
                return;
            }
        };
        let literal = match self.state.goals.get(&gid) {
            Some(goal) => goal.literal.clone(),
            None => return,
        };
        let answer = subst.apply_literal(&literal);
        if !answer.is_ground() {
            warn!(goal = %gid, %answer, "dropping non-ground remote answer");
            return;
        }
        self.deps.fabric.touch(&peer);
        let (recorded, _) = self
            .deps
            .claims
            .record(answer.clone(), Evidence::Remote { peer, claim });
        self.attach_claim(gid, &recorded);
        self.add_answer(gid, answer, recorded);
    }

    fn closed(&mut self, correlation: &str) {
        // Requester side: a provider we delegated to reports quiescence.
        if let Some(delegation) = self.state.delegations.remove(correlation) {
            if let Some(goal) = self.state.goals.get_mut(&delegation.goal) {
                goal.inflight = goal.inflight.saturating_sub(1);
            }
            debug!(correlation, goal = %delegation.goal, "delegation closed");
            return;
        }
        // Provider side: a requester cancels a query it delegated to us.
        let query = self.state.queries.iter().find_map(|(id, q)| match &q.origin {
            QueryOrigin::Remote { correlation: c, .. } if c == correlation => Some(id.clone()),
            _ => None,
        });
        if let Some(id) = query {
            self.close_query(&id);
        }
    }

    fn delegation_failed(&mut self, correlation: &str, error: &str) {
        let Some(delegation) = self.state.delegations.remove(correlation) else {
            return;
        };
        if let Some(goal) = self.state.goals.get_mut(&delegation.goal) {
            goal.inflight = goal.inflight.saturating_sub(1);
        }
        self.record_error(
            delegation.goal,
            "fabric",
            vec![format!("remote delegation failed: {error}")],
        );
    }

    /// Stream one answer of a remote-origin query back to its requester.
    fn push_to_sink(&self, query_id: &str, answer: &AnswerRec) {
        let Some(query) = self.state.queries.get(query_id) else {
            return;
        };
        let Some(sink) = &query.sink else {
            return;
        };
        if query.done {
            return;
        }
        let Some(subst) = unify_literals(&query.literal, &answer.literal, &Subst::new()) else {
            return;
        };
        let subst = subst.restrict(&query.literal.variables());
        let _ = sink.send(SinkMsg::Answer(subst, answer.claim.clone()));
    }

    // ------------------------------------------------------------------
    // Completion & cancellation
    // ------------------------------------------------------------------

    fn reachable(&self, root: GoalId) -> HashSet<GoalId> {
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(gid) = stack.pop() {
            if !seen.insert(gid) {
                continue;
            }
            if let Some(goal) = self.state.goals.get(&gid) {
                stack.extend(goal.children.iter().copied());
            }
        }
        seen
    }

    /// A query completes when every goal reachable from its root is
    /// quiescent. Called whenever the task queue drains.
    fn check_completion(&mut self) {
        let candidates: Vec<QueryId> = self
            .state
            .queries
            .iter()
            .filter(|(_, q)| !q.done)
            .map(|(id, _)| id.clone())
            .collect();
        for id in candidates {
            let Some(root) = self.state.queries.get(&id).map(|q| q.root) else {
                continue;
            };
            let reachable = self.reachable(root);
            let quiescent = reachable
                .iter()
                .all(|gid| self.state.goals.get(gid).is_none_or(Goal::is_quiescent));
            if !quiescent {
                continue;
            }
            for gid in &reachable {
                if let Some(goal) = self.state.goals.get_mut(gid) {
                    goal.resolved = true;
                }
            }
            if let Some(query) = self.state.queries.get_mut(&id) {
                if let Some(sink) = query.sink.take() {
                    let _ = sink.send(SinkMsg::Closed);
                }
                query.done = true;
                let _ = query.done_tx.send(true);
                info!(query = %id, "query completed");
            }
        }
    }

    /// Close a query: its root goal and every goal exclusively consumed
    /// by it are closed, ephemeral rules they introduced are retracted
    /// atomically, and outstanding delegations are notified.
    fn close_query(&mut self, id: &str) {
        let Some(root) = self.state.queries.get(id).map(|q| q.root) else {
            return;
        };
        let mine = self.reachable(root);
        let mut others: HashSet<GoalId> = HashSet::new();
        for (other_id, other) in &self.state.queries {
            if other_id != id {
                others.extend(self.reachable(other.root));
            }
        }
        let exclusive: HashSet<GoalId> = mine.difference(&others).copied().collect();
        info!(query = %id, closing = exclusive.len(), "closing query");

        for gid in &exclusive {
            if let Some(goal) = self.state.goals.get_mut(gid) {
                goal.closed = true;
                goal.waiters.clear();
            }
        }

        let retracted = self.deps.rules.retract_by_origin(&exclusive);
        if retracted > 0 {
            debug!(query = %id, retracted, "retracted ephemeral rules");
        }

        // Notify providers of outstanding delegations owned by the
        // closed subtree.
        let cancelled: Vec<(String, String)> = self
            .state
            .delegations
            .iter()
            .filter(|(_, d)| exclusive.contains(&d.goal))
            .map(|(corr, d)| (corr.clone(), d.peer.clone()))
            .collect();
        for (correlation, peer_id) in cancelled {
            self.state.delegations.remove(&correlation);
            if let Some(peer) = self.deps.fabric.peer(&peer_id) {
                let client = peer.client();
                tokio::spawn(async move {
                    let _ = client.closed(&correlation).await;
                });
            }
        }

        if let Some(query) = self.state.queries.get_mut(id) {
            if let Some(sink) = query.sink.take() {
                let _ = sink.send(SinkMsg::Closed);
            }
            query.done = true;
            let _ = query.done_tx.send(true);
        }
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    fn info_for(&self, id: &str) -> Option<QueryInfo> {
        let query = self.state.queries.get(id)?;
        let goal = self.state.goals.get(&query.root)?;
        let origin = match &query.origin {
            QueryOrigin::Local => self.deps.fabric.self_id().to_string(),
            QueryOrigin::Remote {
                reply_host,
                reply_port,
                ..
            } => format!("{reply_host}:{reply_port}"),
        };
        Some(QueryInfo {
            id: id.to_string(),
            goal: query.root,
            goal_state: goal.state(),
            created: query.created,
            done: query.done,
            origin,
        })
    }

    fn answers_for(&self, id: &str) -> Option<Vec<Subst>> {
        let query = self.state.queries.get(id)?;
        let goal = self.state.goals.get(&query.root)?;
        let vars = query.literal.variables();
        Some(
            goal.answers
                .iter()
                .filter_map(|a| unify_literals(&query.literal, &a.literal, &Subst::new()))
                .map(|s| s.restrict(&vars))
                .collect(),
        )
    }

    fn claims_for(&self, id: &str, errors_only: bool) -> Option<Vec<Claim>> {
        let query = self.state.queries.get(id)?;
        let mut goal_ids: Vec<GoalId> = self.reachable(query.root).into_iter().collect();
        goal_ids.sort_by_key(|g| g.0);
        let mut seen = HashSet::new();
        let mut claims = Vec::new();
        for gid in goal_ids {
            let Some(goal) = self.state.goals.get(&gid) else {
                continue;
            };
            for claim_id in &goal.claims {
                if !seen.insert(claim_id.clone()) {
                    continue;
                }
                if let Some(claim) = self.deps.claims.get(claim_id) {
                    if !errors_only || claim.is_error() {
                        claims.push(claim);
                    }
                }
            }
        }
        Some(claims)
    }
}

/// Make a blob locally resolvable, pulling it from the first peer that
/// answers. Integrity is re-verified after transfer; a mismatch fails the
/// fetch.
async fn sync_blob(fabric: &Fabric, files: &FileStore, fr: &FileRef) -> Result<(), String> {
    if files.has(&fr.sha1) {
        return Ok(());
    }
    for peer in fabric.peers() {
        if !peer.reachable {
            continue;
        }
        let client = peer.client();
        match client.get_file(fr).await {
            Ok(bytes) => {
                return files.store_fetched(fr, &bytes).map_err(|e| e.to_string());
            }
            Err(e) => {
                debug!(peer = %peer.descriptor.id, error = %e, "peer could not serve blob");
            }
        }
    }
    Err(format!("no reachable peer stores {fr}"))
}

//! # Node
//!
//! The per-process instance: rule base, wrapper registry, claims table,
//! file store, fabric and engine, wired together with an explicit init
//! and shutdown - no implicit singletons. The methods here are the
//! client API; the remote surface in [`crate::rpc::server`] is a thin
//! XML-RPC skin over them.

use crate::claims::{Claim, ClaimsTable};
use crate::config::Config;
use crate::engine::{Engine, EngineDeps, QueryId};
use crate::error::{EtbError, EtbResult};
use crate::fabric::Fabric;
use crate::filestore::{FileStore, LsReport, StoreError};
use crate::rules::RuleBase;
use crate::term::{parse_literal, parse_rule_file, FileRef, Subst};
use crate::wrappers::{builtins::InRange, WrapperRegistry};
use serde_json::Value as Json;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct Node {
    id: String,
    config: Config,
    pub rules: Arc<RuleBase>,
    pub wrappers: Arc<WrapperRegistry>,
    pub claims: Arc<ClaimsTable>,
    pub files: Arc<FileStore>,
    pub fabric: Arc<Fabric>,
    pub engine: Engine,
}

impl Node {
    /// Bring a node up from configuration: open the file store, load
    /// rule files and wrapper manifests, start the engine. Must run
    /// inside a tokio runtime.
    pub fn init(config: Config) -> EtbResult<Arc<Node>> {
        let id = uuid::Uuid::new_v4().to_string();
        info!(node = %id, host = %config.node.host, port = config.node.port, "initialising node");

        let files = Arc::new(FileStore::open(&config.node.data_dir)?);
        let rules = Arc::new(RuleBase::new());
        let wrappers = Arc::new(WrapperRegistry::new());
        let claims = Arc::new(ClaimsTable::new());
        let fabric = Arc::new(Fabric::new(
            id.clone(),
            config.node.host.clone(),
            config.node.port,
        ));

        wrappers.register(Arc::new(InRange::new()));
        if let Some(dir) = &config.node.wrappers_dir {
            let loaded = crate::wrappers::exec::load_wrapper_dir(dir, &wrappers, &files)?;
            info!(dir = %dir.display(), loaded, "loaded wrapper manifests");
        }
        for path in &config.node.rule_files {
            let text = std::fs::read_to_string(path)?;
            let parsed = parse_rule_file(&text)?;
            let count = parsed.len();
            for rule in parsed {
                rules.insert(rule);
            }
            info!(file = %path.display(), rules = count, "loaded rule file");
        }

        let engine = Engine::start(EngineDeps {
            rules: Arc::clone(&rules),
            wrappers: Arc::clone(&wrappers),
            claims: Arc::clone(&claims),
            files: Arc::clone(&files),
            fabric: Arc::clone(&fabric),
            config: config.engine_config(),
        });

        let node = Arc::new(Node {
            id,
            config,
            rules,
            wrappers,
            claims,
            files,
            fabric,
            engine,
        });
        node.refresh_advertisement();
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Recompute the predicate advertisement (rule heads + wrapper
    /// names) the fabric gossips on our behalf.
    pub fn refresh_advertisement(&self) {
        let mut predicates = self.rules.head_indicators();
        predicates.extend(self.wrappers.indicators());
        self.fabric.set_local_predicates(predicates);
    }

    pub fn shutdown(&self) {
        info!(node = %self.id, "shutting down");
        self.engine.shutdown();
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    pub fn put_file(&self, bytes: &[u8], dest_path: &str) -> EtbResult<FileRef> {
        Ok(self.files.put(bytes, dest_path)?)
    }

    /// Materialise a reference's bytes: locally stored, or pulled from
    /// the first peer that answers. A reference nobody stores any more
    /// yields a stale-blob error.
    pub async fn get_file(&self, fr: &FileRef) -> EtbResult<Vec<u8>> {
        if let Ok(bytes) = self.files.get(fr) {
            return Ok(bytes);
        }
        for peer in self.fabric.peers() {
            if !peer.reachable {
                continue;
            }
            if let Ok(bytes) = peer.client().get_file(fr).await {
                self.files.store_fetched(fr, &bytes)?;
                return Ok(self.files.get(fr)?);
            }
        }
        Err(EtbError::Store(StoreError::UnknownBlob(fr.to_string())))
    }

    pub fn ls(&self, dir: &str) -> EtbResult<LsReport> {
        Ok(self.files.ls(dir)?)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub async fn query(&self, goal: &str) -> EtbResult<QueryId> {
        let literal = parse_literal(goal)?;
        self.engine.admit(literal).await
    }

    pub async fn query_wait(&self, id: &str) -> EtbResult<()> {
        self.engine.wait(id).await
    }

    pub async fn query_done(&self, id: &str) -> EtbResult<bool> {
        self.engine.done(id).await
    }

    pub async fn query_info(&self, id: &str) -> EtbResult<crate::engine::QueryInfo> {
        self.engine.info(id).await
    }

    pub async fn query_answers(&self, id: &str) -> EtbResult<Vec<Subst>> {
        self.engine.answers(id).await
    }

    pub async fn query_claims(&self, id: &str) -> EtbResult<Vec<Claim>> {
        self.engine.claims(id).await
    }

    pub async fn query_errors(&self, id: &str) -> EtbResult<Vec<Claim>> {
        self.engine.errors(id).await
    }

    pub fn query_close(&self, id: &str) {
        self.engine.close_query(id);
    }

    pub fn get_all_claims(&self) -> Vec<Claim> {
        self.claims.all()
    }

    pub async fn active_queries(&self) -> EtbResult<Vec<QueryId>> {
        Ok(self.engine.list_queries().await?.0)
    }

    pub async fn done_queries(&self) -> EtbResult<Vec<QueryId>> {
        Ok(self.engine.list_queries().await?.1)
    }

    // ------------------------------------------------------------------
    // Fabric
    // ------------------------------------------------------------------

    pub async fn connect(&self, host: &str, port: u16) -> EtbResult<()> {
        self.fabric.connect(host, port).await?;
        // Membership changed: let the rest of the fabric know.
        self.fabric.gossip().await;
        Ok(())
    }

    pub fn tunnel(&self, local_port: u16, remote_port: u16) {
        self.fabric.add_tunnel(local_port, remote_port);
    }

    /// Does this node offer `pred/arity`, by rule or by wrapper?
    pub fn offers(&self, indicator: &str) -> bool {
        let Some((pred, arity)) = indicator.rsplit_once('/') else {
            return false;
        };
        let Ok(arity) = arity.parse::<usize>() else {
            return false;
        };
        if self.rules.defines(pred, arity) {
            return true;
        }
        self.wrappers
            .get(pred)
            .is_some_and(|w| w.signature().arity() == arity)
    }

    /// Peer entry point: admit a delegated goal as a local root goal.
    pub async fn remote_query(
        &self,
        goal: &str,
        correlation: &str,
        reply_host: &str,
        reply_port: u16,
    ) -> EtbResult<QueryId> {
        let literal = parse_literal(goal)?;
        self.engine
            .admit_remote(
                literal,
                correlation.to_string(),
                reply_host.to_string(),
                reply_port,
            )
            .await
    }

    /// Peer entry point: an answer for a delegation we issued.
    pub fn deliver_answer(&self, correlation: &str, subst: Subst, claim_digest: &str) {
        self.engine.deliver_answer(
            correlation.to_string(),
            subst,
            crate::claims::ClaimId(claim_digest.to_string()),
        );
    }

    /// Peer entry point: quiescence report or cancellation, depending on
    /// which side of the correlation we are.
    pub fn closed(&self, correlation: &str) {
        self.engine.closed(correlation.to_string());
    }

    /// Peer entry point: two-way handshake. Merges the caller's peer
    /// table and answers with ours; newly learned peers trigger a
    /// re-gossip.
    pub fn advertise_peers(self: &Arc<Self>, payload: &Json) -> EtbResult<Json> {
        let (reply, fresh) = self.fabric.accept_handshake(payload)?;
        if !fresh.is_empty() {
            let node = Arc::clone(self);
            tokio::spawn(async move {
                node.fabric.gossip().await;
            });
        }
        Ok(reply)
    }

    /// Load one rule file after startup (shell convenience).
    pub fn load_rules(&self, path: &Path) -> EtbResult<usize> {
        let text = std::fs::read_to_string(path)?;
        let parsed = parse_rule_file(&text)?;
        let count = parsed.len();
        for rule in parsed {
            self.rules.insert(rule);
        }
        self.refresh_advertisement();
        let fabric = Arc::clone(&self.fabric);
        tokio::spawn(async move { fabric.gossip().await });
        if count == 0 {
            warn!(file = %path.display(), "rule file contained no clauses");
        }
        Ok(count)
    }
}

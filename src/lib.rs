//! # ETB - Evidential Tool Bus
//!
//! A federated Horn-clause inference engine. Peer nodes cooperatively
//! evaluate Datalog-style goals against rules, facts and tool-backed
//! wrapper predicates; every derived answer is a ground *claim* carrying
//! an evidentiary derivation over base facts, rules, tool invocations and
//! content-addressed file contents. The same query posed anywhere on a
//! fabric yields the same claims.
//!
//! ## Architecture
//!
//! - [`term`] - terms, literals, substitutions, unification, the goal
//!   grammar and the canonical forms all identities hash over.
//! - [`rules`] - the Horn-clause store with epoch-visible retraction.
//! - [`wrappers`] - tool-backed predicates with mode/kind signatures.
//! - [`engine`] - tabled SLD resolution, the scheduler and remote
//!   delegation.
//! - [`claims`] - the append-only claims table.
//! - [`filestore`] - SHA-1 content-addressed blobs with peer pull.
//! - [`fabric`] - peer table, gossip and tunnel rewrites.
//! - [`rpc`] - the XML-RPC surface shared by clients and peers.
//! - [`node`] - one process-wide instance wiring the above together.
//!
//! ## Example
//!
//! ```no_run
//! use etb::{Config, Node};
//!
//! # async fn demo() -> Result<(), etb::EtbError> {
//! let node = Node::init(Config::default())?;
//! node.rules.insert(etb::term::parse_rule("parent(bill, mary).")?);
//! node.rules.insert(etb::term::parse_rule("ancestor(X, Y) :- parent(X, Y).")?);
//! node.refresh_advertisement();
//!
//! let query = node.query("ancestor(bill, Y)").await?;
//! node.query_wait(&query).await?;
//! for answer in node.query_answers(&query).await? {
//!     println!("{answer}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod claims;
pub mod config;
pub mod engine;
pub mod error;
pub mod fabric;
pub mod filestore;
pub mod node;
pub mod rpc;
pub mod rules;
pub mod term;
pub mod wrappers;

pub use claims::{Claim, ClaimId, ClaimsTable, Evidence};
pub use config::Config;
pub use engine::{Engine, GoalId, GoalState, QueryId, QueryInfo};
pub use error::{EtbError, EtbResult};
pub use fabric::Fabric;
pub use filestore::FileStore;
pub use node::Node;
pub use rules::{Rule, RuleBase, RuleId};
pub use term::{FileRef, Literal, Subst, Term};
pub use wrappers::{Outcome, Signature, Wrapper, WrapperRegistry};

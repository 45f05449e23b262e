//! Crate-level error taxonomy.
//!
//! Per-goal problems (unknown predicates, mode violations, wrapper
//! failures, remote and file-integrity errors) never appear here: they
//! surface as `error/2` claim rows so derivations stay introspectable.
//! These errors cover the synchronous failures of top-level calls.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtbError {
    /// Malformed rule or goal text; nothing was admitted.
    #[error("parse error: {0}")]
    Parse(#[from] crate::term::ParseError),

    /// The engine actor is no longer running.
    #[error("engine is not running")]
    EngineStopped,

    #[error("unknown query {0}")]
    UnknownQuery(String),

    #[error(transparent)]
    Store(#[from] crate::filestore::StoreError),

    #[error(transparent)]
    Wire(#[from] crate::rpc::WireError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type EtbResult<T> = Result<T, EtbError>;

//! # Remote Surface
//!
//! All remote operations are XML-RPC over HTTP (`POST /RPC2`). Structured
//! payloads (substitutions, claims) travel as JSON strings inside XML-RPC
//! strings; file bodies are base64. Clients and peers use the same surface;
//! peers use a privileged subset (`etb.offers`, `etb.remote_query`,
//! `etb.deliver_answer`, `etb.closed`, `etb.advertise_peers`).

pub mod client;
pub mod server;
pub mod wire;
pub mod xmlrpc;

pub use client::PeerClient;
pub use xmlrpc::{Fault, Value};

use thiserror::Error;

/// Wire-level failures: malformed envelopes or payloads, transport errors,
/// and faults returned by the far side.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed XML-RPC: {0}")]
    Xml(String),

    #[error("malformed payload: {0}")]
    Payload(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("fault {code}: {message}")]
    Fault { code: i64, message: String },
}

impl From<quick_xml::Error> for WireError {
    fn from(e: quick_xml::Error) -> Self {
        WireError::Xml(e.to_string())
    }
}

impl From<Fault> for WireError {
    fn from(f: Fault) -> Self {
        WireError::Fault {
            code: f.code,
            message: f.message,
        }
    }
}

//! The HTTP side of the remote surface: a single `POST /RPC2` endpoint
//! dispatching XML-RPC method calls onto the node.
//!
//! Per-goal problems never fault: they are claim rows. A fault is
//! returned only for transport-level problems, malformed envelopes,
//! parse errors of the top-level call and unknown query ids.

use super::wire;
use super::xmlrpc::{self, Fault, Value};
use crate::error::EtbError;
use crate::node::Node;
use axum::extract::Extension;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Build the router for a node.
pub fn router(node: Arc<Node>) -> Router {
    Router::new()
        .route("/RPC2", post(handle_rpc))
        .layer(Extension(node))
}

/// Bind and serve until the process exits.
pub async fn serve(node: Arc<Node>) -> Result<(), EtbError> {
    let addr = format!(
        "{}:{}",
        node.config().node.host,
        node.config().node.port
    );
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "remote surface listening");
    axum::serve(listener, router(node)).await?;
    Ok(())
}

/// Serve on an already bound listener (ephemeral ports in tests).
/// Returns the local address and the serving task.
pub fn serve_listener(
    node: Arc<Node>,
    listener: TcpListener,
) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), EtbError> {
    let addr = listener.local_addr()?;
    let app = router(node);
    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "remote surface failed");
        }
    });
    Ok((addr, task))
}

async fn handle_rpc(Extension(node): Extension<Arc<Node>>, body: String) -> impl IntoResponse {
    let xml = match xmlrpc::decode_call(&body) {
        Ok((method, params)) => {
            debug!(%method, "rpc call");
            match dispatch(&node, &method, &params).await {
                Ok(value) => xmlrpc::encode_response(&value),
                Err(fault) => xmlrpc::encode_fault(&fault),
            }
        }
        Err(e) => xmlrpc::encode_fault(&Fault {
            code: -32700,
            message: e.to_string(),
        }),
    };
    ([(header::CONTENT_TYPE, "text/xml")], xml)
}

fn fault(code: i64, message: impl Into<String>) -> Fault {
    Fault {
        code,
        message: message.into(),
    }
}

fn fault_of(e: EtbError) -> Fault {
    let code = match &e {
        EtbError::Parse(_) => 400,
        EtbError::UnknownQuery(_) => 404,
        _ => 500,
    };
    fault(code, e.to_string())
}

fn str_param<'a>(params: &'a [Value], index: usize, name: &str) -> Result<&'a str, Fault> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| fault(400, format!("missing string parameter {name}")))
}

fn port_param(params: &[Value], index: usize, name: &str) -> Result<u16, Fault> {
    let raw = params
        .get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| fault(400, format!("missing int parameter {name}")))?;
    u16::try_from(raw).map_err(|_| fault(400, format!("{name} out of range")))
}

async fn dispatch(node: &Arc<Node>, method: &str, params: &[Value]) -> Result<Value, Fault> {
    match method {
        "etb.put_file" => {
            let bytes = params
                .first()
                .and_then(Value::as_bytes)
                .ok_or_else(|| fault(400, "missing base64 parameter bytes"))?;
            let dest = str_param(params, 1, "dest_path")?;
            let fr = node.put_file(bytes, dest).map_err(fault_of)?;
            let json = wire::term_to_json(&crate::term::Term::FileRef(fr));
            Ok(Value::Str(json.to_string()))
        }
        "etb.get_file" => {
            let text = str_param(params, 0, "file_ref")?;
            let json: serde_json::Value =
                serde_json::from_str(text).map_err(|e| fault(400, e.to_string()))?;
            let term = wire::term_from_json(&json).map_err(|e| fault(400, e.to_string()))?;
            let crate::term::Term::FileRef(fr) = term else {
                return Err(fault(400, "expected a file reference"));
            };
            let bytes = node.get_file(&fr).await.map_err(fault_of)?;
            Ok(Value::Base64(bytes))
        }
        "etb.ls" => {
            let dir = params.first().and_then(Value::as_str).unwrap_or("");
            let report = node.ls(dir).map_err(fault_of)?;
            let json = serde_json::to_string(&report).map_err(|e| fault(500, e.to_string()))?;
            Ok(Value::Str(json))
        }
        "etb.query" => {
            let goal = str_param(params, 0, "goal")?;
            let id = node.query(goal).await.map_err(fault_of)?;
            Ok(Value::Str(id))
        }
        "etb.query_wait" => {
            let id = str_param(params, 0, "query_id")?;
            node.query_wait(id).await.map_err(fault_of)?;
            Ok(Value::Bool(true))
        }
        "etb.query_done" => {
            let id = str_param(params, 0, "query_id")?;
            Ok(Value::Bool(node.query_done(id).await.map_err(fault_of)?))
        }
        "etb.query_info" => {
            let id = str_param(params, 0, "query_id")?;
            let info = node.query_info(id).await.map_err(fault_of)?;
            let json = serde_json::json!({
                "id": info.id,
                "goal": info.goal.to_string(),
                "state": info.goal_state.as_str(),
                "created": info.created.to_rfc3339(),
                "done": info.done,
                "origin": info.origin,
            });
            Ok(Value::Str(json.to_string()))
        }
        "etb.query_answers" => {
            let id = str_param(params, 0, "query_id")?;
            let answers = node.query_answers(id).await.map_err(fault_of)?;
            Ok(Value::Str(wire::answers_to_string(&answers)))
        }
        "etb.query_claims" => {
            let id = str_param(params, 0, "query_id")?;
            let claims = node.query_claims(id).await.map_err(fault_of)?;
            Ok(Value::Str(wire::claims_to_string(&claims)))
        }
        "etb.query_errors" => {
            let id = str_param(params, 0, "query_id")?;
            let claims = node.query_errors(id).await.map_err(fault_of)?;
            Ok(Value::Str(wire::claims_to_string(&claims)))
        }
        "etb.query_close" => {
            let id = str_param(params, 0, "query_id")?;
            node.query_close(id);
            Ok(Value::Bool(true))
        }
        "etb.get_all_claims" => {
            Ok(Value::Str(wire::claims_to_string(&node.get_all_claims())))
        }
        "etb.active_queries" => {
            let ids = node.active_queries().await.map_err(fault_of)?;
            Ok(Value::Array(ids.into_iter().map(Value::Str).collect()))
        }
        "etb.done_queries" => {
            let ids = node.done_queries().await.map_err(fault_of)?;
            Ok(Value::Array(ids.into_iter().map(Value::Str).collect()))
        }
        "etb.connect" => {
            let host = str_param(params, 0, "host")?;
            let port = port_param(params, 1, "port")?;
            node.connect(host, port).await.map_err(fault_of)?;
            Ok(Value::Bool(true))
        }
        "etb.tunnel" => {
            let local = port_param(params, 0, "local_port")?;
            let remote = port_param(params, 1, "remote_port")?;
            node.tunnel(local, remote);
            Ok(Value::Bool(true))
        }

        // Peer surface.
        "etb.offers" => {
            let indicator = str_param(params, 0, "predicate")?;
            Ok(Value::Bool(node.offers(indicator)))
        }
        "etb.remote_query" => {
            let goal = str_param(params, 0, "goal")?;
            let correlation = str_param(params, 1, "correlation")?;
            let reply_host = str_param(params, 2, "reply_host")?;
            let reply_port = port_param(params, 3, "reply_port")?;
            let id = node
                .remote_query(goal, correlation, reply_host, reply_port)
                .await
                .map_err(fault_of)?;
            Ok(Value::Str(id))
        }
        "etb.deliver_answer" => {
            let correlation = str_param(params, 0, "correlation")?;
            let subst_text = str_param(params, 1, "substitution")?;
            let claim = str_param(params, 2, "claim_digest")?;
            let json: serde_json::Value =
                serde_json::from_str(subst_text).map_err(|e| fault(400, e.to_string()))?;
            let subst = wire::subst_from_json(&json).map_err(|e| fault(400, e.to_string()))?;
            node.deliver_answer(correlation, subst, claim);
            Ok(Value::Bool(true))
        }
        "etb.closed" => {
            let correlation = str_param(params, 0, "correlation")?;
            node.closed(correlation);
            Ok(Value::Bool(true))
        }
        "etb.advertise_peers" => {
            let text = str_param(params, 0, "descriptors")?;
            let json: serde_json::Value =
                serde_json::from_str(text).map_err(|e| fault(400, e.to_string()))?;
            let reply = node.advertise_peers(&json).map_err(fault_of)?;
            Ok(Value::Str(reply.to_string()))
        }

        other => Err(fault(-32601, format!("unknown method {other}"))),
    }
}

//! Typed XML-RPC client, used by the shell, by peers delegating subgoals,
//! and by the fabric handshake.

use super::wire;
use super::xmlrpc::{self, Value};
use super::WireError;
use crate::claims::Claim;
use crate::filestore::LsReport;
use crate::term::{FileRef, Subst};
use serde_json::Value as Json;

/// A connection to one node's remote surface.
#[derive(Debug, Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    url: String,
}

impl PeerClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self::from_url(format!("http://{host}:{port}/RPC2"))
    }

    pub fn from_url(url: String) -> Self {
        PeerClient {
            // No global timeout: `query_wait` blocks server-side until the
            // query completes. Delegations bound their own deadlines.
            http: reqwest::Client::new(),
            url,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, WireError> {
        let body = xmlrpc::encode_call(method, params);
        let response = self
            .http
            .post(&self.url)
            .header("content-type", "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| WireError::Transport(e.to_string()))?;
        let text = response
            .text()
            .await
            .map_err(|e| WireError::Transport(e.to_string()))?;
        Ok(xmlrpc::decode_response(&text)??)
    }

    async fn call_str(&self, method: &str, params: &[Value]) -> Result<String, WireError> {
        let value = self.call(method, params).await?;
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| WireError::Payload(format!("{method} returned a non-string")))
    }

    // ------------------------------------------------------------------
    // Client surface
    // ------------------------------------------------------------------

    pub async fn put_file(&self, bytes: &[u8], dest_path: &str) -> Result<FileRef, WireError> {
        let value = self
            .call(
                "etb.put_file",
                &[Value::Base64(bytes.to_vec()), Value::Str(dest_path.into())],
            )
            .await?;
        let text = value
            .as_str()
            .ok_or_else(|| WireError::Payload("put_file returned a non-string".into()))?;
        let json: Json = serde_json::from_str(text)?;
        match crate::rpc::wire::term_from_json(&json)? {
            crate::term::Term::FileRef(fr) => Ok(fr),
            other => Err(WireError::Payload(format!("expected a file reference, got {other}"))),
        }
    }

    pub async fn get_file(&self, fr: &FileRef) -> Result<Vec<u8>, WireError> {
        let json = serde_json::json!({ "file": fr.file, "sha1": fr.sha1 });
        let value = self
            .call("etb.get_file", &[Value::Str(json.to_string())])
            .await?;
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| WireError::Payload("get_file returned non-base64".into()))
    }

    pub async fn ls(&self, dir: &str) -> Result<LsReport, WireError> {
        let text = self.call_str("etb.ls", &[Value::Str(dir.into())]).await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn query(&self, goal: &str) -> Result<String, WireError> {
        self.call_str("etb.query", &[Value::Str(goal.into())]).await
    }

    pub async fn query_wait(&self, id: &str) -> Result<(), WireError> {
        self.call("etb.query_wait", &[Value::Str(id.into())]).await?;
        Ok(())
    }

    pub async fn query_done(&self, id: &str) -> Result<bool, WireError> {
        let value = self.call("etb.query_done", &[Value::Str(id.into())]).await?;
        value
            .as_bool()
            .ok_or_else(|| WireError::Payload("query_done returned non-boolean".into()))
    }

    /// Query metadata: root goal, goal state, creation time, origin.
    pub async fn query_info(&self, id: &str) -> Result<Json, WireError> {
        let text = self
            .call_str("etb.query_info", &[Value::Str(id.into())])
            .await?;
        Ok(serde_json::from_str(&text)?)
    }

    pub async fn query_answers(&self, id: &str) -> Result<Vec<Subst>, WireError> {
        let text = self
            .call_str("etb.query_answers", &[Value::Str(id.into())])
            .await?;
        wire::answers_from_string(&text)
    }

    pub async fn query_claims(&self, id: &str) -> Result<Vec<Claim>, WireError> {
        let text = self
            .call_str("etb.query_claims", &[Value::Str(id.into())])
            .await?;
        wire::claims_from_string(&text)
    }

    pub async fn query_errors(&self, id: &str) -> Result<Vec<Claim>, WireError> {
        let text = self
            .call_str("etb.query_errors", &[Value::Str(id.into())])
            .await?;
        wire::claims_from_string(&text)
    }

    pub async fn query_close(&self, id: &str) -> Result<(), WireError> {
        self.call("etb.query_close", &[Value::Str(id.into())]).await?;
        Ok(())
    }

    pub async fn get_all_claims(&self) -> Result<Vec<Claim>, WireError> {
        let text = self.call_str("etb.get_all_claims", &[]).await?;
        wire::claims_from_string(&text)
    }

    pub async fn active_queries(&self) -> Result<Vec<String>, WireError> {
        self.query_list("etb.active_queries").await
    }

    pub async fn done_queries(&self) -> Result<Vec<String>, WireError> {
        self.query_list("etb.done_queries").await
    }

    async fn query_list(&self, method: &str) -> Result<Vec<String>, WireError> {
        let value = self.call(method, &[]).await?;
        value
            .as_array()
            .ok_or_else(|| WireError::Payload(format!("{method} returned a non-array")))?
            .iter()
            .map(|v| {
                v.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| WireError::Payload("query ids are strings".into()))
            })
            .collect()
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<(), WireError> {
        self.call(
            "etb.connect",
            &[Value::Str(host.into()), Value::Int(i64::from(port))],
        )
        .await?;
        Ok(())
    }

    pub async fn tunnel(&self, local_port: u16, remote_port: u16) -> Result<(), WireError> {
        self.call(
            "etb.tunnel",
            &[
                Value::Int(i64::from(local_port)),
                Value::Int(i64::from(remote_port)),
            ],
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer surface
    // ------------------------------------------------------------------

    pub async fn offers(&self, indicator: &str) -> Result<bool, WireError> {
        let value = self
            .call("etb.offers", &[Value::Str(indicator.into())])
            .await?;
        value
            .as_bool()
            .ok_or_else(|| WireError::Payload("offers returned non-boolean".into()))
    }

    pub async fn remote_query(
        &self,
        goal: &str,
        correlation: &str,
        reply_host: &str,
        reply_port: u16,
    ) -> Result<(), WireError> {
        self.call(
            "etb.remote_query",
            &[
                Value::Str(goal.into()),
                Value::Str(correlation.into()),
                Value::Str(reply_host.into()),
                Value::Int(i64::from(reply_port)),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn deliver_answer(
        &self,
        correlation: &str,
        subst: &Subst,
        claim_digest: &str,
    ) -> Result<(), WireError> {
        self.call(
            "etb.deliver_answer",
            &[
                Value::Str(correlation.into()),
                Value::Str(wire::subst_to_json(subst).to_string()),
                Value::Str(claim_digest.into()),
            ],
        )
        .await?;
        Ok(())
    }

    pub async fn closed(&self, correlation: &str) -> Result<(), WireError> {
        self.call("etb.closed", &[Value::Str(correlation.into())])
            .await?;
        Ok(())
    }

    /// Two-way handshake: send our descriptor set, receive theirs.
    pub async fn advertise_peers(&self, descriptors: &Json) -> Result<Json, WireError> {
        let text = self
            .call_str("etb.advertise_peers", &[Value::Str(descriptors.to_string())])
            .await?;
        Ok(serde_json::from_str(&text)?)
    }
}

//! Remote Surface Tests
//!
//! One node served over HTTP, driven exclusively through the XML-RPC
//! client: file round trips, the query lifecycle, fault behaviour.

use etb::rpc::{PeerClient, WireError};
use etb::{Config, Node};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;

async fn start_node(
    setup: impl FnOnce(&mut Config),
) -> (Arc<Node>, SocketAddr, PeerClient, TempDir) {
    let dir = TempDir::new().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = Config::default();
    config.node.data_dir = dir.path().join("data");
    config.node.host = "127.0.0.1".to_string();
    config.node.port = addr.port();
    setup(&mut config);
    let node = Node::init(config).unwrap();
    let (_, _task) = etb::rpc::server::serve_listener(Arc::clone(&node), listener).unwrap();
    let client = PeerClient::new("127.0.0.1", addr.port());
    (node, addr, client, dir)
}

fn write_ancestor_rules(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("ancestor.etb");
    std::fs::write(
        &path,
        "% family facts\n\
         parent(bill, mary).\n\
         parent(mary, john).\n\
         ancestor(X, Y) :- parent(X, Y).\n\
         ancestor(X, Y) :- parent(X, Z), ancestor(Z, Y).\n",
    )
    .unwrap();
    path
}

#[tokio::test]
async fn test_put_get_round_trip_over_http() {
    let (_node, _addr, client, _dir) = start_node(|_| {}).await;

    let body = b"binary \x00\x01\xff payload";
    let fr = client.put_file(body, "docs/blob.bin").await.unwrap();
    assert_eq!(fr.file, "docs/blob.bin");
    assert_eq!(fr.sha1.len(), 40);

    let back = client.get_file(&fr).await.unwrap();
    assert_eq!(back, body);
}

#[tokio::test]
async fn test_ls_over_http() {
    let (_node, _addr, client, _dir) = start_node(|_| {}).await;

    client.put_file(b"one", "a.txt").await.unwrap();
    client.put_file(b"two", "sub/b.txt").await.unwrap();

    let report = client.ls("").await.unwrap();
    assert_eq!(report.in_sync, vec!["a.txt"]);
    assert_eq!(report.dirs, vec!["sub"]);

    let report = client.ls("sub").await.unwrap();
    assert_eq!(report.in_sync, vec!["sub/b.txt"]);
}

#[tokio::test]
async fn test_query_lifecycle_over_http() {
    let dir = TempDir::new().unwrap();
    let rules = write_ancestor_rules(&dir);
    let (_node, _addr, client, _dir) = start_node(move |config| {
        config.node.rule_files = vec![rules];
    })
    .await;

    let query = client.query("ancestor(bill, Y)").await.unwrap();
    client.query_wait(&query).await.unwrap();
    assert!(client.query_done(&query).await.unwrap());

    let answers = client.query_answers(&query).await.unwrap();
    let mut values: Vec<String> = answers
        .iter()
        .filter_map(|s| s.get("Y").map(ToString::to_string))
        .collect();
    values.sort();
    assert_eq!(values, vec!["john", "mary"]);

    let claims = client.query_claims(&query).await.unwrap();
    assert!(claims.len() >= 2);
    assert!(client.query_errors(&query).await.unwrap().is_empty());

    assert!(client.done_queries().await.unwrap().contains(&query));
    assert!(!client.active_queries().await.unwrap().contains(&query));

    let all = client.get_all_claims().await.unwrap();
    assert!(all.len() >= claims.len());
}

#[tokio::test]
async fn test_query_info_over_http() {
    let dir = TempDir::new().unwrap();
    let rules = write_ancestor_rules(&dir);
    let (node, _addr, client, _dir) = start_node(move |config| {
        config.node.rule_files = vec![rules];
    })
    .await;

    let query = client.query("ancestor(bill, Y)").await.unwrap();
    client.query_wait(&query).await.unwrap();

    let info = client.query_info(&query).await.unwrap();
    assert_eq!(info["id"].as_str().unwrap(), query);
    assert_eq!(info["state"].as_str().unwrap(), "resolved");
    assert!(info["done"].as_bool().unwrap());
    assert_eq!(info["origin"].as_str().unwrap(), node.id());
    // Creation time is RFC 3339.
    let created = info["created"].as_str().unwrap();
    assert!(chrono::DateTime::parse_from_rfc3339(created).is_ok());

    match client.query_info("no-such-query").await {
        Err(WireError::Fault { code, .. }) => assert_eq!(code, 404),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_parse_error_is_a_fault() {
    let (_node, _addr, client, _dir) = start_node(|_| {}).await;

    match client.query("NotAPredicate(").await {
        Err(WireError::Fault { code, message }) => {
            assert_eq!(code, 400);
            assert!(message.contains("parse error"));
        }
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unknown_query_is_a_fault() {
    let (_node, _addr, client, _dir) = start_node(|_| {}).await;

    match client.query_done("no-such-query").await {
        Err(WireError::Fault { code, .. }) => assert_eq!(code, 404),
        other => panic!("expected a fault, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offers_probe() {
    let dir = TempDir::new().unwrap();
    let rules = write_ancestor_rules(&dir);
    let (_node, _addr, client, _dir) = start_node(move |config| {
        config.node.rule_files = vec![rules];
    })
    .await;

    assert!(client.offers("ancestor/2").await.unwrap());
    assert!(client.offers("parent/2").await.unwrap());
    // Built-in wrapper.
    assert!(client.offers("in_range/3").await.unwrap());
    assert!(!client.offers("ancestor/3").await.unwrap());
    assert!(!client.offers("nope/1").await.unwrap());
}

#[tokio::test]
async fn test_query_close_over_http() {
    let dir = TempDir::new().unwrap();
    let rules = write_ancestor_rules(&dir);
    let (_node, _addr, client, _dir) = start_node(move |config| {
        config.node.rule_files = vec![rules];
    })
    .await;

    let query = client.query("ancestor(bill, Y)").await.unwrap();
    client.query_close(&query).await.unwrap();
    client.query_wait(&query).await.unwrap();
    assert!(client.query_done(&query).await.unwrap());
}

//! # Network Fabric
//!
//! Peer table, membership gossip and tunnel indirection. A `connect` does
//! a two-way handshake in which both sides exchange and merge peer tables;
//! each newly learned peer is then contacted symmetrically, so the fabric
//! converges to its transitive closure. Predicate advertisements (rule
//! heads plus wrapper names) ride along with every handshake.
//!
//! A tunnel installs an address rewrite pair: outbound calls dialled
//! through `local_port` reach the far network over the relay, and the
//! descriptor this node sends through the tunnel advertises `remote_port`
//! so the far side can dial back through the same relay.

use crate::rpc::{PeerClient, WireError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// The wire form of a peer: what handshakes and gossip carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub predicates: BTreeSet<String>,
}

/// A known peer: descriptor plus local bookkeeping.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub descriptor: PeerDescriptor,
    pub reachable_since: DateTime<Utc>,
    pub last_ping: DateTime<Utc>,
    pub reachable: bool,
    /// Dial address override for peers only reachable through a tunnel.
    pub dial: Option<(String, u16)>,
}

impl PeerInfo {
    fn new(descriptor: PeerDescriptor, dial: Option<(String, u16)>) -> Self {
        let now = Utc::now();
        PeerInfo {
            descriptor,
            reachable_since: now,
            last_ping: now,
            reachable: true,
            dial,
        }
    }

    /// The address outbound calls actually use.
    pub fn dial_addr(&self) -> (String, u16) {
        self.dial
            .clone()
            .unwrap_or_else(|| (self.descriptor.host.clone(), self.descriptor.port))
    }

    pub fn client(&self) -> PeerClient {
        let (host, port) = self.dial_addr();
        PeerClient::new(&host, port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tunnel {
    local_port: u16,
    remote_port: u16,
}

/// The per-node view of the fabric.
pub struct Fabric {
    self_id: String,
    host: String,
    port: u16,
    peers: DashMap<String, PeerInfo>,
    tunnels: RwLock<Vec<Tunnel>>,
    local_predicates: RwLock<BTreeSet<String>>,
}

impl Fabric {
    pub fn new(self_id: String, host: String, port: u16) -> Self {
        Fabric {
            self_id,
            host,
            port,
            peers: DashMap::new(),
            tunnels: RwLock::new(Vec::new()),
            local_predicates: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Refresh the advertised predicate set (rule heads + wrapper names).
    pub fn set_local_predicates(&self, predicates: impl IntoIterator<Item = String>) {
        *self.local_predicates.write() = predicates.into_iter().collect();
    }

    pub fn local_predicates(&self) -> BTreeSet<String> {
        self.local_predicates.read().clone()
    }

    /// Our descriptor as sent over a direct connection.
    pub fn self_descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.self_id.clone(),
            host: self.host.clone(),
            port: self.port,
            predicates: self.local_predicates(),
        }
    }

    /// Our descriptor as sent through `tunnel`: the far side dials the
    /// relay's remote port instead of our advertised address.
    fn tunnelled_descriptor(&self, tunnel: Tunnel) -> PeerDescriptor {
        PeerDescriptor {
            host: "127.0.0.1".to_string(),
            port: tunnel.remote_port,
            ..self.self_descriptor()
        }
    }

    /// Install a tunnel rewrite pair.
    pub fn add_tunnel(&self, local_port: u16, remote_port: u16) {
        info!(local_port, remote_port, "installing tunnel rewrite");
        self.tunnels.write().push(Tunnel {
            local_port,
            remote_port,
        });
    }

    /// The tunnel whose local port matches a dial target, if any. Consulted
    /// immediately before every outbound connect.
    fn tunnel_for(&self, host: &str, port: u16) -> Option<Tunnel> {
        let is_local = matches!(host, "127.0.0.1" | "localhost" | "::1");
        if !is_local {
            return None;
        }
        self.tunnels
            .read()
            .iter()
            .find(|t| t.local_port == port)
            .copied()
    }

    /// The address `peer_id` should use to call us back. For a peer we
    /// reach through a tunnel, the answer path runs through the same
    /// relay: the tunnel's remote port instead of our advertised address.
    pub fn callback_addr(&self, peer_id: &str) -> (String, u16) {
        if let Some(peer) = self.peer(peer_id) {
            if let Some((_, dial_port)) = peer.dial {
                let tunnels = self.tunnels.read();
                if let Some(t) = tunnels.iter().find(|t| t.local_port == dial_port) {
                    return ("127.0.0.1".to_string(), t.remote_port);
                }
            }
        }
        (self.host.clone(), self.port)
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.iter().map(|e| e.value().clone()).collect()
    }

    pub fn peer(&self, id: &str) -> Option<PeerInfo> {
        self.peers.get(id).map(|e| e.value().clone())
    }

    /// Reachable peers advertising `pred/arity`.
    pub fn providers(&self, indicator: &str) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .filter(|e| e.value().reachable && e.value().descriptor.predicates.contains(indicator))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn mark_unreachable(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            warn!(peer = id, "marking peer unreachable");
            peer.reachable = false;
        }
    }

    pub fn touch(&self, id: &str) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.last_ping = Utc::now();
            peer.reachable = true;
        }
    }

    /// Merge a set of descriptors into the peer table. Returns the
    /// descriptors that were new. `dial` is the override applied to peers
    /// learned through a tunnel.
    pub fn merge_descriptors(
        &self,
        descriptors: Vec<PeerDescriptor>,
        dial: Option<(String, u16)>,
    ) -> Vec<PeerDescriptor> {
        let mut fresh = Vec::new();
        for descriptor in descriptors {
            if descriptor.id == self.self_id {
                continue;
            }
            match self.peers.get_mut(&descriptor.id) {
                Some(mut existing) => {
                    existing.descriptor.predicates = descriptor.predicates.clone();
                    existing.descriptor.host = descriptor.host.clone();
                    existing.descriptor.port = descriptor.port;
                    existing.last_ping = Utc::now();
                    existing.reachable = true;
                }
                None => {
                    debug!(peer = %descriptor.id, host = %descriptor.host, port = descriptor.port,
                           "learned new peer");
                    self.peers.insert(
                        descriptor.id.clone(),
                        PeerInfo::new(descriptor.clone(), dial.clone()),
                    );
                    fresh.push(descriptor);
                }
            }
        }
        fresh
    }

    /// Everything we know, as sent in a handshake: ourselves plus every
    /// reachable peer.
    pub fn known_descriptors(&self) -> Vec<PeerDescriptor> {
        let mut all = vec![self.self_descriptor()];
        for entry in self.peers.iter() {
            if entry.value().reachable {
                all.push(entry.value().descriptor.clone());
            }
        }
        all
    }

    pub fn descriptors_json(&self) -> Json {
        json!(self.known_descriptors())
    }

    /// Handle an inbound handshake: merge the caller's table, answer with
    /// ours. Returns the descriptors that were new so the node can decide
    /// to re-gossip.
    pub fn accept_handshake(&self, payload: &Json) -> Result<(Json, Vec<PeerDescriptor>), WireError> {
        let descriptors: Vec<PeerDescriptor> = serde_json::from_value(payload.clone())?;
        let fresh = self.merge_descriptors(descriptors, None);
        Ok((self.descriptors_json(), fresh))
    }

    /// Connect to a peer: two-way handshake, transitive merge, then a
    /// symmetric contact of every newly learned peer.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), WireError> {
        let tunnel = self.tunnel_for(host, port);
        let ours = match tunnel {
            Some(t) => {
                let mut all = vec![self.tunnelled_descriptor(t)];
                all.extend(self.peers.iter().filter_map(|e| {
                    e.value().reachable.then(|| e.value().descriptor.clone())
                }));
                json!(all)
            }
            None => self.descriptors_json(),
        };
        let client = PeerClient::new(host, port);
        let theirs = client.advertise_peers(&ours).await?;
        let descriptors: Vec<PeerDescriptor> = serde_json::from_value(theirs)?;
        let dial = tunnel.map(|_| (host.to_string(), port));
        let fresh = self.merge_descriptors(descriptors, dial);
        info!(host, port, learned = fresh.len(), "connected to peer");

        // Contact each newly learned peer symmetrically so it knows us
        // (and what we offer) without waiting for gossip to come around.
        for descriptor in fresh {
            if let Some(peer) = self.peer(&descriptor.id) {
                let client = peer.client();
                if let Err(e) = client.advertise_peers(&ours).await {
                    warn!(peer = %descriptor.id, error = %e, "symmetric contact failed");
                    self.mark_unreachable(&descriptor.id);
                }
            }
        }
        Ok(())
    }

    /// The self descriptor as `peer` should see it: peers we reach
    /// through a tunnel are sent the tunnel advert.
    fn advert_for(&self, peer: &PeerInfo) -> PeerDescriptor {
        if let Some((_, dial_port)) = peer.dial {
            let tunnels = self.tunnels.read();
            if let Some(t) = tunnels.iter().find(|t| t.local_port == dial_port) {
                return self.tunnelled_descriptor(*t);
            }
        }
        self.self_descriptor()
    }

    /// Push our current table to every reachable peer. Called on
    /// membership or advertisement change.
    pub async fn gossip(&self) {
        for peer in self.peers() {
            if !peer.reachable {
                continue;
            }
            let mut payload = vec![self.advert_for(&peer)];
            payload.extend(self.peers().into_iter().filter_map(|p| {
                (p.reachable && p.descriptor.id != peer.descriptor.id)
                    .then_some(p.descriptor)
            }));
            let client = peer.client();
            if let Err(e) = client.advertise_peers(&json!(payload)).await {
                warn!(peer = %peer.descriptor.id, error = %e, "gossip failed");
                self.mark_unreachable(&peer.descriptor.id);
            } else {
                self.touch(&peer.descriptor.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str, port: u16, preds: &[&str]) -> PeerDescriptor {
        PeerDescriptor {
            id: id.into(),
            host: "127.0.0.1".into(),
            port,
            predicates: preds.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn test_merge_ignores_self_and_tracks_new() {
        let fabric = Fabric::new("me".into(), "127.0.0.1".into(), 7000);
        let fresh = fabric.merge_descriptors(
            vec![
                descriptor("me", 7000, &[]),
                descriptor("a", 7001, &["p/1"]),
                descriptor("b", 7002, &[]),
            ],
            None,
        );
        assert_eq!(fresh.len(), 2);
        assert_eq!(fabric.peers().len(), 2);
        // Re-merging the same peers yields nothing new.
        let fresh = fabric.merge_descriptors(vec![descriptor("a", 7001, &["p/1"])], None);
        assert!(fresh.is_empty());
    }

    #[test]
    fn test_merge_updates_advertisements() {
        let fabric = Fabric::new("me".into(), "127.0.0.1".into(), 7000);
        fabric.merge_descriptors(vec![descriptor("a", 7001, &["p/1"])], None);
        assert_eq!(fabric.providers("p/1").len(), 1);
        fabric.merge_descriptors(vec![descriptor("a", 7001, &["q/2"])], None);
        assert!(fabric.providers("p/1").is_empty());
        assert_eq!(fabric.providers("q/2").len(), 1);
    }

    #[test]
    fn test_unreachable_peers_are_not_providers() {
        let fabric = Fabric::new("me".into(), "127.0.0.1".into(), 7000);
        fabric.merge_descriptors(vec![descriptor("a", 7001, &["p/1"])], None);
        fabric.mark_unreachable("a");
        assert!(fabric.providers("p/1").is_empty());
        fabric.touch("a");
        assert_eq!(fabric.providers("p/1").len(), 1);
    }

    #[test]
    fn test_tunnel_rewrites_dial_and_advert() {
        let fabric = Fabric::new("me".into(), "10.0.0.5".into(), 7000);
        fabric.add_tunnel(9001, 9002);
        let tunnel = fabric.tunnel_for("127.0.0.1", 9001).unwrap();
        assert_eq!(tunnel.remote_port, 9002);
        // Dialling elsewhere is untouched.
        assert!(fabric.tunnel_for("127.0.0.1", 7000).is_none());
        assert!(fabric.tunnel_for("10.0.0.9", 9001).is_none());
        let advert = fabric.tunnelled_descriptor(tunnel);
        assert_eq!(advert.port, 9002);
        assert_eq!(advert.host, "127.0.0.1");
    }

    #[test]
    fn test_peers_learned_through_tunnel_keep_dial_override() {
        let fabric = Fabric::new("me".into(), "10.0.0.5".into(), 7000);
        fabric.merge_descriptors(
            vec![descriptor("far", 7100, &["p/1"])],
            Some(("127.0.0.1".into(), 9001)),
        );
        let peer = fabric.peer("far").unwrap();
        assert_eq!(peer.dial_addr(), ("127.0.0.1".to_string(), 9001));
    }
}

//! Registry of known peers
//!
//! Shared between the discovery-drain task and the coordinator. A single
//! registry-wide lock guards every mutation and snapshot.

use crate::nat::{NatTraversal, PortMappings};
use crate::network::Peer;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

/// Offset of the message socket from the configured port
pub const MESSAGE_PORT_OFFSET: u16 = 2;

/// Peer table keyed by address
pub type PeerMap = HashMap<String, Peer>;

/// Addresses that belong to this node, computed once at startup
#[derive(Debug, Clone, Default)]
pub struct Blacklist(HashSet<String>);

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blacklist `ip` on both the configured port and the message port.
    /// A message port past `u16::MAX` does not exist and is skipped.
    pub fn add_endpoint(&mut self, ip: IpAddr, port: u16) {
        let ports = [Some(port), port.checked_add(MESSAGE_PORT_OFFSET)];
        for p in ports.into_iter().flatten() {
            self.0.insert(SocketAddr::new(ip, p).to_string());
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.contains(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Known peers with self-filtering and NAT-aware address rewriting
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<PeerMap>,
    blacklist: Blacklist,
    external: Option<IpAddr>,
}

impl PeerRegistry {
    /// `external` is this node's address as seen from the internet, if a
    /// NAT gateway reported one.
    pub fn new(blacklist: Blacklist, external: Option<IpAddr>) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            blacklist,
            external,
        }
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn external_address(&self) -> Option<IpAddr> {
        self.external
    }

    /// Map `address` to the address it should be stored under, or `None`
    /// if it is one of ours.
    ///
    /// Peers that share our external address sit behind the same gateway;
    /// they are reached through the LAN address the gateway forwards their
    /// port to.
    pub fn resolve(&self, address: &str, mappings: &PortMappings) -> Option<String> {
        if self.blacklist.contains(address) {
            return None;
        }

        let rewritten = match (self.external, address.parse::<SocketAddr>()) {
            (Some(external), Ok(addr)) if addr.ip() == external => mappings
                .internal_for(addr.port())
                .map(|internal| internal.to_string()),
            _ => None,
        };

        Some(rewritten.unwrap_or_else(|| address.to_string()))
    }

    /// Store or refresh a discovered peer; returns the address it was stored
    /// under.
    pub async fn ingest(&self, address: &str, mappings: &PortMappings) -> Option<String> {
        let stored = self.resolve(address, mappings)?;
        if stored != address {
            debug!("Rewrote peer {} to LAN address {}", address, stored);
        }

        let mut peers = self.peers.lock().await;
        peers.insert(stored.clone(), Peer::new(stored.clone()));
        Some(stored)
    }

    /// Ingest one discovery batch, fetching the gateway mapping table once
    /// for the whole batch. Returns how many addresses were stored.
    pub async fn ingest_batch(&self, batch: &[String], nat: Option<&dyn NatTraversal>) -> usize {
        let mappings = match (self.external, nat) {
            (Some(_), Some(nat)) => match nat.list_port_mappings().await {
                Ok(mappings) => mappings.into_iter().collect(),
                Err(e) => {
                    warn!("Failed to list port mappings: {}", e);
                    PortMappings::new()
                },
            },
            _ => PortMappings::new(),
        };

        let mut stored = 0;
        for address in batch {
            if self.ingest(address, &mappings).await.is_some() {
                stored += 1;
            }
        }
        stored
    }

    /// Addresses of every known peer, sorted
    pub async fn snapshot(&self) -> Vec<String> {
        let peers = self.peers.lock().await;
        let mut addresses: Vec<String> = peers.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn remove(&self, address: &str) -> bool {
        self.peers.lock().await.remove(address).is_some()
    }

    pub async fn contains(&self, address: &str) -> bool {
        self.peers.lock().await.contains_key(address)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Hold the registry lock, e.g. across a whole broadcast
    pub(crate) async fn lock(&self) -> MutexGuard<'_, PeerMap> {
        self.peers.lock().await
    }
}

//! NAT traversal collaborator
//!
//! The node only consumes this interface: it installs port mappings at
//! startup, removes them on shutdown, and reads the gateway's external
//! address and mapping table to blacklist itself and to rewrite addresses
//! of peers sitting behind the same gateway.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// One forwarding rule on the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_host: IpAddr,
    pub internal_port: u16,
}

impl PortMapping {
    pub fn internal_addr(&self) -> SocketAddr {
        SocketAddr::new(self.internal_host, self.internal_port)
    }
}

/// Gateway mapping table keyed by external port
#[derive(Debug, Clone, Default)]
pub struct PortMappings(HashMap<u16, SocketAddr>);

impl PortMappings {
    pub fn new() -> Self {
        Self::default()
    }

    /// LAN address forwarded from `external_port`
    pub fn internal_for(&self, external_port: u16) -> Option<SocketAddr> {
        self.0.get(&external_port).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<PortMapping> for PortMappings {
    fn from_iter<I: IntoIterator<Item = PortMapping>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|m| (m.external_port, m.internal_addr()))
                .collect(),
        )
    }
}

/// Port-forwarding service on the local gateway (UPnP or similar)
#[async_trait]
pub trait NatTraversal: Send + Sync {
    /// Forward UDP `external_port` on the gateway to `internal_port` here
    async fn add_port_mapping(&self, external_port: u16, internal_port: u16) -> Result<()>;

    /// Remove the UDP mapping for `external_port`
    async fn delete_port_mapping(&self, external_port: u16) -> Result<()>;

    /// Address the gateway presents to the internet
    async fn external_address(&self) -> Result<IpAddr>;

    /// Every mapping currently installed on the gateway
    async fn list_port_mappings(&self) -> Result<Vec<PortMapping>>;

    /// This host's address on the gateway's network
    fn local_address(&self) -> Option<IpAddr>;
}

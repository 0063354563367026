//! Fire-and-forget broadcast to every known peer

use crate::registry::PeerRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{lookup_host, UdpSocket};
use tracing::{debug, warn};

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Peers the datagram was handed to
    pub delivered: usize,
    /// Peers removed because the transmit failed
    pub pruned: Vec<String>,
    /// Address whose resolution or dial failure stopped the broadcast
    pub aborted_at: Option<String>,
}

/// Sends buffers to every peer in the registry
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<PeerRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Transmit `buffer` to every known peer over a fresh UDP socket each.
    ///
    /// The registry stays locked for the whole broadcast. A peer whose
    /// transmit fails is removed; a peer that cannot be resolved or dialled
    /// ends the broadcast without touching the remaining peers.
    pub async fn send(&self, buffer: &[u8]) -> BroadcastReport {
        let mut peers = self.registry.lock().await;
        let addresses: Vec<String> = peers.keys().cloned().collect();
        let mut report = BroadcastReport::default();

        for address in addresses {
            let socket = match Self::dial(&address).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Broadcast stopped at {}: {}", address, e);
                    report.aborted_at = Some(address);
                    break;
                },
            };

            match socket.send(buffer).await {
                Ok(_) => report.delivered += 1,
                Err(e) => {
                    debug!("Pruning unreachable peer {}: {}", address, e);
                    peers.remove(&address);
                    report.pruned.push(address);
                },
            }
        }

        report
    }

    async fn dial(address: &str) -> std::io::Result<UdpSocket> {
        let target = lookup_host(address).await?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {address}"),
            )
        })?;

        let local: SocketAddr = if target.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(socket)
    }
}

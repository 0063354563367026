//! Networking: peer records, local address probing and the packet receiver

use crate::packet::{has_valid_shape, MAX_PACKET_SIZE};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::net::{IpAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A discovered network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// `host:port`
    pub address: String,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            last_seen: Utc::now(),
        }
    }
}

/// Address of the interface used for outbound traffic.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick a
/// route and source address.
pub fn local_address() -> Option<IpAddr> {
    let socket = StdUdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Read datagrams forever, queueing the well-shaped ones.
///
/// Malformed datagrams are dropped here so they never occupy queue space.
/// Returns when the queue is closed or the socket fails.
pub async fn receive_packets(
    socket: Arc<UdpSocket>,
    packets: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<()> {
    loop {
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (n, from) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            // ICMP errors from earlier sends surface here on some platforms
            Err(e) if matches!(e.kind(), ErrorKind::ConnectionReset | ErrorKind::ConnectionRefused) => {
                debug!("Ignoring receive error: {}", e);
                continue;
            },
            Err(e) => {
                warn!("Packet receiver stopped: {}", e);
                return Err(e);
            },
        };

        if !has_valid_shape(n) {
            continue;
        }
        buffer.truncate(n);
        debug!("Queued {} byte packet from {}", n, from);

        if packets.send(buffer).await.is_err() {
            return Ok(());
        }
    }
}

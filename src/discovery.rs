//! Peer discovery collaborator and the task that drains its results

use crate::{
    error::{GrapevineError, Result},
    nat::NatTraversal,
    registry::PeerRegistry,
    types::RoomId,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Addresses (`host:port`) reported together by the overlay
pub type PeerBatch = Vec<String>;

/// Capacity of a discovery result stream
pub const RESULT_QUEUE_CAPACITY: usize = 16;

/// Peer-discovery overlay (a DHT or similar)
///
/// Results arrive asynchronously on the stream returned by [`start`], not
/// as the return value of [`request_peers`].
///
/// [`start`]: PeerDiscovery::start
/// [`request_peers`]: PeerDiscovery::request_peers
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Start the overlay and hand over its result stream. Called once.
    async fn start(&self) -> Result<mpsc::Receiver<PeerBatch>>;

    /// Ask for more peers in `room`, optionally announcing ourselves on
    /// `port`
    async fn request_peers(&self, room: &RoomId, announce: bool, port: u16) -> Result<()>;

    /// Stop announcing in `room`
    async fn withdraw(&self, room: &RoomId) -> Result<()>;

    /// Shut the overlay down
    async fn stop(&self) -> Result<()>;
}

/// Discovery over a fixed list of bootstrap addresses.
///
/// Every request reports the whole list as one batch.
#[derive(Debug)]
pub struct StaticDiscovery {
    peers: Vec<String>,
    results: Mutex<Option<mpsc::Sender<PeerBatch>>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<String>) -> Self {
        Self {
            peers,
            results: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn start(&self) -> Result<mpsc::Receiver<PeerBatch>> {
        let mut results = self.results.lock().await;
        if results.is_some() {
            return Err(GrapevineError::discovery("discovery already started"));
        }
        let (tx, rx) = mpsc::channel(RESULT_QUEUE_CAPACITY);
        *results = Some(tx);
        Ok(rx)
    }

    async fn request_peers(&self, room: &RoomId, announce: bool, port: u16) -> Result<()> {
        debug!(
            "Peer request for room {} (announce: {}, port: {})",
            room, announce, port
        );
        if self.peers.is_empty() {
            return Ok(());
        }

        let results = self.results.lock().await;
        let tx = results
            .as_ref()
            .ok_or_else(|| GrapevineError::discovery("discovery not started"))?;
        // A full stream means the previous batch is still being drained
        if tx.try_send(self.peers.clone()).is_err() {
            debug!("Discovery results backlogged, skipping batch");
        }
        Ok(())
    }

    async fn withdraw(&self, room: &RoomId) -> Result<()> {
        debug!("Withdrawing from room {}", room);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.results.lock().await.take();
        Ok(())
    }
}

/// Feed every reported batch into the registry until the stream ends
pub async fn drain_results(
    mut results: mpsc::Receiver<PeerBatch>,
    registry: Arc<PeerRegistry>,
    nat: Option<Arc<dyn NatTraversal>>,
) {
    while let Some(batch) = results.recv().await {
        let stored = registry.ingest_batch(&batch, nat.as_deref()).await;
        debug!("Discovery reported {} peers, stored {}", batch.len(), stored);
    }
    info!("Discovery result stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::room_id;

    #[tokio::test]
    async fn test_static_discovery_reports_bootstrap_list() {
        let discovery = StaticDiscovery::new(vec!["10.0.0.1:1339".to_string()]);
        let mut rx = discovery.start().await.unwrap();

        discovery
            .request_peers(&room_id("grapevine#main"), true, 1339)
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec!["10.0.0.1:1339".to_string()]);
    }

    #[tokio::test]
    async fn test_static_discovery_starts_once() {
        let discovery = StaticDiscovery::new(Vec::new());
        assert!(discovery.start().await.is_ok());
        assert!(discovery.start().await.is_err());
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let discovery = StaticDiscovery::new(vec!["10.0.0.1:1339".to_string()]);
        let result = discovery.request_peers(&room_id("x"), true, 1339).await;
        assert!(matches!(result, Err(GrapevineError::Discovery(_))));
    }

    #[tokio::test]
    async fn test_stop_closes_stream() {
        let discovery = StaticDiscovery::new(Vec::new());
        let mut rx = discovery.start().await.unwrap();
        discovery.stop().await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}

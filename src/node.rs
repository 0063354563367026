//! Grapevine node: the event coordinator
//!
//! One control loop owns every state change. Background tasks feed it
//! through bounded queues (received packets, commands, finished
//! proof-of-work jobs) and it processes exactly one event at a time.

use crate::{
    broadcast::{BroadcastReport, Broadcaster},
    codec,
    command::{Command, CommandKind, COMMANDS},
    crypto::{room_id, ProofOfWork, ProofOfWorkConfig},
    discovery::{drain_results, PeerDiscovery, StaticDiscovery},
    error::{CryptoError, GrapevineError, NetworkError, Result, StorageError},
    nat::NatTraversal,
    network::{local_address, receive_packets},
    packet::{Packet, PacketValidator},
    registry::{Blacklist, PeerRegistry, MESSAGE_PORT_OFFSET},
    storage::MessageStore,
    types::RoomId,
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the received-packet queue
pub const PACKET_QUEUE_CAPACITY: usize = 8;

/// Capacity of the finished proof-of-work queue
pub const JOB_QUEUE_CAPACITY: usize = 8;

/// Nonce searches allowed to run at once; further jobs wait for a permit
pub const MAX_CONCURRENT_SEARCHES: usize = 2;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Configured port; messages use `port + 2`
    pub port: u16,

    /// How often to ask the overlay for more peers
    pub refresh_interval: Duration,

    /// Work a packet needs to be stored, and the work put into `send`
    pub min_work: u64,

    /// Hashed into the rendezvous identifier
    pub room_name: String,

    /// Addresses reported by the built-in static discovery
    pub bootstrap_peers: Vec<String>,

    /// scrypt cost parameters
    pub pow: ProofOfWorkConfig,
}

impl NodeConfig {
    /// Port of the message socket
    pub fn message_port(&self) -> Result<u16> {
        self.port.checked_add(MESSAGE_PORT_OFFSET).ok_or_else(|| {
            GrapevineError::config(format!(
                "port {} leaves no room for the message port",
                self.port
            ))
        })
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            refresh_interval: Duration::from_secs(crate::DEFAULT_REFRESH_INTERVAL_SECS),
            min_work: crate::DEFAULT_MIN_WORK,
            room_name: crate::ROOM_NAME.to_string(),
            bootstrap_peers: Vec::new(),
            pow: ProofOfWorkConfig::default(),
        }
    }
}

/// Background proof-of-work job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    Send,
    Like { id: u64 },
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Send => write!(f, "new message"),
            Job::Like { id } => write!(f, "liked message {id}"),
        }
    }
}

#[derive(Debug)]
struct MinedPacket {
    job: Job,
    result: Result<Vec<u8>>,
}

/// A messaging node
pub struct GrapevineNode {
    config: NodeConfig,
    room: RoomId,
    registry: Arc<PeerRegistry>,
    store: Arc<MessageStore>,
    pow: ProofOfWork,
    validator: PacketValidator,
    broadcaster: Broadcaster,
    discovery: Arc<dyn PeerDiscovery>,
    nat: Option<Arc<dyn NatTraversal>>,
    mapped_ports: Vec<u16>,
    console: Option<mpsc::UnboundedSender<String>>,
    shutdown: CancellationToken,
    search_permits: Arc<Semaphore>,
    jobs_tx: mpsc::Sender<MinedPacket>,
    jobs_rx: Option<mpsc::Receiver<MinedPacket>>,
}

impl GrapevineNode {
    /// Create a builder for this node
    pub fn builder() -> GrapevineNodeBuilder {
        GrapevineNodeBuilder::new()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn pow(&self) -> &ProofOfWork {
        &self.pow
    }

    /// Ports mapped on the NAT gateway at startup
    pub fn mapped_ports(&self) -> &[u16] {
        &self.mapped_ports
    }

    /// Cancelling this token stops the node
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of proof-of-work searches currently running
    pub fn active_searches(&self) -> usize {
        MAX_CONCURRENT_SEARCHES - self.search_permits.available_permits()
    }

    fn min_work(&self) -> BigUint {
        self.validator.min_work().clone()
    }

    /// Encode `text` and append one chunk worth the node's minimum work
    pub async fn compose(&self, text: &str) -> Result<Vec<u8>> {
        let header = codec::encode(text)?;
        self.pow.extend(header, self.min_work()).await
    }

    /// Validate a received datagram and store it if it carries enough work.
    ///
    /// Returns the new message id, or `None` if the packet was discarded.
    pub async fn handle_packet(&self, datagram: Vec<u8>) -> Result<Option<u64>> {
        let Some(packet) = Packet::from_datagram(datagram) else {
            return Ok(None);
        };

        match self.validator.validate(packet).await? {
            Some(valid) => {
                let id = self.store.accept(valid.buffer, valid.text, valid.work).await;
                debug!("Accepted message {}", id);
                Ok(Some(id))
            },
            None => Ok(None),
        }
    }

    /// Ask the overlay for more peers, announcing our message port
    pub async fn refresh(&self) {
        let port = match self.config.message_port() {
            Ok(port) => port,
            Err(e) => {
                warn!("Not announcing: {}", e);
                return;
            },
        };
        if let Err(e) = self.discovery.request_peers(&self.room, true, port).await {
            warn!("Peer request failed: {}", e);
        }
    }

    /// Execute one command line and return the lines to show the user
    pub async fn handle_command(&self, line: &str) -> Result<Vec<String>> {
        match line.parse::<CommandKind>()? {
            CommandKind::Send(text) => {
                let header = codec::encode(&text)?;
                let pow = self.pow.clone();
                let min_work = self.min_work();
                info!("Computing proof of work for new message");
                self.spawn_job(Job::Send, async move { pow.extend(header, min_work).await });
                Ok(Vec::new())
            },
            CommandKind::Messages => Ok(self
                .store
                .list()
                .await
                .into_iter()
                .map(|m| format!("{}: \"{}\" {}", m.id, m.text, m.cost))
                .collect()),
            CommandKind::Peers => Ok(self.registry.snapshot().await),
            CommandKind::Like { id, exponent: None } => {
                let buffer = self.store.like(id, None, &self.pow).await?;
                let report = self.broadcaster.send(&buffer).await;
                info!("Resent message {} to {} peers", id, report.delivered);
                Ok(Vec::new())
            },
            CommandKind::Like {
                id,
                exponent: Some(exponent),
            } => {
                if !self.store.contains(id).await {
                    return Err(StorageError::MessageNotFound { id }.into());
                }
                let min_work = BigUint::from(1u8) << exponent;
                let store = self.store.clone();
                let pow = self.pow.clone();
                info!("Computing proof of work worth {} for message {}", min_work, id);
                self.spawn_job(Job::Like { id }, async move {
                    store.like(id, Some(min_work), &pow).await
                });
                Ok(Vec::new())
            },
            CommandKind::Drop { id } => {
                self.store.tombstone(id).await?;
                Ok(Vec::new())
            },
            CommandKind::Help => Ok(COMMANDS
                .iter()
                .map(|(name, description)| format!("{name:<10}{description}"))
                .collect()),
            CommandKind::Exit => {
                self.shutdown.cancel();
                Ok(Vec::new())
            },
        }
    }

    fn spawn_job<F>(&self, job: Job, work: F)
    where
        F: Future<Output = Result<Vec<u8>>> + Send + 'static,
    {
        let jobs = self.jobs_tx.clone();
        let permits = self.search_permits.clone();
        tokio::spawn(async move {
            let result = match permits.acquire_owned().await {
                Ok(_permit) => work.await,
                Err(_) => Err(CryptoError::ProofOfWorkCancelled.into()),
            };
            let _ = jobs.send(MinedPacket { job, result }).await;
        });
    }

    async fn finish_job(&self, mined: MinedPacket) -> Option<BroadcastReport> {
        match mined.result {
            Ok(buffer) => {
                let report = self.broadcaster.send(&buffer).await;
                info!("Broadcast {} to {} peers", mined.job, report.delivered);
                Some(report)
            },
            Err(GrapevineError::Crypto(CryptoError::ProofOfWorkCancelled)) => {
                debug!("Proof of work for {} cancelled", mined.job);
                None
            },
            Err(e) => {
                warn!("Proof of work for {} failed: {}", mined.job, e);
                self.emit(vec![e.to_string()]);
                None
            },
        }
    }

    /// Wait for the next background proof-of-work job and broadcast its
    /// result. Only usable while the event loop is not running.
    pub async fn complete_next_job(&mut self) -> Option<BroadcastReport> {
        let mined = self.jobs_rx.as_mut()?.recv().await?;
        self.finish_job(mined).await
    }

    fn emit(&self, lines: Vec<String>) {
        for line in lines {
            match &self.console {
                Some(console) => {
                    let _ = console.send(line);
                },
                None => println!("{line}"),
            }
        }
    }

    /// Run the event loop until shutdown.
    ///
    /// Fails before entering the loop if discovery cannot start or the
    /// message socket cannot be bound.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        let mut jobs = self
            .jobs_rx
            .take()
            .ok_or_else(|| GrapevineError::generic("node is already running"))?;

        let results = self.discovery.start().await?;
        tokio::spawn(drain_results(
            results,
            self.registry.clone(),
            self.nat.clone(),
        ));

        let addr = SocketAddr::from(([0u8; 4], self.config.message_port()?));
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| NetworkError::BindFailed { addr, source })?;
        let (packets_tx, mut packets_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let receiver = tokio::spawn(receive_packets(Arc::new(socket), packets_tx));

        info!("Node listening on {} in room {}", addr, self.room);

        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        let mut commands_open = true;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.refresh().await,
                Some(packet) = packets_rx.recv() => {
                    if let Err(e) = self.handle_packet(packet).await {
                        warn!("Dropping packet: {}", e);
                    }
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => {
                        let lines = match self.handle_command(&command.line).await {
                            Ok(lines) => lines,
                            Err(e) => vec![e.to_string()],
                        };
                        self.emit(lines);
                        command.acknowledge();
                    },
                    None => commands_open = false,
                },
                Some(mined) = jobs.recv() => {
                    self.finish_job(mined).await;
                },
            }
        }

        receiver.abort();
        self.close().await;
        Ok(())
    }

    /// Stop background work, remove port mappings and leave the room
    pub async fn close(&self) {
        info!("Cleaning up...");
        self.shutdown.cancel();
        self.search_permits.close();

        if let Some(nat) = &self.nat {
            for port in &self.mapped_ports {
                if let Err(e) = nat.delete_port_mapping(*port).await {
                    warn!("Failed to delete port mapping {}: {}", port, e);
                }
            }
        }
        if let Err(e) = self.discovery.withdraw(&self.room).await {
            warn!("Failed to withdraw from room: {}", e);
        }
        if let Err(e) = self.discovery.stop().await {
            warn!("Failed to stop discovery: {}", e);
        }
    }
}

/// Builder for Grapevine nodes
pub struct GrapevineNodeBuilder {
    config: NodeConfig,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    nat: Option<Arc<dyn NatTraversal>>,
    console: Option<mpsc::UnboundedSender<String>>,
}

impl GrapevineNodeBuilder {
    /// Create a new node builder
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            discovery: None,
            nat: None,
            console: None,
        }
    }

    /// Set the node configuration
    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the peer refresh interval
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval = interval;
        self
    }

    /// Set the minimum work for accepting and sending messages
    pub fn min_work(mut self, min_work: u64) -> Self {
        self.config.min_work = min_work;
        self
    }

    /// Set the scrypt cost parameters
    pub fn pow_config(mut self, pow: ProofOfWorkConfig) -> Self {
        self.config.pow = pow;
        self
    }

    /// Set the bootstrap peers used when no discovery overlay is given
    pub fn bootstrap_peers(mut self, peers: Vec<String>) -> Self {
        self.config.bootstrap_peers = peers;
        self
    }

    /// Use a discovery overlay instead of the static bootstrap list
    pub fn discovery(mut self, discovery: Arc<dyn PeerDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Use a NAT gateway
    pub fn nat(mut self, nat: Arc<dyn NatTraversal>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Send user-facing output here instead of stdout
    pub fn console(mut self, console: mpsc::UnboundedSender<String>) -> Self {
        self.console = Some(console);
        self
    }

    /// Build the node, installing port mappings and computing the
    /// self-address blacklist.
    ///
    /// NAT failures are logged and the node continues without them.
    pub async fn build(self) -> Result<GrapevineNode> {
        let config = self.config;
        let message_port = config.message_port()?;
        let room = room_id(&config.room_name);

        let mut blacklist = Blacklist::new();
        let local = self
            .nat
            .as_ref()
            .and_then(|nat| nat.local_address())
            .or_else(local_address);
        if let Some(ip) = local {
            blacklist.add_endpoint(ip, config.port);
        }

        let mut external = None;
        let mut mapped_ports = Vec::new();
        match &self.nat {
            Some(nat) => {
                for port in [config.port, message_port] {
                    match nat.add_port_mapping(port, port).await {
                        Ok(()) => mapped_ports.push(port),
                        Err(e) => warn!("Failed to map port {}: {}", port, e),
                    }
                }
                match nat.external_address().await {
                    Ok(ip) => {
                        blacklist.add_endpoint(ip, config.port);
                        external = Some(ip);
                    },
                    Err(e) => warn!("No external address, peers will not be rewritten: {}", e),
                }
            },
            None => info!("No NAT gateway, tracking peers by reported address"),
        }
        debug!("Blacklisted {} self addresses", blacklist.len());

        let discovery = self.discovery.unwrap_or_else(|| {
            Arc::new(StaticDiscovery::new(config.bootstrap_peers.clone()))
        });

        let shutdown = CancellationToken::new();
        let pow = ProofOfWork::with_config(config.pow).with_cancellation(shutdown.child_token());
        let validator = PacketValidator::new(pow.clone(), BigUint::from(config.min_work));
        let registry = Arc::new(PeerRegistry::new(blacklist, external));
        let broadcaster = Broadcaster::new(registry.clone());
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);

        Ok(GrapevineNode {
            config,
            room,
            registry,
            store: Arc::new(MessageStore::new()),
            pow,
            validator,
            broadcaster,
            discovery,
            nat: self.nat,
            mapped_ports,
            console: self.console,
            shutdown,
            search_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_SEARCHES)),
            jobs_tx,
            jobs_rx: Some(jobs_rx),
        })
    }
}

impl Default for GrapevineNodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

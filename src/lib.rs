//! Grapevine - a serverless peer-to-peer messaging node
//!
//! Peers find each other through a discovery overlay and exchange short
//! text messages directly over UDP. Every message carries a chained proof
//! of work; nodes only store messages that represent enough work.

// Modules
pub mod broadcast;
pub mod codec;
pub mod command;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod nat;
pub mod network;
pub mod node;
pub mod packet;
pub mod registry;
pub mod storage;
pub mod types;

// Re-exports
pub use broadcast::{BroadcastReport, Broadcaster};
pub use command::{Command, CommandKind};
pub use crypto::{ProofOfWork, ProofOfWorkConfig};
pub use discovery::{PeerDiscovery, StaticDiscovery};
pub use error::{GrapevineError, Result};
pub use nat::{NatTraversal, PortMapping, PortMappings};
pub use network::Peer;
pub use node::{GrapevineNode, GrapevineNodeBuilder, NodeConfig};
pub use packet::{Packet, PacketValidator, ValidatedPacket};
pub use registry::{Blacklist, PeerRegistry};
pub use storage::{Message, MessageStore};
pub use types::RoomId;

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Default configured port; the message socket listens two above it
pub const DEFAULT_PORT: u16 = 1337;

/// Default work a message must carry to be accepted
pub const DEFAULT_MIN_WORK: u64 = 1 << 5;

/// Default interval between peer requests
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;

/// Application-wide room name hashed into the rendezvous identifier
pub const ROOM_NAME: &str = "grapevine#main";
